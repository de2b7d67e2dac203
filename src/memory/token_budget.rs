//! 上下文预算
//!
//! 记忆选择的总量上限，可按字符或估算 token 计量。

use serde::{Deserialize, Serialize};

/// Token 估算器（字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 英文约 4 字符/token，中文约 1.5 字符/token；空文本为 0
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }
        if ascii_chars + non_ascii_chars == 0 {
            return 0;
        }
        let tokens = ascii_chars.div_ceil(4) + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetUnit {
    #[default]
    Chars,
    Tokens,
}

/// 预算：上限 + 计量单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub limit: usize,
    pub unit: BudgetUnit,
}

impl ContextBudget {
    pub fn new(limit: usize, unit: BudgetUnit) -> Self {
        Self { limit, unit }
    }

    pub fn chars(limit: usize) -> Self {
        Self::new(limit, BudgetUnit::Chars)
    }

    pub fn tokens(limit: usize) -> Self {
        Self::new(limit, BudgetUnit::Tokens)
    }

    /// 按本预算的单位计量文本
    pub fn measure(&self, text: &str) -> usize {
        match self.unit {
            BudgetUnit::Chars => text.chars().count(),
            BudgetUnit::Tokens => TokenEstimator::estimate(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate() {
        assert_eq!(TokenEstimator::estimate(""), 0);
        assert_eq!(TokenEstimator::estimate("abcd"), 1);
        assert_eq!(TokenEstimator::estimate("abcde"), 2);
        assert_eq!(TokenEstimator::estimate("你好世"), 2);
    }

    #[test]
    fn test_measure_by_unit() {
        assert_eq!(ContextBudget::chars(10).measure("你好 ab"), 5);
        assert_eq!(ContextBudget::tokens(10).measure("abcdefgh"), 2);
    }
}
