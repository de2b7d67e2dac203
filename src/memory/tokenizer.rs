//! 分词：记忆相关度计算
//!
//! 中英文混合文本：CJK 片段交给 jieba-rs（搜索引擎模式），其余按非字母数字字符切分。
//! 结果统一小写，单字符的非 CJK 词被丢弃。

use std::collections::BTreeSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn push_word(out: &mut Vec<String>, word: &str) {
    let w = word.trim().to_lowercase();
    if w.is_empty() {
        return;
    }
    let first = w.chars().next().unwrap_or(' ');
    if w.chars().count() > 1 || is_cjk(first) {
        out.push(w);
    }
}

/// 分词，保留顺序与重复
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if word.is_empty() {
            continue;
        }
        if contains_cjk(word) {
            for piece in get_jieba().cut_for_search(word, true) {
                push_word(&mut out, piece);
            }
        } else {
            push_word(&mut out, word);
        }
    }
    out
}

/// 分词并去重（有序集合，迭代顺序确定）
pub fn tokenize_to_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard 相似度 |A∩B| / |A∪B|
pub fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_english_strips_punctuation() {
        let tokens = tokenize("Search: Rust async, tokio-runtime!");
        assert_eq!(tokens, vec!["search", "rust", "async", "tokio", "runtime"]);
    }

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("我喜欢编程和人工智能");
        assert!(tokens.iter().any(|t| t.contains("编程") || t.contains("智能")));
    }

    #[test]
    fn test_tokenize_mixed() {
        let tokens = tokenize("用 Rust 编程");
        assert!(tokens.contains(&"rust".to_string()));
        assert!(tokens.iter().any(|t| t.contains("编程")));
    }

    #[test]
    fn test_jaccard_similarity() {
        let a = tokenize_to_set("rust async runtime");
        let b = tokenize_to_set("rust runtime internals");
        let sim = jaccard_similarity(&a, &b);
        assert!((sim - 0.5).abs() < 1e-9);
        assert_eq!(jaccard_similarity(&a, &BTreeSet::new()), 0.0);
    }

    #[test]
    fn test_contains_cjk() {
        assert!(contains_cjk("Hello 世界"));
        assert!(!contains_cjk("Hello World"));
    }
}
