//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__CONCURRENCY_LIMIT=2`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::RetryPolicy;
use crate::memory::{BudgetUnit, ContextBudget};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub gateway: GatewaySection,
    pub memory: MemorySection,
    pub store: StoreSection,
    pub prompts: PromptsSection,
}

/// [app] 段：应用名、数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// SQLite、记忆文件等默认落盘位置
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: PathBuf::from("data"),
        }
    }
}

/// [orchestrator] 段：并发、重试与退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 单个 Run 内同时执行的步骤上限
    pub concurrency_limit: usize,
    /// 每个步骤默认最多重试次数（Step 可覆盖）
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// Step 未指定模板时使用的模板 ID
    pub default_template: String,
    /// 步骤结束后是否写入情景记忆
    pub record_outcomes: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            max_retries: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            default_template: "agent_step".to_string(),
            record_outcomes: true,
        }
    }
}

impl OrchestratorSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: self.backoff_initial_ms,
            max_delay_ms: self.backoff_max_ms,
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// [gateway] 段：单次调用超时与全局并发许可
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub timeout_secs: u64,
    /// 跨 Run 共享的调用并发上限
    pub max_concurrent_invocations: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_concurrent_invocations: 8,
        }
    }
}

/// [memory] 段：选择预算、程序记忆保底条数、时间衰减
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub budget_chars: usize,
    pub budget_unit: BudgetUnit,
    pub procedural_reserve: usize,
    pub recency_half_life_hours: f64,
    pub max_entries: usize,
    /// JSONL 记忆文件；未设置时仅保存在内存
    pub store_path: Option<PathBuf>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            budget_chars: 4000,
            budget_unit: BudgetUnit::Chars,
            procedural_reserve: 2,
            recency_half_life_hours: 72.0,
            max_entries: 10_000,
            store_path: None,
        }
    }
}

impl MemorySection {
    pub fn budget(&self) -> ContextBudget {
        ContextBudget::new(self.budget_chars, self.budget_unit)
    }

    pub fn half_life_ms(&self) -> i64 {
        (self.recency_half_life_hours * 3_600_000.0) as i64
    }
}

/// [store] 段：运行状态存储后端（memory / sqlite）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: String,
    pub sqlite_path: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_path: None,
        }
    }
}

/// [prompts] 段：额外模板目录（*.toml）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PromptsSection {
    pub template_dir: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
