//! Hive - Rust 多智能体编排与记忆检索引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与重试、运行状态、运行监管、Orchestrator 主控循环
//! - **memory**: 情景 / 程序 / 语义记忆，存储与按步骤选择
//! - **observability**: 日志初始化
//! - **prompt**: 提示词模板与 Prompt Compiler
//! - **store**: 运行状态存储（内存 / SQLite）
//! - **tools**: Agent 注册表、调用网关与返回值归一化
//! - **workflow**: 计划 DAG、校验、构建与规划输出解析

pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod prompt;
pub mod store;
pub mod tools;
pub mod workflow;

pub use crate::core::{Orchestrator, OrchestratorSettings, RunReport};
pub use crate::workflow::{Plan, PlanBuilder, Step};
