//! 计划：步骤 DAG、校验、构建器、规划器输出解析

pub mod builder;
pub mod graph;
pub mod parser;
pub mod types;

pub use builder::PlanBuilder;
pub use graph::PlanGraph;
pub use parser::{parse_plan_output, PlannerOutput};
pub use types::*;
