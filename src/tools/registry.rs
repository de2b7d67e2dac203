//! Agent 注册表
//!
//! 所有 Agent 实现 Agent trait（id / description / input_kind / invoke），由 AgentRegistry 按 ID 注册与查找，
//! ToolGateway 在调用时加超时并统一归一化返回值。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::tools::envelope::{AgentFailure, AgentRequest, AgentResponse, InputKind};

/// Agent trait：ID、描述（供规划器理解）、声明的输入类型、异步调用
///
/// 同一输入重复调用必须安全（重试会以相同输入再次调用）。
#[async_trait]
pub trait Agent: Send + Sync {
    /// Agent ID（计划中 Step.agent_id 引用它）
    fn id(&self) -> &str;

    /// 能力描述（渲染到规划提示词的 tool_list）
    fn description(&self) -> &str;

    /// 声明接受的输入类型；默认文本
    fn input_kind(&self) -> InputKind {
        InputKind::Text
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentFailure>;
}

/// Agent 注册表：按 ID 存储 Arc<dyn Agent>，有序以保证目录输出稳定
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: impl Agent + 'static) {
        self.register_arc(Arc::new(agent));
    }

    pub fn register_arc(&mut self, agent: Arc<dyn Agent>) {
        let id = agent.id().to_string();
        self.agents.insert(id, agent);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// 生成规划提示词中的 Available Tools 段落：每行 `- id (input kind): description`
    pub fn catalogue(&self) -> String {
        self.agents
            .values()
            .map(|a| format!("- {} ({}): {}", a.id(), a.input_kind().as_str(), a.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
