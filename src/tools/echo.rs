//! Echo Agent（测试与演示用）

use async_trait::async_trait;
use serde_json::json;

use crate::tools::envelope::{AgentFailure, AgentRequest, AgentResponse};
use crate::tools::Agent;

/// Echo Agent：回显步骤输入与编译后的提示词
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the step input back (for testing)."
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentFailure> {
        Ok(AgentResponse::new(json!({
            "echo": request.input,
            "prompt_chars": request.prompt.chars().count(),
        })))
    }
}
