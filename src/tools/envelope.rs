//! 调用信封
//!
//! Agent 的返回形状各不相同，网关在边界处统一归一化为 `InvocationOutcome`：
//! 成功为 `{payload, artifacts}`，失败为携带原因码的 `RawFailure`，交给错误分类器。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent 声明接受的输入类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    #[default]
    Text,
    Url,
    Document,
    Image,
    Audio,
    Video,
    Code,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Text => "text",
            InputKind::Url => "url",
            InputKind::Document => "document",
            InputKind::Image => "image",
            InputKind::Audio => "audio",
            InputKind::Video => "video",
            InputKind::Code => "code",
        }
    }
}

/// Agent 产生的副作用（文件、截图等）的引用；内容本身不进入业务事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ArtifactRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            media_type: None,
            description: None,
        }
    }
}

/// 交给 Agent 的请求：编译后的提示词 + 输入类型
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub step_id: String,
    pub attempt: u32,
    pub prompt: String,
    pub input_kind: InputKind,
    /// 步骤的原始输入载荷
    pub input: Value,
}

/// Agent 的成功返回
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub payload: Value,
    pub artifacts: Vec<ArtifactRef>,
}

impl AgentResponse {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// Agent 的失败返回：机器可读原因码 + 文本详情
#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub reason_code: String,
    pub detail: String,
}

impl AgentFailure {
    pub fn new(reason_code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            detail: detail.into(),
        }
    }
}

/// 归一化后的成功结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub payload: Value,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

/// 归一化后的失败，交给 `ErrorClassifier::classify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFailure {
    pub step_id: String,
    pub agent_id: String,
    pub attempt: u32,
    pub reason_code: String,
    pub detail: String,
}

/// 网关返回值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success(InvocationResult),
    Failure(RawFailure),
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Success(_))
    }
}

/// 将 Agent 的原始返回归一化
///
/// - 载荷为 `{"success": false, ...}` 视为失败，原因码取 `reason_code`（缺省 `fatal`），详情取 `error`
/// - 载荷中内联的 `artifacts` 数组被移出，转为 `ArtifactRef`
pub fn normalize(
    step_id: &str,
    agent_id: &str,
    attempt: u32,
    raw: Result<AgentResponse, AgentFailure>,
) -> InvocationOutcome {
    let failure = |reason_code: String, detail: String| {
        InvocationOutcome::Failure(RawFailure {
            step_id: step_id.to_string(),
            agent_id: agent_id.to_string(),
            attempt,
            reason_code,
            detail,
        })
    };

    let response = match raw {
        Ok(r) => r,
        Err(f) => return failure(f.reason_code, f.detail),
    };

    let mut payload = response.payload;
    let mut artifacts = response.artifacts;

    if let Value::Object(map) = &mut payload {
        if map.get("success").and_then(Value::as_bool) == Some(false) {
            let code = map
                .get("reason_code")
                .and_then(Value::as_str)
                .unwrap_or("fatal")
                .to_string();
            let detail = match map.get("error") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "agent reported failure without detail".to_string(),
            };
            return failure(code, detail);
        }

        if let Some(Value::Array(inline)) = map.remove("artifacts") {
            for item in inline {
                match item {
                    Value::String(uri) => artifacts.push(ArtifactRef::new(uri)),
                    other => {
                        if let Ok(a) = serde_json::from_value::<ArtifactRef>(other) {
                            artifacts.push(a);
                        }
                    }
                }
            }
        }
    }

    InvocationOutcome::Success(InvocationResult { payload, artifacts })
}
