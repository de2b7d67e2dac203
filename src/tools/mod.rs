//! Agent 调用：注册表、调用信封、网关

pub mod echo;
pub mod envelope;
pub mod executor;
pub mod registry;

pub use echo::EchoAgent;
pub use envelope::{
    normalize, AgentFailure, AgentRequest, AgentResponse, ArtifactRef, InputKind,
    InvocationOutcome, InvocationResult, RawFailure,
};
pub use executor::{InvocationRequest, ToolGateway};
pub use registry::{Agent, AgentRegistry};
