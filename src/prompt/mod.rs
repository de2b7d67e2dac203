//! 提示词：模板注册表与 Prompt Compiler

pub mod compiler;
pub mod template;

pub use compiler::{BusinessStateView, CompiledPrompt, HistoryEntry, PromptCompiler};
pub use template::{PromptTemplate, TemplateRegistry};
