pub mod dispatch;
pub mod lookup;
mod loop_impl;
pub mod prompt;

pub use dispatch::{FunctionCallSpec, ToolContext, dispatch_calls, tool_declarations};
pub use loop_impl::{AgentAnswer, AgentConfig, AgentProgressEvent, run_question_with_events};
