//! Local tool layer for Codequill.
//!
//! Turns one untrusted model response into at most one constrained,
//! auditable local side effect: parse the action, gate shell commands
//! through the safety validator, execute under a hard timeout, and decide
//! whether the raw output is user-visible.

mod action;
mod error;
mod executor;
mod parser;
mod safety;
mod visibility;

pub use action::ToolAction;
pub use error::{Result, ToolError};
pub use executor::{ExecutorLimits, ServerSummary, ToolExecutor};
pub use parser::parse_tool_call;
pub use safety::{SafetyDecision, validate_command};
pub use visibility::should_show_output;
