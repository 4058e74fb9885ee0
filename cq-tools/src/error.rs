use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

/// Internal error type for fallible helpers. The executor folds every
/// variant into descriptive output text before it reaches the orchestrator.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("blocked: {0}")]
    Blocked(String),
}
