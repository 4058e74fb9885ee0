//! HTTP chat transport for Codequill.
//!
//! Pure client: chat completions, model catalog, and the bounded retry
//! transport the orchestrator sends every request through.

mod client;
mod error;
mod retry;
mod types;

pub use client::ChatClient;
pub use error::{HttpErrorKind, LlmError, Result};
pub use retry::{RetryPolicy, backoff_delay, send_with_retry};
pub use types::{ChatCompletion, ChatRole, ChatUsage, ModelInfo, WireMessage};
