use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network-layer failure: timeout, DNS, connection refused. Never
    /// retried by the transport; the caller classifies it for the user.
    #[error("network error: {0}")]
    Network(String),

    #[error("http error: status={status} body={body}")]
    Http { status: u16, body: String },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

/// Coarse classification of an HTTP failure, used by the orchestrator to
/// decide between surfacing the error and trying a fallback model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    Auth,
    RateLimit,
    Server,
    ModelNotFound,
    Other,
}

impl LlmError {
    pub fn http_kind(&self) -> Option<HttpErrorKind> {
        let Self::Http { status, body } = self else {
            return None;
        };
        Some(match status {
            401 | 403 => HttpErrorKind::Auth,
            429 => HttpErrorKind::RateLimit,
            500..=599 => HttpErrorKind::Server,
            400 if body.to_ascii_lowercase().contains("model") => HttpErrorKind::ModelNotFound,
            _ => HttpErrorKind::Other,
        })
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_kind_classifies_statuses() {
        let auth = LlmError::Http {
            status: 401,
            body: String::new(),
        };
        assert_eq!(auth.http_kind(), Some(HttpErrorKind::Auth));

        let rate = LlmError::Http {
            status: 429,
            body: String::new(),
        };
        assert_eq!(rate.http_kind(), Some(HttpErrorKind::RateLimit));

        let server = LlmError::Http {
            status: 503,
            body: String::new(),
        };
        assert_eq!(server.http_kind(), Some(HttpErrorKind::Server));
    }

    #[test]
    fn http_kind_detects_unknown_model() {
        let err = LlmError::Http {
            status: 400,
            body: r#"{"error":"Model not found: gpt-nonexistent"}"#.to_string(),
        };
        assert_eq!(err.http_kind(), Some(HttpErrorKind::ModelNotFound));

        let other = LlmError::Http {
            status: 400,
            body: "bad request".to_string(),
        };
        assert_eq!(other.http_kind(), Some(HttpErrorKind::Other));
    }

    #[test]
    fn network_errors_have_no_http_kind() {
        assert!(LlmError::Network("dns".to_string()).http_kind().is_none());
    }
}
