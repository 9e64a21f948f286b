use thiserror::Error;

/// Classification attached to every CI-boundary error at construction time,
/// so retry logic never infers intent from message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing/invalid registration, bad credentials, 4xx responses.
    /// Never retried.
    Config,
    /// Network failures, timeouts, 5xx responses. Retried with backoff.
    Transient,
}

/// Error produced by CI trigger/status calls and their preconditions.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CiError {
    pub fn config(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Config,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl From<reqwest::Error> for CiError {
    fn from(e: reqwest::Error) -> Self {
        // A response with a client-error status is a caller problem; pure
        // transport failures and server errors are worth another attempt.
        let transient = match e.status() {
            Some(status) => status.is_server_error() || status.as_u16() == 429,
            None => true,
        };
        if transient {
            Self::transient(format!("ci request failed: {e}"))
        } else {
            Self::config(format!("ci request rejected: {e}"))
        }
    }
}
