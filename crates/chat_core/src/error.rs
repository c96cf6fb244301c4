use thiserror::Error;

/// Failure surface of the external store and push transport.
///
/// The engine cares about one distinction above all: whether the store
/// explicitly refused a mutation, or the outcome is simply unknown. Optimistic
/// state is rolled back only for explicit refusals; timeouts and transport
/// failures leave it in place because the write may still have landed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("store request timed out")]
    Timeout,
    #[error("store rejected the request: {message}")]
    Rejected { message: String },
    #[error("malformed store payload: {0}")]
    Decode(String),
    #[error("record not found")]
    NotFound,
}

impl StoreError {
    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        Self::Unavailable(err.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Transient failures are worth retrying; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }

    /// True when the store actively refused the request, as opposed to the
    /// request possibly never arriving.
    pub fn is_explicit_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::NotFound)
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        if let Some(status) = err.status() {
            // Server-side trouble is retryable; a 4xx is the store refusing.
            if status.is_server_error() {
                return Self::Unavailable(err.into());
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Self::NotFound;
            }
            return Self::Rejected {
                message: format!("http status {status}"),
            };
        }
        if err.is_decode() {
            return Self::Decode(err.to_string());
        }
        Self::Unavailable(err.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
