use thiserror::Error;

/// Failures of the sync core, grouped by how the caller must react to them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network failure or 5xx. Retried by the governor before surfacing.
    #[error("Transient error: {0}")]
    Transient(String),

    /// The listing changed size while it was being paginated.
    #[error("Listing {endpoint} changed while paginating (total {expected} -> {actual})")]
    UpstreamChanged {
        endpoint: String,
        expected: u32,
        actual: u32,
    },

    #[error("Rate limit retry budget exhausted after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    /// 4xx other than 429. Never retried.
    #[error("Request rejected (status {status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("Malformed response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    /// Snapshot read/write failure. Fatal to the process.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Shutdown requested")]
    Cancelled,

    #[error("Cycle exceeded its deadline of {0} seconds")]
    DeadlineExceeded(u64),

    #[error("Invalid cycle transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(status: u16, message: impl Into<String>) -> Self {
        Self::Permanent {
            status,
            message: message.into(),
        }
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    /// Whether the process must stop rather than wait for the next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }

    /// Whether the governor may retry the request that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_errors_are_fatal() {
        assert!(SyncError::storage("disk full").is_fatal());
        assert!(!SyncError::transient("reset by peer").is_fatal());
        assert!(!SyncError::RateLimitExhausted { attempts: 5 }.is_fatal());
        assert!(!SyncError::permanent(404, "missing").is_fatal());
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(SyncError::transient("502").is_retryable());
        assert!(!SyncError::permanent(400, "bad").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }
}
