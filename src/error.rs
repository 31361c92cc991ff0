use crate::guard::RateLimitReason;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Unauthenticated: caller identity is missing")]
    Unauthenticated,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid ledger entry: {0}")]
    InvalidEntry(String),

    #[error("Rate limited ({reason}){}", retry_hint(.retry_after_secs))]
    RateLimited {
        reason: RateLimitReason,
        retry_after_secs: Option<u64>,
    },

    /// Identical request seen inside the dedup window; callers treat it as a no-op.
    #[error("Duplicate request")]
    DuplicateRequest,

    #[error("Insufficient tokens: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },

    /// Optimistic concurrency collision. Retried by `storage::transact`, never surfaced.
    #[error("Write conflict")]
    Conflict,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

fn retry_hint(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!(", retry after {}s", secs),
        None => String::new(),
    }
}

impl Error {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::Internal(_) | Error::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message_includes_hint() {
        let err = Error::RateLimited {
            reason: RateLimitReason::IngestCooldown,
            retry_after_secs: Some(12),
        };
        let msg = err.to_string();
        assert!(msg.contains("ingest_cooldown"));
        assert!(msg.contains("retry after 12s"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Internal("store down".to_string()).is_retryable());
        assert!(!Error::InsufficientFunds {
            available: 1,
            required: 2
        }
        .is_retryable());
        assert!(!Error::DuplicateRequest.is_retryable());
        assert!(!Error::Unauthenticated.is_retryable());
    }
}
