//! Provider error classification
//!
//! Typed errors for remote API operations, classified into retryable and
//! permanent categories so the reconciler can decide between backoff and
//! immediate failure.

use thiserror::Error;

/// Provider error categories for retry and cleanup logic
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Resource was not found (safe to skip in cleanup)
    #[error("resource not found: {kind} '{id}'")]
    NotFound { kind: &'static str, id: String },

    /// Resource already exists (safe to adopt in create operations)
    #[error("resource already exists")]
    AlreadyExists,

    /// Rate limit exceeded (retryable with backoff)
    #[error("rate limit exceeded")]
    Throttled,

    /// A just-created dependency is not yet visible (eventual consistency,
    /// retryable)
    #[error("dependency not yet visible: {0}")]
    PropagationDelay(String),

    /// Caller lacks permission on the target (permanent, no retry)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request itself is invalid (permanent, no retry)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Generic API error with status code and message
    #[error("provider error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure reaching the API (retryable)
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }

    /// Check if this is an "already exists" error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProviderError::AlreadyExists)
    }

    /// Check if the operation should be retried with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Throttled
            | ProviderError::PropagationDelay(_)
            | ProviderError::Transport(_) => true,
            // Server-side errors are worth one more attempt
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Classify an HTTP response status into the provider taxonomy.
///
/// Google APIs report eventual-consistency misses on just-created principals
/// as 400s mentioning the resource; those are surfaced via
/// [`ProviderError::PropagationDelay`] by the per-service callers that know
/// the pattern, not here.
pub fn classify_status(status: u16, kind: &'static str, id: &str, message: &str) -> ProviderError {
    match status {
        404 => ProviderError::NotFound {
            kind,
            id: id.to_string(),
        },
        409 => ProviderError::AlreadyExists,
        429 => ProviderError::Throttled,
        401 | 403 => ProviderError::PermissionDenied(message.to_string()),
        400 => ProviderError::InvalidRequest(message.to_string()),
        _ => ProviderError::Api {
            status,
            message: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        let err = classify_status(404, "secret", "db-password", "not found");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_classification() {
        assert!(classify_status(429, "x", "y", "slow down").is_retryable());
        assert!(classify_status(503, "x", "y", "unavailable").is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(ProviderError::PropagationDelay("sa".into()).is_retryable());
    }

    #[test]
    fn permanent_classification() {
        assert!(!classify_status(403, "x", "y", "denied").is_retryable());
        assert!(!classify_status(400, "x", "y", "bad tier").is_retryable());
        assert!(classify_status(409, "x", "y", "exists").is_already_exists());
    }
}
