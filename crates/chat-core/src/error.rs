use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConversationPhase;

/// Broad error category used for UI handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Conversation or user record is absent.
    NotFound,
    /// A block relation or remote policy forbids the operation.
    Forbidden,
    /// Transient network or transport failure.
    Network,
    /// Concurrent structural update on the remote record.
    Conflict,
    /// Authentication failure or missing session.
    Auth,
    /// Invalid input or unsupported state.
    Config,
    /// Remote record could not be decoded.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new sync error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::NotFound, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Forbidden, code, message)
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Network, code, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Conflict, "conflict", message)
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConversationPhase, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while conversation is {current:?}"),
        )
    }

    /// Whether an explicit user retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::Network | SyncErrorCategory::Conflict
        )
    }
}

/// Map HTTP status codes to sync error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 => SyncErrorCategory::Auth,
        403 => SyncErrorCategory::Forbidden,
        404 | 406 => SyncErrorCategory::NotFound,
        409 | 412 => SyncErrorCategory::Conflict,
        408 | 429 => SyncErrorCategory::Network,
        400..=499 => SyncErrorCategory::Config,
        500..=599 => SyncErrorCategory::Network,
        _ => SyncErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), SyncErrorCategory::Auth);
        assert_eq!(classify_http_status(403), SyncErrorCategory::Forbidden);
        assert_eq!(classify_http_status(404), SyncErrorCategory::NotFound);
        assert_eq!(classify_http_status(409), SyncErrorCategory::Conflict);
        assert_eq!(classify_http_status(429), SyncErrorCategory::Network);
        assert_eq!(classify_http_status(422), SyncErrorCategory::Config);
        assert_eq!(classify_http_status(503), SyncErrorCategory::Network);
        assert_eq!(classify_http_status(700), SyncErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = SyncError::invalid_state(ConversationPhase::Closed, "send");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, SyncErrorCategory::Internal);
    }

    #[test]
    fn only_network_and_conflict_are_retryable() {
        assert!(SyncError::network("offline", "x").is_retryable());
        assert!(SyncError::conflict("x").is_retryable());
        assert!(!SyncError::forbidden("blocked", "x").is_retryable());
        assert!(!SyncError::not_found("chat_not_found", "x").is_retryable());
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = SyncError::network("rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }
}
