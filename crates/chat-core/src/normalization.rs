use crate::{
    error::SyncError,
    types::{SendAck, SyncEvent},
};

/// Stable code reported when the sender's copy accepted a message but the
/// peer's copy did not.
pub const PEER_COPY_FAILED: &str = "peer_copy_failed";

/// Outcome of writing one message to both participant copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    /// Both copies accepted the message.
    Delivered,
    /// The sender's own copy rejected the write; the peer copy was not tried.
    OwnCopyFailed { error: SyncError },
    /// The sender's copy has the message but the peer's copy does not.
    PeerCopyFailed { error: SyncError },
}

/// Convert a delivery report to a stable `SendAck`.
pub fn normalize_delivery(
    conversation_id: impl Into<String>,
    client_temp_id: impl Into<String>,
    report: &DeliveryReport,
) -> SendAck {
    let conversation_id = conversation_id.into();
    let client_temp_id = client_temp_id.into();
    match report {
        DeliveryReport::Delivered => SendAck {
            conversation_id,
            client_temp_id,
            delivered: true,
            error_code: None,
        },
        DeliveryReport::OwnCopyFailed { error } => SendAck {
            conversation_id,
            client_temp_id,
            delivered: false,
            error_code: Some(error.code.clone()),
        },
        DeliveryReport::PeerCopyFailed { .. } => SendAck {
            conversation_id,
            client_temp_id,
            delivered: false,
            error_code: Some(PEER_COPY_FAILED.to_owned()),
        },
    }
}

/// Wrap an error for the event channel.
pub fn normalize_error(error: SyncError) -> SyncEvent {
    SyncEvent::Error(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_delivered_to_clean_ack() {
        let ack = normalize_delivery("c1", "t1", &DeliveryReport::Delivered);
        assert!(ack.delivered);
        assert_eq!(ack.error_code, None);
        assert_eq!(ack.client_temp_id, "t1");
    }

    #[test]
    fn own_copy_failure_keeps_stable_error_code() {
        let ack = normalize_delivery(
            "c1",
            "t2",
            &DeliveryReport::OwnCopyFailed {
                error: SyncError::network("offline", "connection refused"),
            },
        );
        assert!(!ack.delivered);
        assert_eq!(ack.error_code.as_deref(), Some("offline"));
    }

    #[test]
    fn peer_copy_failure_is_reported_distinctly() {
        let ack = normalize_delivery(
            "c1",
            "t3",
            &DeliveryReport::PeerCopyFailed {
                error: SyncError::network("offline", "timeout"),
            },
        );
        assert!(!ack.delivered);
        assert_eq!(ack.error_code.as_deref(), Some(PEER_COPY_FAILED));
    }
}
