use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::SyncError,
    types::{
        BlockState, Conversation, ConversationSummary, MediaUpload, Message, PeerProfile,
        RemoteChange,
    },
};

/// Sender half the remote pushes change notifications into.
pub type ChangeSink = mpsc::Sender<RemoteChange>;

/// Opaque handle for an active change subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(String);

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capabilities the sync engine needs from the hosted backend.
///
/// Every method converts backend failures to [`SyncError`]. `append_message`
/// must be safe to call concurrently from both participants; the remote does
/// not order writes across the two per-user copies.
#[async_trait]
pub trait RemotePort: Send + Sync {
    /// Fetch `as_user`'s copy of a conversation. Absent records are
    /// `NotFound` errors.
    async fn fetch_conversation(
        &self,
        conversation_id: &str,
        as_user: &str,
    ) -> Result<Conversation, SyncError>;

    /// Append `message` to `as_user`'s copy of the conversation.
    async fn append_message(
        &self,
        conversation_id: &str,
        as_user: &str,
        message: &Message,
    ) -> Result<(), SyncError>;

    /// Deliver change notifications for one conversation into `sink`.
    async fn subscribe_to_changes(
        &self,
        conversation_id: &str,
        as_user: &str,
        sink: ChangeSink,
    ) -> Result<SubscriptionHandle, SyncError>;

    /// Deliver change notifications for `user_id`'s conversation index.
    async fn subscribe_to_list_changes(
        &self,
        user_id: &str,
        sink: ChangeSink,
    ) -> Result<SubscriptionHandle, SyncError>;

    /// Cancel a subscription. Unknown or already-closed handles are a no-op.
    async fn unsubscribe(&self, handle: &SubscriptionHandle);

    async fn fetch_conversation_list(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, SyncError>;

    async fn set_seen(&self, conversation_id: &str, user_id: &str) -> Result<(), SyncError>;

    /// Store a media blob and return its public URL.
    async fn upload_media(&self, user_id: &str, media: &MediaUpload) -> Result<String, SyncError>;

    async fn fetch_peer(&self, user_id: &str) -> Result<PeerProfile, SyncError>;

    async fn fetch_block_state(&self, viewer: &str, peer: &str) -> Result<BlockState, SyncError>;

    /// Add or remove `viewer`'s block on `peer`.
    async fn set_blocked(&self, viewer: &str, peer: &str, blocked: bool) -> Result<(), SyncError>;
}
