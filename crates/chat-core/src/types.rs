use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// One chat message as stored in a conversation log.
///
/// Immutable once accepted by the remote. `client_temp_id` only exists on
/// optimistic local entries and is never written to the remote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Author user ID.
    pub sender_id: String,
    /// Message text; may be empty when an image is attached.
    pub text: String,
    /// Public URL of an attached image.
    pub image_url: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Local correlation ID for unconfirmed sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
}

impl Message {
    /// Copy of this message suitable for writing to the remote.
    pub fn to_remote(&self) -> Message {
        Message {
            client_temp_id: None,
            ..self.clone()
        }
    }

    /// Whether `other` carries the same author and content.
    pub fn same_content(&self, other: &Message) -> bool {
        self.sender_id == other.sender_id
            && self.text == other.text
            && self.image_url == other.image_url
    }
}

/// Full message history between two participants, as seen by one viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub conversation_id: String,
    pub participant_ids: BTreeSet<String>,
    pub messages: Vec<Message>,
    pub last_message_text: String,
    pub updated_at: DateTime<Utc>,
    pub seen_by: BTreeSet<String>,
}

impl Conversation {
    /// The other participant, from `viewer`'s perspective.
    pub fn peer_of(&self, viewer: &str) -> Option<&str> {
        self.participant_ids
            .iter()
            .map(String::as_str)
            .find(|id| *id != viewer)
    }

    pub fn is_seen_by(&self, user_id: &str) -> bool {
        self.seen_by.contains(user_id)
    }
}

/// Display information for a conversation peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerProfile {
    pub user_id: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl PeerProfile {
    /// Placeholder profile shown when the peer has blocked the viewer.
    pub fn masked(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: "User".to_owned(),
            avatar_url: None,
        }
    }
}

/// List-row projection of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub peer_user_id: String,
    pub peer: PeerProfile,
    pub last_message_text: String,
    pub updated_at: DateTime<Utc>,
    pub is_seen: bool,
}

/// Directed block edge, stored on the blocker's user record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlockRelation {
    pub blocker_id: String,
    pub blocked_id: String,
}

/// Block status between a viewer and one peer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlockState {
    /// The peer has blocked the viewer.
    pub viewer_blocked: bool,
    /// The viewer has blocked the peer.
    pub peer_blocked: bool,
}

impl BlockState {
    /// Derive the block state between `viewer` and `peer` from a relation set.
    pub fn from_relations<'a>(
        viewer: &str,
        peer: &str,
        relations: impl IntoIterator<Item = &'a BlockRelation>,
    ) -> Self {
        let mut state = Self::default();
        for relation in relations {
            if relation.blocker_id == peer && relation.blocked_id == viewer {
                state.viewer_blocked = true;
            }
            if relation.blocker_id == viewer && relation.blocked_id == peer {
                state.peer_blocked = true;
            }
        }
        state
    }

    /// Sending is disabled when either direction is blocked.
    pub fn is_blocked(&self) -> bool {
        self.viewer_blocked || self.peer_blocked
    }
}

/// Media blob handed to the remote object store.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for MediaUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaUpload")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Change notification pushed by the remote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteChange {
    /// A conversation record changed. `snapshot` carries the new state when
    /// the remote supplies it; otherwise the engine re-fetches.
    Conversation {
        conversation_id: String,
        snapshot: Option<Conversation>,
    },
    /// The user's conversation index changed.
    ConversationList { user_id: String },
}

/// Lifecycle of the single open conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConversationPhase {
    /// No conversation is open.
    #[default]
    Closed,
    /// Initial fetch in flight.
    Loading,
    /// Fetched and subscribed to changes.
    Live,
}

/// Delivery state of one cached message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Present in the authoritative log.
    Confirmed,
    /// Optimistic entry awaiting confirmation.
    Pending,
    /// Write failed; kept for explicit retry.
    Failed { error_code: String },
}

/// Identity of the signed-in user the engine runs for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Message row consumed by the UI shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageView {
    pub sender_id: String,
    pub text: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub client_temp_id: Option<String>,
    pub status: DeliveryStatus,
    /// Image is still uploading.
    pub awaiting_media: bool,
    pub is_own: bool,
}

/// Snapshot of the open conversation for rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationView {
    pub conversation_id: String,
    pub phase: ConversationPhase,
    pub peer: Option<PeerProfile>,
    pub messages: Vec<MessageView>,
    pub last_message_text: String,
    pub block: BlockState,
    pub can_send: bool,
}

/// Acknowledgement for a send, keyed by its client temp ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    pub conversation_id: String,
    pub client_temp_id: String,
    /// Both participant copies accepted the message.
    pub delivered: bool,
    /// Stable error code on failure or partial delivery.
    pub error_code: Option<String>,
}

/// Command channel input accepted by the sync runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncCommand {
    /// Open a conversation, closing any other one first.
    OpenConversation { conversation_id: String },
    /// Close the open conversation.
    CloseConversation,
    /// Send a message to the open conversation.
    SendMessage {
        text: String,
        image: Option<MediaUpload>,
    },
    /// Retry a failed send.
    RetrySend { client_temp_id: String },
    /// Drop a failed send.
    DiscardFailed { client_temp_id: String },
    /// Re-fetch the conversation list.
    RefreshList,
    /// Block or unblock the open conversation's peer.
    SetBlocked { blocked: bool },
    /// Stop the runtime (sign-out).
    Teardown,
}

/// Event channel output emitted by the sync runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    /// Conversation lifecycle transition.
    PhaseChanged {
        conversation_id: Option<String>,
        phase: ConversationPhase,
    },
    /// Open conversation view changed.
    ConversationUpdated(ConversationView),
    /// Conversation list replaced.
    ListUpdated { rows: Vec<ConversationSummary> },
    /// Send acknowledgement.
    SendAck(SendAck),
    /// Non-fatal error surfaced to the UI.
    Error(SyncError),
    /// Runtime stopped after teardown.
    Stopped,
}
