//! Row shapes of the hosted `users` and `userchats` tables.
//!
//! Each user owns one `userchats` row holding their copy of every
//! conversation they take part in. Rows are validated on ingress: missing
//! arrays become empty, chat entries without a `receiverId` are skipped and
//! malformed timestamps are rejected.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use chat_core::{
    BlockRelation, Conversation, ConversationSummary, Message, PeerProfile, SyncError,
    SyncErrorCategory,
};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// One message inside a chat entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub sender_id: String,
    #[serde(default)]
    pub text: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img: Option<String>,
}

/// One conversation as stored in its owner's `userchats` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChatEntry {
    pub chat_id: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_seen: bool,
}

impl WireChatEntry {
    pub fn new(chat_id: impl Into<String>, receiver_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            chat_id: chat_id.into(),
            receiver_id: Some(receiver_id.into()),
            last_message: String::new(),
            messages: Vec::new(),
            updated_at: Some(format_timestamp(now)),
            is_seen: false,
        }
    }
}

/// A user's conversation index: the `userchats` row keyed by user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChatsRow {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub chats: Vec<WireChatEntry>,
}

impl UserChatsRow {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            id: user_id.into(),
            chats: Vec::new(),
        }
    }

    pub fn entry(&self, chat_id: &str) -> Option<&WireChatEntry> {
        self.chats.iter().find(|entry| entry.chat_id == chat_id)
    }

    pub fn entry_mut(&mut self, chat_id: &str) -> Option<&mut WireChatEntry> {
        self.chats.iter_mut().find(|entry| entry.chat_id == chat_id)
    }

    pub fn entry_with_peer_mut(&mut self, peer_id: &str) -> Option<&mut WireChatEntry> {
        self.chats
            .iter_mut()
            .find(|entry| entry.receiver_id.as_deref() == Some(peer_id))
    }
}

/// A `users` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub blocked: Vec<String>,
}

impl UserRow {
    pub fn profile(&self) -> PeerProfile {
        PeerProfile {
            user_id: self.id.clone(),
            username: self.username.clone(),
            avatar_url: self.avatar.clone().filter(|url| !url.is_empty()),
        }
    }

    /// Block edges recorded on this row.
    pub fn relations(&self) -> impl Iterator<Item = BlockRelation> + '_ {
        self.blocked.iter().map(|blocked_id| BlockRelation {
            blocker_id: self.id.clone(),
            blocked_id: blocked_id.clone(),
        })
    }

    pub fn has_blocked(&self, user_id: &str) -> bool {
        self.blocked.iter().any(|id| id == user_id)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decode a row received from the store.
pub fn decode_row<T: for<'de> Deserialize<'de>>(
    table: &str,
    value: serde_json::Value,
) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Serialization,
            "malformed_row",
            format!("{table} row could not be decoded: {err}"),
        )
    })
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SyncError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Serialization,
                "malformed_timestamp",
                format!("'{raw}' is not an RFC 3339 timestamp: {err}"),
            )
        })
}

/// Millisecond-precision UTC timestamp, as written by browser clients.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn message_from_wire(wire: &WireMessage) -> Result<Message, SyncError> {
    Ok(Message {
        sender_id: wire.sender_id.clone(),
        text: wire.text.clone(),
        image_url: wire.img.clone().filter(|url| !url.is_empty()),
        created_at: parse_timestamp(&wire.created_at)?,
        client_temp_id: None,
    })
}

pub fn message_to_wire(message: &Message) -> WireMessage {
    WireMessage {
        sender_id: message.sender_id.clone(),
        text: message.text.clone(),
        created_at: format_timestamp(message.created_at),
        img: message.image_url.clone(),
    }
}

/// Convert `owner_id`'s chat entry into a conversation.
///
/// Returns `Ok(None)` for entries without a receiver.
pub fn conversation_from_entry(
    owner_id: &str,
    entry: &WireChatEntry,
) -> Result<Option<Conversation>, SyncError> {
    let Some(receiver_id) = entry.receiver_id.as_deref().filter(|id| !id.is_empty()) else {
        warn!(chat_id = %entry.chat_id, %owner_id, "skipping chat entry without receiver");
        return Ok(None);
    };

    let messages = entry
        .messages
        .iter()
        .map(message_from_wire)
        .collect::<Result<Vec<_>, _>>()?;
    let updated_at = match entry.updated_at.as_deref() {
        Some(raw) => parse_timestamp(raw)?,
        None => messages
            .last()
            .map(|message| message.created_at)
            .unwrap_or_default(),
    };
    let mut seen_by = BTreeSet::new();
    if entry.is_seen {
        seen_by.insert(owner_id.to_owned());
    }

    Ok(Some(Conversation {
        conversation_id: entry.chat_id.clone(),
        participant_ids: [owner_id.to_owned(), receiver_id.to_owned()]
            .into_iter()
            .collect(),
        messages,
        last_message_text: entry.last_message.clone(),
        updated_at,
        seen_by,
    }))
}

/// List row for `owner_id`'s chat entry, given the peer's `users` row.
///
/// Peers who have blocked the owner are masked.
pub fn summary_from_entry(
    owner_id: &str,
    entry: &WireChatEntry,
    peer: &UserRow,
) -> Result<ConversationSummary, SyncError> {
    let updated_at = match entry.updated_at.as_deref() {
        Some(raw) => parse_timestamp(raw)?,
        None => DateTime::<Utc>::default(),
    };
    let profile = if peer.has_blocked(owner_id) {
        PeerProfile::masked(peer.id.clone())
    } else {
        peer.profile()
    };
    Ok(ConversationSummary {
        conversation_id: entry.chat_id.clone(),
        peer_user_id: peer.id.clone(),
        peer: profile,
        last_message_text: entry.last_message.clone(),
        updated_at,
        is_seen: entry.is_seen,
    })
}
