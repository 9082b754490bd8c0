use std::{collections::BTreeSet, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::{
    merge::{CachedMessage, MergeOutcome, merge_messages},
    types::{BlockState, Conversation, ConversationSummary, DeliveryStatus, PeerProfile},
};

/// Cached state of the open conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConversation {
    pub conversation_id: String,
    pub participant_ids: BTreeSet<String>,
    pub peer: Option<PeerProfile>,
    pub messages: Vec<CachedMessage>,
    pub last_message_text: String,
    pub updated_at: DateTime<Utc>,
    pub seen_by: BTreeSet<String>,
    pub block: BlockState,
}

impl OpenConversation {
    pub fn new(conversation: Conversation, peer: Option<PeerProfile>, block: BlockState) -> Self {
        let mut open = Self {
            conversation_id: conversation.conversation_id.clone(),
            participant_ids: BTreeSet::new(),
            peer,
            messages: Vec::new(),
            last_message_text: String::new(),
            updated_at: conversation.updated_at,
            seen_by: BTreeSet::new(),
            block,
        };
        open.apply_authoritative(conversation, Duration::ZERO);
        open
    }

    /// Run the merge algorithm against a fresh authoritative record.
    pub fn apply_authoritative(
        &mut self,
        conversation: Conversation,
        tolerance: Duration,
    ) -> MergeOutcome {
        let (messages, outcome) = merge_messages(&self.messages, &conversation.messages, tolerance);
        self.messages = messages;
        self.participant_ids = conversation.participant_ids;
        self.last_message_text = conversation.last_message_text;
        self.updated_at = conversation.updated_at;
        self.seen_by = conversation.seen_by;
        outcome
    }

    pub fn find_mut(&mut self, client_temp_id: &str) -> Option<&mut CachedMessage> {
        self.messages
            .iter_mut()
            .find(|entry| entry.temp_id() == Some(client_temp_id))
    }

    pub fn find(&self, client_temp_id: &str) -> Option<&CachedMessage> {
        self.messages
            .iter()
            .find(|entry| entry.temp_id() == Some(client_temp_id))
    }

    pub fn remove(&mut self, client_temp_id: &str) -> Option<CachedMessage> {
        let idx = self
            .messages
            .iter()
            .position(|entry| entry.temp_id() == Some(client_temp_id))?;
        Some(self.messages.remove(idx))
    }

    pub fn pending_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|entry| entry.status == DeliveryStatus::Pending)
            .count()
    }
}

/// Local view of the open conversation and the conversation list.
///
/// Only the sync engine mutates the cache; UI reads go through snapshots.
#[derive(Debug, Clone, Default)]
pub struct LocalCache {
    open: Option<OpenConversation>,
    list: Vec<ConversationSummary>,
}

impl LocalCache {
    pub fn open(&self) -> Option<&OpenConversation> {
        self.open.as_ref()
    }

    pub fn open_mut(&mut self) -> Option<&mut OpenConversation> {
        self.open.as_mut()
    }

    pub fn set_open(&mut self, open: OpenConversation) {
        debug!(
            conversation_id = %open.conversation_id,
            message_count = open.messages.len(),
            "cached conversation populated"
        );
        self.open = Some(open);
    }

    pub fn clear_open(&mut self) -> Option<OpenConversation> {
        self.open.take()
    }

    pub fn list(&self) -> &[ConversationSummary] {
        &self.list
    }

    /// Replace the list, most recently updated first.
    pub fn replace_list(&mut self, mut rows: Vec<ConversationSummary>) {
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        self.list = rows;
        debug!(row_count = self.list.len(), "conversation list replaced");
    }

    /// Rows whose peer username contains `filter`, case-insensitively.
    pub fn filtered_list(&self, filter: &str) -> Vec<ConversationSummary> {
        let needle = filter.trim().to_lowercase();
        self.list
            .iter()
            .filter(|row| needle.is_empty() || row.peer.username.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn mark_row_seen(&mut self, conversation_id: &str) -> bool {
        match self
            .list
            .iter_mut()
            .find(|row| row.conversation_id == conversation_id)
        {
            Some(row) if !row.is_seen => {
                row.is_seen = true;
                true
            }
            _ => false,
        }
    }

    /// Reflect a local send in the list row and move it to the top.
    pub fn touch_row(
        &mut self,
        conversation_id: &str,
        last_message_text: &str,
        updated_at: DateTime<Utc>,
    ) {
        let Some(idx) = self
            .list
            .iter()
            .position(|row| row.conversation_id == conversation_id)
        else {
            trace!(%conversation_id, "no list row to touch");
            return;
        };
        let mut row = self.list.remove(idx);
        row.last_message_text = last_message_text.to_owned();
        row.updated_at = updated_at;
        row.is_seen = true;
        self.list.insert(0, row);
    }
}
