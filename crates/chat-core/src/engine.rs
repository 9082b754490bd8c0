//! Conversation sync engine.
//!
//! The engine is the single writer of the [`LocalCache`]. It performs no I/O:
//! callers run the remote operations it asks for and feed the results back,
//! tagged with the [`FetchTicket`] they were issued under.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    cache::{LocalCache, OpenConversation},
    error::{SyncError, SyncErrorCategory},
    merge::{CachedMessage, next_local_timestamp},
    normalization::{DeliveryReport, normalize_delivery},
    port::SubscriptionHandle,
    retry::RetryPolicy,
    state_machine::{ConversationStateMachine, FetchTicket},
    types::{
        BlockState, Conversation, ConversationPhase, ConversationSummary, ConversationView,
        DeliveryStatus, Message, MessageView, PeerProfile, RemoteChange, SendAck, SessionContext,
    },
};

const DEFAULT_MERGE_TOLERANCE_MS: u64 = 5_000;
const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Runtime tuning for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Window within which a remote message confirms an optimistic one.
    pub merge_tolerance: Duration,
    /// Automatic re-applications of an append after `Conflict`.
    pub max_conflict_retries: u32,
    /// Delay between conflict re-applications.
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            merge_tolerance: Duration::from_millis(DEFAULT_MERGE_TOLERANCE_MS),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Everything fetched when a conversation is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConversation {
    pub conversation: Conversation,
    pub peer: Option<PeerProfile>,
    pub block: BlockState,
}

/// What the caller must do to open a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPlan {
    /// Ticket to tag the initial fetch with.
    pub ticket: FetchTicket,
    /// Subscription of the previously live conversation, to be cancelled.
    pub release: Option<SubscriptionHandle>,
}

/// Result of feeding an initial fetch back into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Conversation is Live; subscribe to its changes next.
    Live,
    /// Result belonged to a conversation that is no longer loading; dropped.
    Stale,
}

/// Reaction required for a remote change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeAction {
    Ignored,
    /// Payload merged into the cache.
    Applied,
    /// No payload; re-fetch under this ticket.
    Refetch(FetchTicket),
    /// Conversation list must be re-fetched.
    RefreshList,
}

/// A message ready to be written to the remote copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSend {
    pub conversation_id: String,
    pub peer_id: String,
    pub client_temp_id: String,
    /// Remote form of the message (no temp ID).
    pub message: Message,
    /// Image must be uploaded before the append.
    pub awaiting_media: bool,
}

/// Client-side conversation sync state machine.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    session: SessionContext,
    config: EngineConfig,
    machine: ConversationStateMachine,
    cache: LocalCache,
    subscription: Option<SubscriptionHandle>,
}

impl SyncEngine {
    pub fn new(session: SessionContext, config: EngineConfig) -> Self {
        info!(user_id = %session.user_id, "sync engine initialised");
        Self {
            session,
            config,
            machine: ConversationStateMachine::default(),
            cache: LocalCache::default(),
            subscription: None,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn phase(&self) -> ConversationPhase {
        self.machine.phase()
    }

    pub fn open_conversation_id(&self) -> Option<&str> {
        self.machine.conversation_id()
    }

    /// Peer of the open conversation, once loaded.
    pub fn open_peer_id(&self) -> Option<String> {
        let open = self.cache.open()?;
        open.participant_ids
            .iter()
            .find(|id| **id != self.session.user_id)
            .cloned()
    }

    /// Begin opening `conversation_id`; any open conversation is closed first.
    pub fn open_conversation(&mut self, conversation_id: impl Into<String>) -> OpenPlan {
        let release = self.close_conversation();
        let ticket = self.machine.begin_open(conversation_id);
        debug!(
            conversation_id = %ticket.conversation_id,
            generation = ticket.generation,
            "opening conversation"
        );
        OpenPlan { ticket, release }
    }

    /// Feed the initial fetch result for `ticket`.
    pub fn on_conversation_loaded(
        &mut self,
        ticket: &FetchTicket,
        result: Result<LoadedConversation, SyncError>,
    ) -> Result<LoadOutcome, SyncError> {
        if !self
            .machine
            .is_current_in(ticket, ConversationPhase::Loading)
        {
            debug!(
                conversation_id = %ticket.conversation_id,
                generation = ticket.generation,
                "dropping stale conversation fetch"
            );
            return Ok(LoadOutcome::Stale);
        }

        match result {
            Ok(loaded) => {
                self.machine.on_loaded(ticket)?;
                let open = OpenConversation::new(loaded.conversation, loaded.peer, loaded.block);
                self.cache.set_open(open);
                self.cache.mark_row_seen(&ticket.conversation_id);
                Ok(LoadOutcome::Live)
            }
            Err(err) => {
                self.machine.on_load_failed(ticket)?;
                warn!(
                    conversation_id = %ticket.conversation_id,
                    error = %err,
                    "conversation fetch failed"
                );
                Err(err)
            }
        }
    }

    /// Record the subscription created for `ticket`.
    ///
    /// Returns the handle back when it belongs to a conversation that is no
    /// longer live; the caller must unsubscribe it.
    pub fn on_subscribed(
        &mut self,
        ticket: &FetchTicket,
        handle: SubscriptionHandle,
    ) -> Option<SubscriptionHandle> {
        if self.machine.is_current_in(ticket, ConversationPhase::Live) && self.subscription.is_none()
        {
            debug!(conversation_id = %ticket.conversation_id, %handle, "subscription active");
            self.subscription = Some(handle);
            None
        } else {
            debug!(conversation_id = %ticket.conversation_id, %handle, "releasing stale subscription");
            Some(handle)
        }
    }

    /// Merge a refreshed authoritative record. Returns whether it was applied.
    pub fn on_refreshed(&mut self, ticket: &FetchTicket, conversation: Conversation) -> bool {
        if !self.machine.is_current_in(ticket, ConversationPhase::Live) {
            debug!(conversation_id = %ticket.conversation_id, "dropping stale refresh");
            return false;
        }
        self.apply_authoritative(conversation)
    }

    /// Ticket for re-fetching the live conversation.
    pub fn refresh_ticket(&self) -> Option<FetchTicket> {
        self.machine.live_ticket()
    }

    /// Classify a push notification and apply any payload it carries.
    pub fn on_remote_change(&mut self, change: RemoteChange) -> ChangeAction {
        match change {
            RemoteChange::Conversation {
                conversation_id,
                snapshot,
            } => {
                if !self.machine.is_live(&conversation_id) {
                    return ChangeAction::Ignored;
                }
                match snapshot {
                    Some(conversation) if conversation.conversation_id == conversation_id => {
                        if self.apply_authoritative(conversation) {
                            ChangeAction::Applied
                        } else {
                            ChangeAction::Ignored
                        }
                    }
                    Some(_) => ChangeAction::Ignored,
                    None => self
                        .machine
                        .live_ticket()
                        .map(ChangeAction::Refetch)
                        .unwrap_or(ChangeAction::Ignored),
                }
            }
            RemoteChange::ConversationList { user_id } if user_id == self.session.user_id => {
                ChangeAction::RefreshList
            }
            RemoteChange::ConversationList { .. } => ChangeAction::Ignored,
        }
    }

    /// Live conversation the viewer has not marked seen yet.
    pub fn unseen_live_conversation(&self) -> Option<String> {
        if self.phase() != ConversationPhase::Live {
            return None;
        }
        let open = self.cache.open()?;
        (!open.seen_by.contains(&self.session.user_id)).then(|| open.conversation_id.clone())
    }

    /// Record that the viewer's seen flag was written.
    pub fn on_seen_marked(&mut self, conversation_id: &str) {
        if let Some(open) = self.cache.open_mut()
            && open.conversation_id == conversation_id
        {
            open.seen_by.insert(self.session.user_id.clone());
        }
        self.cache.mark_row_seen(conversation_id);
    }

    /// Optimistically append a new message to the open conversation.
    ///
    /// Rejected locally, without any remote call, when the conversation is
    /// not live, either side has blocked the other, or the draft is empty.
    pub fn begin_send(
        &mut self,
        text: &str,
        with_image: bool,
        now: DateTime<Utc>,
    ) -> Result<OutgoingSend, SyncError> {
        let (conversation_id, peer_id) = self.sendable_target("send")?;
        let text = text.trim();
        if text.is_empty() && !with_image {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "empty_message",
                "message has no text and no image",
            ));
        }

        let sender_id = self.session.user_id.clone();
        let open = self.require_open_mut("send")?;
        let created_at = next_local_timestamp(&open.messages, now);
        let client_temp_id = Uuid::new_v4().to_string();
        let message = Message {
            sender_id,
            text: text.to_owned(),
            image_url: None,
            created_at,
            client_temp_id: Some(client_temp_id.clone()),
        };
        open.messages
            .push(CachedMessage::pending(message.clone(), with_image));
        self.cache.touch_row(&conversation_id, text, created_at);
        debug!(%conversation_id, %client_temp_id, with_image, "optimistic message appended");

        Ok(OutgoingSend {
            conversation_id,
            peer_id,
            client_temp_id,
            message: message.to_remote(),
            awaiting_media: with_image,
        })
    }

    /// Fill in the uploaded image URL of a pending entry.
    pub fn attach_media(&mut self, client_temp_id: &str, image_url: String) -> Option<OutgoingSend> {
        let peer_id = self.open_peer_id()?;
        let open = self.cache.open_mut()?;
        let conversation_id = open.conversation_id.clone();
        let entry = open.find_mut(client_temp_id)?;
        entry.message.image_url = Some(image_url);
        entry.awaiting_media = false;
        Some(OutgoingSend {
            conversation_id,
            peer_id,
            client_temp_id: client_temp_id.to_owned(),
            message: entry.message.to_remote(),
            awaiting_media: false,
        })
    }

    /// Mark a send as failed before it reached the remote (e.g. upload error).
    pub fn on_send_failed(
        &mut self,
        conversation_id: &str,
        client_temp_id: &str,
        error: SyncError,
    ) -> SendAck {
        self.on_delivery(
            conversation_id,
            client_temp_id,
            DeliveryReport::OwnCopyFailed { error },
        )
    }

    /// Apply the outcome of the two-copy append.
    pub fn on_delivery(
        &mut self,
        conversation_id: &str,
        client_temp_id: &str,
        report: DeliveryReport,
    ) -> SendAck {
        match &report {
            DeliveryReport::Delivered => {
                debug!(%conversation_id, %client_temp_id, "message delivered to both copies");
            }
            DeliveryReport::OwnCopyFailed { error } => {
                warn!(%conversation_id, %client_temp_id, error = %error, "send failed");
                self.mark_failed(conversation_id, client_temp_id, &error.code);
            }
            DeliveryReport::PeerCopyFailed { error } => {
                error!(
                    %conversation_id,
                    %client_temp_id,
                    error = %error,
                    "message stored in sender copy only; peer copy write failed"
                );
            }
        }
        normalize_delivery(conversation_id, client_temp_id, &report)
    }

    /// Flip a failed entry back to pending and return it for re-delivery.
    pub fn retry_send(
        &mut self,
        client_temp_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OutgoingSend, SyncError> {
        let (conversation_id, peer_id) = self.sendable_target("retry_send")?;
        let open = self.require_open_mut("retry_send")?;
        let is_failed = open
            .find(client_temp_id)
            .is_some_and(|entry| matches!(entry.status, DeliveryStatus::Failed { .. }));
        if !is_failed {
            return Err(unknown_pending_send(client_temp_id));
        }

        let mut entry = open
            .remove(client_temp_id)
            .ok_or_else(|| unknown_pending_send(client_temp_id))?;
        entry.message.created_at = next_local_timestamp(&open.messages, now);
        entry.status = DeliveryStatus::Pending;
        let outgoing = OutgoingSend {
            conversation_id,
            peer_id,
            client_temp_id: client_temp_id.to_owned(),
            message: entry.message.to_remote(),
            awaiting_media: entry.awaiting_media,
        };
        open.messages.push(entry);
        info!(conversation_id = %outgoing.conversation_id, %client_temp_id, "retrying send");
        Ok(outgoing)
    }

    /// Remove a failed entry on explicit user request.
    pub fn discard_failed(&mut self, client_temp_id: &str) -> Result<(), SyncError> {
        let open = self.require_open_mut("discard_failed")?;
        let is_failed = open
            .find(client_temp_id)
            .is_some_and(|entry| matches!(entry.status, DeliveryStatus::Failed { .. }));
        if !is_failed {
            return Err(unknown_pending_send(client_temp_id));
        }
        open.remove(client_temp_id);
        Ok(())
    }

    /// Live -> Closed. Returns the subscription to cancel.
    pub fn close_conversation(&mut self) -> Option<SubscriptionHandle> {
        if let Some(conversation_id) = self.machine.close() {
            debug!(%conversation_id, "conversation closed");
        }
        self.cache.clear_open();
        self.subscription.take()
    }

    /// Replace the cached conversation list.
    pub fn replace_list(&mut self, rows: Vec<ConversationSummary>) {
        self.cache.replace_list(rows);
        if let Some(conversation_id) = self.machine.conversation_id().map(str::to_owned)
            && self.phase() == ConversationPhase::Live
        {
            self.cache.mark_row_seen(&conversation_id);
        }
    }

    /// Conversation list, optionally filtered by peer username.
    pub fn list_view(&self, filter: &str) -> Vec<ConversationSummary> {
        self.cache.filtered_list(filter)
    }

    /// Update the viewer's own block on `peer_id`.
    pub fn set_peer_blocked(&mut self, peer_id: &str, blocked: bool) {
        let is_open_peer = self.open_peer_id().as_deref() == Some(peer_id);
        if let Some(open) = self.cache.open_mut()
            && is_open_peer
        {
            open.block.peer_blocked = blocked;
        }
    }

    /// Snapshot of the open conversation.
    pub fn conversation_view(&self) -> Option<ConversationView> {
        let open = self.cache.open()?;
        let phase = self.phase();
        Some(ConversationView {
            conversation_id: open.conversation_id.clone(),
            phase,
            peer: open.peer.clone(),
            messages: open
                .messages
                .iter()
                .map(|entry| MessageView {
                    sender_id: entry.message.sender_id.clone(),
                    text: entry.message.text.clone(),
                    image_url: entry.message.image_url.clone(),
                    created_at: entry.message.created_at,
                    client_temp_id: entry.message.client_temp_id.clone(),
                    status: entry.status.clone(),
                    awaiting_media: entry.awaiting_media,
                    is_own: entry.message.sender_id == self.session.user_id,
                })
                .collect(),
            last_message_text: open.last_message_text.clone(),
            block: open.block,
            can_send: phase == ConversationPhase::Live && !open.block.is_blocked(),
        })
    }

    /// Release everything for sign-out.
    pub fn teardown(&mut self) -> Option<SubscriptionHandle> {
        let release = self.close_conversation();
        self.cache.replace_list(Vec::new());
        info!(user_id = %self.session.user_id, "sync engine torn down");
        release
    }

    fn apply_authoritative(&mut self, conversation: Conversation) -> bool {
        let tolerance = self.config.merge_tolerance;
        let Some(open) = self.cache.open_mut() else {
            return false;
        };
        let outcome = open.apply_authoritative(conversation, tolerance);
        debug!(
            conversation_id = %open.conversation_id,
            confirmed = outcome.confirmed.len(),
            still_pending = outcome.still_pending,
            duplicates_dropped = outcome.duplicates_dropped,
            "merged authoritative messages"
        );
        true
    }

    fn mark_failed(&mut self, conversation_id: &str, client_temp_id: &str, error_code: &str) {
        let Some(open) = self.cache.open_mut() else {
            warn!(%conversation_id, %client_temp_id, "failed send for a closed conversation");
            return;
        };
        if open.conversation_id != conversation_id {
            warn!(%conversation_id, %client_temp_id, "failed send for a closed conversation");
            return;
        }
        if let Some(entry) = open.find_mut(client_temp_id) {
            entry.status = DeliveryStatus::Failed {
                error_code: error_code.to_owned(),
            };
        }
    }

    fn sendable_target(&self, action: &str) -> Result<(String, String), SyncError> {
        if self.phase() != ConversationPhase::Live {
            return Err(SyncError::invalid_state(self.phase(), action));
        }
        let open = self
            .cache
            .open()
            .ok_or_else(|| SyncError::invalid_state(self.phase(), action))?;
        if open.block.is_blocked() {
            return Err(SyncError::forbidden(
                "blocked",
                "messages cannot be sent while a block is in place",
            ));
        }
        let peer_id = self.open_peer_id().ok_or_else(|| {
            SyncError::new(
                SyncErrorCategory::Internal,
                "missing_peer",
                format!("conversation {} has no peer", open.conversation_id),
            )
        })?;
        Ok((open.conversation_id.clone(), peer_id))
    }

    fn require_open_mut(&mut self, action: &str) -> Result<&mut OpenConversation, SyncError> {
        let phase = self.phase();
        self.cache
            .open_mut()
            .ok_or_else(|| SyncError::invalid_state(phase, action))
    }
}

fn unknown_pending_send(client_temp_id: &str) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Config,
        "unknown_pending_send",
        format!("no failed send with id {client_temp_id}"),
    )
}
