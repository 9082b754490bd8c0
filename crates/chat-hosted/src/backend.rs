use std::{collections::HashMap, sync::{Arc, Mutex}};

use async_trait::async_trait;
use chat_core::{
    BlockState, ChangeSink, Conversation, ConversationSummary, MediaUpload, Message, PeerProfile,
    RemoteChange, RemotePort, SubscriptionHandle, SyncError, SyncErrorCategory,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    schema::{
        UserChatsRow, conversation_from_entry, format_timestamp, message_to_wire,
        summary_from_entry,
    },
    tables::{RowEvent, RowFeed, Tables},
};

const FEED_BUFFER: usize = 32;

/// [`RemotePort`] over the hosted `users`/`userchats` tables.
pub struct HostedBackend<T, F> {
    tables: Arc<T>,
    feed: Arc<F>,
    media_bucket: String,
    subscriptions: Mutex<HashMap<SubscriptionHandle, CancellationToken>>,
}

impl<T: Tables, F: RowFeed> HostedBackend<T, F> {
    pub fn new(tables: Arc<T>, feed: Arc<F>, media_bucket: impl Into<String>) -> Self {
        Self {
            tables,
            feed,
            media_bucket: media_bucket.into(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn tables(&self) -> &Arc<T> {
        &self.tables
    }

    /// Number of live change subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().map(|subs| subs.len()).unwrap_or(0)
    }

    /// Follow `row_id` and turn each feed event into notifications via `map`.
    async fn follow<M>(
        &self,
        row_id: &str,
        sink: ChangeSink,
        map: M,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        M: Fn(RowEvent) -> Option<RemoteChange> + Send + 'static,
    {
        let handle = SubscriptionHandle::new();
        let stop = CancellationToken::new();
        let (row_tx, mut row_rx) = mpsc::channel(FEED_BUFFER);
        self.feed
            .follow_user_chats(row_id, row_tx, stop.child_token())
            .await?;

        let task_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    event = row_rx.recv() => {
                        let Some(event) = event else { break };
                        let Some(change) = map(event) else { continue };
                        if sink.send(change).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut subscriptions = self
            .subscriptions
            .lock()
            .map_err(|_| lock_poisoned())?;
        subscriptions.insert(handle.clone(), stop);
        debug!(%row_id, %handle, "change subscription started");
        Ok(handle)
    }

    async fn write_seen(&self, conversation_id: &str, user_id: &str) -> Result<bool, SyncError> {
        let mut current = self.tables.user_chats(user_id).await?;
        let entry = current
            .row
            .entry_mut(conversation_id)
            .ok_or_else(|| chat_not_found(conversation_id))?;
        if entry.is_seen {
            return Ok(false);
        }
        entry.is_seen = true;
        self.tables
            .update_user_chats(&current.row, Some(&current.revision))
            .await?;
        Ok(true)
    }
}

fn chat_not_found(conversation_id: &str) -> SyncError {
    SyncError::not_found(
        "chat_not_found",
        format!("conversation {conversation_id} does not exist"),
    )
}

fn lock_poisoned() -> SyncError {
    SyncError::new(
        SyncErrorCategory::Internal,
        "subscription_registry",
        "subscription registry lock poisoned",
    )
}

#[async_trait]
impl<T, F> RemotePort for HostedBackend<T, F>
where
    T: Tables + 'static,
    F: RowFeed + 'static,
{
    async fn fetch_conversation(
        &self,
        conversation_id: &str,
        as_user: &str,
    ) -> Result<Conversation, SyncError> {
        let current = self.tables.user_chats(as_user).await?;
        let entry = current
            .row
            .entry(conversation_id)
            .ok_or_else(|| chat_not_found(conversation_id))?;
        conversation_from_entry(as_user, entry)?.ok_or_else(|| chat_not_found(conversation_id))
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        as_user: &str,
        message: &Message,
    ) -> Result<(), SyncError> {
        let mut current = self.tables.user_chats(as_user).await?;
        let entry = current
            .row
            .entry_mut(conversation_id)
            .ok_or_else(|| chat_not_found(conversation_id))?;
        entry.messages.push(message_to_wire(message));
        entry.last_message = message.text.clone();
        entry.updated_at = Some(format_timestamp(Utc::now()));
        entry.is_seen = message.sender_id == as_user;

        self.tables
            .update_user_chats(&current.row, Some(&current.revision))
            .await?;
        debug!(%conversation_id, %as_user, "message appended");
        Ok(())
    }

    async fn subscribe_to_changes(
        &self,
        conversation_id: &str,
        as_user: &str,
        sink: ChangeSink,
    ) -> Result<SubscriptionHandle, SyncError> {
        let conversation_id = conversation_id.to_owned();
        let owner = as_user.to_owned();
        self.follow(as_user, sink, move |event| {
            let row = match event {
                RowEvent::Updated(row) => row,
                RowEvent::Resync => {
                    return Some(RemoteChange::Conversation {
                        conversation_id: conversation_id.clone(),
                        snapshot: None,
                    });
                }
            };
            let entry = row.entry(&conversation_id)?;
            let snapshot = match conversation_from_entry(&owner, entry) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(%conversation_id, error = %err, "undecodable change; requesting refetch");
                    None
                }
            };
            Some(RemoteChange::Conversation {
                conversation_id: conversation_id.clone(),
                snapshot,
            })
        })
        .await
    }

    async fn subscribe_to_list_changes(
        &self,
        user_id: &str,
        sink: ChangeSink,
    ) -> Result<SubscriptionHandle, SyncError> {
        let user_id_owned = user_id.to_owned();
        self.follow(user_id, sink, move |_| {
            Some(RemoteChange::ConversationList {
                user_id: user_id_owned.clone(),
            })
        })
        .await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let stop = match self.subscriptions.lock() {
            Ok(mut subscriptions) => subscriptions.remove(handle),
            Err(_) => None,
        };
        if let Some(stop) = stop {
            stop.cancel();
            debug!(%handle, "change subscription cancelled");
        }
    }

    async fn fetch_conversation_list(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let current = self.tables.user_chats(user_id).await?;
        let mut rows = Vec::with_capacity(current.row.chats.len());
        for entry in &current.row.chats {
            let Some(peer_id) = entry.receiver_id.as_deref().filter(|id| !id.is_empty()) else {
                warn!(chat_id = %entry.chat_id, %user_id, "skipping chat entry without receiver");
                continue;
            };
            let peer = match self.tables.user(peer_id).await {
                Ok(peer) => peer,
                Err(err) if err.category == SyncErrorCategory::NotFound => {
                    warn!(chat_id = %entry.chat_id, %peer_id, "skipping chat with unknown peer");
                    continue;
                }
                Err(err) => return Err(err),
            };
            rows.push(summary_from_entry(user_id, entry, &peer)?);
        }
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn set_seen(&self, conversation_id: &str, user_id: &str) -> Result<(), SyncError> {
        // One re-read is enough: the only concurrent writer of a seen flag is
        // an append racing on the same row.
        match self.write_seen(conversation_id, user_id).await {
            Err(err) if err.category == SyncErrorCategory::Conflict => {
                self.write_seen(conversation_id, user_id).await.map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    async fn upload_media(&self, user_id: &str, media: &MediaUpload) -> Result<String, SyncError> {
        let name = object_name(Utc::now().timestamp_millis(), &media.file_name);
        debug!(%user_id, %name, "uploading media");
        self.tables
            .upload_object(&self.media_bucket, &name, media)
            .await
    }

    async fn fetch_peer(&self, user_id: &str) -> Result<PeerProfile, SyncError> {
        Ok(self.tables.user(user_id).await?.profile())
    }

    async fn fetch_block_state(&self, viewer: &str, peer: &str) -> Result<BlockState, SyncError> {
        let viewer_row = self.tables.user(viewer).await?;
        let peer_row = self.tables.user(peer).await?;
        let relations: Vec<_> = viewer_row.relations().chain(peer_row.relations()).collect();
        Ok(BlockState::from_relations(viewer, peer, &relations))
    }

    async fn set_blocked(&self, viewer: &str, peer: &str, blocked: bool) -> Result<(), SyncError> {
        let viewer_row = self.tables.user(viewer).await?;
        let mut list: Vec<String> = viewer_row
            .blocked
            .into_iter()
            .filter(|id| id != peer)
            .collect();
        if blocked {
            list.push(peer.to_owned());
        }
        self.tables.update_blocked(viewer, &list).await
    }
}

/// Storage object name: `<unix_millis>_<file name>`, without path separators.
pub fn object_name(unix_millis: i64, file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("upload");
    format!("{unix_millis}_{base}")
}
