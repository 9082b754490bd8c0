use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{EventStream, RuntimeLink, SyncChannelError},
    engine::{ChangeAction, EngineConfig, LoadOutcome, LoadedConversation, OutgoingSend, SyncEngine},
    error::{SyncError, SyncErrorCategory},
    normalization::{DeliveryReport, normalize_error},
    port::{ChangeSink, RemotePort, SubscriptionHandle},
    state_machine::FetchTicket,
    types::{
        Conversation, ConversationPhase, ConversationSummary, MediaUpload, Message, PeerProfile,
        RemoteChange, SessionContext, SyncCommand, SyncEvent,
    },
};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;
const INTERNAL_BUFFER: usize = 256;

/// Handle to a running sync runtime.
#[derive(Clone, Debug)]
pub struct SyncRuntimeHandle {
    channels: RuntimeLink,
}

impl SyncRuntimeHandle {
    pub async fn send(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Start the sync runtime for `session` on the current tokio runtime.
///
/// The runtime subscribes to the user's conversation list and fetches it
/// immediately. It runs until [`SyncCommand::Teardown`].
pub fn spawn_runtime(
    port: Arc<dyn RemotePort>,
    session: SessionContext,
    config: EngineConfig,
) -> SyncRuntimeHandle {
    let (channels, command_rx) = RuntimeLink::new(COMMAND_BUFFER, EVENT_BUFFER);
    let runtime = SyncRuntime::new(port, channels.clone(), command_rx, session, config);
    tokio::spawn(async move {
        runtime.run().await;
    });

    SyncRuntimeHandle { channels }
}

/// Result of background remote work, fed back into the engine.
enum Completion {
    Opened {
        ticket: FetchTicket,
        result: Result<LoadedConversation, SyncError>,
    },
    Subscribed {
        ticket: FetchTicket,
        result: Result<SubscriptionHandle, SyncError>,
    },
    Refreshed {
        ticket: FetchTicket,
        result: Result<Conversation, SyncError>,
    },
    MediaUploaded {
        conversation_id: String,
        client_temp_id: String,
        result: Result<String, SyncError>,
    },
    Delivered {
        conversation_id: String,
        client_temp_id: String,
        report: DeliveryReport,
    },
    ListSubscribed(Result<SubscriptionHandle, SyncError>),
    ListFetched(Result<Vec<ConversationSummary>, SyncError>),
    SeenMarked {
        conversation_id: String,
        result: Result<(), SyncError>,
    },
    BlockUpdated {
        peer_id: String,
        blocked: bool,
        result: Result<(), SyncError>,
    },
}

enum Step {
    Command(Option<SyncCommand>),
    Completion(Completion),
    Change(RemoteChange),
}

struct SyncRuntime {
    port: Arc<dyn RemotePort>,
    channels: RuntimeLink,
    command_rx: mpsc::Receiver<SyncCommand>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    change_tx: ChangeSink,
    change_rx: mpsc::Receiver<RemoteChange>,
    engine: SyncEngine,
    list_subscription: Option<SubscriptionHandle>,
    staged_media: HashMap<String, MediaUpload>,
    seen_in_flight: Option<String>,
    stop: CancellationToken,
}

impl SyncRuntime {
    fn new(
        port: Arc<dyn RemotePort>,
        channels: RuntimeLink,
        command_rx: mpsc::Receiver<SyncCommand>,
        session: SessionContext,
        config: EngineConfig,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(INTERNAL_BUFFER);
        let (change_tx, change_rx) = mpsc::channel(INTERNAL_BUFFER);
        Self {
            port,
            channels,
            command_rx,
            completion_tx,
            completion_rx,
            change_tx,
            change_rx,
            engine: SyncEngine::new(session, config),
            list_subscription: None,
            staged_media: HashMap::new(),
            seen_in_flight: None,
            stop: CancellationToken::new(),
        }
    }

    async fn run(mut self) {
        self.start();

        loop {
            let step = tokio::select! {
                command = self.command_rx.recv() => Step::Command(command),
                Some(completion) = self.completion_rx.recv() => Step::Completion(completion),
                Some(change) = self.change_rx.recv() => Step::Change(change),
            };

            match step {
                Step::Command(Some(SyncCommand::Teardown)) | Step::Command(None) => {
                    self.teardown().await;
                    break;
                }
                Step::Command(Some(command)) => {
                    if let Err(err) = self.handle_command(command) {
                        self.channels.emit(normalize_error(err));
                    }
                }
                Step::Completion(completion) => self.handle_completion(completion),
                Step::Change(change) => self.handle_change(change),
            }
        }
    }

    fn start(&mut self) {
        let user_id = self.user_id();
        let port = self.port.clone();
        let sink = self.change_tx.clone();
        self.spawn_task(async move {
            Completion::ListSubscribed(port.subscribe_to_list_changes(&user_id, sink).await)
        });
        self.spawn_list_fetch();
    }

    fn handle_command(&mut self, command: SyncCommand) -> Result<(), SyncError> {
        match command {
            SyncCommand::OpenConversation { conversation_id } => {
                self.handle_open(conversation_id);
                Ok(())
            }
            SyncCommand::CloseConversation => {
                self.handle_close();
                Ok(())
            }
            SyncCommand::SendMessage { text, image } => self.handle_send(text, image),
            SyncCommand::RetrySend { client_temp_id } => self.handle_retry(client_temp_id),
            SyncCommand::DiscardFailed { client_temp_id } => {
                self.engine.discard_failed(&client_temp_id)?;
                self.staged_media.remove(&client_temp_id);
                self.emit_view();
                Ok(())
            }
            SyncCommand::RefreshList => {
                self.spawn_list_fetch();
                Ok(())
            }
            SyncCommand::SetBlocked { blocked } => self.handle_set_blocked(blocked),
            // Handled by the run loop.
            SyncCommand::Teardown => Ok(()),
        }
    }

    fn handle_open(&mut self, conversation_id: String) {
        let plan = self.engine.open_conversation(conversation_id);
        self.staged_media.clear();
        self.seen_in_flight = None;
        if let Some(handle) = plan.release {
            self.spawn_unsubscribe(handle);
        }
        self.channels.emit(SyncEvent::PhaseChanged {
            conversation_id: Some(plan.ticket.conversation_id.clone()),
            phase: ConversationPhase::Loading,
        });

        let port = self.port.clone();
        let viewer = self.user_id();
        let ticket = plan.ticket;
        self.spawn_task(async move {
            let result = load_conversation(port.as_ref(), &ticket.conversation_id, &viewer).await;
            Completion::Opened { ticket, result }
        });
    }

    fn handle_close(&mut self) {
        let was_open = self.engine.open_conversation_id().is_some();
        if let Some(handle) = self.engine.close_conversation() {
            self.spawn_unsubscribe(handle);
        }
        self.staged_media.clear();
        self.seen_in_flight = None;
        if was_open {
            self.channels.emit(SyncEvent::PhaseChanged {
                conversation_id: None,
                phase: ConversationPhase::Closed,
            });
        }
    }

    fn handle_send(&mut self, text: String, image: Option<MediaUpload>) -> Result<(), SyncError> {
        let outgoing = self
            .engine
            .begin_send(&text, image.is_some(), Utc::now())?;
        self.emit_view();
        self.emit_list();

        match image {
            Some(media) if outgoing.awaiting_media => {
                self.staged_media
                    .insert(outgoing.client_temp_id.clone(), media.clone());
                self.spawn_upload(outgoing.conversation_id, outgoing.client_temp_id, media);
            }
            _ => self.spawn_delivery(outgoing),
        }
        Ok(())
    }

    fn handle_retry(&mut self, client_temp_id: String) -> Result<(), SyncError> {
        let outgoing = self.engine.retry_send(&client_temp_id, Utc::now())?;
        self.emit_view();

        if !outgoing.awaiting_media {
            self.spawn_delivery(outgoing);
            return Ok(());
        }
        match self.staged_media.get(&client_temp_id).cloned() {
            Some(media) => {
                self.spawn_upload(outgoing.conversation_id, client_temp_id, media);
            }
            None => {
                let ack = self.engine.on_send_failed(
                    &outgoing.conversation_id,
                    &client_temp_id,
                    SyncError::new(
                        SyncErrorCategory::Internal,
                        "media_unavailable",
                        "attachment is no longer staged for upload",
                    ),
                );
                self.channels.emit(SyncEvent::SendAck(ack));
                self.emit_view();
            }
        }
        Ok(())
    }

    fn handle_set_blocked(&mut self, blocked: bool) -> Result<(), SyncError> {
        let peer_id = self
            .engine
            .open_peer_id()
            .ok_or_else(|| SyncError::invalid_state(self.engine.phase(), "set_blocked"))?;
        let port = self.port.clone();
        let viewer = self.user_id();
        self.spawn_task(async move {
            let result = port.set_blocked(&viewer, &peer_id, blocked).await;
            Completion::BlockUpdated {
                peer_id,
                blocked,
                result,
            }
        });
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Opened { ticket, result } => {
                match self.engine.on_conversation_loaded(&ticket, result) {
                    Ok(LoadOutcome::Live) => {
                        self.channels.emit(SyncEvent::PhaseChanged {
                            conversation_id: Some(ticket.conversation_id.clone()),
                            phase: ConversationPhase::Live,
                        });
                        self.emit_view();
                        self.emit_list();
                        self.spawn_subscribe(ticket);
                        self.mark_seen_if_needed();
                    }
                    Ok(LoadOutcome::Stale) => {}
                    Err(err) => {
                        self.channels.emit(SyncEvent::PhaseChanged {
                            conversation_id: None,
                            phase: ConversationPhase::Closed,
                        });
                        self.channels.emit(normalize_error(err));
                    }
                }
            }
            Completion::Subscribed { ticket, result } => match result {
                Ok(handle) => match self.engine.on_subscribed(&ticket, handle) {
                    Some(stale) => self.spawn_unsubscribe(stale),
                    // Catch writes that landed between the fetch and the subscription.
                    None => self.spawn_refresh(ticket),
                },
                Err(err) => {
                    warn!(conversation_id = %ticket.conversation_id, error = %err, "change subscription failed");
                    self.channels.emit(normalize_error(err));
                }
            },
            Completion::Refreshed { ticket, result } => match result {
                Ok(conversation) => {
                    if self.engine.on_refreshed(&ticket, conversation) {
                        self.emit_view();
                        self.mark_seen_if_needed();
                    }
                }
                Err(err) => {
                    warn!(conversation_id = %ticket.conversation_id, error = %err, "conversation refresh failed");
                    self.channels.emit(normalize_error(err));
                }
            },
            Completion::MediaUploaded {
                conversation_id,
                client_temp_id,
                result,
            } => match result {
                Ok(image_url) => match self.engine.attach_media(&client_temp_id, image_url) {
                    Some(outgoing) => {
                        self.emit_view();
                        self.spawn_delivery(outgoing);
                    }
                    None => {
                        debug!(%conversation_id, %client_temp_id, "upload finished after conversation closed");
                    }
                },
                Err(err) => {
                    let ack = self
                        .engine
                        .on_send_failed(&conversation_id, &client_temp_id, err);
                    self.channels.emit(SyncEvent::SendAck(ack));
                    self.emit_view();
                }
            },
            Completion::Delivered {
                conversation_id,
                client_temp_id,
                report,
            } => {
                if !matches!(report, DeliveryReport::OwnCopyFailed { .. }) {
                    self.staged_media.remove(&client_temp_id);
                }
                let ack = self
                    .engine
                    .on_delivery(&conversation_id, &client_temp_id, report);
                self.channels.emit(SyncEvent::SendAck(ack));
                self.emit_view();
                if let Some(ticket) = self.engine.refresh_ticket()
                    && ticket.conversation_id == conversation_id
                {
                    self.spawn_refresh(ticket);
                }
            }
            Completion::ListSubscribed(result) => match result {
                Ok(handle) => {
                    if let Some(previous) = self.list_subscription.replace(handle) {
                        self.spawn_unsubscribe(previous);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "conversation list subscription failed");
                    self.channels.emit(normalize_error(err));
                }
            },
            Completion::ListFetched(result) => match result {
                Ok(rows) => {
                    self.engine.replace_list(rows);
                    self.emit_list();
                }
                Err(err) => {
                    warn!(error = %err, "conversation list fetch failed");
                    self.channels.emit(normalize_error(err));
                }
            },
            Completion::SeenMarked {
                conversation_id,
                result,
            } => {
                if self.seen_in_flight.as_deref() == Some(conversation_id.as_str()) {
                    self.seen_in_flight = None;
                }
                match result {
                    Ok(()) => {
                        self.engine.on_seen_marked(&conversation_id);
                        self.emit_list();
                    }
                    Err(err) => {
                        warn!(%conversation_id, error = %err, "failed to mark conversation seen");
                    }
                }
            }
            Completion::BlockUpdated {
                peer_id,
                blocked,
                result,
            } => match result {
                Ok(()) => {
                    info!(%peer_id, blocked, "block state updated");
                    self.engine.set_peer_blocked(&peer_id, blocked);
                    self.emit_view();
                }
                Err(err) => self.channels.emit(normalize_error(err)),
            },
        }
    }

    fn handle_change(&mut self, change: RemoteChange) {
        match self.engine.on_remote_change(change) {
            ChangeAction::Ignored => {}
            ChangeAction::Applied => {
                self.emit_view();
                self.mark_seen_if_needed();
            }
            ChangeAction::Refetch(ticket) => self.spawn_refresh(ticket),
            ChangeAction::RefreshList => self.spawn_list_fetch(),
        }
    }

    async fn teardown(&mut self) {
        if let Some(handle) = self.engine.teardown() {
            self.port.unsubscribe(&handle).await;
        }
        if let Some(handle) = self.list_subscription.take() {
            self.port.unsubscribe(&handle).await;
        }
        self.stop.cancel();
        self.staged_media.clear();
        info!(user_id = %self.engine.session().user_id, "sync runtime stopped");
        self.channels.emit(SyncEvent::Stopped);
    }

    fn mark_seen_if_needed(&mut self) {
        let Some(conversation_id) = self.engine.unseen_live_conversation() else {
            return;
        };
        if self.seen_in_flight.as_deref() == Some(conversation_id.as_str()) {
            return;
        }
        self.seen_in_flight = Some(conversation_id.clone());
        let port = self.port.clone();
        let user_id = self.user_id();
        self.spawn_task(async move {
            let result = port.set_seen(&conversation_id, &user_id).await;
            Completion::SeenMarked {
                conversation_id,
                result,
            }
        });
    }

    fn spawn_subscribe(&self, ticket: FetchTicket) {
        let port = self.port.clone();
        let user_id = self.user_id();
        let sink = self.change_tx.clone();
        self.spawn_task(async move {
            let result = port
                .subscribe_to_changes(&ticket.conversation_id, &user_id, sink)
                .await;
            Completion::Subscribed { ticket, result }
        });
    }

    fn spawn_refresh(&self, ticket: FetchTicket) {
        let port = self.port.clone();
        let user_id = self.user_id();
        self.spawn_task(async move {
            let result = port
                .fetch_conversation(&ticket.conversation_id, &user_id)
                .await;
            Completion::Refreshed { ticket, result }
        });
    }

    fn spawn_list_fetch(&self) {
        let port = self.port.clone();
        let user_id = self.user_id();
        self.spawn_task(async move {
            Completion::ListFetched(port.fetch_conversation_list(&user_id).await)
        });
    }

    fn spawn_upload(&self, conversation_id: String, client_temp_id: String, media: MediaUpload) {
        let port = self.port.clone();
        let user_id = self.user_id();
        self.spawn_task(async move {
            let result = port.upload_media(&user_id, &media).await;
            Completion::MediaUploaded {
                conversation_id,
                client_temp_id,
                result,
            }
        });
    }

    fn spawn_delivery(&self, outgoing: OutgoingSend) {
        let port = self.port.clone();
        let user_id = self.user_id();
        let config = self.engine.config().clone();
        self.spawn_task(async move {
            let report = deliver(port.as_ref(), &config, &user_id, &outgoing).await;
            Completion::Delivered {
                conversation_id: outgoing.conversation_id,
                client_temp_id: outgoing.client_temp_id,
                report,
            }
        });
    }

    fn spawn_unsubscribe(&self, handle: SubscriptionHandle) {
        let port = self.port.clone();
        tokio::spawn(async move {
            port.unsubscribe(&handle).await;
        });
    }

    /// Run remote work off the loop; its completion is dropped after teardown.
    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completion_tx = self.completion_tx.clone();
        let stop = self.stop.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                completion = task => {
                    let _ = completion_tx.send(completion).await;
                }
            }
        });
    }

    fn emit_view(&self) {
        if let Some(view) = self.engine.conversation_view() {
            self.channels.emit(SyncEvent::ConversationUpdated(view));
        }
    }

    fn emit_list(&self) {
        self.channels.emit(SyncEvent::ListUpdated {
            rows: self.engine.list_view(""),
        });
    }

    fn user_id(&self) -> String {
        self.engine.session().user_id.clone()
    }
}

/// Fetch a conversation together with its peer profile and block state.
async fn load_conversation(
    port: &dyn RemotePort,
    conversation_id: &str,
    viewer: &str,
) -> Result<LoadedConversation, SyncError> {
    let conversation = port.fetch_conversation(conversation_id, viewer).await?;
    let Some(peer_id) = conversation.peer_of(viewer).map(str::to_owned) else {
        return Ok(LoadedConversation {
            conversation,
            peer: None,
            block: Default::default(),
        });
    };

    let block = port.fetch_block_state(viewer, &peer_id).await?;
    let peer = if block.viewer_blocked {
        Some(PeerProfile::masked(peer_id))
    } else {
        match port.fetch_peer(&peer_id).await {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!(%conversation_id, %peer_id, error = %err, "peer profile unavailable");
                None
            }
        }
    };

    Ok(LoadedConversation {
        conversation,
        peer,
        block,
    })
}

/// Write the sender's copy, then the peer's copy.
async fn deliver(
    port: &dyn RemotePort,
    config: &EngineConfig,
    sender_id: &str,
    outgoing: &OutgoingSend,
) -> DeliveryReport {
    let conversation_id = outgoing.conversation_id.as_str();
    if let Err(error) =
        append_with_conflict_retry(port, config, conversation_id, sender_id, &outgoing.message)
            .await
    {
        return DeliveryReport::OwnCopyFailed { error };
    }

    match append_with_conflict_retry(
        port,
        config,
        conversation_id,
        &outgoing.peer_id,
        &outgoing.message,
    )
    .await
    {
        Ok(()) => DeliveryReport::Delivered,
        Err(error) => DeliveryReport::PeerCopyFailed { error },
    }
}

/// Append, re-applying after `Conflict` up to the configured limit.
async fn append_with_conflict_retry(
    port: &dyn RemotePort,
    config: &EngineConfig,
    conversation_id: &str,
    as_user: &str,
    message: &Message,
) -> Result<(), SyncError> {
    let mut attempt: u32 = 0;
    loop {
        match port.append_message(conversation_id, as_user, message).await {
            Ok(()) => return Ok(()),
            Err(err)
                if err.category == SyncErrorCategory::Conflict
                    && attempt < config.max_conflict_retries =>
            {
                let delay = config
                    .retry_policy
                    .delay(attempt, err.retry_after_ms.map(Duration::from_millis));
                attempt = attempt.saturating_add(1);
                debug!(%conversation_id, %as_user, attempt, ?delay, "append conflict; re-applying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Mutex};

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        normalization::PEER_COPY_FAILED,
        retry::RetryPolicy,
        types::{BlockRelation, BlockState, ConversationView, DeliveryStatus},
    };

    const ME: &str = "alice";
    const PEER: &str = "bob";
    const CHAT: &str = "chat_1";

    #[derive(Default)]
    struct MockState {
        copies: HashMap<(String, String), Conversation>,
        peers: HashMap<String, PeerProfile>,
        blocks: Vec<BlockRelation>,
        fail_append_for: Option<String>,
        conflicts_remaining: u32,
        append_calls: usize,
        sinks: HashMap<SubscriptionHandle, (String, String, ChangeSink)>,
    }

    #[derive(Default)]
    struct MockPort {
        state: Mutex<MockState>,
    }

    impl MockPort {
        fn seeded() -> Arc<Self> {
            let port = Self::default();
            {
                let mut state = port.state.lock().expect("lock");
                for user in [ME, PEER] {
                    state.copies.insert(
                        (CHAT.to_owned(), user.to_owned()),
                        Conversation {
                            conversation_id: CHAT.to_owned(),
                            participant_ids: [ME.to_owned(), PEER.to_owned()]
                                .into_iter()
                                .collect(),
                            messages: Vec::new(),
                            last_message_text: String::new(),
                            updated_at: Utc::now(),
                            seen_by: BTreeSet::new(),
                        },
                    );
                    state.peers.insert(
                        user.to_owned(),
                        PeerProfile {
                            user_id: user.to_owned(),
                            username: user.to_owned(),
                            avatar_url: None,
                        },
                    );
                }
            }
            Arc::new(port)
        }

        fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
            let mut state = self.state.lock().expect("lock");
            f(&mut state)
        }

        fn copy_of(&self, user: &str) -> Conversation {
            self.with_state(|state| {
                state.copies[&(CHAT.to_owned(), user.to_owned())].clone()
            })
        }
    }

    #[async_trait]
    impl RemotePort for MockPort {
        async fn fetch_conversation(
            &self,
            conversation_id: &str,
            as_user: &str,
        ) -> Result<Conversation, SyncError> {
            self.with_state(|state| {
                state
                    .copies
                    .get(&(conversation_id.to_owned(), as_user.to_owned()))
                    .cloned()
                    .ok_or_else(|| SyncError::not_found("chat_not_found", conversation_id))
            })
        }

        async fn append_message(
            &self,
            conversation_id: &str,
            as_user: &str,
            message: &Message,
        ) -> Result<(), SyncError> {
            self.with_state(|state| {
                state.append_calls += 1;
                if state.fail_append_for.as_deref() == Some(as_user) {
                    return Err(SyncError::network("offline", "append unreachable"));
                }
                if state.conflicts_remaining > 0 {
                    state.conflicts_remaining -= 1;
                    return Err(SyncError::conflict("record changed"));
                }
                let copy = state
                    .copies
                    .get_mut(&(conversation_id.to_owned(), as_user.to_owned()))
                    .ok_or_else(|| SyncError::not_found("chat_not_found", conversation_id))?;
                copy.messages.push(message.clone());
                copy.last_message_text = message.text.clone();
                copy.updated_at = message.created_at;
                for (conv, user, sink) in state.sinks.values() {
                    if conv == conversation_id && user == as_user {
                        let _ = sink.try_send(RemoteChange::Conversation {
                            conversation_id: conv.clone(),
                            snapshot: None,
                        });
                    }
                }
                Ok(())
            })
        }

        async fn subscribe_to_changes(
            &self,
            conversation_id: &str,
            as_user: &str,
            sink: ChangeSink,
        ) -> Result<SubscriptionHandle, SyncError> {
            let handle = SubscriptionHandle::new();
            self.with_state(|state| {
                state.sinks.insert(
                    handle.clone(),
                    (conversation_id.to_owned(), as_user.to_owned(), sink),
                )
            });
            Ok(handle)
        }

        async fn subscribe_to_list_changes(
            &self,
            _user_id: &str,
            _sink: ChangeSink,
        ) -> Result<SubscriptionHandle, SyncError> {
            Ok(SubscriptionHandle::new())
        }

        async fn unsubscribe(&self, handle: &SubscriptionHandle) {
            self.with_state(|state| state.sinks.remove(handle));
        }

        async fn fetch_conversation_list(
            &self,
            user_id: &str,
        ) -> Result<Vec<ConversationSummary>, SyncError> {
            self.with_state(|state| {
                Ok(state
                    .copies
                    .iter()
                    .filter(|((_, owner), _)| owner == user_id)
                    .filter_map(|(_, conversation)| {
                        let peer_id = conversation.peer_of(user_id)?.to_owned();
                        Some(ConversationSummary {
                            conversation_id: conversation.conversation_id.clone(),
                            peer: state.peers.get(&peer_id).cloned()?,
                            peer_user_id: peer_id,
                            last_message_text: conversation.last_message_text.clone(),
                            updated_at: conversation.updated_at,
                            is_seen: conversation.is_seen_by(user_id),
                        })
                    })
                    .collect())
            })
        }

        async fn set_seen(&self, conversation_id: &str, user_id: &str) -> Result<(), SyncError> {
            self.with_state(|state| {
                if let Some(copy) = state
                    .copies
                    .get_mut(&(conversation_id.to_owned(), user_id.to_owned()))
                {
                    copy.seen_by.insert(user_id.to_owned());
                }
            });
            Ok(())
        }

        async fn upload_media(
            &self,
            _user_id: &str,
            media: &MediaUpload,
        ) -> Result<String, SyncError> {
            Ok(format!("https://media.test/{}", media.file_name))
        }

        async fn fetch_peer(&self, user_id: &str) -> Result<PeerProfile, SyncError> {
            self.with_state(|state| {
                state
                    .peers
                    .get(user_id)
                    .cloned()
                    .ok_or_else(|| SyncError::not_found("user_not_found", user_id))
            })
        }

        async fn fetch_block_state(
            &self,
            viewer: &str,
            peer: &str,
        ) -> Result<BlockState, SyncError> {
            Ok(self.with_state(|state| BlockState::from_relations(viewer, peer, &state.blocks)))
        }

        async fn set_blocked(
            &self,
            viewer: &str,
            peer: &str,
            blocked: bool,
        ) -> Result<(), SyncError> {
            self.with_state(|state| {
                state
                    .blocks
                    .retain(|r| !(r.blocker_id == viewer && r.blocked_id == peer));
                if blocked {
                    state.blocks.push(BlockRelation {
                        blocker_id: viewer.to_owned(),
                        blocked_id: peer.to_owned(),
                    });
                }
            });
            Ok(())
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry_policy: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
            ..EngineConfig::default()
        }
    }

    fn start(port: Arc<MockPort>) -> (SyncRuntimeHandle, EventStream) {
        let handle = spawn_runtime(port, SessionContext::new(ME), fast_config());
        let events = handle.subscribe();
        (handle, events)
    }

    async fn wait_for<T>(
        events: &mut EventStream,
        mut pick: impl FnMut(SyncEvent) -> Option<T>,
    ) -> T {
        timeout(Duration::from_secs(2), async {
            loop {
                let event = events.next().await.expect("event stream open");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        })
        .await
        .expect("expected event in time")
    }

    async fn open(handle: &SyncRuntimeHandle, events: &mut EventStream) -> ConversationView {
        handle
            .send(SyncCommand::OpenConversation {
                conversation_id: CHAT.to_owned(),
            })
            .await
            .expect("open enqueued");
        wait_for(events, |event| match event {
            SyncEvent::PhaseChanged {
                phase: ConversationPhase::Live,
                ..
            } => Some(()),
            _ => None,
        })
        .await;
        wait_for(events, |event| match event {
            SyncEvent::ConversationUpdated(view) => Some(view),
            _ => None,
        })
        .await
    }

    async fn send_text(handle: &SyncRuntimeHandle, text: &str) {
        handle
            .send(SyncCommand::SendMessage {
                text: text.to_owned(),
                image: None,
            })
            .await
            .expect("send enqueued");
    }

    async fn next_ack(events: &mut EventStream) -> crate::types::SendAck {
        wait_for(events, |event| match event {
            SyncEvent::SendAck(ack) => Some(ack),
            _ => None,
        })
        .await
    }

    #[tokio::test]
    async fn open_emits_loading_then_live() {
        let port = MockPort::seeded();
        let (handle, mut events) = start(port);

        handle
            .send(SyncCommand::OpenConversation {
                conversation_id: CHAT.to_owned(),
            })
            .await
            .expect("open enqueued");

        let loading = wait_for(&mut events, |event| match event {
            SyncEvent::PhaseChanged { phase, .. } => Some(phase),
            _ => None,
        })
        .await;
        assert_eq!(loading, ConversationPhase::Loading);

        let view = wait_for(&mut events, |event| match event {
            SyncEvent::ConversationUpdated(view) => Some(view),
            _ => None,
        })
        .await;
        assert_eq!(view.phase, ConversationPhase::Live);
        assert_eq!(view.peer.map(|p| p.username).as_deref(), Some(PEER));
        assert!(view.can_send);
    }

    #[tokio::test]
    async fn send_reaches_both_copies_and_is_confirmed() {
        let port = MockPort::seeded();
        let (handle, mut events) = start(port.clone());
        open(&handle, &mut events).await;

        send_text(&handle, "hi").await;
        let ack = next_ack(&mut events).await;
        assert!(ack.delivered);

        let confirmed = wait_for(&mut events, |event| match event {
            SyncEvent::ConversationUpdated(view)
                if view
                    .messages
                    .iter()
                    .all(|m| m.status == DeliveryStatus::Confirmed)
                    && view.messages.len() == 1 =>
            {
                Some(view)
            }
            _ => None,
        })
        .await;
        assert_eq!(confirmed.messages[0].text, "hi");
        assert_eq!(confirmed.messages[0].client_temp_id, None);

        assert_eq!(port.copy_of(ME).messages.len(), 1);
        assert_eq!(port.copy_of(PEER).messages.len(), 1);
    }

    #[tokio::test]
    async fn blocked_send_never_reaches_remote() {
        let port = MockPort::seeded();
        port.with_state(|state| {
            state.blocks.push(BlockRelation {
                blocker_id: PEER.to_owned(),
                blocked_id: ME.to_owned(),
            })
        });
        let (handle, mut events) = start(port.clone());
        let view = open(&handle, &mut events).await;
        assert!(!view.can_send);
        assert_eq!(view.peer.map(|p| p.username).as_deref(), Some("User"));

        send_text(&handle, "hello?").await;
        let err = wait_for(&mut events, |event| match event {
            SyncEvent::Error(err) => Some(err),
            _ => None,
        })
        .await;
        assert_eq!(err.category, SyncErrorCategory::Forbidden);
        assert_eq!(port.with_state(|state| state.append_calls), 0);
    }

    #[tokio::test]
    async fn own_copy_failure_is_retryable() {
        let port = MockPort::seeded();
        port.with_state(|state| state.fail_append_for = Some(ME.to_owned()));
        let (handle, mut events) = start(port.clone());
        open(&handle, &mut events).await;

        send_text(&handle, "hi").await;
        let ack = next_ack(&mut events).await;
        assert!(!ack.delivered);
        assert_eq!(ack.error_code.as_deref(), Some("offline"));
        assert_eq!(port.copy_of(PEER).messages.len(), 0);

        port.with_state(|state| state.fail_append_for = None);
        handle
            .send(SyncCommand::RetrySend {
                client_temp_id: ack.client_temp_id.clone(),
            })
            .await
            .expect("retry enqueued");
        let retried = next_ack(&mut events).await;
        assert_eq!(retried.client_temp_id, ack.client_temp_id);
        assert!(retried.delivered);
        assert_eq!(port.copy_of(ME).messages.len(), 1);
    }

    #[tokio::test]
    async fn peer_copy_failure_is_reported() {
        let port = MockPort::seeded();
        port.with_state(|state| state.fail_append_for = Some(PEER.to_owned()));
        let (handle, mut events) = start(port.clone());
        open(&handle, &mut events).await;

        send_text(&handle, "one-sided").await;
        let ack = next_ack(&mut events).await;
        assert_eq!(ack.error_code.as_deref(), Some(PEER_COPY_FAILED));
        assert_eq!(port.copy_of(ME).messages.len(), 1);
    }

    #[tokio::test]
    async fn conflicts_are_reapplied_then_surface() {
        let port = MockPort::seeded();
        port.with_state(|state| state.conflicts_remaining = 2);
        let (handle, mut events) = start(port.clone());
        open(&handle, &mut events).await;

        send_text(&handle, "contended").await;
        assert!(next_ack(&mut events).await.delivered);

        port.with_state(|state| state.conflicts_remaining = 100);
        send_text(&handle, "hopeless").await;
        let ack = next_ack(&mut events).await;
        assert_eq!(ack.error_code.as_deref(), Some("conflict"));
    }

    #[tokio::test]
    async fn image_send_uploads_before_append() {
        let port = MockPort::seeded();
        let (handle, mut events) = start(port.clone());
        open(&handle, &mut events).await;

        handle
            .send(SyncCommand::SendMessage {
                text: String::new(),
                image: Some(MediaUpload {
                    file_name: "cat.png".into(),
                    content_type: "image/png".into(),
                    bytes: vec![1, 2, 3],
                }),
            })
            .await
            .expect("send enqueued");
        assert!(next_ack(&mut events).await.delivered);

        let stored = port.copy_of(PEER);
        assert_eq!(
            stored.messages[0].image_url.as_deref(),
            Some("https://media.test/cat.png")
        );
    }

    #[tokio::test]
    async fn remote_change_updates_open_view() {
        let port = MockPort::seeded();
        let (handle, mut events) = start(port.clone());
        open(&handle, &mut events).await;
        // Let the change subscription register.
        tokio::time::sleep(Duration::from_millis(50)).await;

        port.append_message(
            CHAT,
            ME,
            &Message {
                sender_id: PEER.to_owned(),
                text: "ping".to_owned(),
                image_url: None,
                created_at: Utc::now(),
                client_temp_id: None,
            },
        )
        .await
        .expect("peer write");

        let view = wait_for(&mut events, |event| match event {
            SyncEvent::ConversationUpdated(view) if !view.messages.is_empty() => Some(view),
            _ => None,
        })
        .await;
        assert_eq!(view.messages[0].text, "ping");
        assert!(!view.messages[0].is_own);
    }

    #[tokio::test]
    async fn teardown_stops_runtime_and_releases_subscriptions() {
        let port = MockPort::seeded();
        let (handle, mut events) = start(port.clone());
        open(&handle, &mut events).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.send(SyncCommand::Teardown).await.expect("teardown");
        wait_for(&mut events, |event| match event {
            SyncEvent::Stopped => Some(()),
            _ => None,
        })
        .await;
        assert!(port.with_state(|state| state.sinks.is_empty()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = handle
            .send(SyncCommand::RefreshList)
            .await
            .expect_err("runtime is gone");
        assert!(matches!(err.into_command(), SyncCommand::RefreshList));
    }
}
