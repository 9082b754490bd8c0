//! Console-side reducer over runtime events.

use std::collections::HashMap;

use chat_core::{
    ConversationPhase, ConversationSummary, ConversationView, DeliveryStatus, LocalCache,
    MessageView, PEER_COPY_FAILED, SyncEvent,
};
use tracing::trace;

use crate::{
    commands::OpenTarget,
    render::{render_header, render_message, render_row},
};

/// Identity of a message across its pending and confirmed forms.
fn message_key(message: &MessageView) -> String {
    format!(
        "{}|{}|{}",
        message.sender_id,
        message.created_at.timestamp_millis(),
        message.text
    )
}

/// Tracks what has been printed so each event prints only what changed.
#[derive(Debug, Default)]
pub struct ConsoleState {
    list: LocalCache,
    shown_rows: Vec<ConversationSummary>,
    open_id: Option<String>,
    peer_name: String,
    can_send: bool,
    printed: HashMap<String, DeliveryStatus>,
}

impl ConsoleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_conversation_id(&self) -> Option<&str> {
        self.open_id.as_deref()
    }

    pub fn can_send(&self) -> bool {
        self.can_send
    }

    /// Apply one runtime event and return the lines to print.
    pub fn apply(&mut self, event: SyncEvent) -> Vec<String> {
        trace!(?event, "console event");
        match event {
            SyncEvent::PhaseChanged {
                conversation_id,
                phase,
            } => match phase {
                ConversationPhase::Loading => {
                    vec![format!("opening {}...", conversation_id.unwrap_or_default())]
                }
                ConversationPhase::Closed => {
                    let was_open = self.open_id.take().is_some();
                    self.printed.clear();
                    self.can_send = false;
                    if was_open {
                        vec!["conversation closed".to_owned()]
                    } else {
                        Vec::new()
                    }
                }
                ConversationPhase::Live => Vec::new(),
            },
            SyncEvent::ConversationUpdated(view) => self.apply_view(view),
            SyncEvent::ListUpdated { rows } => self.apply_list(rows),
            SyncEvent::SendAck(ack) => match ack.error_code.as_deref() {
                Some(PEER_COPY_FAILED) => vec![format!(
                    "! message {} was saved but did not reach the other side",
                    ack.client_temp_id
                )],
                _ => Vec::new(),
            },
            SyncEvent::Error(err) => vec![format!("! {}: {}", err.code, err.message)],
            SyncEvent::Stopped => {
                self.open_id = None;
                self.printed.clear();
                vec!["session closed".to_owned()]
            }
        }
    }

    fn apply_view(&mut self, view: ConversationView) -> Vec<String> {
        let mut lines = Vec::new();
        if self.open_id.as_deref() != Some(view.conversation_id.as_str()) {
            self.open_id = Some(view.conversation_id.clone());
            self.printed.clear();
            lines.push(render_header(&view));
        }
        if view.phase != ConversationPhase::Live {
            return lines;
        }
        let fresh_open = !lines.is_empty();
        if !fresh_open && self.can_send != view.can_send {
            lines.push(if view.can_send {
                "sending is enabled again".to_owned()
            } else {
                "sending is disabled for this conversation".to_owned()
            });
        }
        self.can_send = view.can_send;
        self.peer_name = view
            .peer
            .as_ref()
            .map(|peer| peer.username.clone())
            .unwrap_or_else(|| "them".to_owned());

        for message in &view.messages {
            let key = message_key(message);
            let changed = match self.printed.get(&key) {
                None => true,
                Some(previous) => {
                    previous != &message.status
                        && matches!(message.status, DeliveryStatus::Failed { .. })
                }
            };
            if changed {
                lines.push(render_message(message, &self.peer_name));
            }
            self.printed.insert(key, message.status.clone());
        }
        lines
    }

    fn apply_list(&mut self, rows: Vec<ConversationSummary>) -> Vec<String> {
        let previous: HashMap<String, ConversationSummary> = self
            .list
            .list()
            .iter()
            .map(|row| (row.conversation_id.clone(), row.clone()))
            .collect();
        self.list.replace_list(rows);

        self.list
            .list()
            .iter()
            .filter(|row| !row.is_seen)
            .filter(|row| self.open_id.as_deref() != Some(row.conversation_id.as_str()))
            .filter(|row| {
                previous
                    .get(&row.conversation_id)
                    .is_none_or(|before| before.updated_at != row.updated_at || before.is_seen)
            })
            .map(|row| format!("* new message from {}", row.peer.username))
            .collect()
    }

    /// Render the list and remember it for `/open <n>`.
    pub fn list_lines(&mut self, filter: &str) -> Vec<String> {
        self.shown_rows = self.list.filtered_list(filter);
        if self.shown_rows.is_empty() {
            return vec!["no conversations; start one with /add <username>".to_owned()];
        }
        self.shown_rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let is_open = self.open_id.as_deref() == Some(row.conversation_id.as_str());
                render_row(i + 1, row, is_open)
            })
            .collect()
    }

    pub fn resolve(&self, target: &OpenTarget) -> Result<String, String> {
        match target {
            OpenTarget::ChatId(id) => Ok(id.clone()),
            OpenTarget::Row(n) => self
                .shown_rows
                .get(n - 1)
                .map(|row| row.conversation_id.clone())
                .ok_or_else(|| format!("no row {n}; run /list first")),
        }
    }
}

#[cfg(test)]
mod tests {
    use chat_core::{BlockState, PeerProfile, SendAck, SyncError};
    use chrono::{TimeZone, Utc};

    use super::*;

    fn at(minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 7, 9, minute, 0)
            .single()
            .expect("valid date")
    }

    fn message(text: &str, minute: u32, status: DeliveryStatus, temp: Option<&str>) -> MessageView {
        MessageView {
            sender_id: "me".into(),
            text: text.into(),
            image_url: None,
            created_at: at(minute),
            client_temp_id: temp.map(str::to_owned),
            status,
            awaiting_media: false,
            is_own: true,
        }
    }

    fn view(messages: Vec<MessageView>, can_send: bool) -> ConversationView {
        ConversationView {
            conversation_id: "chat_1".into(),
            phase: ConversationPhase::Live,
            peer: Some(PeerProfile {
                user_id: "u2".into(),
                username: "bob".into(),
                avatar_url: None,
            }),
            messages,
            last_message_text: String::new(),
            block: BlockState::default(),
            can_send,
        }
    }

    fn row(id: &str, name: &str, minute: u32, is_seen: bool) -> ConversationSummary {
        ConversationSummary {
            conversation_id: id.into(),
            peer_user_id: format!("{name}-id"),
            peer: PeerProfile {
                user_id: format!("{name}-id"),
                username: name.into(),
                avatar_url: None,
            },
            last_message_text: "hi".into(),
            updated_at: at(minute),
            is_seen,
        }
    }

    #[test]
    fn pending_then_confirmed_prints_once() {
        let mut state = ConsoleState::new();
        let first = state.apply(SyncEvent::ConversationUpdated(view(
            vec![message("hi", 1, DeliveryStatus::Pending, Some("t1"))],
            true,
        )));
        assert_eq!(first.len(), 2);
        assert!(first[0].starts_with("== bob (chat_1)"));

        let confirmed = state.apply(SyncEvent::ConversationUpdated(view(
            vec![message("hi", 1, DeliveryStatus::Confirmed, None)],
            true,
        )));
        assert!(confirmed.is_empty());

        let failed = state.apply(SyncEvent::ConversationUpdated(view(
            vec![
                message("hi", 1, DeliveryStatus::Confirmed, None),
                message(
                    "again",
                    2,
                    DeliveryStatus::Failed {
                        error_code: "offline".into(),
                    },
                    Some("t2"),
                ),
            ],
            true,
        )));
        assert_eq!(failed.len(), 1);
        assert!(failed[0].contains("/retry t2"));
    }

    #[test]
    fn blocking_transitions_are_announced() {
        let mut state = ConsoleState::new();
        state.apply(SyncEvent::ConversationUpdated(view(Vec::new(), true)));
        let lines = state.apply(SyncEvent::ConversationUpdated(view(Vec::new(), false)));
        assert_eq!(lines, vec!["sending is disabled for this conversation".to_owned()]);
        assert!(!state.can_send());
        let lines = state.apply(SyncEvent::ConversationUpdated(view(Vec::new(), true)));
        assert_eq!(lines, vec!["sending is enabled again".to_owned()]);
    }

    #[test]
    fn list_rows_resolve_and_announce_new_messages() {
        let mut state = ConsoleState::new();
        let notices = state.apply(SyncEvent::ListUpdated {
            rows: vec![row("chat_a", "alice", 1, true), row("chat_b", "bob", 2, false)],
        });
        assert_eq!(notices, vec!["* new message from bob".to_owned()]);

        let lines = state.list_lines("");
        assert_eq!(lines.len(), 2);
        assert_eq!(state.resolve(&OpenTarget::Row(1)), Ok("chat_b".to_owned()));
        assert!(state.resolve(&OpenTarget::Row(3)).is_err());

        state.list_lines("ALI");
        assert_eq!(state.resolve(&OpenTarget::Row(1)), Ok("chat_a".to_owned()));

        let repeat = state.apply(SyncEvent::ListUpdated {
            rows: vec![row("chat_a", "alice", 1, true), row("chat_b", "bob", 2, false)],
        });
        assert!(repeat.is_empty());
    }

    #[test]
    fn errors_and_partial_delivery_are_printed() {
        let mut state = ConsoleState::new();
        let lines = state.apply(SyncEvent::Error(SyncError::forbidden(
            "blocked",
            "sending is disabled",
        )));
        assert_eq!(lines, vec!["! blocked: sending is disabled".to_owned()]);

        let lines = state.apply(SyncEvent::SendAck(SendAck {
            conversation_id: "chat_1".into(),
            client_temp_id: "t9".into(),
            delivered: false,
            error_code: Some(PEER_COPY_FAILED.into()),
        }));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("t9"));
    }
}
