//! Plain-text rendering of engine views.

use chat_core::{
    BlockState, ConversationSummary, ConversationView, DeliveryStatus, MessageView,
};

pub fn render_row(index: usize, row: &ConversationSummary, is_open: bool) -> String {
    let marker = if is_open {
        '>'
    } else if row.is_seen {
        ' '
    } else {
        '*'
    };
    let preview = if row.last_message_text.is_empty() {
        "(no messages)"
    } else {
        row.last_message_text.as_str()
    };
    format!(
        "{marker} {index:>2}. {:<16} {}  [{}]",
        row.peer.username,
        truncate(preview, 40),
        row.updated_at.format("%Y-%m-%d %H:%M")
    )
}

pub fn render_header(view: &ConversationView) -> String {
    let peer = view
        .peer
        .as_ref()
        .map(|peer| peer.username.as_str())
        .unwrap_or("unknown user");
    let mut header = format!("== {peer} ({}) ==", view.conversation_id);
    if let Some(note) = block_note(&view.block) {
        header.push_str("  ");
        header.push_str(note);
    }
    header
}

pub fn block_note(block: &BlockState) -> Option<&'static str> {
    if block.viewer_blocked {
        Some("[you have been blocked]")
    } else if block.peer_blocked {
        Some("[user blocked]")
    } else {
        None
    }
}

pub fn render_message(message: &MessageView, peer_name: &str) -> String {
    let who = if message.is_own { "you" } else { peer_name };
    let mut line = format!("[{}] {who}: {}", message.created_at.format("%H:%M"), message.text);
    if let Some(url) = &message.image_url {
        line.push_str(&format!(" <image {url}>"));
    } else if message.awaiting_media {
        line.push_str(" <uploading image>");
    }
    match (&message.status, &message.client_temp_id) {
        (DeliveryStatus::Pending, _) => line.push_str("  (sending)"),
        (DeliveryStatus::Failed { error_code }, Some(temp_id)) => {
            line.push_str(&format!("  (failed: {error_code}; /retry {temp_id} or /discard {temp_id})"));
        }
        (DeliveryStatus::Failed { error_code }, None) => {
            line.push_str(&format!("  (failed: {error_code})"));
        }
        (DeliveryStatus::Confirmed, _) => {}
    }
    line
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use chat_core::PeerProfile;
    use chrono::{TimeZone, Utc};

    use super::*;

    fn message(status: DeliveryStatus, temp: Option<&str>) -> MessageView {
        MessageView {
            sender_id: "me".into(),
            text: "hello".into(),
            image_url: None,
            created_at: Utc
                .with_ymd_and_hms(2024, 11, 7, 9, 5, 0)
                .single()
                .expect("valid date"),
            client_temp_id: temp.map(str::to_owned),
            status,
            awaiting_media: false,
            is_own: true,
        }
    }

    #[test]
    fn failed_messages_show_recovery_commands() {
        let line = render_message(
            &message(
                DeliveryStatus::Failed {
                    error_code: "offline".into(),
                },
                Some("t1"),
            ),
            "bob",
        );
        assert_eq!(
            line,
            "[09:05] you: hello  (failed: offline; /retry t1 or /discard t1)"
        );
        assert_eq!(
            render_message(&message(DeliveryStatus::Confirmed, None), "bob"),
            "[09:05] you: hello"
        );
    }

    #[test]
    fn rows_mark_unseen_and_truncate() {
        let row = ConversationSummary {
            conversation_id: "chat_1".into(),
            peer_user_id: "u2".into(),
            peer: PeerProfile {
                user_id: "u2".into(),
                username: "bob".into(),
                avatar_url: None,
            },
            last_message_text: "x".repeat(50),
            updated_at: Utc
                .with_ymd_and_hms(2024, 11, 7, 9, 5, 0)
                .single()
                .expect("valid date"),
            is_seen: false,
        };
        let line = render_row(1, &row, false);
        assert!(line.starts_with("*  1. bob"));
        assert!(line.contains(&format!("{}…", "x".repeat(40))));
        assert!(line.ends_with("[2024-11-07 09:05]"));
    }
}
