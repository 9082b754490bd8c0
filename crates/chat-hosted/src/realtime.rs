//! Realtime change feed over the hosted service's websocket channels.
//!
//! Each followed `userchats` row gets its own channel joined with a
//! `postgres_changes` filter on the row id. The connection sends a heartbeat
//! every 30 seconds and reconnects with backoff until stopped. Updates made
//! while disconnected are not replayed, so every rejoin after the first is
//! reported as [`RowEvent::Resync`].

use std::time::Duration;

use async_trait::async_trait;
use chat_core::{RetryPolicy, SyncError};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::HostedConfig,
    rest::AccessToken,
    schema::{UserChatsRow, decode_row},
    tables::{RowEvent, RowFeed},
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_TOPIC: &str = "phoenix";

/// One frame of the channel protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl ChannelFrame {
    pub fn join(topic: &str, row_id: &str, access_token: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            event: "phx_join".to_owned(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [{
                        "event": "UPDATE",
                        "schema": "public",
                        "table": "userchats",
                        "filter": format!("id=eq.{row_id}"),
                    }],
                },
                "access_token": access_token,
            }),
            reference: Some(reference.to_owned()),
            join_ref: Some(reference.to_owned()),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: HEARTBEAT_TOPIC.to_owned(),
            event: "heartbeat".to_owned(),
            payload: json!({}),
            reference: Some(reference.to_owned()),
            join_ref: None,
        }
    }

    pub fn leave(topic: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            event: "phx_leave".to_owned(),
            payload: json!({}),
            reference: Some(reference.to_owned()),
            join_ref: None,
        }
    }
}

/// What an incoming frame means for a channel on `topic`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    RowUpdated(UserChatsRow),
    JoinAccepted,
    JoinRejected(String),
    /// The server closed or errored the channel; rejoin.
    Closed,
    Ignored,
}

pub fn channel_topic(row_id: &str) -> String {
    format!("realtime:userchats:{row_id}")
}

/// Interpret one text frame received on a channel joined as `topic`.
pub fn decode_frame(text: &str, topic: &str, join_ref: &str) -> Result<ChannelEvent, SyncError> {
    let frame: ChannelFrame = serde_json::from_str(text).map_err(|err| {
        SyncError::new(
            chat_core::SyncErrorCategory::Serialization,
            "malformed_frame",
            format!("realtime frame could not be decoded: {err}"),
        )
    })?;
    if frame.topic != topic {
        return Ok(ChannelEvent::Ignored);
    }

    match frame.event.as_str() {
        "postgres_changes" => {
            let record = frame
                .payload
                .pointer("/data/record")
                .or_else(|| frame.payload.get("record"))
                .cloned();
            match record {
                Some(record) => Ok(ChannelEvent::RowUpdated(decode_row("userchats", record)?)),
                None => Ok(ChannelEvent::Ignored),
            }
        }
        "phx_reply" if frame.reference.as_deref() == Some(join_ref) => {
            match frame.payload.get("status").and_then(Value::as_str) {
                Some("ok") => Ok(ChannelEvent::JoinAccepted),
                _ => Ok(ChannelEvent::JoinRejected(rejection_reason(&frame.payload))),
            }
        }
        "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
            Ok(ChannelEvent::JoinRejected(rejection_reason(&frame.payload)))
        }
        "phx_close" | "phx_error" => Ok(ChannelEvent::Closed),
        _ => Ok(ChannelEvent::Ignored),
    }
}

/// Tracks joins across the reconnects of one followed row.
#[derive(Debug, Default)]
pub struct RejoinTracker {
    joined_before: bool,
}

impl RejoinTracker {
    /// Record an accepted join. Returns `Resync` when this join follows an
    /// earlier one, since the gap between them went unobserved.
    pub fn on_join_accepted(&mut self) -> Option<RowEvent> {
        std::mem::replace(&mut self.joined_before, true).then_some(RowEvent::Resync)
    }
}

fn rejection_reason(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| payload.to_string())
}

/// [`RowFeed`] backed by realtime websocket channels.
#[derive(Clone)]
pub struct RealtimeFeed {
    url: Url,
    anon_key: String,
    token: AccessToken,
    policy: RetryPolicy,
}

impl RealtimeFeed {
    pub fn new(config: &HostedConfig, token: AccessToken) -> Self {
        Self {
            url: config.realtime_url(),
            anon_key: config.anon_key.clone(),
            token,
            policy: RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

#[async_trait]
impl RowFeed for RealtimeFeed {
    async fn follow_user_chats(
        &self,
        row_id: &str,
        rows: mpsc::Sender<RowEvent>,
        stop: CancellationToken,
    ) -> Result<(), SyncError> {
        let feed = self.clone();
        let row_id = row_id.to_owned();
        tokio::spawn(async move {
            feed.run_channel(row_id, rows, stop).await;
        });
        Ok(())
    }
}

enum SessionEnd {
    Stopped,
    Disconnected,
}

impl RealtimeFeed {
    async fn run_channel(
        &self,
        row_id: String,
        rows: mpsc::Sender<RowEvent>,
        stop: CancellationToken,
    ) {
        let mut attempt: u32 = 0;
        let mut joins = RejoinTracker::default();
        loop {
            let retry_hint = match self.session(&row_id, &rows, &stop, &mut joins).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Disconnected) => {
                    info!(%row_id, "realtime channel disconnected; rejoining");
                    attempt = 0;
                    None
                }
                Err(err) => {
                    warn!(%row_id, error = %err, attempt, "realtime channel failed");
                    err.retry_after_ms.map(Duration::from_millis)
                }
            };
            if stop.is_cancelled() || rows.is_closed() {
                break;
            }

            let delay = self.policy.delay(attempt, retry_hint);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(%row_id, "realtime channel stopped");
    }

    async fn session(
        &self,
        row_id: &str,
        rows: &mpsc::Sender<RowEvent>,
        stop: &CancellationToken,
        joins: &mut RejoinTracker,
    ) -> Result<SessionEnd, SyncError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| SyncError::network("realtime_connect", err.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let topic = channel_topic(row_id);
        let mut next_ref: u64 = 1;
        let join_ref = next_ref.to_string();
        let access_token = self.token.get().unwrap_or_else(|| self.anon_key.clone());
        send_frame(
            &mut sink,
            &ChannelFrame::join(&topic, row_id, &access_token, &join_ref),
        )
        .await?;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    next_ref += 1;
                    let _ = send_frame(&mut sink, &ChannelFrame::leave(&topic, &next_ref.to_string())).await;
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Stopped);
                }
                _ = rows.closed() => {
                    next_ref += 1;
                    let _ = send_frame(&mut sink, &ChannelFrame::leave(&topic, &next_ref.to_string())).await;
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Stopped);
                }
                _ = heartbeat.tick() => {
                    next_ref += 1;
                    send_frame(&mut sink, &ChannelFrame::heartbeat(&next_ref.to_string())).await?;
                }
                incoming = stream.next() => match incoming {
                    None | Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Disconnected),
                    Some(Err(err)) => {
                        return Err(SyncError::network("realtime_socket", err.to_string()));
                    }
                    Some(Ok(Message::Text(text))) => match decode_frame(&text, &topic, &join_ref) {
                        Ok(ChannelEvent::RowUpdated(row)) => {
                            if rows.send(RowEvent::Updated(row)).await.is_err() {
                                return Ok(SessionEnd::Stopped);
                            }
                        }
                        Ok(ChannelEvent::JoinAccepted) => {
                            debug!(%topic, "realtime channel joined");
                            if let Some(resync) = joins.on_join_accepted() {
                                info!(%topic, "rejoined after a gap; requesting resync");
                                if rows.send(resync).await.is_err() {
                                    return Ok(SessionEnd::Stopped);
                                }
                            }
                        }
                        Ok(ChannelEvent::JoinRejected(reason)) => {
                            return Err(SyncError::forbidden("realtime_join_rejected", reason));
                        }
                        Ok(ChannelEvent::Closed) => return Ok(SessionEnd::Disconnected),
                        Ok(ChannelEvent::Ignored) => {}
                        Err(err) => warn!(%topic, error = %err, "dropping realtime frame"),
                    },
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ChannelFrame) -> Result<(), SyncError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame).map_err(|err| {
        SyncError::new(
            chat_core::SyncErrorCategory::Internal,
            "frame_encode",
            err.to_string(),
        )
    })?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| SyncError::network("realtime_socket", err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "realtime:userchats:u1";

    #[test]
    fn join_frame_filters_on_row_id() {
        let frame = ChannelFrame::join(TOPIC, "u1", "token", "1");
        let encoded = serde_json::to_value(&frame).expect("encode");

        assert_eq!(encoded["event"], "phx_join");
        assert_eq!(encoded["ref"], "1");
        assert_eq!(
            encoded["payload"]["config"]["postgres_changes"][0]["filter"],
            "id=eq.u1"
        );
        assert_eq!(encoded["payload"]["access_token"], "token");
    }

    #[test]
    fn decodes_row_updates_in_both_payload_shapes() {
        let nested = json!({
            "topic": TOPIC,
            "event": "postgres_changes",
            "payload": { "data": { "type": "UPDATE", "record": { "id": "u1", "chats": [] } } },
            "ref": null
        });
        let flat = json!({
            "topic": TOPIC,
            "event": "postgres_changes",
            "payload": { "record": { "id": "u1", "chats": null } },
            "ref": null
        });

        for frame in [nested, flat] {
            let event = decode_frame(&frame.to_string(), TOPIC, "1").expect("decode");
            assert_eq!(event, ChannelEvent::RowUpdated(UserChatsRow::empty("u1")));
        }
    }

    #[test]
    fn classifies_replies_and_closures() {
        let ok = json!({ "topic": TOPIC, "event": "phx_reply", "payload": { "status": "ok", "response": {} }, "ref": "1" });
        assert_eq!(
            decode_frame(&ok.to_string(), TOPIC, "1").expect("decode"),
            ChannelEvent::JoinAccepted
        );

        let heartbeat_reply = json!({ "topic": TOPIC, "event": "phx_reply", "payload": { "status": "ok" }, "ref": "7" });
        assert_eq!(
            decode_frame(&heartbeat_reply.to_string(), TOPIC, "1").expect("decode"),
            ChannelEvent::Ignored
        );

        let rejected = json!({ "topic": TOPIC, "event": "phx_reply", "payload": { "status": "error", "response": { "reason": "unauthorized" } }, "ref": "1" });
        assert_eq!(
            decode_frame(&rejected.to_string(), TOPIC, "1").expect("decode"),
            ChannelEvent::JoinRejected("unauthorized".into())
        );

        let closed = json!({ "topic": TOPIC, "event": "phx_close", "payload": {}, "ref": null });
        assert_eq!(
            decode_frame(&closed.to_string(), TOPIC, "1").expect("decode"),
            ChannelEvent::Closed
        );

        let other_topic = json!({ "topic": "realtime:userchats:u2", "event": "phx_close", "payload": {}, "ref": null });
        assert_eq!(
            decode_frame(&other_topic.to_string(), TOPIC, "1").expect("decode"),
            ChannelEvent::Ignored
        );
    }

    #[test]
    fn only_rejoins_request_a_resync() {
        let mut joins = RejoinTracker::default();
        assert_eq!(joins.on_join_accepted(), None);
        assert_eq!(joins.on_join_accepted(), Some(RowEvent::Resync));
        assert_eq!(joins.on_join_accepted(), Some(RowEvent::Resync));
    }

    #[test]
    fn rejects_garbage_frames() {
        let err = decode_frame("not json", TOPIC, "1").expect_err("garbage");
        assert_eq!(err.code, "malformed_frame");
    }
}
