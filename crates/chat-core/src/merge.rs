use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::types::{DeliveryStatus, Message};

/// Message held in the local cache together with its delivery state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub message: Message,
    pub status: DeliveryStatus,
    /// Image attachment is still uploading; `message.image_url` is unset.
    pub awaiting_media: bool,
}

impl CachedMessage {
    pub fn confirmed(message: Message) -> Self {
        Self {
            message: message.to_remote(),
            status: DeliveryStatus::Confirmed,
            awaiting_media: false,
        }
    }

    pub fn pending(message: Message, awaiting_media: bool) -> Self {
        Self {
            message,
            status: DeliveryStatus::Pending,
            awaiting_media,
        }
    }

    pub fn temp_id(&self) -> Option<&str> {
        self.message.client_temp_id.as_deref()
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.message.client_temp_id.is_some()
    }
}

/// Result of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Temp IDs of optimistic entries confirmed by this pass.
    pub confirmed: Vec<String>,
    /// Unconfirmed entries still awaiting the remote.
    pub still_pending: usize,
    /// Duplicate authoritative entries dropped.
    pub duplicates_dropped: usize,
}

/// Identity of an authoritative message: sender, timestamp, text and image.
type MessageKey = (String, DateTime<Utc>, String, Option<String>);

fn key_of(message: &Message) -> MessageKey {
    (
        message.sender_id.clone(),
        message.created_at,
        message.text.clone(),
        message.image_url.clone(),
    )
}

/// Reconcile cached messages with an authoritative full sequence.
///
/// The confirmed part of `cached` is replaced wholesale by `authoritative`.
/// Authoritative messages first pair off with the confirmed entries they
/// replace; only the unpaired remainder can confirm optimistic entries. An
/// unconfirmed entry is dropped when such a message has the same sender,
/// text and image within `tolerance` of its timestamp, and each message
/// confirms at most one entry. Entries still waiting for their image upload
/// never match. The result is sorted by `created_at`, stable with respect to
/// insertion order.
pub fn merge_messages(
    cached: &[CachedMessage],
    authoritative: &[Message],
    tolerance: Duration,
) -> (Vec<CachedMessage>, MergeOutcome) {
    let mut outcome = MergeOutcome::default();

    let mut seen = HashSet::new();
    let mut merged: Vec<CachedMessage> = Vec::with_capacity(authoritative.len());
    for message in authoritative {
        if seen.insert(key_of(message)) {
            merged.push(CachedMessage::confirmed(message.clone()));
        } else {
            outcome.duplicates_dropped += 1;
        }
    }
    merged.sort_by_key(|entry| entry.message.created_at);

    let mut previously_confirmed: HashMap<MessageKey, usize> = HashMap::new();
    for entry in cached.iter().filter(|entry| !entry.is_unconfirmed()) {
        *previously_confirmed
            .entry(key_of(&entry.message))
            .or_default() += 1;
    }
    let mut consumed: Vec<bool> = merged
        .iter()
        .map(
            |entry| match previously_confirmed.get_mut(&key_of(&entry.message)) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    true
                }
                _ => false,
            },
        )
        .collect();

    let mut kept = Vec::new();
    for entry in cached.iter().filter(|entry| entry.is_unconfirmed()) {
        let matched = if entry.awaiting_media {
            None
        } else {
            (0..merged.len()).find(|&idx| {
                !consumed[idx] && confirms(&merged[idx].message, &entry.message, tolerance)
            })
        };
        match matched {
            Some(idx) => {
                consumed[idx] = true;
                if let Some(temp_id) = entry.temp_id() {
                    outcome.confirmed.push(temp_id.to_owned());
                }
            }
            None => kept.push(entry.clone()),
        }
    }

    outcome.still_pending = kept.len();
    merged.extend(kept);
    merged.sort_by_key(|entry| entry.message.created_at);
    (merged, outcome)
}

/// Whether `authoritative` is the remote copy of optimistic entry `local`.
pub fn confirms(authoritative: &Message, local: &Message, tolerance: Duration) -> bool {
    authoritative.same_content(local)
        && within(authoritative.created_at, local.created_at, tolerance)
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, tolerance: Duration) -> bool {
    let delta = (a - b).abs();
    delta
        .to_std()
        .map(|delta| delta <= tolerance)
        .unwrap_or(false)
}

/// Timestamp for a new optimistic entry: never earlier than the current tail.
pub fn next_local_timestamp(cached: &[CachedMessage], now: DateTime<Utc>) -> DateTime<Utc> {
    cached
        .last()
        .map(|tail| tail.message.created_at.max(now))
        .unwrap_or(now)
}
