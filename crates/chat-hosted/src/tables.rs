//! Row access to the hosted tables and object storage.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use chat_core::{MediaUpload, SyncError, SyncErrorCategory};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::schema::{UserChatsRow, UserRow};

/// Store-specific token for the row version a write is based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// Counter kept by the store itself.
    Counter(u64),
    /// The `chats` column exactly as read. A conditional write only applies
    /// while the stored column still equals it.
    Snapshot(serde_json::Value),
}

/// A row together with the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub row: T,
    pub revision: Revision,
}

/// Row operations the hosted adapter needs.
#[async_trait]
pub trait Tables: Send + Sync {
    /// Fetch the `userchats` row of `user_id`. Missing rows are `NotFound`.
    async fn user_chats(&self, user_id: &str) -> Result<Versioned<UserChatsRow>, SyncError>;

    /// Replace the `chats` column of `row.id`.
    ///
    /// With `expected` set, the write fails with `Conflict` when the row
    /// changed since it was read; without it the write is unconditional.
    async fn update_user_chats(
        &self,
        row: &UserChatsRow,
        expected: Option<&Revision>,
    ) -> Result<(), SyncError>;

    async fn insert_user_chats(&self, row: &UserChatsRow) -> Result<(), SyncError>;

    async fn user(&self, user_id: &str) -> Result<UserRow, SyncError>;

    async fn user_by_username(&self, username: &str) -> Result<Option<UserRow>, SyncError>;

    async fn insert_user(&self, row: &UserRow) -> Result<(), SyncError>;

    async fn update_blocked(&self, user_id: &str, blocked: &[String]) -> Result<(), SyncError>;

    /// Store an object (upsert) and return its public URL.
    async fn upload_object(
        &self,
        bucket: &str,
        name: &str,
        media: &MediaUpload,
    ) -> Result<String, SyncError>;
}

/// Item delivered by a [`RowFeed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowEvent {
    Updated(UserChatsRow),
    /// Updates may have been missed (e.g. across a reconnect); re-read the row.
    Resync,
}

/// Push feed of `userchats` row updates.
#[async_trait]
pub trait RowFeed: Send + Sync {
    /// Forward every new version of row `row_id` into `rows` until `stop`
    /// is cancelled or the receiver is dropped.
    async fn follow_user_chats(
        &self,
        row_id: &str,
        rows: mpsc::Sender<RowEvent>,
        stop: CancellationToken,
    ) -> Result<(), SyncError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    users: BTreeMap<String, UserRow>,
    user_chats: BTreeMap<String, (UserChatsRow, u64)>,
    objects: BTreeMap<(String, String), MediaUpload>,
}

#[derive(Debug, Default)]
struct FaultPlan {
    unavailable_rows: HashSet<String>,
    conflicts: u32,
}

/// In-process tables with revision tracking and a change feed.
///
/// Used by tests and offline demos. Faults can be injected to exercise
/// network failures and write races.
pub struct MemoryTables {
    state: RwLock<MemoryState>,
    faults: Mutex<FaultPlan>,
    changes: broadcast::Sender<UserChatsRow>,
    public_base: String,
}

impl Default for MemoryTables {
    fn default() -> Self {
        Self::new("memory://storage")
    }
}

impl MemoryTables {
    pub fn new(public_base: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(MemoryState::default()),
            faults: Mutex::new(FaultPlan::default()),
            changes,
            public_base: public_base.into(),
        }
    }

    /// Make writes to `user_id`'s `userchats` row fail with `Network`.
    pub fn set_row_unavailable(&self, user_id: &str, unavailable: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            if unavailable {
                faults.unavailable_rows.insert(user_id.to_owned());
            } else {
                faults.unavailable_rows.remove(user_id);
            }
        }
    }

    /// Fail the next `count` revision-checked writes with `Conflict`, as if
    /// another writer got there first.
    pub fn inject_conflicts(&self, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.conflicts = count;
        }
    }

    pub async fn object(&self, bucket: &str, name: &str) -> Option<MediaUpload> {
        let state = self.state.read().await;
        state
            .objects
            .get(&(bucket.to_owned(), name.to_owned()))
            .cloned()
    }

    pub async fn object_names(&self, bucket: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn check_write(&self, row_id: &str, revision_checked: bool) -> Result<(), SyncError> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| internal("fault plan lock poisoned"))?;
        if faults.unavailable_rows.contains(row_id) {
            return Err(SyncError::network(
                "store_unavailable",
                format!("userchats row {row_id} is unreachable"),
            ));
        }
        if revision_checked && faults.conflicts > 0 {
            faults.conflicts -= 1;
            return Err(SyncError::conflict(format!(
                "userchats row {row_id} changed concurrently"
            )));
        }
        Ok(())
    }
}

fn internal(message: &str) -> SyncError {
    SyncError::new(SyncErrorCategory::Internal, "memory_store", message)
}

fn row_not_found(table: &str, id: &str) -> SyncError {
    SyncError::not_found(format!("{table}_not_found"), format!("no {table} row for {id}"))
}

#[async_trait]
impl Tables for MemoryTables {
    async fn user_chats(&self, user_id: &str) -> Result<Versioned<UserChatsRow>, SyncError> {
        let state = self.state.read().await;
        state
            .user_chats
            .get(user_id)
            .map(|(row, revision)| Versioned {
                row: row.clone(),
                revision: Revision::Counter(*revision),
            })
            .ok_or_else(|| row_not_found("userchats", user_id))
    }

    async fn update_user_chats(
        &self,
        row: &UserChatsRow,
        expected: Option<&Revision>,
    ) -> Result<(), SyncError> {
        let expected_counter = match expected {
            Some(Revision::Counter(counter)) => Some(*counter),
            Some(Revision::Snapshot(_)) => {
                return Err(internal("memory tables only track counter revisions"));
            }
            None => None,
        };
        self.check_write(&row.id, expected_counter.is_some())?;
        let mut state = self.state.write().await;
        let (stored, revision) = state
            .user_chats
            .get_mut(&row.id)
            .ok_or_else(|| row_not_found("userchats", &row.id))?;
        if let Some(expected) = expected_counter
            && expected != *revision
        {
            return Err(SyncError::conflict(format!(
                "userchats row {} is at revision {revision}, expected {expected}",
                row.id
            )));
        }
        *stored = row.clone();
        *revision += 1;
        debug!(row_id = %row.id, revision = *revision, "userchats row updated");
        let _ = self.changes.send(row.clone());
        Ok(())
    }

    async fn insert_user_chats(&self, row: &UserChatsRow) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        if state.user_chats.contains_key(&row.id) {
            return Err(SyncError::conflict(format!(
                "userchats row {} already exists",
                row.id
            )));
        }
        state.user_chats.insert(row.id.clone(), (row.clone(), 1));
        Ok(())
    }

    async fn user(&self, user_id: &str) -> Result<UserRow, SyncError> {
        let state = self.state.read().await;
        state
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| row_not_found("users", user_id))
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<UserRow>, SyncError> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn insert_user(&self, row: &UserRow) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        if state.users.contains_key(&row.id) {
            return Err(SyncError::conflict(format!("user {} already exists", row.id)));
        }
        state.users.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn update_blocked(&self, user_id: &str, blocked: &[String]) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| row_not_found("users", user_id))?;
        user.blocked = blocked.to_vec();
        Ok(())
    }

    async fn upload_object(
        &self,
        bucket: &str,
        name: &str,
        media: &MediaUpload,
    ) -> Result<String, SyncError> {
        let mut state = self.state.write().await;
        state
            .objects
            .insert((bucket.to_owned(), name.to_owned()), media.clone());
        Ok(format!("{}/{bucket}/{name}", self.public_base))
    }
}

#[async_trait]
impl RowFeed for MemoryTables {
    async fn follow_user_chats(
        &self,
        row_id: &str,
        rows: mpsc::Sender<RowEvent>,
        stop: CancellationToken,
    ) -> Result<(), SyncError> {
        let mut changes = self.changes.subscribe();
        let row_id = row_id.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(row) if row.id == row_id => {
                            if rows.send(RowEvent::Updated(row)).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(%row_id, skipped, "memory change feed lagged");
                            if rows.send(RowEvent::Resync).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    async fn seeded() -> MemoryTables {
        let tables = MemoryTables::default();
        tables
            .insert_user_chats(&UserChatsRow::empty("u1"))
            .await
            .expect("insert row");
        tables
    }

    #[tokio::test]
    async fn revision_mismatch_is_a_conflict() {
        let tables = seeded().await;
        let first = tables.user_chats("u1").await.expect("read");
        let second = tables.user_chats("u1").await.expect("read");

        tables
            .update_user_chats(&first.row, Some(&first.revision))
            .await
            .expect("first write wins");
        let err = tables
            .update_user_chats(&second.row, Some(&second.revision))
            .await
            .expect_err("stale write must conflict");
        assert_eq!(err.category, SyncErrorCategory::Conflict);

        tables
            .update_user_chats(&second.row, None)
            .await
            .expect("unchecked write is last-writer-wins");

        let err = tables
            .update_user_chats(&second.row, Some(&Revision::Snapshot(serde_json::json!([]))))
            .await
            .expect_err("memory tables compare counters only");
        assert_eq!(err.category, SyncErrorCategory::Internal);
    }

    #[tokio::test]
    async fn injected_faults_apply_to_writes() {
        let tables = seeded().await;
        let current = tables.user_chats("u1").await.expect("read");

        tables.inject_conflicts(1);
        let err = tables
            .update_user_chats(&current.row, Some(&current.revision))
            .await
            .expect_err("injected conflict");
        assert_eq!(err.category, SyncErrorCategory::Conflict);

        tables.set_row_unavailable("u1", true);
        let err = tables
            .update_user_chats(&current.row, Some(&current.revision))
            .await
            .expect_err("row unavailable");
        assert_eq!(err.category, SyncErrorCategory::Network);

        tables.set_row_unavailable("u1", false);
        tables
            .update_user_chats(&current.row, Some(&current.revision))
            .await
            .expect("write after faults clear");
    }

    #[tokio::test]
    async fn feed_forwards_only_the_followed_row() {
        let tables = seeded().await;
        tables
            .insert_user_chats(&UserChatsRow::empty("u2"))
            .await
            .expect("insert row");

        let (tx, mut rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        tables
            .follow_user_chats("u1", tx, stop.clone())
            .await
            .expect("follow");

        let other = tables.user_chats("u2").await.expect("read");
        tables
            .update_user_chats(&other.row, Some(&other.revision))
            .await
            .expect("write u2");
        let mine = tables.user_chats("u1").await.expect("read");
        tables
            .update_user_chats(&mine.row, Some(&mine.revision))
            .await
            .expect("write u1");

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("feed timeout")
            .expect("feed open");
        assert!(matches!(event, RowEvent::Updated(row) if row.id == "u1"));

        stop.cancel();
        let closed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("feed should close after stop");
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn uploads_return_public_urls() {
        let tables = MemoryTables::new("https://cdn.example.org");
        let url = tables
            .upload_object(
                "avatars",
                "1_cat.png",
                &MediaUpload {
                    file_name: "cat.png".into(),
                    content_type: "image/png".into(),
                    bytes: vec![1],
                },
            )
            .await
            .expect("upload");
        assert_eq!(url, "https://cdn.example.org/avatars/1_cat.png");
        assert!(tables.object("avatars", "1_cat.png").await.is_some());
    }
}
