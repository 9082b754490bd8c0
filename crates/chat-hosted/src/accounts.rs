//! Account registration, user lookup and conversation creation.

use std::sync::Arc;

use chat_core::{MediaUpload, PeerProfile, SyncError, SyncErrorCategory};
use chat_platform::CredentialStore;
use chrono::Utc;
use tracing::{info, warn};

use crate::{
    auth::{AuthApi, SessionManager},
    backend::object_name,
    schema::{UserChatsRow, UserRow, WireChatEntry, format_timestamp},
    tables::Tables,
};

/// Input of [`Accounts::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub avatar: Option<MediaUpload>,
}

pub struct Accounts<T, A, S: CredentialStore> {
    tables: Arc<T>,
    sessions: Arc<SessionManager<A, S>>,
    media_bucket: String,
}

impl<T, A, S> Accounts<T, A, S>
where
    T: Tables,
    A: AuthApi,
    S: CredentialStore,
{
    pub fn new(
        tables: Arc<T>,
        sessions: Arc<SessionManager<A, S>>,
        media_bucket: impl Into<String>,
    ) -> Self {
        Self {
            tables,
            sessions,
            media_bucket: media_bucket.into(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager<A, S>> {
        &self.sessions
    }

    /// Create an auth account with its `users` and `userchats` rows.
    ///
    /// Fails with `Config` errors before any remote write when a field is
    /// empty, the avatar is missing or the username is taken.
    pub async fn register(&self, registration: &Registration) -> Result<UserRow, SyncError> {
        let username = registration.username.trim();
        let email = registration.email.trim();
        if username.is_empty() || email.is_empty() || registration.password.is_empty() {
            return Err(config_error("missing_fields", "username, email and password are required"));
        }
        let Some(avatar) = &registration.avatar else {
            return Err(config_error("missing_avatar", "an avatar image is required"));
        };
        if self.tables.user_by_username(username).await?.is_some() {
            return Err(config_error("username_taken", "select another username"));
        }

        let sign_up = self.sessions.sign_up(email, &registration.password).await?;
        let name = object_name(Utc::now().timestamp_millis(), &avatar.file_name);
        let avatar_url = self
            .tables
            .upload_object(&self.media_bucket, &name, avatar)
            .await?;

        let row = UserRow {
            id: sign_up.user_id.clone(),
            username: username.to_owned(),
            email: email.to_owned(),
            avatar: Some(avatar_url),
            blocked: Vec::new(),
        };
        self.tables.insert_user(&row).await?;
        self.tables
            .insert_user_chats(&UserChatsRow::empty(&sign_up.user_id))
            .await?;
        info!(user_id = %row.id, %username, "account registered");
        Ok(row)
    }

    /// Exact-match username lookup.
    pub async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<PeerProfile>, SyncError> {
        let username = username.trim();
        if username.is_empty() {
            return Ok(None);
        }
        Ok(self
            .tables
            .user_by_username(username)
            .await?
            .map(|row| row.profile()))
    }

    /// Ensure a chat entry between `viewer` and `peer` exists in both
    /// participants' copies and return its id.
    ///
    /// An existing entry keeps its id and has `updatedAt` bumped. When only
    /// one side has an entry, the other side reuses its id.
    pub async fn start_conversation(&self, viewer: &str, peer: &str) -> Result<String, SyncError> {
        if viewer == peer {
            return Err(config_error("self_conversation", "cannot start a chat with yourself"));
        }
        // Fails with NotFound before any write when the peer does not exist.
        self.tables.user(peer).await?;

        let now = Utc::now();
        let mut own = self.tables.user_chats(viewer).await?;
        let mut theirs = self.tables.user_chats(peer).await?;
        let chat_id = existing_chat_id(&own.row, peer)
            .or_else(|| existing_chat_id(&theirs.row, viewer))
            .unwrap_or_else(|| format!("chat_{}", now.timestamp_millis()));

        upsert_entry(&mut own.row, &chat_id, peer, now);
        self.tables
            .update_user_chats(&own.row, Some(&own.revision))
            .await?;

        upsert_entry(&mut theirs.row, &chat_id, viewer, now);
        if let Err(err) = self
            .tables
            .update_user_chats(&theirs.row, Some(&theirs.revision))
            .await
        {
            warn!(%chat_id, %peer, error = %err, "peer copy of new chat was not written");
            return Err(err);
        }

        info!(%chat_id, %viewer, %peer, "conversation started");
        Ok(chat_id)
    }
}

fn existing_chat_id(row: &UserChatsRow, peer: &str) -> Option<String> {
    row.chats
        .iter()
        .find(|entry| entry.receiver_id.as_deref() == Some(peer))
        .map(|entry| entry.chat_id.clone())
}

fn upsert_entry(row: &mut UserChatsRow, chat_id: &str, peer: &str, now: chrono::DateTime<Utc>) {
    match row.entry_with_peer_mut(peer) {
        Some(entry) => entry.updated_at = Some(format_timestamp(now)),
        None => row.chats.push(WireChatEntry::new(chat_id, peer, now)),
    }
}

fn config_error(code: &str, message: &str) -> SyncError {
    SyncError::new(SyncErrorCategory::Config, code, message)
}

#[cfg(test)]
mod tests {
    use chat_platform::{InMemoryCredentialStore, ScopedCredentialStore};

    use super::*;
    use crate::{
        auth::MemoryAuthApi,
        rest::AccessToken,
        tables::MemoryTables,
    };

    type TestAccounts = Accounts<MemoryTables, MemoryAuthApi, InMemoryCredentialStore>;

    fn accounts() -> (TestAccounts, Arc<MemoryTables>) {
        let tables = Arc::new(MemoryTables::default());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemoryAuthApi::new()),
            ScopedCredentialStore::new(InMemoryCredentialStore::default(), "chat-test"),
            AccessToken::default(),
        ));
        (Accounts::new(tables.clone(), sessions, "avatars"), tables)
    }

    fn registration(username: &str, email: &str) -> Registration {
        Registration {
            username: username.to_owned(),
            email: email.to_owned(),
            password: "secret-pass".to_owned(),
            avatar: Some(MediaUpload {
                file_name: "me.png".into(),
                content_type: "image/png".into(),
                bytes: vec![1, 2, 3],
            }),
        }
    }

    #[tokio::test]
    async fn register_creates_rows_and_uploads_avatar() {
        let (accounts, tables) = accounts();
        let row = accounts
            .register(&registration("alice", "alice@example.org"))
            .await
            .expect("register");

        assert_eq!(row.username, "alice");
        assert!(row.blocked.is_empty());
        let avatar = row.avatar.as_deref().expect("avatar url");
        assert!(avatar.ends_with("_me.png"));
        assert_eq!(tables.object_names("avatars").await.len(), 1);
        let chats = tables.user_chats(&row.id).await.expect("userchats row");
        assert!(chats.row.chats.is_empty());
        assert_eq!(
            accounts.sessions().get_session().map(|s| s.user_id),
            Some(row.id)
        );
    }

    #[tokio::test]
    async fn register_validates_before_writing() {
        let (accounts, tables) = accounts();
        let mut missing_avatar = registration("alice", "alice@example.org");
        missing_avatar.avatar = None;
        let err = accounts
            .register(&missing_avatar)
            .await
            .expect_err("avatar required");
        assert_eq!(err.code, "missing_avatar");

        let err = accounts
            .register(&registration("  ", "alice@example.org"))
            .await
            .expect_err("username required");
        assert_eq!(err.code, "missing_fields");

        accounts
            .register(&registration("alice", "alice@example.org"))
            .await
            .expect("first registration");
        let err = accounts
            .register(&registration("alice", "other@example.org"))
            .await
            .expect_err("duplicate username");
        assert_eq!(err.code, "username_taken");
        assert_eq!(tables.object_names("avatars").await.len(), 1);
    }

    #[tokio::test]
    async fn start_conversation_writes_both_copies_once() {
        let (accounts, tables) = accounts();
        let alice = accounts
            .register(&registration("alice", "alice@example.org"))
            .await
            .expect("alice");
        let bob = accounts
            .register(&registration("bob", "bob@example.org"))
            .await
            .expect("bob");

        let found = accounts
            .find_user_by_username("bob")
            .await
            .expect("lookup")
            .expect("bob exists");
        assert_eq!(found.user_id, bob.id);
        assert_eq!(
            accounts.find_user_by_username("carol").await.expect("lookup"),
            None
        );

        let chat_id = accounts
            .start_conversation(&alice.id, &bob.id)
            .await
            .expect("start");
        assert!(chat_id.starts_with("chat_"));
        let again = accounts
            .start_conversation(&bob.id, &alice.id)
            .await
            .expect("restart");
        assert_eq!(again, chat_id);

        for (owner, peer) in [(&alice.id, &bob.id), (&bob.id, &alice.id)] {
            let row = tables.user_chats(owner).await.expect("row").row;
            assert_eq!(row.chats.len(), 1);
            assert_eq!(row.chats[0].chat_id, chat_id);
            assert_eq!(row.chats[0].receiver_id.as_deref(), Some(peer.as_str()));
        }

        let err = accounts
            .start_conversation(&alice.id, &alice.id)
            .await
            .expect_err("self chat");
        assert_eq!(err.code, "self_conversation");
        let err = accounts
            .start_conversation(&alice.id, "ghost")
            .await
            .expect_err("unknown peer");
        assert_eq!(err.category, SyncErrorCategory::NotFound);
    }
}
