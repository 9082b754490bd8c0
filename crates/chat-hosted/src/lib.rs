//! Adapter from the chat-core remote port to the hosted backend.
//!
//! Conversations live in per-user `userchats` rows; profiles and block lists
//! live in `users` rows. [`HostedBackend`] implements
//! [`chat_core::RemotePort`] over any [`Tables`] store and [`RowFeed`]
//! change feed, so the same adapter runs against the REST service or the
//! in-memory tables used in tests.

/// Registration, user lookup and conversation creation.
pub mod accounts;
/// Email/password auth and the local session lifecycle.
pub mod auth;
/// Remote port implementation.
pub mod backend;
/// Environment-driven configuration.
pub mod config;
/// Realtime websocket change feed.
pub mod realtime;
/// REST tables and shared HTTP helpers.
pub mod rest;
/// Wire schema and ingress validation.
pub mod schema;
/// Row-store abstraction and its in-memory implementation.
pub mod tables;

use std::sync::Arc;

use chat_core::SyncError;
use chat_platform::{CredentialStore, ScopedCredentialStore};

pub use accounts::{Accounts, Registration};
pub use auth::{AuthApi, AuthSession, AuthStateChange, MemoryAuthApi, RestAuthApi, SessionManager, SignUp};
pub use backend::{HostedBackend, object_name};
pub use config::{ConfigError, HostedConfig};
pub use realtime::RealtimeFeed;
pub use rest::{AccessToken, RestTables};
pub use tables::{MemoryTables, Revision, RowEvent, RowFeed, Tables, Versioned};

pub type RestBackend = HostedBackend<RestTables, RealtimeFeed>;

/// Everything a shell needs to talk to the hosted service.
pub struct HostedClient<S: CredentialStore> {
    pub config: HostedConfig,
    pub sessions: Arc<SessionManager<RestAuthApi, S>>,
    pub accounts: Accounts<RestTables, RestAuthApi, S>,
    pub backend: Arc<RestBackend>,
}

impl<S: CredentialStore> HostedClient<S> {
    /// Wire the REST tables, realtime feed and auth API to one shared
    /// access token.
    pub fn new(config: HostedConfig, store: ScopedCredentialStore<S>) -> Result<Self, SyncError> {
        let token = AccessToken::default();
        let tables = Arc::new(RestTables::new(config.clone(), token.clone())?);
        let feed = Arc::new(RealtimeFeed::new(&config, token.clone()));
        let auth = Arc::new(RestAuthApi::new(config.clone())?);
        let sessions = Arc::new(SessionManager::new(auth, store, token));
        let accounts = Accounts::new(tables.clone(), sessions.clone(), config.media_bucket.clone());
        let backend = Arc::new(HostedBackend::new(tables, feed, config.media_bucket.clone()));
        Ok(Self {
            config,
            sessions,
            accounts,
            backend,
        })
    }
}
