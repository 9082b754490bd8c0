//! Email/password auth against the hosted service, plus the local session
//! lifecycle (persist, restore, state-change broadcast).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use async_trait::async_trait;
use chat_core::{SyncError, SyncErrorCategory};
use chat_platform::{CredentialStore, CredentialStoreError, ScopedCredentialStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::HostedConfig,
    rest::{AccessToken, build_http_client, read_json, send},
};

const SESSION_ACCOUNT: &str = "auth-session";
const AUTH_EVENT_BUFFER: usize = 16;
const MIN_PASSWORD_LEN: usize = 6;

/// Signed-in session as issued by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: Option<i64>,
}

impl AuthSession {
    pub fn is_expired_at(&self, unix_seconds: i64) -> bool {
        self.expires_at.is_some_and(|expires| expires <= unix_seconds)
    }
}

/// Result of a sign-up. `session` is absent when the service requires
/// email confirmation before the first sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUp {
    pub user_id: String,
    pub session: Option<AuthSession>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStateChange {
    SignedIn(AuthSession),
    SignedOut,
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, SyncError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, SyncError>;

    /// Revoke `access_token` on the service.
    async fn sign_out(&self, access_token: &str) -> Result<(), SyncError>;
}

#[derive(Debug, Deserialize)]
struct WireAuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: WireAuthUser,
}

impl TokenResponse {
    fn into_session(self, fallback_email: &str) -> AuthSession {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| Utc::now().timestamp() + secs));
        AuthSession {
            user_id: self.user.id,
            email: self
                .user
                .email
                .filter(|email| !email.is_empty())
                .unwrap_or_else(|| fallback_email.to_owned()),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(WireAuthUser),
}

impl SignUpResponse {
    fn into_sign_up(self, email: &str) -> SignUp {
        match self {
            Self::Session(token) => {
                let session = token.into_session(email);
                SignUp {
                    user_id: session.user_id.clone(),
                    session: Some(session),
                }
            }
            Self::User(user) => SignUp {
                user_id: user.id,
                session: None,
            },
        }
    }
}

/// [`AuthApi`] over the hosted `/auth/v1` endpoints.
#[derive(Clone)]
pub struct RestAuthApi {
    http: reqwest::Client,
    config: HostedConfig,
}

impl RestAuthApi {
    pub fn new(config: HostedConfig) -> Result<Self, SyncError> {
        let http = build_http_client(&config)?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl AuthApi for RestAuthApi {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, SyncError> {
        let request = self
            .http
            .post(self.config.auth_url("signup"))
            .header("apikey", &self.config.anon_key)
            .json(&json!({ "email": email, "password": password }));
        let response = send(request, "auth").await?;
        let body: SignUpResponse = read_json(response, "auth").await?;
        Ok(body.into_sign_up(email))
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, SyncError> {
        let mut url = self.config.auth_url("token");
        url.query_pairs_mut().append_pair("grant_type", "password");
        let request = self
            .http
            .post(url)
            .header("apikey", &self.config.anon_key)
            .json(&json!({ "email": email, "password": password }));
        let response = send(request, "auth").await?;
        let body: TokenResponse = read_json(response, "auth").await?;
        Ok(body.into_session(email))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), SyncError> {
        let request = self
            .http
            .post(self.config.auth_url("logout"))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(access_token);
        send(request, "auth").await?;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryAccount {
    user_id: String,
    password: String,
}

/// In-process [`AuthApi`] for tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryAuthApi {
    accounts: Mutex<HashMap<String, MemoryAccount>>,
    live_tokens: Mutex<HashMap<String, String>>,
}

impl MemoryAuthApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `access_token` was issued and not yet revoked.
    pub fn is_token_live(&self, access_token: &str) -> bool {
        self.live_tokens
            .lock()
            .map(|tokens| tokens.contains_key(access_token))
            .unwrap_or(false)
    }

    fn issue(&self, user_id: &str, email: &str) -> Result<AuthSession, SyncError> {
        let access_token = format!("mem-{}", Uuid::new_v4());
        self.live_tokens
            .lock()
            .map_err(|_| poisoned())?
            .insert(access_token.clone(), user_id.to_owned());
        Ok(AuthSession {
            user_id: user_id.to_owned(),
            email: email.to_owned(),
            access_token,
            refresh_token: Some(Uuid::new_v4().to_string()),
            expires_at: Some(Utc::now().timestamp() + 3_600),
        })
    }
}

fn poisoned() -> SyncError {
    SyncError::new(SyncErrorCategory::Internal, "auth_state", "auth state lock poisoned")
}

#[async_trait]
impl AuthApi for MemoryAuthApi {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, SyncError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "invalid_email",
                "a valid email address is required",
            ));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "weak_password",
                format!("password must be at least {MIN_PASSWORD_LEN} characters"),
            ));
        }

        let user_id = {
            let mut accounts = self.accounts.lock().map_err(|_| poisoned())?;
            if accounts.contains_key(&email) {
                return Err(SyncError::new(
                    SyncErrorCategory::Config,
                    "email_taken",
                    "user already registered",
                ));
            }
            let user_id = Uuid::new_v4().to_string();
            accounts.insert(
                email.clone(),
                MemoryAccount {
                    user_id: user_id.clone(),
                    password: password.to_owned(),
                },
            );
            user_id
        };

        let session = self.issue(&user_id, &email)?;
        Ok(SignUp {
            user_id,
            session: Some(session),
        })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, SyncError> {
        let email = email.trim().to_lowercase();
        let user_id = {
            let accounts = self.accounts.lock().map_err(|_| poisoned())?;
            match accounts.get(&email) {
                Some(account) if account.password == password => account.user_id.clone(),
                _ => {
                    return Err(SyncError::new(
                        SyncErrorCategory::Auth,
                        "invalid_credentials",
                        "invalid login credentials",
                    ));
                }
            }
        };
        self.issue(&user_id, &email)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), SyncError> {
        self.live_tokens
            .lock()
            .map_err(|_| poisoned())?
            .remove(access_token);
        Ok(())
    }
}

fn map_credential_error(operation: &str, err: CredentialStoreError) -> SyncError {
    match err {
        CredentialStoreError::NotFound => SyncError::new(
            SyncErrorCategory::Config,
            "secret_not_found",
            format!("no stored credential during {operation}"),
        ),
        CredentialStoreError::Unavailable(message) => SyncError::new(
            SyncErrorCategory::Internal,
            "secret_store_unavailable",
            format!("secret store unavailable during {operation}: {message}"),
        ),
        CredentialStoreError::Backend(message) => SyncError::new(
            SyncErrorCategory::Internal,
            "secret_store_error",
            format!("secret store backend error during {operation}: {message}"),
        ),
        CredentialStoreError::Malformed(message) => SyncError::new(
            SyncErrorCategory::Serialization,
            "session_deserialize_error",
            message,
        ),
    }
}

/// Owns the current auth session.
///
/// Sign-in persists the session to the credential store and publishes the
/// access token to the shared [`AccessToken`] used by the HTTP clients.
/// Subscribers of [`SessionManager::on_auth_state_change`] see every
/// transition.
pub struct SessionManager<A, S: CredentialStore> {
    api: Arc<A>,
    store: ScopedCredentialStore<S>,
    token: AccessToken,
    current: RwLock<Option<AuthSession>>,
    changes: broadcast::Sender<AuthStateChange>,
}

impl<A: AuthApi, S: CredentialStore> SessionManager<A, S> {
    pub fn new(api: Arc<A>, store: ScopedCredentialStore<S>, token: AccessToken) -> Self {
        let (changes, _) = broadcast::channel(AUTH_EVENT_BUFFER);
        Self {
            api,
            store,
            token,
            current: RwLock::new(None),
            changes,
        }
    }

    pub fn access_token(&self) -> &AccessToken {
        &self.token
    }

    pub fn on_auth_state_change(&self) -> broadcast::Receiver<AuthStateChange> {
        self.changes.subscribe()
    }

    pub fn get_session(&self) -> Option<AuthSession> {
        self.current.read().ok().and_then(|slot| slot.clone())
    }

    /// Load a persisted session, if one exists and has not expired.
    pub fn restore(&self) -> Result<Option<AuthSession>, SyncError> {
        let stored: Option<AuthSession> = self
            .store
            .get_json(SESSION_ACCOUNT)
            .map_err(|err| map_credential_error("restore_session", err))?;
        let Some(session) = stored else {
            debug!("no persisted session");
            return Ok(None);
        };
        if session.is_expired_at(Utc::now().timestamp()) {
            info!(user_id = %session.user_id, "persisted session expired; discarding");
            self.store
                .forget(SESSION_ACCOUNT)
                .map_err(|err| map_credential_error("forget_session", err))?;
            return Ok(None);
        }
        self.adopt(session.clone());
        Ok(Some(session))
    }

    /// Sign up; adopts the session when the service issues one.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, SyncError> {
        let sign_up = self.api.sign_up(email, password).await?;
        if let Some(session) = &sign_up.session {
            self.persist(session)?;
            self.adopt(session.clone());
        }
        Ok(sign_up)
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, SyncError> {
        let session = self.api.sign_in_with_password(email, password).await?;
        self.persist(&session)?;
        self.adopt(session.clone());
        Ok(session)
    }

    /// Clear the local session, then revoke it remotely.
    ///
    /// Local state is cleared even when revocation fails; the remote error
    /// is still returned.
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        let previous = self
            .current
            .write()
            .map_err(|_| poisoned())?
            .take();
        self.token.set(None);
        let forgotten = self
            .store
            .forget(SESSION_ACCOUNT)
            .map_err(|err| map_credential_error("forget_session", err));
        let _ = self.changes.send(AuthStateChange::SignedOut);

        if let Some(session) = previous {
            info!(user_id = %session.user_id, "signed out");
            if let Err(err) = self.api.sign_out(&session.access_token).await {
                warn!(error = %err, "remote sign-out failed");
                return Err(err);
            }
        }
        forgotten
    }

    fn persist(&self, session: &AuthSession) -> Result<(), SyncError> {
        self.store
            .put_json(SESSION_ACCOUNT, session)
            .map_err(|err| map_credential_error("persist_session", err))
    }

    fn adopt(&self, session: AuthSession) {
        self.token.set(Some(session.access_token.clone()));
        if let Ok(mut slot) = self.current.write() {
            *slot = Some(session.clone());
        }
        info!(user_id = %session.user_id, "signed in");
        let _ = self.changes.send(AuthStateChange::SignedIn(session));
    }
}
