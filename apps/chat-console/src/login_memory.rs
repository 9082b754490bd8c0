//! The email of the last successful login, kept next to the session in the
//! credential store so `/login` can omit it.

use chat_platform::{CredentialStore, CredentialStoreError, ScopedCredentialStore};
use serde::{Deserialize, Serialize};
use tracing::warn;

const ACCOUNT: &str = "last-login";

#[derive(Serialize, Deserialize)]
struct LastLogin {
    email: String,
}

pub struct LoginMemory<S: CredentialStore> {
    store: ScopedCredentialStore<S>,
}

impl<S: CredentialStore> LoginMemory<S> {
    pub fn new(store: ScopedCredentialStore<S>) -> Self {
        Self { store }
    }

    pub fn remember(&self, email: &str) -> Result<(), CredentialStoreError> {
        self.store.put_json(
            ACCOUNT,
            &LastLogin {
                email: email.to_owned(),
            },
        )
    }

    /// An unreadable entry counts as nothing remembered.
    pub fn email(&self) -> Option<String> {
        match self.store.get_json::<LastLogin>(ACCOUNT) {
            Ok(last) => last.map(|last| last.email),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable login memory");
                None
            }
        }
    }

    pub fn forget(&self) -> Result<(), CredentialStoreError> {
        self.store.forget(ACCOUNT)
    }
}
