//! Credential storage used to persist auth sessions between runs.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialStoreError {
    #[error("credential not found")]
    NotFound,
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential store backend failure: {0}")]
    Backend(String),
    #[error("stored credential is malformed: {0}")]
    Malformed(String),
}

/// Key/value store for secrets, addressed by `(service, account)`.
pub trait CredentialStore: Send + Sync {
    fn put(&self, service: &str, account: &str, secret: &str) -> Result<(), CredentialStoreError>;

    fn get(&self, service: &str, account: &str) -> Result<String, CredentialStoreError>;

    /// Remove a credential. Missing entries are `NotFound`.
    fn remove(&self, service: &str, account: &str) -> Result<(), CredentialStoreError>;
}

impl<S: CredentialStore + ?Sized> CredentialStore for Arc<S> {
    fn put(&self, service: &str, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        (**self).put(service, account, secret)
    }

    fn get(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        (**self).get(service, account)
    }

    fn remove(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        (**self).remove(service, account)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn put(&self, service: &str, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.insert((service.to_owned(), account.to_owned()), secret.to_owned());
        Ok(())
    }

    fn get(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.get(&(service.to_owned(), account.to_owned()))
            .cloned()
            .ok_or(CredentialStoreError::NotFound)
    }

    fn remove(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.remove(&(service.to_owned(), account.to_owned()))
            .map(|_| ())
            .ok_or(CredentialStoreError::NotFound)
    }
}

/// Credentials kept in a single JSON file, for hosts without a keyring.
///
/// The file maps `"service/account"` keys to secrets and is rewritten through
/// a temp file and rename.
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, CredentialStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(CredentialStoreError::Unavailable(err.to_string())),
        };
        serde_json::from_str(&raw).map_err(|err| CredentialStoreError::Malformed(err.to_string()))
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), CredentialStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| CredentialStoreError::Unavailable(err.to_string()))?;
        }
        let encoded = serde_json::to_vec_pretty(entries)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, encoded)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))
    }

    fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> Result<(R, bool), CredentialStoreError>,
    ) -> Result<R, CredentialStoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        let mut entries = self.load()?;
        let (result, dirty) = f(&mut entries)?;
        if dirty {
            self.save(&entries)?;
        }
        Ok(result)
    }
}

fn file_key(service: &str, account: &str) -> String {
    format!("{service}/{account}")
}

impl CredentialStore for FileCredentialStore {
    fn put(&self, service: &str, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        self.with_entries(|entries| {
            entries.insert(file_key(service, account), secret.to_owned());
            Ok(((), true))
        })
    }

    fn get(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        self.with_entries(|entries| {
            entries
                .get(&file_key(service, account))
                .cloned()
                .map(|secret| (secret, false))
                .ok_or(CredentialStoreError::NotFound)
        })
    }

    fn remove(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        self.with_entries(|entries| {
            entries
                .remove(&file_key(service, account))
                .map(|_| ((), true))
                .ok_or(CredentialStoreError::NotFound)
        })
    }
}

#[cfg(feature = "os-keyring")]
#[derive(Default, Clone, Copy)]
pub struct OsKeyringCredentialStore;

#[cfg(feature = "os-keyring")]
impl CredentialStore for OsKeyringCredentialStore {
    fn put(&self, service: &str, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        entry
            .set_password(secret)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))
    }

    fn get(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        entry.get_password().map_err(map_keyring_error)
    }

    fn remove(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        entry.delete_credential().map_err(map_keyring_error)
    }
}

#[cfg(feature = "os-keyring")]
fn map_keyring_error(err: keyring::Error) -> CredentialStoreError {
    match err {
        keyring::Error::NoEntry => CredentialStoreError::NotFound,
        keyring::Error::NoStorageAccess(inner) => {
            CredentialStoreError::Unavailable(inner.to_string())
        }
        other => CredentialStoreError::Backend(other.to_string()),
    }
}

/// A credential store bound to one service name, with JSON helpers.
#[derive(Clone)]
pub struct ScopedCredentialStore<S: CredentialStore> {
    inner: S,
    service: String,
}

impl<S: CredentialStore> ScopedCredentialStore<S> {
    pub fn new(inner: S, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn put(&self, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        self.inner.put(&self.service, account, secret)
    }

    pub fn get(&self, account: &str) -> Result<String, CredentialStoreError> {
        self.inner.get(&self.service, account)
    }

    /// Remove a credential; a missing entry is not an error.
    pub fn forget(&self, account: &str) -> Result<(), CredentialStoreError> {
        match self.inner.remove(&self.service, account) {
            Ok(()) | Err(CredentialStoreError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn put_json<T: Serialize>(&self, account: &str, value: &T) -> Result<(), CredentialStoreError> {
        let encoded = serde_json::to_string(value)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        self.put(account, &encoded)
    }

    /// Load a JSON credential. Returns `Ok(None)` when absent.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        account: &str,
    ) -> Result<Option<T>, CredentialStoreError> {
        match self.get(account) {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| CredentialStoreError::Malformed(err.to_string())),
            Err(CredentialStoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
