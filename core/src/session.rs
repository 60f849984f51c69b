use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The authenticated user as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSnapshot {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Tokens and user held for the current session.
///
/// The session counts as authenticated exactly when `access_token` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserSnapshot>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        user: Option<UserSnapshot>,
    ) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token,
            user,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    /// Same refresh token and user, new access token.
    pub fn with_access_token(&self, access_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            ..self.clone()
        }
    }
}

/// Durable key-value home for the credential.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
    fn remove(&self) -> Result<()>;
}

/// Keeps the credential as a JSON file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let credential = serde_json::from_str(&contents).with_context(|| {
                    format!("invalid credential file at {}", self.path.display())
                })?;
                Ok(Some(credential))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let serialized = serde_json::to_vec_pretty(credential)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }

    pub fn snapshot(&self) -> Option<Credential> {
        self.slot.lock().clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        *self.slot.lock() = Some(credential.clone());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// Shared view of the current credential.
///
/// Clones share the same slot. Every write replaces the whole credential and
/// is mirrored to the backing store.
#[derive(Clone)]
pub struct SessionState {
    current: Arc<RwLock<Credential>>,
    store: Arc<dyn CredentialStore>,
}

impl SessionState {
    /// Rehydrates from `store`. An unreadable store starts logged out.
    pub fn open(store: Arc<dyn CredentialStore>) -> Self {
        let credential = match store.load() {
            Ok(credential) => credential.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to load stored credential, starting logged out");
                Credential::default()
            }
        };
        Self {
            current: Arc::new(RwLock::new(credential)),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryCredentialStore::new()))
    }

    pub fn get(&self) -> Credential {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.current.read().refresh_token.clone()
    }

    pub fn user(&self) -> Option<UserSnapshot> {
        self.current.read().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.read().is_authenticated()
    }

    pub fn set(&self, credential: Credential) {
        let mut current = self.current.write();
        if let Err(err) = self.store.save(&credential) {
            tracing::warn!(error = %err, "failed to persist credential");
        }
        *current = credential;
    }

    /// Swaps in a renewed access token, keeping refresh token and user.
    ///
    /// Only applies while the session still holds `refresh_token`, the token
    /// the renewal was made with. Returns whether the swap happened.
    pub fn replace_access_token(&self, refresh_token: &str, access_token: impl Into<String>) -> bool {
        let mut current = self.current.write();
        if current.refresh_token.as_deref() != Some(refresh_token) {
            return false;
        }
        let next = current.with_access_token(access_token);
        if let Err(err) = self.store.save(&next) {
            tracing::warn!(error = %err, "failed to persist renewed credential");
        }
        *current = next;
        true
    }

    /// Records a fresher user profile. Ignored when logged out.
    pub fn replace_user(&self, user: UserSnapshot) {
        let mut current = self.current.write();
        if !current.is_authenticated() {
            return;
        }
        let next = Credential {
            user: Some(user),
            ..current.clone()
        };
        if let Err(err) = self.store.save(&next) {
            tracing::warn!(error = %err, "failed to persist user profile");
        }
        *current = next;
    }

    pub fn clear(&self) {
        let mut current = self.current.write();
        self.remove_stored();
        *current = Credential::default();
    }

    /// Clears the session only while it still holds `refresh_token`.
    pub fn clear_if_refresh_token(&self, refresh_token: Option<&str>) -> bool {
        let mut current = self.current.write();
        if current.refresh_token.as_deref() != refresh_token {
            return false;
        }
        self.remove_stored();
        *current = Credential::default();
        true
    }

    fn remove_stored(&self) {
        if let Err(err) = self.store.remove() {
            tracing::warn!(error = %err, "failed to remove stored credential");
        }
    }
}
