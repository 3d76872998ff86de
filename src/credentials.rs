//! Registered users and their password hashes.
//!
//! Users live in a map behind a short synchronous lock, optionally mirrored to
//! a JSON file. Disk writes happen outside that lock, one at a time, so a slow
//! disk never holds up password checks.

use crate::error::CredentialError;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Argon2id hash in PHC string format.
    pub password_hash: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub last_login: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_user(&self, username: &str) -> Result<Option<UserRecord>, CredentialError>;

    /// Returns `false` for a wrong password or an unknown user.
    async fn verify_password(&self, username: &str, password: &str)
        -> Result<bool, CredentialError>;

    async fn create_user(
        &self,
        username: &str,
        password: &str,
        container_id: &str,
    ) -> Result<UserRecord, CredentialError>;

    async fn update_last_login(&self, username: &str) -> Result<(), CredentialError>;
}

fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hash(e.to_string()))
}

fn password_matches(stored: &str, password: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(hash) => Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "Stored password hash is unreadable");
            false
        }
    }
}

/// Argon2 is deliberately slow; keep it off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, CredentialError>
where
    F: FnOnce() -> Result<T, CredentialError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CredentialError::Hash(e.to_string()))?
}

/// File-backed (or purely in-memory) credential store.
pub struct FileCredentialStore {
    path: Option<PathBuf>,
    users: RwLock<HashMap<String, UserRecord>>,
    /// Serializes file writes. Never held together with `users`.
    writer: tokio::sync::Mutex<()>,
    /// The map changed since the last successful write.
    dirty: AtomicBool,
}

impl FileCredentialStore {
    pub fn in_memory() -> Self {
        Self::with_users(None, HashMap::new())
    }

    /// Loads `path` if it exists; it is created on the first registration.
    pub async fn open(path: PathBuf) -> Result<Self, CredentialError> {
        let users = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<HashMap<String, UserRecord>>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), users = users.len(), "Loaded credential store");
        Ok(Self::with_users(Some(path), users))
    }

    fn with_users(path: Option<PathBuf>, users: HashMap<String, UserRecord>) -> Self {
        Self {
            path,
            users: RwLock::new(users),
            writer: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Writes the current map to disk, waiting for any write in progress.
    /// Returns once a snapshot at least as new as the caller's change is on
    /// disk.
    async fn persist(&self) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.dirty.store(true, Ordering::SeqCst);
        let _writer = self.writer.lock().await;
        self.flush(path).await
    }

    /// Like [`Self::persist`], but leaves the write to a writer that is
    /// already running instead of queueing behind it.
    async fn persist_soon(&self) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.dirty.store(true, Ordering::SeqCst);
        match self.writer.try_lock() {
            Ok(_writer) => self.flush(path).await,
            Err(_) => Ok(()),
        }
    }

    /// Caller holds `writer`.
    async fn flush(&self, path: &Path) -> Result<(), CredentialError> {
        while self.dirty.swap(false, Ordering::SeqCst) {
            let snapshot = serde_json::to_vec_pretty(&*self.users.read())?;
            if let Err(e) = write_atomically(path, &snapshot).await {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }
}

async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), CredentialError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get_user(&self, username: &str) -> Result<Option<UserRecord>, CredentialError> {
        Ok(self.users.read().get(username).cloned())
    }

    async fn verify_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, CredentialError> {
        let Some(stored) = self
            .users
            .read()
            .get(username)
            .map(|u| u.password_hash.clone())
        else {
            return Ok(false);
        };
        let password = password.to_string();
        blocking(move || Ok(password_matches(&stored, &password))).await
    }

    async fn create_user(
        &self,
        username: &str,
        password: &str,
        container_id: &str,
    ) -> Result<UserRecord, CredentialError> {
        if self.users.read().contains_key(username) {
            return Err(CredentialError::AlreadyExists(username.to_string()));
        }
        let password = password.to_string();
        let password_hash = blocking(move || hash_password(&password)).await?;

        let now = Utc::now();
        let record = UserRecord {
            username: username.to_string(),
            password_hash,
            container_id: container_id.to_string(),
            created_at: now,
            last_login: now,
        };
        {
            let mut users = self.users.write();
            if users.contains_key(username) {
                return Err(CredentialError::AlreadyExists(username.to_string()));
            }
            users.insert(username.to_string(), record.clone());
        }
        if let Err(e) = self.persist().await {
            self.users.write().remove(username);
            return Err(e);
        }
        debug!(username, "Registered user");
        Ok(record)
    }

    async fn update_last_login(&self, username: &str) -> Result<(), CredentialError> {
        let updated = match self.users.write().get_mut(username) {
            Some(user) => {
                user.last_login = Utc::now();
                true
            }
            None => false,
        };
        if updated {
            self.persist_soon().await?;
        }
        Ok(())
    }
}
