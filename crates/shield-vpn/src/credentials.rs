//! Session Credentials
//!
//! API credentials (session id, access token, refresh token) and the store
//! that keeps them between runs.
//!
//! # Write Discipline
//!
//! Credentials are the only state shared between concurrent refreshes. All
//! writes go through [`CredentialVault::replace_rejected`], a compare-and-set
//! on the access token: renewed credentials only replace the record that
//! still holds the token the server rejected. Expiry plays no part, since a
//! server may revoke a token long before it claims to expire.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

/// API session credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// When the access token stops being accepted
    #[serde(with = "crate::epoch")]
    pub expiration: SystemTime,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Credentials {
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expiration <= now
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("session_id", &self.session_id)
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("expiration", &crate::epoch::to_secs(self.expiration))
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Credential storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Corrupt credential record: {0}")]
    Corrupt(String),
}

/// Secure storage for credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credentials>, StoreError>;

    async fn store(&self, credentials: &Credentials) -> Result<(), StoreError>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(Some(credentials)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, StoreError> {
        Ok(self.inner.read().await.clone())
    }

    async fn store(&self, credentials: &Credentials) -> Result<(), StoreError> {
        *self.inner.write().await = Some(credentials.clone());
        Ok(())
    }
}

/// JSON file store; a missing file means no credentials
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn store(&self, credentials: &Credentials) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(credentials)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        // Write then rename so readers never see a partial record
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

/// Serialized, freshness-checked access to a [`CredentialStore`]
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    write_lock: Mutex<()>,
    reauth_lock: Mutex<()>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            reauth_lock: Mutex::new(()),
        }
    }

    /// Held for the whole of a re-authentication so only one runs at a time
    pub async fn lock_reauth(&self) -> MutexGuard<'_, ()> {
        self.reauth_lock.lock().await
    }

    pub async fn load(&self) -> Result<Option<Credentials>, StoreError> {
        self.store.load().await
    }

    /// Store `incoming` in place of `rejected`.
    ///
    /// If the stored record no longer holds the rejected access token,
    /// another caller renewed first and its credentials win. Returns the
    /// credentials in effect afterwards.
    pub async fn replace_rejected(
        &self,
        rejected: &Credentials,
        incoming: Credentials,
    ) -> Result<Credentials, StoreError> {
        let _guard = self.write_lock.lock().await;

        if let Some(current) = self.store.load().await? {
            if current.access_token != rejected.access_token {
                debug!(
                    "Credentials for session {} were already renewed, keeping them",
                    current.session_id
                );
                return Ok(current);
            }
        }

        self.store.store(&incoming).await?;
        info!("Stored renewed credentials for session {}", incoming.session_id);
        Ok(incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn credentials(token: &str, expires: u64) -> Credentials {
        Credentials {
            session_id: "uid-1".to_string(),
            access_token: token.to_string(),
            refresh_token: format!("refresh-{}", token),
            expiration: UNIX_EPOCH + Duration::from_secs(expires),
            scopes: vec!["vpn".to_string()],
        }
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let text = format!("{:?}", credentials("secret-token", 10));
        assert!(!text.contains("secret-token"));
        assert!(text.contains("uid-1"));
    }

    #[tokio::test]
    async fn test_vault_replaces_rejected_token_regardless_of_expiry() {
        // Revoked early: still claims to be valid for much longer
        let revoked = credentials("revoked", 4_000_000_000);
        let store = Arc::new(MemoryCredentialStore::with_credentials(revoked.clone()));
        let vault = CredentialVault::new(store.clone());

        let stored = vault.replace_rejected(&revoked, credentials("new", 1_000)).await.unwrap();
        assert_eq!(stored.access_token, "new");
        assert_eq!(store.load().await.unwrap().unwrap().access_token, "new");
    }

    #[tokio::test]
    async fn test_vault_keeps_concurrent_renewal() {
        let store = Arc::new(MemoryCredentialStore::with_credentials(credentials("renewed", 2_000)));
        let vault = CredentialVault::new(store.clone());

        // A late writer that saw the older token loses
        let kept = vault
            .replace_rejected(&credentials("old", 1_000), credentials("late", 3_000))
            .await
            .unwrap();
        assert_eq!(kept.access_token, "renewed");
        assert_eq!(store.load().await.unwrap().unwrap().access_token, "renewed");
    }

    #[tokio::test]
    async fn test_vault_stores_into_empty_store() {
        let store = Arc::new(MemoryCredentialStore::new());
        let vault = CredentialVault::new(store.clone());

        let stored = vault
            .replace_rejected(&credentials("gone", 1_000), credentials("new", 2_000))
            .await
            .unwrap();
        assert_eq!(stored.access_token, "new");
        assert_eq!(store.load().await.unwrap(), Some(credentials("new", 2_000)));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let path = std::env::temp_dir().join(format!("shield-credentials-{}.json", rand::random::<u64>()));
        let store = FileCredentialStore::new(&path);

        assert_eq!(store.load().await.unwrap(), None);

        store.store(&credentials("tok", 1_700_000_000)).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, credentials("tok", 1_700_000_000));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("1700000000"));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_file_store_corrupt_record() {
        let path = std::env::temp_dir().join(format!("shield-corrupt-{}.json", rand::random::<u64>()));
        std::fs::write(&path, "{not json").unwrap();

        let result = FileCredentialStore::new(&path).load().await;
        assert!(matches!(result, Err(StoreError::Corrupt(_))));

        std::fs::remove_file(&path).ok();
    }
}
