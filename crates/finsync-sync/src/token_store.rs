//! # Token Store
//!
//! Durable home of the session credential.
//!
//! ```text
//! TokenManager ──► TokenStore ──► dyn CredentialVault
//!                                     ├── CredentialRepository (SQLite `credentials` row)
//!                                     └── MemoryVault          (tests, ephemeral sessions)
//! ```
//!
//! Hosts with a platform keychain implement [`CredentialVault`] themselves.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use finsync_core::Credential;
use finsync_db::{CredentialRepository, Database};

use crate::error::{AuthError, VaultError};

/// Secure storage for at most one credential.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Replaces the stored credential.
    async fn save(&self, credential: &Credential) -> Result<(), VaultError>;

    async fn load(&self) -> Result<Option<Credential>, VaultError>;

    /// Removes the stored credential, if any.
    async fn clear(&self) -> Result<(), VaultError>;
}

#[async_trait]
impl CredentialVault for CredentialRepository {
    async fn save(&self, credential: &Credential) -> Result<(), VaultError> {
        CredentialRepository::save(self, credential).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Credential>, VaultError> {
        Ok(CredentialRepository::load(self).await?)
    }

    async fn clear(&self) -> Result<(), VaultError> {
        CredentialRepository::clear(self).await?;
        Ok(())
    }
}

/// Process-local vault.
#[derive(Debug, Clone, Default)]
pub struct MemoryVault {
    slot: Arc<Mutex<Option<Credential>>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialVault for MemoryVault {
    async fn save(&self, credential: &Credential) -> Result<(), VaultError> {
        *self.slot.lock().await = Some(credential.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Credential>, VaultError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn clear(&self) -> Result<(), VaultError> {
        self.slot.lock().await.take();
        Ok(())
    }
}

/// Credential persistence used by the token manager.
#[derive(Clone)]
pub struct TokenStore {
    vault: Arc<dyn CredentialVault>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

impl TokenStore {
    pub fn new(vault: Arc<dyn CredentialVault>) -> Self {
        TokenStore { vault }
    }

    /// Stores the credential in the database's `credentials` table.
    pub fn sqlite(db: &Database) -> Self {
        TokenStore::new(Arc::new(db.credentials()))
    }

    pub fn in_memory() -> Self {
        TokenStore::new(Arc::new(MemoryVault::new()))
    }

    pub async fn persist(&self, credential: &Credential) -> Result<(), AuthError> {
        self.vault.save(credential).await?;
        debug!(session_id = %credential.session_id, "Credential persisted");
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<Credential>, AuthError> {
        Ok(self.vault.load().await?)
    }

    pub async fn clear(&self) -> Result<(), AuthError> {
        self.vault.clear().await?;
        debug!("Credential cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use finsync_core::TokenGrant;
    use finsync_db::DbConfig;
    use uuid::Uuid;

    fn credential() -> Credential {
        Credential::from_grant(
            TokenGrant::new("access-1").with_refresh_token("refresh-1"),
            None,
            Uuid::new_v4(),
            Duration::hours(1),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = TokenStore::in_memory();
        assert!(store.load().await.unwrap().is_none());

        let cred = credential();
        store.persist(&cred).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(cred));

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_store_replaces_credential() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let store = TokenStore::sqlite(&db);

        store.persist(&credential()).await.unwrap();
        let second = credential();
        store.persist(&second).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.session_id, second.session_id);
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-1"));
    }
}
