//! # Client
//!
//! Wires the store, reconciler, token manager and sync driver together.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            FinsyncClient                                │
//! │                                                                         │
//! │   ClientConfig ──► Database ──► Reconciler ◄── RelationshipLinker       │
//! │                        │            ▲                                   │
//! │                        │            │                                   │
//! │                   TokenStore ──► TokenManager ◄── dyn AuthClient        │
//! │                                     ▲                                   │
//! │                                     │                                   │
//! │   dyn ApiTransport ──────────► CollectionSync ◄── dyn BatchDecoder      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use finsync_core::{AuthState, Entity, ReconcileReport, TokenGrant};
use finsync_db::{Database, EntityStore};

use crate::auth::{AuthClient, TokenManager};
use crate::collection::CollectionSync;
use crate::config::ClientConfig;
use crate::error::{AuthError, SyncError, SyncResult};
use crate::linker::RelationshipLinker;
use crate::reconcile::{Authority, Reconciler};
use crate::token_store::{CredentialVault, TokenStore};
use crate::transport::{ApiRequest, ApiTransport, BatchDecoder, JsonBatchDecoder};

/// Snapshot of client state for hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub auth_state: AuthState,
    pub database_healthy: bool,
    pub refresh_calls: u64,
}

/// The data layer, assembled.
#[derive(Debug, Clone)]
pub struct FinsyncClient {
    config: ClientConfig,
    db: Database,
    tokens: TokenManager,
    sync: CollectionSync,
}

impl FinsyncClient {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn store<T: Entity>(&self) -> EntityStore<T> {
        self.db.store::<T>()
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn reconciler(&self) -> &Reconciler {
        self.sync.reconciler()
    }

    pub fn sync(&self) -> &CollectionSync {
        &self.sync
    }

    pub async fn sign_in(&self, grant: TokenGrant) -> Uuid {
        self.tokens.sign_in(grant).await
    }

    pub async fn sign_out(&self) -> Option<Uuid> {
        self.tokens.sign_out().await
    }

    pub async fn fetch_and_reconcile<T: Entity>(
        &self,
        request: ApiRequest,
        authority: Authority,
    ) -> SyncResult<ReconcileReport> {
        self.sync.fetch_and_reconcile::<T>(request, authority).await
    }

    pub async fn status(&self) -> ClientStatus {
        ClientStatus {
            auth_state: self.tokens.state(),
            database_healthy: self.db.health_check().await,
            refresh_calls: self.tokens.refresh_calls(),
        }
    }

    /// Closes the database pool.
    pub async fn shutdown(&self) {
        info!("Shutting down client");
        self.db.close().await;
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`FinsyncClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    db: Option<Database>,
    transport: Option<Arc<dyn ApiTransport>>,
    auth_client: Option<Arc<dyn AuthClient>>,
    decoder: Option<Arc<dyn BatchDecoder>>,
    vault: Option<Arc<dyn CredentialVault>>,
    linker: RelationshipLinker,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder {
            config,
            db: None,
            transport: None,
            auth_client: None,
            decoder: None,
            vault: None,
            linker: RelationshipLinker::new(),
        }
    }

    /// Uses an already open database instead of the configured one.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ApiTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_auth_client(mut self, client: Arc<dyn AuthClient>) -> Self {
        self.auth_client = Some(client);
        self
    }

    /// Defaults to [`JsonBatchDecoder`] over a top-level array.
    pub fn with_decoder(mut self, decoder: Arc<dyn BatchDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Defaults to the database's `credentials` table.
    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_linker(mut self, linker: RelationshipLinker) -> Self {
        self.linker = linker;
        self
    }

    /// Opens the store, restores any persisted session and builds the client.
    pub async fn build(self) -> SyncResult<FinsyncClient> {
        self.config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| SyncError::InvalidConfig("Transport required".into()))?;
        let auth_client = self
            .auth_client
            .ok_or_else(|| SyncError::InvalidConfig("Auth client required".into()))?;

        let db = match self.db {
            Some(db) => db,
            None => Database::new(self.config.db_config()).await?,
        };

        let store = match self.vault {
            Some(vault) => TokenStore::new(vault),
            None => TokenStore::sqlite(&db),
        };
        let tokens = TokenManager::new(auth_client, store, self.config.token_settings());
        match tokens.restore().await {
            Ok(_) => {}
            Err(AuthError::Storage(reason)) => {
                warn!(%reason, "Could not restore persisted session");
            }
            Err(e) => return Err(e.into()),
        }

        let decoder = self
            .decoder
            .unwrap_or_else(|| Arc::new(JsonBatchDecoder::new()));
        let reconciler = Reconciler::new(db.clone(), Arc::new(self.linker));
        let sync = CollectionSync::new(
            self.config.base_url()?,
            transport,
            decoder,
            tokens.clone(),
            reconciler,
            self.config.retry_policy(),
        );

        info!(
            base_url = %self.config.api.base_url,
            auth_state = tokens.state().as_str(),
            "Client ready"
        );

        Ok(FinsyncClient {
            config: self.config,
            db,
            tokens,
            sync,
        })
    }
}
