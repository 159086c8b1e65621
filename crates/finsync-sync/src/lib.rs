//! # finsync-sync: Reconciliation and Token Lifecycle
//!
//! Keeps the local entity store in step with the server and keeps the
//! session's access token valid.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         finsync-sync                                    │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  FinsyncClient (client.rs)                       │  │
//! │  │  Builds everything from ClientConfig + host-provided seams       │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │                 ┌─────────────▼──────────────┐                          │
//! │                 │  CollectionSync            │                          │
//! │                 │  token → send → decode →   │                          │
//! │                 │  reconcile, with backoff   │                          │
//! │                 └──────┬──────────────┬──────┘                          │
//! │                        │              │                                 │
//! │         ┌──────────────▼───┐   ┌──────▼─────────────┐                   │
//! │         │  TokenManager    │   │  Reconciler         │                   │
//! │         │  single-flight   │   │  merge-join per     │                   │
//! │         │  refresh         │   │  entity type        │                   │
//! │         └──────┬───────────┘   └──────┬─────────────┘                   │
//! │                │                      │                                 │
//! │         ┌──────▼───────────┐   ┌──────▼─────────────┐                   │
//! │         │  TokenStore      │   │ RelationshipLinker  │                   │
//! │         │  CredentialVault │   │ (parent, child) fns │                   │
//! │         └──────────────────┘   └────────────────────┘                   │
//! │                                                                         │
//! │  HOST SEAMS: ApiTransport, AuthClient, BatchDecoder, CredentialVault    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`reconcile`] - `Reconciler`, `RemoteBatch`, `Authority`
//! - [`linker`] - `RelationshipLinker` dispatch table
//! - [`auth`] - `TokenManager` and the `AuthClient` seam
//! - [`token_store`] - `TokenStore` and credential vaults
//! - [`transport`] - `ApiTransport`, `BatchDecoder`, `JsonBatchDecoder`
//! - [`collection`] - `CollectionSync` fetch-and-reconcile driver
//! - [`client`] - `FinsyncClient` and its builder
//! - [`config`] - `ClientConfig` (TOML + environment)
//! - [`logging`] - Subscriber setup for hosts
//! - [`error`] - Sync, auth and transport errors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use finsync_sync::{Authority, ClientConfig, FinsyncClient, RelationshipLinker};
//! use finsync_sync::transport::ApiRequest;
//!
//! let mut linker = RelationshipLinker::new();
//! linker.register_fn::<Account, Bill, _>(|account, bill| bill.account_id == account.id);
//!
//! let client = FinsyncClient::builder(ClientConfig::load_or_default(None))
//!     .with_transport(transport)
//!     .with_auth_client(auth_client)
//!     .with_linker(linker)
//!     .build()
//!     .await?;
//!
//! let report = client
//!     .fetch_and_reconcile::<Bill>(ApiRequest::get("bills"), Authority::Complete)
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod client;
pub mod collection;
pub mod config;
pub mod error;
pub mod linker;
pub mod logging;
pub mod reconcile;
pub mod token_store;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{AuthClient, TokenManager, TokenManagerSettings};
pub use client::{ClientBuilder, ClientStatus, FinsyncClient};
pub use collection::{CollectionSync, RetryPolicy};
pub use config::ClientConfig;
pub use error::{AuthError, HttpError, RefreshError, SyncError, SyncResult, VaultError};
pub use linker::{LinkRecord, RelationshipLinker, RelationshipSlot};
pub use logging::init_tracing;
pub use reconcile::{Authority, Reconciler, RemoteBatch};
pub use token_store::{CredentialVault, MemoryVault, TokenStore};
pub use transport::{
    ApiRequest, ApiTransport, BatchDecoder, DecodedBatch, JsonBatchDecoder, RawResponse,
};
