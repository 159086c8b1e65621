//! # finsync-db: Entity Store for the finsync Data Layer
//!
//! Persistent keyed storage for every cached entity type, with per-type
//! locking and change notifications.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        finsync Data Flow                                │
//! │                                                                         │
//! │  Reconciler / host reads                                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     finsync-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ RecordRepo    │    │ 001_records  │  │   │
//! │  │   │ SqlitePool    │◄───│ LinkRepo      │    │ 002_creds    │  │   │
//! │  │   │ TypeLocks     │    │ CredentialRepo│    │              │  │   │
//! │  │   │ ChangeNotices │    └───────────────┘    └──────────────┘  │   │
//! │  │   └───────┬───────┘                                            │   │
//! │  │           │                                                     │   │
//! │  │   ┌───────▼───────┐    ┌───────────────┐                       │   │
//! │  │   │ EntityStore<T>│───►│ LiveQuery<T>  │                       │   │
//! │  │   └───────────────┘    └───────────────┘                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool, write scopes and change notices
//! - [`locks`] - Per-entity-type read/write locks
//! - [`store`] - Typed entity store
//! - [`live`] - Live queries and snapshot diffs
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - SQL for records, links and credentials
//!
//! ## Usage
//!
//! ```rust,ignore
//! use finsync_db::{Database, DbConfig};
//! use finsync_core::{Filter, QuerySpec, Sort};
//!
//! let db = Database::new(DbConfig::new("path/to/finsync.db")).await?;
//!
//! let unpaid = db
//!     .store::<Bill>()
//!     .query(&QuerySpec::new().filter(Filter::eq("paid", false)).sort(Sort::asc("due_date")))
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod live;
pub mod locks;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use live::{LiveQuery, LiveQueryEvent, RowChange};
pub use locks::TypeLocks;
pub use pool::{ChangeNotice, Database, DbConfig, WriteScope};
pub use store::EntityStore;

// Repository re-exports for convenience
pub use repository::credentials::CredentialRepository;
pub use repository::links::LinkRepository;
pub use repository::records::{RecordRepository, StoredRecord};
