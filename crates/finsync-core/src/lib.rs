//! # finsync-core: Pure Domain Types for the finsync Data Layer
//!
//! Everything the store and sync layers agree on, with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     finsync Client Data Layer                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                Host SDK (per-entity fetchers, UI)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   finsync-sync: Reconciler, Linker, TokenManager, CollectionSync│   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   finsync-db: EntityStore, TypeLocks, LiveQuery, migrations     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ finsync-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌────────────┐  ┌──────────┐  │   │
//! │  │   │  entity   │  │   query   │  │ credential │  │  report  │  │   │
//! │  │   │  Entity   │  │  Filter   │  │ Credential │  │ Reconcile│  │   │
//! │  │   │ PrimaryKey│  │ QuerySpec │  │ TokenGrant │  │  Report  │  │   │
//! │  │   └───────────┘  └───────────┘  └────────────┘  └──────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`entity`] - The `Entity` trait every cached record type implements
//! - [`query`] - Filters, sorts and limits (also used as reconcile scopes)
//! - [`credential`] - Access/refresh credential and token grants
//! - [`report`] - Result of a reconciliation pass
//! - [`session`] - Auth state and session events
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use finsync_core::{Filter, QuerySpec, Sort};
//!
//! // "the 10 most recent unpaid bills of account 42"
//! let spec = QuerySpec::new()
//!     .filter(Filter::eq("account_id", 42).and(Filter::eq("paid", false)))
//!     .sort(Sort::desc("due_date"))
//!     .limit(10);
//!
//! assert!(spec.validate().is_ok());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod credential;
pub mod entity;
pub mod error;
pub mod query;
pub mod report;
pub mod session;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use credential::{jwt_expiry, AccessToken, Credential, TokenGrant};
pub use entity::{Entity, PrimaryKey};
pub use error::{CoreError, CoreResult, DecodeError};
pub use query::{Filter, QuerySpec, ScalarValue, Sort, SortField};
pub use report::ReconcileReport;
pub use session::{AuthState, SessionEvent};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default proactive refresh margin in seconds.
///
/// A token this close to expiry is treated as expired so that requests do
/// not race the server's clock.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 300;

/// Default lifetime for grants that carry neither `expires_in` nor a JWT
/// `exp` claim.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Longest token lifetime honoured, in seconds (ten years).
///
/// Larger `expires_in` values, JWT `exp` claims and configured lifetimes are
/// clamped to this.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;
