//! # Entity Trait
//!
//! Every record type cached by the SDK (bills, goals, accounts, ...) is
//! described to the data layer by implementing [`Entity`]. The trait is the
//! whole per-type configuration the generic store and reconciler need: a
//! table name and a primary-key accessor.
//!
//! ## Identity
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  (ENTITY_TYPE, primary_key)  ──►  one logical entity, forever           │
//! │                                                                         │
//! │  Reconciliation may rewrite every field of the body, it never changes   │
//! │  the key. A record that "moves" between scopes keeps its key and is     │
//! │  updated in place.                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Primary key of a record, unique within its entity type.
pub type PrimaryKey = i64;

/// A typed, keyed record that can live in the entity store.
///
/// ## Example
/// ```rust
/// use finsync_core::{Entity, PrimaryKey};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Bill {
///     id: i64,
///     account_id: i64,
///     amount_cents: i64,
/// }
///
/// impl Entity for Bill {
///     const ENTITY_TYPE: &'static str = "bill";
///
///     fn primary_key(&self) -> PrimaryKey {
///         self.id
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Logical table name. Must be unique across the SDK.
    const ENTITY_TYPE: &'static str;

    /// Returns the record's primary key.
    fn primary_key(&self) -> PrimaryKey;
}
