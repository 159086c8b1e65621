//! # Error Types
//!
//! Domain-specific error types for finsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  finsync-core errors (this file)                                       │
//! │  ├── CoreError    - Invalid filters, field paths, token claims         │
//! │  └── DecodeError  - One remote record could not be decoded             │
//! │                                                                         │
//! │  finsync-db errors (separate crate)                                    │
//! │  └── DbError      - Entity store I/O failures                          │
//! │                                                                         │
//! │  finsync-sync errors (separate crate)                                  │
//! │  ├── AuthError    - Token refresh / session failures                   │
//! │  └── SyncError    - Everything a fetch-and-reconcile can hit           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `DecodeError` is never fatal to a batch. The reconciler skips the record
//! and counts it in the report's `rejected` total.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while building queries or interpreting credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A filter or sort referenced a field path that is not a plain
    /// dotted identifier.
    ///
    /// ## When This Occurs
    /// - Empty field name
    /// - Characters outside `[A-Za-z0-9_.]`
    /// - Leading, trailing or doubled dots (`a..b`)
    #[error("Invalid field path: '{0}'")]
    InvalidFieldPath(String),

    /// A filter compared a field against a value the store cannot bind
    /// (arrays and objects).
    #[error("Unsupported filter value for field '{field}': {reason}")]
    UnsupportedFilterValue { field: String, reason: String },

    /// The access token is not a JWT or carries no usable `exp` claim.
    #[error("Token claims unreadable: {0}")]
    TokenClaims(String),
}

// =============================================================================
// Decode Error
// =============================================================================

/// A single remote record that could not be turned into a typed entity.
///
/// Carries the record's position in the original (unsorted) batch so that
/// callers can correlate it with the raw response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("Record {index} rejected: {reason}")]
pub struct DecodeError {
    /// Position in the batch as received.
    pub index: usize,
    /// Why the record was rejected.
    pub reason: String,
}

impl DecodeError {
    /// Creates a decode error for the record at `index`.
    pub fn new(index: usize, reason: impl Into<String>) -> Self {
        DecodeError {
            index,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
