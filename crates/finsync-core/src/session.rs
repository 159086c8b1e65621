//! # Session State
//!
//! ```text
//!                 sign_in / restore
//!  Unauthenticated ─────────────────► Authenticated ◄──────┐
//!        ▲                                │               │ success or
//!        │                                │ token expired │ retryable failure
//!        │   terminal refresh failure     ▼               │
//!        └─────────────────────────── Refreshing ─────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Externally observable authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Refreshing,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticated => "authenticated",
            AuthState::Refreshing => "refreshing",
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, AuthState::Unauthenticated)
    }
}

/// Session lifecycle notifications, broadcast process-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A credential was installed by `sign_in`.
    SignedIn { session_id: Uuid },

    /// The user signed out.
    SignedOut { session_id: Uuid },

    /// The server rejected the refresh token; the user must sign in again.
    /// Emitted once per session.
    Invalidated { session_id: Uuid, reason: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::SignedIn { session_id }
            | SessionEvent::SignedOut { session_id }
            | SessionEvent::Invalidated { session_id, .. } => *session_id,
        }
    }
}
