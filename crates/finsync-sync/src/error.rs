//! # Sync Error Types
//!
//! Error types for reconciliation, token lifecycle and fetch operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Auth                │ │
//! │  │                 │  │   (HttpError)   │  │     (AuthError)         │ │
//! │  │  InvalidConfig  │  │  Unauthorized   │  │  Retryable              │ │
//! │  │  InvalidUrl     │  │  Server / 429   │  │  SessionInvalid         │ │
//! │  │  ConfigLoad/Save│  │  Timeout        │  │  LoginRequired          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Store        │  │    Decode       │  │     Refresh             │ │
//! │  │   (DbError)     │  │                 │  │    (RefreshError)       │ │
//! │  │  aborts batch,  │  │  whole body     │  │  Transient / Rejected   │ │
//! │  │  propagates     │  │  unreadable     │  │  from the AuthClient    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-record decode failures are not errors here: they are counted in the
//! reconcile report.

use thiserror::Error;

use finsync_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// HTTP Error
// =============================================================================

/// Maximum length for response bodies kept in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Failure reported by an [`ApiTransport`](crate::transport::ApiTransport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// The server rejected the bearer token.
    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure (DNS, TLS, reset).
    #[error("Network error: {0}")]
    Transport(String),
}

impl HttpError {
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }

        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Maps a non-success status code to an error.
    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 => HttpError::Unauthorized,
            403 => HttpError::Forbidden(truncated),
            404 => HttpError::NotFound(truncated),
            429 => HttpError::RateLimited,
            500..=599 => HttpError::Server {
                status,
                body: truncated,
            },
            _ => HttpError::Status {
                status,
                body: truncated,
            },
        }
    }

    /// Returns true if repeating the request later might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HttpError::RateLimited
                | HttpError::Server { .. }
                | HttpError::Timeout
                | HttpError::Transport(_)
        )
    }
}

// =============================================================================
// Refresh Error
// =============================================================================

/// Failure reported by an [`AuthClient`](crate::auth::AuthClient) refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// Network trouble, timeout or 5xx. The refresh token is still good.
    #[error("Refresh failed transiently: {0}")]
    Transient(String),

    /// The refresh token is invalid, expired or revoked.
    #[error("Refresh token rejected: {0}")]
    Rejected(String),
}

impl From<HttpError> for RefreshError {
    fn from(err: HttpError) -> Self {
        if err.is_retryable() {
            RefreshError::Transient(err.to_string())
        } else {
            RefreshError::Rejected(err.to_string())
        }
    }
}

// =============================================================================
// Auth Error
// =============================================================================

/// What a caller waiting for a token is told.
///
/// Every waiter of one refresh receives the same value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The refresh failed transiently; the session is intact.
    #[error("Token refresh failed, try again: {0}")]
    Retryable(String),

    /// The refresh token was rejected; the session has been cleared.
    #[error("Session is no longer valid, sign in again")]
    SessionInvalid,

    /// No credential is held.
    #[error("Not signed in")]
    LoginRequired,

    /// The credential vault failed.
    #[error("Credential storage failed: {0}")]
    Storage(String),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Retryable(_))
    }

    /// Returns true if the user has to sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(self, AuthError::SessionInvalid | AuthError::LoginRequired)
    }
}

// =============================================================================
// Vault Error
// =============================================================================

/// Failure of a [`CredentialVault`](crate::token_store::CredentialVault).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Vault error: {0}")]
pub struct VaultError(pub String);

impl From<DbError> for VaultError {
    fn from(err: DbError) -> Self {
        VaultError(err.to_string())
    }
}

impl From<VaultError> for AuthError {
    fn from(err: VaultError) -> Self {
        AuthError::Storage(err.0)
    }
}

// =============================================================================
// Sync Error
// =============================================================================

/// Everything a reconcile or fetch-and-reconcile can fail with.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid API base URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Entity store failure. The batch was rolled back.
    #[error(transparent)]
    Store(#[from] DbError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Http(#[from] HttpError),

    /// The response body as a whole could not be decoded.
    #[error("Response decode failed: {0}")]
    Decode(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Transient HTTP failures (5xx, 429, timeout, network)
    /// - Transient refresh failures
    /// - Pool exhaustion
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Rejected sessions, missing login
    /// - Storage and decode failures
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http(e) => e.is_retryable(),
            SyncError::Auth(e) => e.is_retryable(),
            SyncError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Http(HttpError::Timeout).is_retryable());
        assert!(SyncError::Http(HttpError::from_status(503, "down")).is_retryable());
        assert!(SyncError::Auth(AuthError::Retryable("timeout".into())).is_retryable());

        assert!(!SyncError::Http(HttpError::Unauthorized).is_retryable());
        assert!(!SyncError::Auth(AuthError::SessionInvalid).is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::Store(DbError::QueryFailed("disk I/O error".into())).is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(HttpError::from_status(401, ""), HttpError::Unauthorized);
        assert_eq!(HttpError::from_status(429, ""), HttpError::RateLimited);
        assert!(matches!(
            HttpError::from_status(418, "teapot"),
            HttpError::Status { status: 418, .. }
        ));
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "é".repeat(400);
        match HttpError::from_status(500, &body) {
            HttpError::Server { body, .. } => {
                assert!(body.contains("truncated, 800 total bytes"));
            }
            other => panic!("expected Server, got {:?}", other),
        }
    }

    #[test]
    fn test_refresh_error_from_http() {
        assert!(matches!(
            RefreshError::from(HttpError::Timeout),
            RefreshError::Transient(_)
        ));
        assert!(matches!(
            RefreshError::from(HttpError::Unauthorized),
            RefreshError::Rejected(_)
        ));
    }
}
