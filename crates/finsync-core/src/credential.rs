//! # Credentials
//!
//! The access/refresh token pair the SDK authenticates with, and the grant
//! shape a login or refresh response is reduced to.
//!
//! ## Expiry Resolution
//! ```text
//! TokenGrant                         Credential.expires_at
//! ──────────                         ─────────────────────
//! expires_in = Some(3600)      ──►   now + 3600s
//! expires_in = None, JWT exp   ──►   exp (seconds since epoch)
//! expires_in = None, opaque    ──►   now + default lifetime
//! ```
//!
//! Every lifetime is clamped to `0..=MAX_TOKEN_LIFETIME_SECS`, so a hostile
//! or broken server cannot push an expiry out of chrono's range.
//!
//! JWT claims are read without signature verification. The SDK is not the
//! audience that validates the token, it only needs to know when to stop
//! using it.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::MAX_TOKEN_LIFETIME_SECS;

// =============================================================================
// Access Token
// =============================================================================

/// Bearer token sent with every request.
///
/// `Debug` never prints the token itself.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        AccessToken(token.into())
    }

    /// The raw token, for building an `Authorization` header.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(<{} chars>)", self.0.len())
    }
}

impl From<&str> for AccessToken {
    fn from(s: &str) -> Self {
        AccessToken::new(s)
    }
}

// =============================================================================
// Token Grant
// =============================================================================

/// What a login or refresh response yields.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: AccessToken,

    /// Absent when the server does not rotate refresh tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Lifetime in seconds, relative to the moment the grant was received.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &self.access_token)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>) -> Self {
        TokenGrant {
            access_token: AccessToken::new(access_token),
            refresh_token: None,
            expires_in: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_in(mut self, secs: i64) -> Self {
        self.expires_in = Some(secs);
        self
    }

    /// Resolves the absolute expiry of this grant.
    pub fn expiry(&self, now: DateTime<Utc>, default_lifetime: Duration) -> DateTime<Utc> {
        if let Some(secs) = self.expires_in {
            return expires_after(now, clamp_lifetime_secs(secs));
        }

        match jwt_expiry(self.access_token.as_str()) {
            Ok(exp) => exp.min(expires_after(now, MAX_TOKEN_LIFETIME_SECS)),
            Err(_) => expires_after(now, clamp_lifetime_secs(default_lifetime.num_seconds())),
        }
    }
}

// =============================================================================
// Credential
// =============================================================================

/// The live credential of one signed-in session.
///
/// `session_id` is assigned at sign-in and survives refreshes, so a refresh
/// that completes after a sign-out/sign-in can tell it belongs to an older
/// session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub session_id: Uuid,
    pub access_token: AccessToken,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("session_id", &self.session_id)
            .field("access_token", &self.access_token)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

impl Credential {
    /// Builds the credential for `grant`.
    ///
    /// When the grant carries no refresh token, `previous_refresh` is kept.
    pub fn from_grant(
        grant: TokenGrant,
        previous_refresh: Option<String>,
        session_id: Uuid,
        default_lifetime: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = grant.expiry(now, default_lifetime);

        Credential {
            session_id,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh),
            expires_at,
            issued_at: now,
        }
    }

    /// True once the token is past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the token expires within `margin` of `now`.
    pub fn needs_refresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        match now.checked_add_signed(margin) {
            Some(deadline) => deadline >= self.expires_at,
            // A margin past the end of time covers every expiry.
            None => true,
        }
    }

    /// Seconds until expiry (negative once expired).
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

fn clamp_lifetime_secs(secs: i64) -> i64 {
    secs.clamp(0, MAX_TOKEN_LIFETIME_SECS)
}

/// `now + secs`, saturating instead of overflowing.
fn expires_after(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(secs)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// =============================================================================
// JWT Claims
// =============================================================================

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    exp: Option<i64>,
}

/// Reads the `exp` claim of a JWT without verifying its signature.
pub fn jwt_expiry(token: &str) -> CoreResult<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = jsonwebtoken::decode::<ExpiryClaims>(
        token,
        &DecodingKey::from_secret(&[]),
        &validation,
    )
    .map_err(|e| CoreError::TokenClaims(e.to_string()))?;

    let exp = data
        .claims
        .exp
        .ok_or_else(|| CoreError::TokenClaims("missing exp claim".to_string()))?;

    DateTime::<Utc>::from_timestamp(exp, 0)
        .ok_or_else(|| CoreError::TokenClaims(format!("exp {} out of range", exp)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn signed_jwt(exp: Option<i64>) -> String {
        #[derive(Serialize)]
        struct Claims {
            sub: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            exp: Option<i64>,
        }

        encode(
            &Header::default(),
            &Claims {
                sub: "user-1".to_string(),
                exp,
            },
            &EncodingKey::from_secret(b"server-side-secret"),
        )
        .unwrap()
    }

    #[test]
    fn test_expires_in_wins() {
        let now = Utc::now();
        let grant = TokenGrant::new(signed_jwt(Some(1))).with_expires_in(600);

        let expiry = grant.expiry(now, Duration::seconds(60));
        assert_eq!(expiry, now + Duration::seconds(600));
    }

    #[test]
    fn test_jwt_exp_used_without_expires_in() {
        let now = Utc::now();
        let exp = now.timestamp() + 900;
        let grant = TokenGrant::new(signed_jwt(Some(exp)));

        let expiry = grant.expiry(now, Duration::seconds(60));
        assert_eq!(expiry.timestamp(), exp);
    }

    #[test]
    fn test_opaque_token_falls_back_to_default() {
        let now = Utc::now();
        let grant = TokenGrant::new("not-a-jwt");

        let expiry = grant.expiry(now, Duration::seconds(60));
        assert_eq!(expiry, now + Duration::seconds(60));

        let grant = TokenGrant::new(signed_jwt(None));
        assert_eq!(grant.expiry(now, Duration::seconds(60)), now + Duration::seconds(60));
    }

    #[test]
    fn test_refresh_token_rotation() {
        let now = Utc::now();
        let session = Uuid::new_v4();

        let kept = Credential::from_grant(
            TokenGrant::new("a").with_expires_in(60),
            Some("old-refresh".to_string()),
            session,
            Duration::seconds(60),
            now,
        );
        assert_eq!(kept.refresh_token.as_deref(), Some("old-refresh"));

        let rotated = Credential::from_grant(
            TokenGrant::new("b")
                .with_refresh_token("new-refresh")
                .with_expires_in(60),
            Some("old-refresh".to_string()),
            session,
            Duration::seconds(60),
            now,
        );
        assert_eq!(rotated.refresh_token.as_deref(), Some("new-refresh"));
        assert_eq!(rotated.session_id, session);
    }

    #[test]
    fn test_needs_refresh_margin() {
        let now = Utc::now();
        let cred = Credential::from_grant(
            TokenGrant::new("a").with_expires_in(120),
            None,
            Uuid::new_v4(),
            Duration::seconds(60),
            now,
        );

        assert!(!cred.is_expired(now));
        assert!(!cred.needs_refresh(Duration::seconds(60), now));
        assert!(cred.needs_refresh(Duration::seconds(300), now));
        assert!(cred.is_expired(now + Duration::seconds(120)));
        assert_eq!(cred.remaining_secs(now), 120);
    }

    #[test]
    fn test_huge_lifetimes_are_clamped() {
        let now = Utc::now();
        let cap = now + Duration::seconds(MAX_TOKEN_LIFETIME_SECS);

        let grant = TokenGrant::new("a").with_expires_in(i64::MAX / 1000);
        assert_eq!(grant.expiry(now, Duration::seconds(60)), cap);

        let grant = TokenGrant::new("a").with_expires_in(i64::MAX);
        assert_eq!(grant.expiry(now, Duration::seconds(60)), cap);

        let grant = TokenGrant::new("a").with_expires_in(-5);
        assert_eq!(grant.expiry(now, Duration::seconds(60)), now);

        let far_exp = now.timestamp() + 4 * MAX_TOKEN_LIFETIME_SECS;
        let grant = TokenGrant::new(signed_jwt(Some(far_exp)));
        assert_eq!(grant.expiry(now, Duration::seconds(60)), cap);

        let grant = TokenGrant::new("opaque");
        assert_eq!(grant.expiry(now, Duration::max_value()), cap);
    }

    #[test]
    fn test_needs_refresh_with_unbounded_margin() {
        let now = Utc::now();
        let cred = Credential::from_grant(
            TokenGrant::new("a").with_expires_in(i64::MAX / 1000),
            None,
            Uuid::new_v4(),
            Duration::seconds(60),
            now,
        );

        assert!(!cred.needs_refresh(Duration::seconds(300), now));
        assert!(cred.needs_refresh(Duration::max_value(), now));
        assert!(cred.remaining_secs(now) > 0);
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let token = AccessToken::new("super-secret-value");
        let printed = format!("{:?}", token);
        assert!(!printed.contains("super-secret-value"));
    }
}
