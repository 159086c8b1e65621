//! # Token Lifecycle Manager
//!
//! Hands out access tokens and refreshes them with at most one refresh
//! request in flight.
//!
//! ## State Machine
//! ```text
//!                 sign_in / restore
//!   Unauthenticated ───────────────► Authenticated ◄──────────────┐
//!         ▲                               │                       │
//!         │                  expired or   │                       │ success /
//!         │                  401 reported ▼                       │ transient failure
//!         │                          Refreshing ──────────────────┘
//!         │      rejected refresh         │
//!         └───────────────────────────────┘
//!                 (credential cleared, SessionEvent::Invalidated)
//! ```
//!
//! ## Single Flight
//! ```text
//!   caller A ─┐                 ┌─ lock: Idle → Refreshing, spawn task ─┐
//!   caller B ─┼─ current_token ─┤                                       │
//!   caller C ─┘                 └─ lock: Refreshing → clone receiver    │
//!                                                                        ▼
//!                       refresh task ── AuthClient::refresh ── install, persist
//!                                                                        │
//!                       watch::Sender::send_replace(outcome) ◄───────────┘
//!                          A, B, C all receive the same outcome
//! ```
//!
//! The refresh runs in its own task, so a caller that gives up (drops its
//! future) does not strand the others. The state mutex is never held
//! across the refresh round trip or the vault.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use finsync_core::{
    AccessToken, AuthState, Credential, SessionEvent, TokenGrant, DEFAULT_REFRESH_MARGIN_SECS,
    DEFAULT_TOKEN_LIFETIME_SECS,
};

use crate::error::{AuthError, RefreshError};
use crate::token_store::TokenStore;

/// Capacity of the session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Default upper bound on one refresh round trip.
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 30;

/// Exchanges a refresh token for a new grant. Implemented by the host.
#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError>;
}

/// Timing knobs for [`TokenManager`].
#[derive(Debug, Clone)]
pub struct TokenManagerSettings {
    /// Tokens expiring within this margin are refreshed proactively.
    pub refresh_margin: Duration,
    pub refresh_timeout: StdDuration,
    /// Lifetime assumed when a grant carries neither `expires_in` nor `exp`.
    pub default_lifetime: Duration,
}

impl Default for TokenManagerSettings {
    fn default() -> Self {
        TokenManagerSettings {
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            refresh_timeout: StdDuration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
            default_lifetime: Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS),
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

type RefreshOutcome = Result<AccessToken, AuthError>;
type Waiter = watch::Receiver<Option<RefreshOutcome>>;

enum Phase {
    Idle,
    Refreshing(Waiter),
}

struct Inner {
    credential: Option<Credential>,
    phase: Phase,
    /// Set when the server rejected the current access token.
    stale: bool,
    /// Bumped on every refresh start, sign-in and sign-out. A refresh task
    /// only applies its outcome if the epoch is still its own.
    epoch: u64,
}

impl Inner {
    /// The waiter of a live refresh. A refresh whose task died without
    /// reporting is treated as absent.
    fn in_flight(&self) -> Option<Waiter> {
        match &self.phase {
            Phase::Refreshing(rx) if rx.has_changed().is_ok() => Some(rx.clone()),
            _ => None,
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    /// Serializes vault writes; taken without `inner` held.
    persist_lock: Mutex<()>,
    client: Arc<dyn AuthClient>,
    store: TokenStore,
    settings: TokenManagerSettings,
    state_tx: watch::Sender<AuthState>,
    events_tx: broadcast::Sender<SessionEvent>,
    refresh_calls: AtomicU64,
}

impl Shared {
    async fn current_session(&self) -> Option<Uuid> {
        self.inner
            .lock()
            .await
            .credential
            .as_ref()
            .map(|c| c.session_id)
    }

    /// Persists `credential` if its session is still the current one.
    async fn persist_if_current(&self, credential: &Credential) {
        let _persist = self.persist_lock.lock().await;
        if self.current_session().await != Some(credential.session_id) {
            debug!(session_id = %credential.session_id, "Session changed, skipping persist");
            return;
        }
        if let Err(e) = self.store.persist(credential).await {
            warn!(error = %e, "Failed to persist credential");
        }
    }

    async fn clear_vault(&self) {
        let _persist = self.persist_lock.lock().await;
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Failed to clear persisted credential");
        }
    }

    fn set_state(&self, state: AuthState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "Auth state changed");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}

// =============================================================================
// Token Manager
// =============================================================================

/// Owner of the session credential.
///
/// Cheap to clone; clones share one credential and one refresh.
#[derive(Clone)]
pub struct TokenManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("state", &self.state())
            .field("settings", &self.shared.settings)
            .finish()
    }
}

impl TokenManager {
    pub fn new(
        client: Arc<dyn AuthClient>,
        store: TokenStore,
        settings: TokenManagerSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(AuthState::Unauthenticated);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        TokenManager {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    credential: None,
                    phase: Phase::Idle,
                    stale: false,
                    epoch: 0,
                }),
                persist_lock: Mutex::new(()),
                client,
                store,
                settings,
                state_tx,
                events_tx,
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &TokenManagerSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> AuthState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AuthState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Number of refresh requests sent to the [`AuthClient`].
    pub fn refresh_calls(&self) -> u64 {
        self.shared.refresh_calls.load(Ordering::Relaxed)
    }

    /// A copy of the held credential.
    pub async fn credential(&self) -> Option<Credential> {
        self.shared.inner.lock().await.credential.clone()
    }

    // =========================================================================
    // Session Lifecycle
    // =========================================================================

    /// Starts a new session from a login grant.
    ///
    /// A persistence failure is logged; the session is usable regardless.
    pub async fn sign_in(&self, grant: TokenGrant) -> Uuid {
        let session_id = Uuid::new_v4();
        let credential = Credential::from_grant(
            grant,
            None,
            session_id,
            self.shared.settings.default_lifetime,
            Utc::now(),
        );

        {
            let mut inner = self.shared.inner.lock().await;
            inner.credential = Some(credential.clone());
            inner.phase = Phase::Idle;
            inner.stale = false;
            inner.epoch += 1;
            self.shared.set_state(AuthState::Authenticated);
        }

        self.shared.persist_if_current(&credential).await;
        self.shared.emit(SessionEvent::SignedIn { session_id });
        info!(%session_id, expires_at = %credential.expires_at, "Signed in");
        session_id
    }

    /// Ends the session. Returns the id of the session that was ended.
    pub async fn sign_out(&self) -> Option<Uuid> {
        let ended = {
            let mut inner = self.shared.inner.lock().await;
            let ended = inner.credential.take().map(|c| c.session_id);
            inner.phase = Phase::Idle;
            inner.stale = false;
            inner.epoch += 1;
            self.shared.set_state(AuthState::Unauthenticated);
            ended
        };

        self.shared.clear_vault().await;
        if let Some(session_id) = ended {
            self.shared.emit(SessionEvent::SignedOut { session_id });
            info!(%session_id, "Signed out");
        }
        ended
    }

    /// Loads a persisted credential, if any.
    ///
    /// Returns true if a session is held afterwards. An already held
    /// session is kept.
    pub async fn restore(&self) -> Result<bool, AuthError> {
        let loaded = self.shared.store.load().await?;

        let mut inner = self.shared.inner.lock().await;
        if inner.credential.is_some() {
            return Ok(true);
        }
        let Some(credential) = loaded else {
            debug!("No persisted credential");
            return Ok(false);
        };

        info!(session_id = %credential.session_id, "Restored session");
        inner.credential = Some(credential);
        inner.phase = Phase::Idle;
        inner.stale = false;
        inner.epoch += 1;
        self.shared.set_state(AuthState::Authenticated);
        Ok(true)
    }

    // =========================================================================
    // Token Access
    // =========================================================================

    /// A valid access token, refreshing first if it is about to expire.
    pub async fn current_token(&self) -> Result<AccessToken, AuthError> {
        self.acquire(None).await
    }

    /// Called after the server answered 401 to `rejected`.
    ///
    /// If `rejected` was already replaced, the current token is returned
    /// without another refresh.
    pub async fn report_unauthorized(&self, rejected: &AccessToken) -> Result<AccessToken, AuthError> {
        self.acquire(Some(rejected)).await
    }

    async fn acquire(&self, rejected: Option<&AccessToken>) -> Result<AccessToken, AuthError> {
        let mut waiter = {
            let mut inner = self.shared.inner.lock().await;

            match inner.in_flight() {
                Some(waiter) => waiter,
                None => {
                    let (token, needs_refresh) = match inner.credential.as_ref() {
                        Some(c) => (
                            c.access_token.clone(),
                            c.needs_refresh(self.shared.settings.refresh_margin, Utc::now()),
                        ),
                        None => return Err(AuthError::LoginRequired),
                    };

                    if rejected == Some(&token) {
                        debug!("Current token rejected by server");
                        inner.stale = true;
                    }
                    if !inner.stale && !needs_refresh {
                        return Ok(token);
                    }
                    self.start_refresh(&mut inner)?
                }
            }
        };

        wait_for_outcome(&mut waiter).await
    }

    /// Moves to `Refreshing` and spawns the refresh task.
    ///
    /// Caller holds the state lock.
    fn start_refresh(&self, inner: &mut Inner) -> Result<Waiter, AuthError> {
        let credential = inner.credential.clone().ok_or(AuthError::LoginRequired)?;

        let (tx, rx) = watch::channel(None);
        inner.epoch += 1;
        inner.phase = Phase::Refreshing(rx.clone());
        self.shared.set_state(AuthState::Refreshing);

        debug!(session_id = %credential.session_id, epoch = inner.epoch, "Starting token refresh");
        tokio::spawn(run_refresh(self.shared.clone(), credential, inner.epoch, tx));
        Ok(rx)
    }
}

async fn wait_for_outcome(waiter: &mut Waiter) -> RefreshOutcome {
    match waiter.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => match &*outcome {
            Some(result) => result.clone(),
            None => Err(AuthError::Retryable("refresh produced no outcome".to_string())),
        },
        Err(_) => Err(AuthError::Retryable(
            "refresh ended without an outcome".to_string(),
        )),
    }
}

// =============================================================================
// Refresh Task
// =============================================================================

async fn run_refresh(
    shared: Arc<Shared>,
    credential: Credential,
    epoch: u64,
    tx: watch::Sender<Option<RefreshOutcome>>,
) {
    let session_id = credential.session_id;

    let result = match credential.refresh_token.as_deref() {
        None => Err(RefreshError::Rejected("no refresh token".to_string())),
        Some(refresh_token) => {
            shared.refresh_calls.fetch_add(1, Ordering::Relaxed);
            let timeout = shared.settings.refresh_timeout;
            match tokio::time::timeout(timeout, shared.client.refresh(refresh_token)).await {
                Ok(result) => result,
                Err(_) => Err(RefreshError::Transient(format!(
                    "refresh timed out after {:?}",
                    timeout
                ))),
            }
        }
    };

    let outcome = match result {
        Ok(grant) => apply_success(&shared, &credential, grant, epoch).await,
        Err(RefreshError::Transient(reason)) => {
            warn!(%session_id, %reason, "Token refresh failed, will retry on next use");
            let mut inner = shared.inner.lock().await;
            if inner.epoch == epoch {
                inner.phase = Phase::Idle;
                shared.set_state(AuthState::Authenticated);
            }
            Err(AuthError::Retryable(reason))
        }
        Err(RefreshError::Rejected(reason)) => {
            apply_rejection(&shared, session_id, reason, epoch).await
        }
    };

    tx.send_replace(Some(outcome));
}

async fn apply_success(
    shared: &Shared,
    previous: &Credential,
    grant: TokenGrant,
    epoch: u64,
) -> RefreshOutcome {
    let refreshed = Credential::from_grant(
        grant,
        previous.refresh_token.clone(),
        previous.session_id,
        shared.settings.default_lifetime,
        Utc::now(),
    );

    {
        let mut inner = shared.inner.lock().await;
        if inner.epoch != epoch {
            // Signed out or signed in again while refreshing.
            debug!(session_id = %previous.session_id, "Discarding refresh for ended session");
            return match inner.credential.as_ref() {
                Some(current) => Ok(current.access_token.clone()),
                None => Err(AuthError::LoginRequired),
            };
        }
        inner.credential = Some(refreshed.clone());
        inner.phase = Phase::Idle;
        inner.stale = false;
        shared.set_state(AuthState::Authenticated);
    }

    shared.persist_if_current(&refreshed).await;
    info!(
        session_id = %refreshed.session_id,
        expires_at = %refreshed.expires_at,
        "Token refreshed"
    );
    Ok(refreshed.access_token)
}

async fn apply_rejection(
    shared: &Shared,
    session_id: Uuid,
    reason: String,
    epoch: u64,
) -> RefreshOutcome {
    {
        let mut inner = shared.inner.lock().await;
        if inner.epoch != epoch {
            return match inner.credential.as_ref() {
                Some(current) => Ok(current.access_token.clone()),
                None => Err(AuthError::LoginRequired),
            };
        }
        inner.credential = None;
        inner.phase = Phase::Idle;
        inner.stale = false;
        inner.epoch += 1;
        shared.set_state(AuthState::Unauthenticated);
    }

    shared.clear_vault().await;
    warn!(%session_id, %reason, "Refresh token rejected, session invalidated");
    shared.emit(SessionEvent::Invalidated { session_id, reason });
    Err(AuthError::SessionInvalid)
}
