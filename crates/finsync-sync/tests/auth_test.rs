use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use finsync_core::{AccessToken, AuthState, SessionEvent, TokenGrant};
use finsync_db::{Database, DbConfig};
use finsync_sync::{
    AuthClient, AuthError, CredentialVault, MemoryVault, RefreshError, TokenManager,
    TokenManagerSettings, TokenStore,
};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::Semaphore;

/// Scripted auth server.
#[derive(Default)]
struct FakeAuth {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<TokenGrant, RefreshError>>>,
    delay: Duration,
    /// When set, every refresh waits for a permit.
    gate: Option<Arc<Semaphore>>,
}

impl FakeAuth {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn then(self, result: Result<TokenGrant, RefreshError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthClient for FakeAuth {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        assert_eq!(refresh_token, "refresh-token");
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(gate) = &self.gate {
            let _ = gate.acquire().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(TokenGrant::new(format!("access-{}", n)).with_expires_in(3600)))
    }
}

fn expired_grant() -> TokenGrant {
    TokenGrant::new("expired")
        .with_refresh_token("refresh-token")
        .with_expires_in(0)
}

fn fresh_grant() -> TokenGrant {
    TokenGrant::new("fresh")
        .with_refresh_token("refresh-token")
        .with_expires_in(3600)
}

fn manager(auth: Arc<FakeAuth>, vault: Arc<MemoryVault>) -> TokenManager {
    TokenManager::new(auth, TokenStore::new(vault), TokenManagerSettings::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_refresh() {
    let auth = Arc::new(FakeAuth::new().with_delay(Duration::from_millis(50)));
    let tokens = manager(auth.clone(), Arc::new(MemoryVault::new()));
    tokens.sign_in(expired_grant()).await;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let tokens = tokens.clone();
            tokio::spawn(async move { tokens.current_token().await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(auth.calls(), 1);
    assert!(results.iter().all(|t| t.as_str() == "access-1"));
    assert_eq!(tokens.state(), AuthState::Authenticated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejected_refresh_fans_out_and_clears_session() {
    let auth = Arc::new(
        FakeAuth::new()
            .with_delay(Duration::from_millis(50))
            .then(Err(RefreshError::Rejected("revoked".into()))),
    );
    let vault = Arc::new(MemoryVault::new());
    let tokens = manager(auth.clone(), vault.clone());
    let mut events = tokens.subscribe_events();
    let session_id = tokens.sign_in(expired_grant()).await;
    assert!(vault.load().await.unwrap().is_some());

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let tokens = tokens.clone();
            tokio::spawn(async move { tokens.current_token().await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Err(AuthError::SessionInvalid));
    }

    assert_eq!(auth.calls(), 1);
    assert_eq!(tokens.state(), AuthState::Unauthenticated);
    assert!(vault.load().await.unwrap().is_none());

    assert_eq!(tokens.current_token().await, Err(AuthError::LoginRequired));
    assert_eq!(auth.calls(), 1);

    assert!(matches!(events.try_recv(), Ok(SessionEvent::SignedIn { .. })));
    match events.try_recv() {
        Ok(SessionEvent::Invalidated { session_id: id, reason }) => {
            assert_eq!(id, session_id);
            assert!(reason.contains("revoked"));
        }
        other => panic!("expected Invalidated, got {:?}", other),
    }
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_transient_failure_allows_a_later_refresh() {
    let auth = Arc::new(FakeAuth::new().then(Err(RefreshError::Transient("503".into()))));
    let tokens = manager(auth.clone(), Arc::new(MemoryVault::new()));
    tokens.sign_in(expired_grant()).await;

    let err = tokens.current_token().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(tokens.state(), AuthState::Authenticated);

    let token = tokens.current_token().await.unwrap();
    assert_eq!(token.as_str(), "access-2");
    assert_eq!(auth.calls(), 2);
}

#[tokio::test]
async fn test_refresh_timeout_is_retryable() {
    let auth = Arc::new(FakeAuth::new().with_delay(Duration::from_secs(30)));
    let settings = TokenManagerSettings {
        refresh_timeout: Duration::from_millis(50),
        ..TokenManagerSettings::default()
    };
    let tokens = TokenManager::new(auth.clone(), TokenStore::in_memory(), settings);
    tokens.sign_in(expired_grant()).await;

    let err = tokens.current_token().await.unwrap_err();
    assert!(matches!(err, AuthError::Retryable(ref reason) if reason.contains("timed out")));
    assert_eq!(tokens.state(), AuthState::Authenticated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redundant_unauthorized_reports_refresh_once() {
    let gate = Arc::new(Semaphore::new(0));
    let auth = Arc::new(FakeAuth::new().with_gate(gate.clone()));
    let tokens = manager(auth.clone(), Arc::new(MemoryVault::new()));
    tokens.sign_in(fresh_grant()).await;
    let rejected = tokens.current_token().await.unwrap();
    assert_eq!(rejected.as_str(), "fresh");

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let tokens = tokens.clone();
            let rejected = rejected.clone();
            tokio::spawn(async move { tokens.report_unauthorized(&rejected).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tokens.state(), AuthState::Refreshing);
    gate.add_permits(1);

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().as_str(), "access-1");
    }

    // A late report carrying the old token gets the new one, no refresh.
    let late = tokens.report_unauthorized(&rejected).await.unwrap();
    assert_eq!(late.as_str(), "access-1");
    assert_eq!(auth.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_waiter_does_not_affect_others() {
    let gate = Arc::new(Semaphore::new(0));
    let auth = Arc::new(FakeAuth::new().with_gate(gate.clone()));
    let tokens = manager(auth.clone(), Arc::new(MemoryVault::new()));
    tokens.sign_in(expired_grant()).await;

    // The initiating caller gives up.
    let initiator = tokio::time::timeout(Duration::from_millis(20), tokens.current_token()).await;
    assert!(initiator.is_err());

    let waiter = {
        let tokens = tokens.clone();
        tokio::spawn(async move { tokens.current_token().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.add_permits(1);

    assert_eq!(waiter.await.unwrap().unwrap().as_str(), "access-1");
    assert_eq!(auth.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sign_out_during_refresh_discards_result() {
    let gate = Arc::new(Semaphore::new(0));
    let auth = Arc::new(FakeAuth::new().with_gate(gate.clone()));
    let vault = Arc::new(MemoryVault::new());
    let tokens = manager(auth.clone(), vault.clone());
    tokens.sign_in(expired_grant()).await;

    let waiter = {
        let tokens = tokens.clone();
        tokio::spawn(async move { tokens.current_token().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(tokens.sign_out().await.is_some());
    gate.add_permits(1);

    assert_eq!(waiter.await.unwrap(), Err(AuthError::LoginRequired));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(tokens.state(), AuthState::Unauthenticated);
    assert!(vault.load().await.unwrap().is_none());
}

#[tokio::test]
async fn test_far_future_expiry_neither_panics_nor_strands_waiters() {
    let auth = Arc::new(
        FakeAuth::new().then(Ok(TokenGrant::new("long-lived").with_expires_in(i64::MAX / 1000))),
    );
    let vault = Arc::new(MemoryVault::new());
    let tokens = manager(auth.clone(), vault.clone());

    let signer = tokens.clone();
    tokio::spawn(async move {
        signer
            .sign_in(
                TokenGrant::new("login")
                    .with_refresh_token("refresh-token")
                    .with_expires_in(i64::MAX / 1000),
            )
            .await
    })
    .await
    .unwrap();
    assert_eq!(tokens.current_token().await.unwrap().as_str(), "login");
    assert_eq!(auth.calls(), 0);

    // A server-side rejection forces a refresh whose grant is just as huge.
    let fresh = tokens
        .report_unauthorized(&AccessToken::new("login"))
        .await
        .unwrap();
    assert_eq!(fresh.as_str(), "long-lived");
    assert_eq!(tokens.state(), AuthState::Authenticated);
    assert_eq!(auth.calls(), 1);

    let persisted = vault.load().await.unwrap().unwrap();
    assert_eq!(persisted.access_token.as_str(), "long-lived");
    assert!(persisted.remaining_secs(chrono::Utc::now()) > 0);
}

#[tokio::test]
async fn test_state_watch_follows_transitions() {
    let auth = Arc::new(FakeAuth::new());
    let tokens = manager(auth, Arc::new(MemoryVault::new()));
    let mut state = tokens.subscribe_state();
    assert_eq!(*state.borrow(), AuthState::Unauthenticated);

    tokens.sign_in(fresh_grant()).await;
    state.changed().await.unwrap();
    assert_eq!(*state.borrow_and_update(), AuthState::Authenticated);

    tokens.sign_out().await;
    state.changed().await.unwrap();
    assert_eq!(*state.borrow_and_update(), AuthState::Unauthenticated);
}

#[tokio::test]
async fn test_restore_from_sqlite_vault() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();

    let first = TokenManager::new(
        Arc::new(FakeAuth::new()),
        TokenStore::sqlite(&db),
        TokenManagerSettings::default(),
    );
    let session_id = first.sign_in(fresh_grant()).await;

    let second = TokenManager::new(
        Arc::new(FakeAuth::new()),
        TokenStore::sqlite(&db),
        TokenManagerSettings::default(),
    );
    assert_eq!(second.state(), AuthState::Unauthenticated);
    assert!(second.restore().await.unwrap());
    assert_eq!(second.state(), AuthState::Authenticated);
    assert_eq!(second.current_token().await.unwrap(), AccessToken::new("fresh"));
    assert_eq!(second.credential().await.unwrap().session_id, session_id);

    first.sign_out().await;
    let third = TokenManager::new(
        Arc::new(FakeAuth::new()),
        TokenStore::sqlite(&db),
        TokenManagerSettings::default(),
    );
    assert!(!third.restore().await.unwrap());
}
