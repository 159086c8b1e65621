use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use finsync_core::{AuthState, Entity, PrimaryKey, TokenGrant};
use finsync_db::{Database, DbConfig};
use finsync_sync::{
    ApiRequest, ApiTransport, AuthClient, AuthError, Authority, ClientConfig, CollectionSync,
    FinsyncClient, HttpError, JsonBatchDecoder, RawResponse, Reconciler, RefreshError,
    RelationshipLinker, RetryPolicy, SyncError, TokenManager, TokenManagerSettings, TokenStore,
};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Bill {
    id: i64,
    amount_cents: i64,
}

impl Entity for Bill {
    const ENTITY_TYPE: &'static str = "bill";

    fn primary_key(&self) -> PrimaryKey {
        self.id
    }
}

#[derive(Default)]
struct FakeTransport {
    responses: Mutex<VecDeque<Result<RawResponse, HttpError>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl FakeTransport {
    fn respond(self, response: Result<RawResponse, HttpError>) -> Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    fn bearers(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.bearer.as_ref().map(|t| t.as_str().to_string()).unwrap_or_default())
            .collect()
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.as_ref().map(|u| u.to_string()).unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl ApiTransport for FakeTransport {
    async fn send(&self, request: ApiRequest) -> Result<RawResponse, HttpError> {
        self.requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(RawResponse::new(404, "no scripted response")))
    }
}

#[derive(Default)]
struct FakeAuth {
    calls: AtomicUsize,
}

#[async_trait]
impl AuthClient for FakeAuth {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenGrant::new(format!("access-{}", n)).with_expires_in(3600))
    }
}

fn bills_body() -> RawResponse {
    RawResponse::json(&json!([
        {"id": 1, "amount_cents": 100},
        {"id": 2, "amount_cents": 200},
    ]))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(50),
        max_elapsed: Some(Duration::from_secs(2)),
    }
}

struct Harness {
    db: Database,
    transport: Arc<FakeTransport>,
    auth: Arc<FakeAuth>,
    sync: CollectionSync,
}

async fn harness(transport: FakeTransport, signed_in: bool) -> Harness {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let transport = Arc::new(transport);
    let auth = Arc::new(FakeAuth::default());

    let tokens = TokenManager::new(
        auth.clone(),
        TokenStore::in_memory(),
        TokenManagerSettings::default(),
    );
    if signed_in {
        tokens
            .sign_in(
                TokenGrant::new("login")
                    .with_refresh_token("refresh")
                    .with_expires_in(3600),
            )
            .await;
    }

    let sync = CollectionSync::new(
        Url::parse("https://api.example.com/v1/").unwrap(),
        transport.clone(),
        Arc::new(JsonBatchDecoder::new()),
        tokens,
        Reconciler::new(db.clone(), Arc::new(RelationshipLinker::new())),
        fast_retry(),
    );

    Harness {
        db,
        transport,
        auth,
        sync,
    }
}

#[tokio::test]
async fn test_fetch_and_reconcile() {
    let h = harness(FakeTransport::default().respond(Ok(bills_body())), true).await;

    let report = h
        .sync
        .fetch_and_reconcile::<Bill>(
            ApiRequest::get("/bills").query("status", "unpaid"),
            Authority::Complete,
        )
        .await
        .unwrap();

    assert_eq!(report.inserted, vec![1, 2]);
    assert_eq!(h.transport.bearers(), vec!["login"]);
    assert_eq!(
        h.transport.urls(),
        vec!["https://api.example.com/v1/bills?status=unpaid"]
    );
    assert_eq!(h.db.store::<Bill>().get(2).await.unwrap().unwrap().amount_cents, 200);
}

#[tokio::test]
async fn test_unauthorized_refreshes_and_retries_once() {
    let transport = FakeTransport::default()
        .respond(Ok(RawResponse::new(401, "token expired")))
        .respond(Ok(bills_body()));
    let h = harness(transport, true).await;

    let report = h
        .sync
        .fetch_and_reconcile::<Bill>(ApiRequest::get("bills"), Authority::Partial)
        .await
        .unwrap();

    assert_eq!(report.inserted_count(), 2);
    assert_eq!(h.transport.bearers(), vec!["login", "access-1"]);
    assert_eq!(h.auth.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_second_unauthorized_is_returned() {
    let transport = FakeTransport::default()
        .respond(Err(HttpError::Unauthorized))
        .respond(Err(HttpError::Unauthorized));
    let h = harness(transport, true).await;

    let err = h
        .sync
        .fetch_and_reconcile::<Bill>(ApiRequest::get("bills"), Authority::Partial)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Http(HttpError::Unauthorized)));
    assert_eq!(h.transport.calls(), 2);
    assert_eq!(h.auth.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_errors_are_retried_with_backoff() {
    let transport = FakeTransport::default()
        .respond(Ok(RawResponse::new(503, "maintenance")))
        .respond(Err(HttpError::Timeout))
        .respond(Ok(bills_body()));
    let h = harness(transport, true).await;

    let report = h
        .sync
        .fetch_and_reconcile::<Bill>(ApiRequest::get("bills"), Authority::Complete)
        .await
        .unwrap();

    assert_eq!(report.inserted_count(), 2);
    assert_eq!(h.transport.calls(), 3);
}

#[tokio::test]
async fn test_permanent_failures_are_not_retried() {
    let transport = FakeTransport::default().respond(Ok(RawResponse::new(200, "<html>oops</html>")));
    let h = harness(transport, true).await;

    let err = h
        .sync
        .fetch_and_reconcile::<Bill>(ApiRequest::get("bills"), Authority::Complete)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Decode(_)));
    assert_eq!(h.transport.calls(), 1);

    let transport = FakeTransport::default().respond(Ok(RawResponse::new(404, "gone")));
    let h = harness(transport, true).await;
    let err = h
        .sync
        .fetch_and_reconcile::<Bill>(ApiRequest::get("bills"), Authority::Complete)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Http(HttpError::NotFound(_))));
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn test_signed_out_fetch_requires_login() {
    let h = harness(FakeTransport::default(), false).await;

    let err = h
        .sync
        .fetch_and_reconcile::<Bill>(ApiRequest::get("bills"), Authority::Complete)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Auth(AuthError::LoginRequired)));
    assert_eq!(h.transport.calls(), 0);
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("finsync.toml");

    let mut config = ClientConfig::default();
    config.api.base_url = "https://api.example.com/v1/".to_string();
    config.auth.refresh_margin_secs = 120;
    config.storage.in_memory = true;
    config.save(Some(path.clone())).unwrap();

    let loaded = ClientConfig::load(Some(path.clone())).unwrap();
    assert_eq!(loaded.api.base_url, "https://api.example.com/v1/");
    assert_eq!(loaded.auth.refresh_margin_secs, 120);
    assert_eq!(loaded.token_settings().refresh_margin, chrono::Duration::seconds(120));

    std::fs::write(&path, "[api]\nbase_url = \"ftp://nope\"\n").unwrap();
    let err = ClientConfig::load(Some(path.clone())).unwrap_err();
    assert!(err.is_config_error());
    assert!(ClientConfig::load_or_default(Some(path)).validate().is_ok());
}

#[tokio::test]
async fn test_client_builder_wires_everything() {
    let mut config = ClientConfig::default();
    config.api.base_url = "https://bank.example.com/api/".to_string();
    config.storage.in_memory = true;
    config.retry.initial_backoff_ms = 10;

    let transport = Arc::new(FakeTransport::default().respond(Ok(bills_body())));
    let client = FinsyncClient::builder(config)
        .with_transport(transport.clone())
        .with_auth_client(Arc::new(FakeAuth::default()))
        .build()
        .await
        .unwrap();

    assert_eq!(client.status().await.auth_state, AuthState::Unauthenticated);

    client
        .sign_in(
            TokenGrant::new("login")
                .with_refresh_token("refresh")
                .with_expires_in(3600),
        )
        .await;
    let report = client
        .fetch_and_reconcile::<Bill>(ApiRequest::get("bills"), Authority::Complete)
        .await
        .unwrap();
    assert_eq!(report.inserted_count(), 2);
    assert_eq!(transport.urls(), vec!["https://bank.example.com/api/bills"]);

    let status = client.status().await;
    assert_eq!(status.auth_state, AuthState::Authenticated);
    assert!(status.database_healthy);
    assert_eq!(client.store::<Bill>().count(&Default::default()).await.unwrap(), 2);

    let err = FinsyncClient::builder(ClientConfig::default())
        .with_auth_client(Arc::new(FakeAuth::default()))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidConfig(_)));
}
