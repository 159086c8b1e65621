//! # Collection Sync
//!
//! Fetches one collection from the API and reconciles it into the store.
//!
//! ## Attempt Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  fetch_and_reconcile::<Bill>(request, authority)                        │
//! │                                                                         │
//! │  ┌── attempt ────────────────────────────────────────────────────────┐  │
//! │  │  resolve request against base_url, token = current_token()        │  │
//! │  │  send(request + bearer) ── 401 ──► report_unauthorized(token)     │  │
//! │  │        │                           send once more (401 → error)   │  │
//! │  │        ▼                                                          │  │
//! │  │  decode_batch ──► reconcile_with::<Bill>(batch, authority)        │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! │        │                                                                │
//! │        ▼  error.is_retryable()?                                         │
//! │     yes → exponential backoff, next attempt                             │
//! │     no  → return the error                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use tracing::{debug, warn};
use url::Url;

use finsync_core::{AccessToken, Entity, ReconcileReport};

use crate::auth::TokenManager;
use crate::error::{HttpError, SyncResult};
use crate::reconcile::{Authority, Reconciler, RemoteBatch};
use crate::transport::{ApiRequest, ApiTransport, BatchDecoder, RawResponse};

/// Backoff limits for retryable failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// `None` retries until success or a permanent error.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: 2.0,
            max_elapsed_time: self.max_elapsed,
            ..Default::default()
        }
    }
}

/// Drives fetch-and-reconcile for any entity type.
#[derive(Clone)]
pub struct CollectionSync {
    base_url: Url,
    transport: Arc<dyn ApiTransport>,
    decoder: Arc<dyn BatchDecoder>,
    tokens: TokenManager,
    reconciler: Reconciler,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CollectionSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionSync")
            .field("base_url", &self.base_url.as_str())
            .field("tokens", &self.tokens)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl CollectionSync {
    pub fn new(
        base_url: Url,
        transport: Arc<dyn ApiTransport>,
        decoder: Arc<dyn BatchDecoder>,
        tokens: TokenManager,
        reconciler: Reconciler,
        retry: RetryPolicy,
    ) -> Self {
        CollectionSync {
            base_url,
            transport,
            decoder,
            tokens,
            reconciler,
            retry,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Fetches `request` and reconciles the response as `T`.
    ///
    /// Retryable failures are retried with exponential backoff; the last
    /// error is returned once the policy gives up.
    pub async fn fetch_and_reconcile<T: Entity>(
        &self,
        request: ApiRequest,
        authority: Authority,
    ) -> SyncResult<ReconcileReport> {
        let this = self;
        let operation = move || {
            let request = request.clone();
            let authority = authority.clone();
            async move {
                this.attempt::<T>(request, authority).await.map_err(|e| {
                    if e.is_retryable() {
                        warn!(entity_type = T::ENTITY_TYPE, error = %e, "Fetch failed, backing off");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        };

        backoff::future::retry(self.retry.backoff(), operation).await
    }

    async fn attempt<T: Entity>(
        &self,
        request: ApiRequest,
        authority: Authority,
    ) -> SyncResult<ReconcileReport> {
        let request = request.resolve(&self.base_url)?;
        let token = self.tokens.current_token().await?;

        let response = match self.send(request.clone(), &token).await {
            Err(HttpError::Unauthorized) => {
                debug!(path = %request.path, "Request unauthorized, refreshing token");
                let fresh = self.tokens.report_unauthorized(&token).await?;
                self.send(request, &fresh).await?
            }
            other => other?,
        };

        let decoded = self.decoder.decode_batch(&response)?;
        self.reconciler
            .reconcile_with::<T>(RemoteBatch::from(decoded), authority)
            .await
    }

    async fn send(&self, request: ApiRequest, token: &AccessToken) -> Result<RawResponse, HttpError> {
        let response = self
            .transport
            .send(request.with_bearer(token.clone()))
            .await?;
        response.error_for_status()
    }
}
