//! # Transport and Decoding Seams
//!
//! The data layer never performs HTTP itself. Hosts plug in an
//! [`ApiTransport`] and, where the wire format is not a plain JSON array, a
//! [`BatchDecoder`].
//!
//! ```text
//! ApiRequest { path, query, url, bearer }
//!     │
//!     ▼  ApiTransport::send
//! RawResponse { status, body }
//!     │
//!     ▼  BatchDecoder::decode_batch
//! DecodedBatch { records: [Value], errors: [DecodeError] }
//!     │
//!     ▼
//! Reconciler
//! ```

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use finsync_core::{AccessToken, DecodeError};

use crate::error::{HttpError, SyncError, SyncResult};

// =============================================================================
// Request / Response
// =============================================================================

/// An outbound GET against the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// Path relative to the configured base URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Absolute URL of `path` and `query` under the configured base.
    /// Set by the sync driver just before sending.
    pub url: Option<Url>,
    /// Set by the sync driver just before sending.
    pub bearer: Option<AccessToken>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        ApiRequest {
            path: path.into(),
            query: Vec::new(),
            url: None,
            bearer: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_bearer(mut self, token: AccessToken) -> Self {
        self.bearer = Some(token);
        self
    }

    /// Resolves the request against `base`.
    ///
    /// `base` should end with a slash for its last path segment to be kept.
    pub fn url(&self, base: &Url) -> SyncResult<Url> {
        let mut url = base.join(self.path.trim_start_matches('/'))?;
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }

    /// Fills in [`url`](Self::url) from `base`.
    pub fn resolve(mut self, base: &Url) -> SyncResult<Self> {
        self.url = Some(self.url(base)?);
        Ok(self)
    }
}

/// A response as received, any status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        RawResponse {
            status,
            body: body.into(),
        }
    }

    /// A 200 response carrying `value`.
    pub fn json(value: &Value) -> Self {
        RawResponse::new(200, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Converts a non-success status into an [`HttpError`].
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HttpError::from_status(self.status, &self.text()))
        }
    }
}

// =============================================================================
// Seams
// =============================================================================

/// Sends API requests. Implemented by the host.
///
/// Requests arrive with [`ApiRequest::url`] already resolved against the
/// configured base URL.
///
/// Non-success statuses may be returned either as a `RawResponse` or as an
/// `HttpError`; `401` must be distinguishable as [`HttpError::Unauthorized`]
/// after [`RawResponse::error_for_status`].
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<RawResponse, HttpError>;
}

/// Records decoded from one response.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub records: Vec<Value>,
    pub errors: Vec<DecodeError>,
}

/// Turns a response body into records.
///
/// A failure to read the body at all is an error; a bad element is
/// reported in `errors` and the rest are kept.
pub trait BatchDecoder: Send + Sync {
    fn decode_batch(&self, response: &RawResponse) -> SyncResult<DecodedBatch>;
}

/// Decodes a JSON array, either at the top level or under an envelope key.
///
/// ```text
/// [ {...}, {...} ]                  JsonBatchDecoder::new()
/// { "data": [ {...}, {...} ] }      JsonBatchDecoder::with_envelope("data")
/// ```
#[derive(Debug, Clone, Default)]
pub struct JsonBatchDecoder {
    envelope: Option<String>,
}

impl JsonBatchDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_envelope(key: impl Into<String>) -> Self {
        JsonBatchDecoder {
            envelope: Some(key.into()),
        }
    }
}

impl BatchDecoder for JsonBatchDecoder {
    fn decode_batch(&self, response: &RawResponse) -> SyncResult<DecodedBatch> {
        let root: Value = serde_json::from_slice(&response.body)
            .map_err(|e| SyncError::Decode(format!("Body is not JSON: {}", e)))?;

        let items = match (&self.envelope, root) {
            (None, Value::Array(items)) => items,
            (Some(key), Value::Object(mut map)) => match map.remove(key.as_str()) {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(SyncError::Decode(format!(
                        "Envelope key '{}' holds {}, expected an array",
                        key,
                        kind(&other)
                    )))
                }
                None => {
                    return Err(SyncError::Decode(format!(
                        "Envelope key '{}' missing",
                        key
                    )))
                }
            },
            (_, other) => {
                return Err(SyncError::Decode(format!(
                    "Unexpected top-level {}",
                    kind(&other)
                )))
            }
        };

        let mut batch = DecodedBatch::default();
        for (index, item) in items.into_iter().enumerate() {
            match item {
                Value::Object(_) => batch.records.push(item),
                other => batch.errors.push(DecodeError::new(
                    index,
                    format!("expected an object, got {}", kind(&other)),
                )),
            }
        }
        Ok(batch)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_url() {
        let base = Url::parse("https://api.example.com/v2/").unwrap();
        let request = ApiRequest::get("/bills").query("status", "unpaid");

        assert_eq!(
            request.url(&base).unwrap().as_str(),
            "https://api.example.com/v2/bills?status=unpaid"
        );

        let resolved = request.resolve(&base).unwrap();
        assert_eq!(
            resolved.url.map(String::from).as_deref(),
            Some("https://api.example.com/v2/bills?status=unpaid")
        );
    }

    #[test]
    fn test_error_for_status() {
        let response = RawResponse::new(401, "expired");
        assert_eq!(response.error_for_status(), Err(HttpError::Unauthorized));

        let response = RawResponse::new(204, "");
        assert!(response.error_for_status().is_ok());
    }

    #[test]
    fn test_decode_top_level_array() {
        let response = RawResponse::json(&json!([{"id": 1}, 7, {"id": 2}, null]));
        let batch = JsonBatchDecoder::new().decode_batch(&response).unwrap();

        assert_eq!(batch.records, vec![json!({"id": 1}), json!({"id": 2})]);
        let indexes: Vec<usize> = batch.errors.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![1, 3]);
    }

    #[test]
    fn test_decode_envelope() {
        let response = RawResponse::json(&json!({"data": [{"id": 1}], "next": null}));
        let batch = JsonBatchDecoder::with_envelope("data")
            .decode_batch(&response)
            .unwrap();
        assert_eq!(batch.records.len(), 1);

        let err = JsonBatchDecoder::with_envelope("items")
            .decode_batch(&response)
            .unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_garbage_body() {
        let response = RawResponse::new(200, "<html>");
        let err = JsonBatchDecoder::new().decode_batch(&response).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }
}
