use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{AgoraClientConfig, AgoraError};

pub const REQUEST_ID_HEADER: &str = "x-agora-request-id";
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

const TEMPORARY_ID_PREFIX: &str = "temp-";
const GENERIC_FAILURE_DETAIL: &str = "request failed";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static TEMPORARY_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

pub fn new_request_id() -> String {
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("agora-rs-{}-{count}", current_unix_timestamp_ms())
}

/// Identifier for an optimistic placeholder that the server has not assigned yet.
pub fn temporary_id() -> String {
    let count = TEMPORARY_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "{TEMPORARY_ID_PREFIX}{}-{count}",
        current_unix_timestamp_ms()
    )
}

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMPORARY_ID_PREFIX)
}

/// Best-effort human readable detail from an error response body.
///
/// Understands `{"detail": "..."}`, `{"detail": {"detail": "..."}}` and
/// validation lists `{"detail": [{"msg": "..."}]}`. Anything else falls back
/// to the status text.
pub fn extract_error_detail(status: StatusCode, raw: &str) -> String {
    let fallback = || {
        status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{GENERIC_FAILURE_DETAIL} with status {}", status.as_u16()))
    };
    let Ok(body) = serde_json::from_str::<Value>(raw) else {
        return fallback();
    };

    match body.get("detail") {
        Some(Value::String(detail)) if !detail.trim().is_empty() => detail.clone(),
        Some(Value::Object(nested)) => nested
            .get("detail")
            .and_then(Value::as_str)
            .filter(|detail| !detail.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(fallback),
        Some(Value::Array(items)) => {
            let messages = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(Value::as_str))
                .collect::<Vec<_>>();
            if messages.is_empty() {
                fallback()
            } else {
                messages.join("; ")
            }
        }
        _ => fallback(),
    }
}

pub(crate) fn transport_error(error: reqwest::Error, endpoint: &str, timeout_ms: u64) -> AgoraError {
    if error.is_timeout() {
        return AgoraError::DeadlineExceeded {
            endpoint: endpoint.to_string(),
            timeout_ms,
        };
    }
    AgoraError::Http(error)
}

pub(crate) fn decode_body<T: DeserializeOwned>(raw: &str) -> Result<T, AgoraError> {
    serde_json::from_str(raw)
        .map_err(|error| AgoraError::InvalidResponse(format!("unexpected response body: {error}")))
}

#[derive(Debug, Clone)]
/// Shared reqwest client carrying auth headers and timeout policy.
pub(crate) struct HttpCore {
    client: reqwest::Client,
    config: AgoraClientConfig,
}

impl HttpCore {
    pub(crate) fn new(config: AgoraClientConfig) -> Result<Self, AgoraError> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = config.effective_bearer_token() {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|error| {
                AgoraError::InvalidConfig(format!("invalid bearer token header: {error}"))
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self { client, config })
    }

    pub(crate) fn config(&self) -> &AgoraClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_base.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AgoraError> {
        let raw = self
            .execute::<Value>(Method::GET, path, None, self.config.request_timeout_ms)
            .await?;
        decode_body(&raw)
    }

    pub(crate) async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AgoraError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post_json_with_timeout(path, body, self.config.request_timeout_ms)
            .await
    }

    pub(crate) async fn post_json_with_timeout<B, T>(
        &self,
        path: &str,
        body: &B,
        timeout_ms: u64,
    ) -> Result<T, AgoraError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let raw = self
            .execute(Method::POST, path, Some(body), timeout_ms)
            .await?;
        decode_body(&raw)
    }

    pub(crate) async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T, AgoraError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let raw = self
            .execute(
                Method::PATCH,
                path,
                Some(body),
                self.config.request_timeout_ms,
            )
            .await?;
        decode_body(&raw)
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<(), AgoraError> {
        self.execute::<Value>(Method::DELETE, path, None, self.config.request_timeout_ms)
            .await?;
        Ok(())
    }

    async fn execute<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout_ms: u64,
    ) -> Result<String, AgoraError>
    where
        B: Serialize + ?Sized,
    {
        let request_id = new_request_id();
        let mut builder = self
            .client
            .request(method.clone(), self.url(path))
            .header(REQUEST_ID_HEADER, request_id.as_str())
            .timeout(Duration::from_millis(timeout_ms.max(1)));
        if let Some(body) = body {
            builder = builder.json(body);
        }

        tracing::debug!(request_id = %request_id, method = %method, path, "sending agora request");
        let response = builder
            .send()
            .await
            .map_err(|error| transport_error(error, path, timeout_ms))?;
        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|error| transport_error(error, path, timeout_ms))?;

        if !status.is_success() {
            let detail = extract_error_detail(status, &raw);
            tracing::debug!(
                request_id = %request_id,
                status = status.as_u16(),
                path,
                detail = %detail,
                "agora request rejected"
            );
            return Err(AgoraError::HttpStatus {
                status: status.as_u16(),
                detail,
            });
        }

        Ok(raw)
    }

    /// Opens a streaming POST. The stream deadline covers connecting and the
    /// whole body, so body reads can also fail with `DeadlineExceeded`.
    pub(crate) async fn open_stream<B>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, AgoraError>
    where
        B: Serialize + ?Sized,
    {
        let timeout_ms = self.config.stream_timeout_ms;
        let request_id = new_request_id();
        tracing::debug!(request_id = %request_id, path, timeout_ms, "opening turn stream");

        let response = self
            .client
            .post(self.url(path))
            .header(ACCEPT, EVENT_STREAM_CONTENT_TYPE)
            .header(REQUEST_ID_HEADER, request_id.as_str())
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .json(body)
            .send()
            .await
            .map_err(|error| transport_error(error, path, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            return Err(AgoraError::HttpStatus {
                status: status.as_u16(),
                detail: extract_error_detail(status, &raw),
            });
        }

        Ok(response)
    }
}
