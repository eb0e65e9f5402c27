use crate::AgoraError;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_STREAM_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Connection settings shared by the REST client, turn transport and poller.
pub struct AgoraClientConfig {
    pub api_base: String,
    pub bearer_token: Option<String>,
    /// Bounds every non-streaming request.
    pub request_timeout_ms: u64,
    /// Deadline for one streaming attempt and for its synchronous fallback.
    pub stream_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl AgoraClientConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            bearer_token: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            stream_timeout_ms: DEFAULT_STREAM_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_stream_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.stream_timeout_ms = timeout_ms;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn validate(&self) -> Result<(), AgoraError> {
        let base = self.api_base.trim();
        if base.is_empty() {
            return Err(AgoraError::InvalidConfig(
                "api base URL must not be empty".to_string(),
            ));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(AgoraError::InvalidConfig(format!(
                "api base URL '{base}' must start with http:// or https://"
            )));
        }
        Ok(())
    }

    /// Token with surrounding whitespace removed; blank tokens count as absent.
    pub fn effective_bearer_token(&self) -> Option<&str> {
        self.bearer_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

impl Default for AgoraClientConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:8000")
    }
}
