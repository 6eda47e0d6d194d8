//! Engine configuration

use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1/mini-assistant";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings shared by the HTTP clients.
///
/// `request_timeout` bounds log-store and tool calls. The streaming
/// completion client only uses it as a connect timeout: an open stream has
/// no deadline, the user stops it manually.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

impl EngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            api_token: None,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Read configuration from the environment.
    ///
    /// `DRISTHI_API_URL`, `DRISTHI_API_TOKEN` and
    /// `DRISTHI_REQUEST_TIMEOUT_SECS` are honored; anything unset falls back
    /// to local-development defaults.
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("DRISTHI_API_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let api_token = std::env::var("DRISTHI_API_TOKEN").ok().filter(|t| !t.is_empty());
        let request_timeout = std::env::var("DRISTHI_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs);

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            request_timeout,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}
