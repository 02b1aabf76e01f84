//! OpenAI-compatible backend client.
//!
//! Sends stateless chat completions and stateful responses requests to a
//! local LLM endpoint, lists the backend's models, and runs every call
//! through the endpoint's circuit breaker and the retry policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Serialize;

use super::errors::GatewayError;
use super::parse::{parse_chat_completion, parse_models, parse_responses};
use super::resilience::{run_with_resilience, BreakerRegistry, RetryPolicy, SharedClock};
use super::types::{BackendResponse, ChatCompletionRequest, ResponsesRequest};
use crate::config::RelayConfig;
use crate::models::types::ModelRecord;
use crate::models::ModelSource;

/// The two completion call shapes the engine drives.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Full history in, one turn out.
    async fn complete_stateless(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<BackendResponse, GatewayError>;

    /// New input plus a continuation token in, one turn and a new token out.
    async fn complete_stateful(
        &self,
        request: &ResponsesRequest,
    ) -> Result<BackendResponse, GatewayError>;
}

/// Request timeout actually applied: the configured value, but never more
/// than 90% of the hard ceiling so the caller sees a typed timeout before
/// the host kills the invocation.
pub fn effective_request_timeout(configured: Duration, hard_ceiling: Duration) -> Duration {
    configured.min(call_budget(hard_ceiling))
}

/// Time one gateway call may take across all of its retries.
pub fn call_budget(hard_ceiling: Duration) -> Duration {
    hard_ceiling.mul_f64(0.9)
}

// ─── GatewayClient ───────────────────────────────────────────────────────────

/// Client for the backend's HTTP API.
pub struct GatewayClient {
    http: HttpClient,
    base_url: String,
    models_path: String,
    api_key: Option<String>,
    request_timeout: Duration,
    call_budget: Duration,
    policy: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
    clock: SharedClock,
}

impl GatewayClient {
    /// Build a client from config. Does NOT check connectivity.
    pub fn new(
        config: &RelayConfig,
        breakers: Arc<BreakerRegistry>,
        clock: SharedClock,
    ) -> Result<Self, GatewayError> {
        let backend = &config.backend;
        let request_timeout =
            effective_request_timeout(backend.request_timeout(), backend.hard_ceiling());

        let http = HttpClient::builder()
            .connect_timeout(backend.connect_timeout())
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: backend.base_url.trim_end_matches('/').to_string(),
            models_path: backend.models_path.clone(),
            api_key: backend.api_key.clone().filter(|k| !k.is_empty()),
            request_timeout,
            call_budget: call_budget(backend.hard_ceiling()),
            policy: RetryPolicy::from_config(&config.retry),
            breakers,
            clock,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    // ─── Single Attempts ─────────────────────────────────────────────────

    /// One attempt, never longer than `budget_left`.
    async fn send_once(
        &self,
        url: &str,
        req: reqwest::RequestBuilder,
        budget_left: Duration,
    ) -> Result<String, GatewayError> {
        let timeout = self.request_timeout.min(budget_left);
        let mut req = req.timeout(timeout);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| self.transport_error(url, e, timeout))?;
        self.read_body(url, response, timeout).await
    }

    async fn read_body(
        &self,
        url: &str,
        response: reqwest::Response,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), body, retry_after));
        }
        response
            .text()
            .await
            .map_err(|e| self.transport_error(url, e, timeout))
    }

    fn transport_error(&self, url: &str, e: reqwest::Error, timeout: Duration) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout {
                endpoint: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else if e.is_decode() || e.is_body() {
            GatewayError::Decode {
                reason: e.to_string(),
            }
        } else {
            GatewayError::Connection {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    /// POST with breaker and retries.
    async fn post_resilient<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<String, GatewayError> {
        let url = self.url(path);
        let breaker = self.breakers.get(&url);
        run_with_resilience(&self.policy, &breaker, self.call_budget, |left| {
            self.send_once(&url, self.http.post(&url).json(body), left)
        })
        .await
    }
}

#[async_trait]
impl LlmBackend for GatewayClient {
    async fn complete_stateless(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<BackendResponse, GatewayError> {
        tracing::info!(
            model = %request.model,
            message_count = request.messages.len(),
            tool_count = request.tools.as_ref().map_or(0, Vec::len),
            max_tokens = request.max_tokens,
            "chat completion request"
        );
        let body = self.post_resilient("/chat/completions", request).await?;
        parse_chat_completion(&body)
    }

    async fn complete_stateful(
        &self,
        request: &ResponsesRequest,
    ) -> Result<BackendResponse, GatewayError> {
        tracing::info!(
            model = %request.model,
            has_previous = request.previous_response_id.is_some(),
            tool_count = request.tools.as_ref().map_or(0, Vec::len),
            max_output_tokens = request.max_output_tokens,
            "responses request"
        );
        let body = self.post_resilient("/responses", request).await?;
        parse_responses(&body)
    }
}

#[async_trait]
impl ModelSource for GatewayClient {
    async fn fetch_models(&self) -> Result<Vec<ModelRecord>, GatewayError> {
        let url = self.url(&self.models_path);
        let breaker = self.breakers.get(&url);
        let body = run_with_resilience(&self.policy, &breaker, self.call_budget, |left| {
            self.send_once(&url, self.http.get(&url), left)
        })
        .await?;
        parse_models(&body, self.clock.utc())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::test_support::ManualClock;

    fn client(config: &RelayConfig) -> GatewayClient {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let breakers = Arc::new(BreakerRegistry::new(
            CircuitBreakerConfig::default(),
            Arc::clone(&clock),
        ));
        GatewayClient::new(config, breakers, clock).unwrap()
    }

    #[test]
    fn test_effective_timeout_stays_below_ceiling() {
        let ceiling = Duration::from_secs(100);
        assert_eq!(
            effective_request_timeout(Duration::from_secs(120), ceiling),
            Duration::from_secs(90)
        );
        assert_eq!(
            effective_request_timeout(Duration::from_secs(30), ceiling),
            Duration::from_secs(30)
        );
        assert!(effective_request_timeout(Duration::from_secs(100), ceiling) < ceiling);
    }

    #[test]
    fn test_urls_join_without_double_slash() {
        let mut config = RelayConfig::default();
        config.backend.base_url = "http://localhost:1234/v1/".into();
        let client = client(&config);
        assert_eq!(client.base_url(), "http://localhost:1234/v1");
        assert_eq!(client.url("/models"), "http://localhost:1234/v1/models");
        assert_eq!(client.url("responses"), "http://localhost:1234/v1/responses");
    }

    #[test]
    fn test_request_timeout_clamped_from_config() {
        let mut config = RelayConfig::default();
        config.backend.request_timeout_secs = 600;
        config.backend.hard_ceiling_secs = 60;
        assert_eq!(client(&config).request_timeout(), Duration::from_secs(54));
    }

    #[tokio::test]
    async fn test_silent_backend_gives_up_within_ceiling() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = RelayConfig::default();
        config.backend.base_url = format!("http://{addr}/v1");
        config.backend.hard_ceiling_secs = 1;
        config.retry.max_attempts = 3;
        config.retry.base_delay_ms = 10;
        let started = std::time::Instant::now();

        let err = client(&config).fetch_models().await.unwrap_err();

        assert!(matches!(err, GatewayError::Timeout { .. }), "got {err:?}");
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_call_budget_is_ninety_percent_of_ceiling() {
        assert_eq!(call_budget(Duration::from_secs(300)), Duration::from_secs(270));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient_connection_error() {
        let mut config = RelayConfig::default();
        // Port 9 (discard) on localhost is closed on any sane test host.
        config.backend.base_url = "http://127.0.0.1:9/v1".into();
        config.retry.max_attempts = 1;
        let err = client(&config).fetch_models().await.unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }
}
