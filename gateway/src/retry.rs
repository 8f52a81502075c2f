//! Credential-cycling retry executor for upstream calls.
//!
//! Drives a caller-supplied request builder through the credential pool
//! until a validated response is obtained, applying per-status policies
//! and per-host circuit breaking. Response bodies are buffered before
//! validation so validators never disturb the returned response.

use crate::breaker::{BreakerError, BreakerRegistry};
use crate::errors::GatewayError;
use crate::metrics_defs::{RETRY_EXHAUSTED, UPSTREAM_REQUEST_DURATION};
use crate::utils::key_preview;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;
use shared::{counter, histogram};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use url::Url;

const MAX_BACKOFF_MS: u64 = 5_000;

/// Hands out credentials for retry attempts and takes back invalid ones.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn next_credential(&self) -> Result<String, GatewayError>;
    fn evict(&self, credential: &str);
}

/// One outbound request, fully described. The body is buffered bytes so
/// the same request can be rebuilt for every attempt.
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// A buffered upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Default response validator: a successful JSON response must decode to a
/// non-empty object; non-JSON responses only need a successful status and
/// a body.
pub fn validate_json_response(response: &UpstreamResponse) -> bool {
    if response.is_ok()
        && response
            .content_type()
            .is_some_and(|ct| ct.contains("json"))
    {
        return matches!(response.json(), Some(Value::Object(map)) if !map.is_empty());
    }
    response.is_ok() && !response.body.is_empty()
}

#[derive(Error, Debug)]
enum SendError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

pub struct RetryExecutor {
    client: reqwest::Client,
    breakers: Arc<BreakerRegistry>,
    max_attempts: usize,
    request_timeout: Duration,
}

impl RetryExecutor {
    pub fn new(
        breakers: Arc<BreakerRegistry>,
        max_attempts: usize,
        request_timeout: Duration,
    ) -> Self {
        RetryExecutor {
            client: reqwest::Client::new(),
            breakers,
            max_attempts: max_attempts.max(1),
            request_timeout,
        }
    }

    /// Attempt loop over rotating credentials.
    ///
    /// Per-status policy: 403 evicts the credential, 429 waits linearly,
    /// 5xx waits exponentially; anything else is validated and returned on
    /// success. Transport errors and breaker trips take the exponential
    /// delay and rethrow on the final attempt.
    ///
    /// Returns the first validated response, otherwise the last received
    /// response, otherwise `None`.
    pub async fn execute<B>(
        &self,
        credentials: &dyn CredentialSource,
        build: B,
        validate: &(dyn Fn(&UpstreamResponse) -> bool + Send + Sync),
        request_id: &str,
    ) -> Result<Option<UpstreamResponse>, GatewayError>
    where
        B: Fn(&str) -> OutboundRequest + Send + Sync,
    {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_response: Option<UpstreamResponse> = None;

        for attempt in 0..self.max_attempts {
            // Prefer a credential not yet used in this call. The skip loop
            // is bounded so a pool smaller than the attempt budget reuses
            // credentials instead of spinning.
            let mut credential = credentials.next_credential().await?;
            let mut skips = 0;
            while !tried.insert(credential.clone()) {
                skips += 1;
                if skips >= self.max_attempts {
                    break;
                }
                credential = credentials.next_credential().await?;
            }

            let request = build(&credential);
            let host = request.url.host_str().unwrap_or("upstream").to_string();
            let breaker = self.breakers.breaker(&host);

            match breaker.call(self.send(request)).await {
                Ok(response) => match response.status.as_u16() {
                    403 => {
                        tracing::warn!(
                            request_id,
                            attempt,
                            key = %key_preview(&credential),
                            "upstream rejected credential, rotating"
                        );
                        credentials.evict(&credential);
                        last_response = Some(response);
                    }
                    429 => {
                        let delay = rate_limit_backoff(attempt);
                        tracing::debug!(
                            request_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "upstream rate limited, backing off"
                        );
                        last_response = Some(response);
                        sleep(delay).await;
                    }
                    status if status >= 500 => {
                        let delay = exponential_backoff(attempt);
                        tracing::debug!(
                            request_id,
                            attempt,
                            status,
                            delay_ms = delay.as_millis() as u64,
                            "upstream server error, backing off"
                        );
                        last_response = Some(response);
                        sleep(delay).await;
                    }
                    status => {
                        if validate(&response) {
                            return Ok(Some(response));
                        }
                        tracing::debug!(request_id, attempt, status, "response failed validation");
                        last_response = Some(response);
                    }
                },
                Err(err) => {
                    let gateway_err = match err {
                        BreakerError::Open { retry_after } => {
                            GatewayError::CircuitOpen {
                                host: host.clone(),
                                retry_after,
                            }
                        }
                        BreakerError::Inner(SendError::Timeout) => GatewayError::UpstreamTimeout,
                        BreakerError::Inner(SendError::Transport(message)) => {
                            GatewayError::Internal(message)
                        }
                    };
                    tracing::warn!(
                        request_id,
                        attempt,
                        error = %gateway_err,
                        "upstream attempt failed"
                    );
                    if attempt + 1 == self.max_attempts {
                        return Err(gateway_err);
                    }
                    sleep(exponential_backoff(attempt)).await;
                }
            }
        }

        counter!(RETRY_EXHAUSTED).increment(1);
        tracing::warn!(request_id, attempts = self.max_attempts, "retry budget exhausted");
        Ok(last_response)
    }

    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, SendError> {
        let start = Instant::now();
        let result = self.send_inner(request).await;

        let status_label = match &result {
            Ok(response) => response.status.as_u16().to_string(),
            Err(SendError::Timeout) => "timeout".to_string(),
            Err(SendError::Transport(_)) => "error".to_string(),
        };
        histogram!(UPSTREAM_REQUEST_DURATION, "status" => status_label)
            .record(start.elapsed().as_secs_f64());

        result
    }

    async fn send_inner(&self, request: OutboundRequest) -> Result<UpstreamResponse, SendError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(self.request_timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SendError {
    if err.is_timeout() {
        SendError::Timeout
    } else {
        SendError::Transport(err.to_string())
    }
}

fn exponential_backoff(attempt: usize) -> Duration {
    let millis = 100_u64
        .saturating_mul(2_u64.saturating_pow(attempt.min(32) as u32))
        .min(MAX_BACKOFF_MS);
    Duration::from_millis(millis)
}

fn rate_limit_backoff(attempt: usize) -> Duration {
    Duration::from_millis(((attempt as u64 + 1) * 1_000).min(MAX_BACKOFF_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerSettings;
    use crate::keypool::{KeyPool, KeySet};
    use crate::testutils::{MockKv, ScriptStep, ScriptedServer, gemini_body};

    fn executor(max_attempts: usize, timeout: Duration) -> RetryExecutor {
        RetryExecutor::new(
            Arc::new(BreakerRegistry::new(BreakerSettings::default())),
            max_attempts,
            timeout,
        )
    }

    fn build_for(base_url: &str) -> impl Fn(&str) -> OutboundRequest + Send + Sync {
        let url: Url = format!("{base_url}/v1/test").parse().unwrap();
        move |credential: &str| {
            let mut url = url.clone();
            url.query_pairs_mut().append_pair("key", credential);
            OutboundRequest {
                method: Method::POST,
                url,
                headers: HeaderMap::new(),
                body: Some(Bytes::from_static(b"{}")),
            }
        }
    }

    #[test]
    fn backoff_schedules() {
        assert_eq!(exponential_backoff(0), Duration::from_millis(100));
        assert_eq!(exponential_backoff(3), Duration::from_millis(800));
        assert_eq!(exponential_backoff(10), Duration::from_millis(5_000));
        assert_eq!(rate_limit_backoff(0), Duration::from_millis(1_000));
        assert_eq!(rate_limit_backoff(1), Duration::from_millis(2_000));
        assert_eq!(rate_limit_backoff(9), Duration::from_millis(5_000));
    }

    #[test]
    fn json_validator() {
        let json_ok = UpstreamResponse {
            status: StatusCode::OK,
            headers: content_type("application/json"),
            body: Bytes::from_static(b"{\"candidates\":[]}"),
        };
        assert!(validate_json_response(&json_ok));

        let empty_object = UpstreamResponse {
            status: StatusCode::OK,
            headers: content_type("application/json"),
            body: Bytes::from_static(b"{}"),
        };
        assert!(!validate_json_response(&empty_object));

        let plain_text = UpstreamResponse {
            status: StatusCode::OK,
            headers: content_type("text/plain"),
            body: Bytes::from_static(b"pong"),
        };
        assert!(validate_json_response(&plain_text));

        let empty_plain = UpstreamResponse {
            status: StatusCode::OK,
            headers: content_type("text/plain"),
            body: Bytes::new(),
        };
        assert!(!validate_json_response(&empty_plain));

        let not_found = UpstreamResponse {
            status: StatusCode::NOT_FOUND,
            headers: content_type("application/json"),
            body: Bytes::from_static(b"{\"error\":{}}"),
        };
        assert!(!validate_json_response(&not_found));
    }

    fn content_type(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn forbidden_rotates_and_evicts() {
        let server = ScriptedServer::spawn(vec![
            ScriptStep::json(403, r#"{"error":{"status":"PERMISSION_DENIED"}}"#),
            ScriptStep::json(200, &gemini_body("Hola")),
        ])
        .await;

        let kv = MockKv::new().with_set("GEMINI_API_KEY_SET", &["A", "B"]);
        let pool = Arc::new(KeyPool::new(kv.clone(), Duration::from_secs(600)));
        let executor = executor(20, Duration::from_secs(2));

        let response = executor
            .execute(
                &pool.source(KeySet::GeminiApi),
                build_for(&server.base_url()),
                &validate_json_response,
                "req-1",
            )
            .await
            .unwrap()
            .expect("a validated response");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(server.hits(), 2);

        // The credential that got the 403 was evicted locally and remotely.
        let requests = server.requests();
        let first_key = requests[0]
            .query
            .as_deref()
            .and_then(|q| q.strip_prefix("key="))
            .unwrap()
            .to_string();
        let second_key = requests[1]
            .query
            .as_deref()
            .and_then(|q| q.strip_prefix("key="))
            .unwrap();
        assert_ne!(first_key, second_key);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            kv.removed.lock().as_slice(),
            &[("GEMINI_API_KEY_SET".to_string(), first_key)]
        );
    }

    #[tokio::test]
    async fn rate_limits_back_off_linearly() {
        let server = ScriptedServer::spawn(vec![
            ScriptStep::json(429, r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#),
            ScriptStep::json(429, r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#),
            ScriptStep::json(200, &gemini_body("Hola")),
        ])
        .await;

        let kv = MockKv::new().with_set("GEMINI_API_KEY_SET", &["A", "B", "C"]);
        let pool = Arc::new(KeyPool::new(kv, Duration::from_secs(600)));
        let executor = executor(20, Duration::from_secs(2));

        let start = Instant::now();
        let response = executor
            .execute(
                &pool.source(KeySet::GeminiApi),
                build_for(&server.base_url()),
                &validate_json_response,
                "req-1",
            )
            .await
            .unwrap()
            .expect("a validated response");

        assert_eq!(response.status, StatusCode::OK);
        // 1000 ms after the first 429, 2000 ms after the second.
        assert!(start.elapsed() >= Duration::from_millis(3_000));
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn server_errors_back_off_exponentially() {
        let server = ScriptedServer::spawn(vec![
            ScriptStep::json(500, r#"{"error":{}}"#),
            ScriptStep::json(200, &gemini_body("Hola")),
        ])
        .await;

        let kv = MockKv::new().with_set("GEMINI_API_KEY_SET", &["A", "B"]);
        let pool = Arc::new(KeyPool::new(kv, Duration::from_secs(600)));
        let executor = executor(20, Duration::from_secs(2));

        let start = Instant::now();
        let response = executor
            .execute(
                &pool.source(KeySet::GeminiApi),
                build_for(&server.base_url()),
                &validate_json_response,
                "req-1",
            )
            .await
            .unwrap()
            .expect("a validated response");

        assert_eq!(response.status, StatusCode::OK);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn small_pool_reuses_credentials_and_returns_last_response() {
        let server =
            ScriptedServer::spawn(vec![ScriptStep::json(404, r#"{"error":{}}"#)]).await;

        let kv = MockKv::new().with_set("GEMINI_API_KEY_SET", &["only"]);
        let pool = Arc::new(KeyPool::new(kv, Duration::from_secs(600)));
        let executor = executor(3, Duration::from_secs(2));

        let response = executor
            .execute(
                &pool.source(KeySet::GeminiApi),
                build_for(&server.base_url()),
                &validate_json_response,
                "req-1",
            )
            .await
            .unwrap()
            .expect("last response is surfaced");

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn timeout_on_final_attempt_is_rethrown() {
        let server = ScriptedServer::spawn(vec![ScriptStep::Hang]).await;

        let kv = MockKv::new().with_set("GEMINI_API_KEY_SET", &["A", "B"]);
        let pool = Arc::new(KeyPool::new(kv, Duration::from_secs(600)));
        let executor = executor(2, Duration::from_millis(50));

        let err = executor
            .execute(
                &pool.source(KeySet::GeminiApi),
                build_for(&server.base_url()),
                &validate_json_response,
                "req-1",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamTimeout));
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn open_circuit_skips_the_network() {
        let server = ScriptedServer::spawn(vec![ScriptStep::Hang]).await;

        let kv = MockKv::new().with_set("GEMINI_API_KEY_SET", &["A", "B", "C"]);
        let pool = Arc::new(KeyPool::new(kv, Duration::from_secs(600)));

        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings {
            failure_threshold: 2,
            success_threshold: 2,
            timeout_secs: 60,
        }));
        let executor = RetryExecutor::new(breakers, 3, Duration::from_millis(50));

        let err = executor
            .execute(
                &pool.source(KeySet::GeminiApi),
                build_for(&server.base_url()),
                &validate_json_response,
                "req-1",
            )
            .await
            .unwrap_err();

        // Two timeouts open the breaker; the third attempt never reaches
        // the network and rethrows on the final attempt.
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        assert_eq!(server.hits(), 2);
    }
}
