//! The gateway's hyper service: request ids, single body buffering,
//! coalescing, and routing to the endpoint handlers.

use crate::api::{SharedResponse, passthrough, status, translate};
use crate::breaker::BreakerRegistry;
use crate::coalesce::{Coalescer, fingerprint};
use crate::config::Config;
use crate::engine::TranslationEngine;
use crate::errors::GatewayError;
use crate::keypool::KeyPool;
use crate::kv::{KvStore, UpstashStore};
use crate::retry::RetryExecutor;
use crate::translation_cache::TranslationCache;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Method, Request, Response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Owns every core component. Built once at startup and shared by all
/// connections.
pub struct Core {
    pub config: Config,
    pub store: Arc<dyn KvStore>,
    pub pool: Arc<KeyPool>,
    pub cache: Arc<TranslationCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub executor: Arc<RetryExecutor>,
    pub engine: TranslationEngine,
    pub coalescer: Arc<Coalescer<SharedResponse>>,
}

impl Core {
    pub fn from_config(config: Config) -> Result<Self, GatewayError> {
        let store: Arc<dyn KvStore> = Arc::new(UpstashStore::new(&config.kv));
        Self::with_store(config, store)
    }

    /// Wires the components around an existing store. Tests inject doubles
    /// here.
    pub fn with_store(config: Config, store: Arc<dyn KvStore>) -> Result<Self, GatewayError> {
        let pool = Arc::new(KeyPool::new(
            store.clone(),
            Duration::from_secs(config.limits.cache_duration_secs),
        ));
        let cache = Arc::new(TranslationCache::new(
            store.clone(),
            config.limits.translation_cache_ttl_secs,
            config.limits.key_cache_size,
        ));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let executor = Arc::new(RetryExecutor::new(
            breakers.clone(),
            config.limits.max_retries,
            Duration::from_millis(config.limits.request_timeout_ms),
        ));
        let engine = TranslationEngine::new(
            cache.clone(),
            pool.clone(),
            executor.clone(),
            Arc::new(config.upstream.clone()),
            config.limits.parallel_translation_limit,
        );
        let coalescer = Arc::new(Coalescer::new(Duration::from_millis(
            config.limits.request_dedup_ttl_ms,
        )));

        Ok(Core {
            config,
            store,
            pool,
            cache,
            breakers,
            executor,
            engine,
            coalescer,
        })
    }
}

#[derive(Clone)]
pub struct GatewayService {
    core: Arc<Core>,
}

impl GatewayService {
    pub fn new(core: Arc<Core>) -> Self {
        GatewayService { core }
    }
}

impl HyperService<Request<Incoming>> for GatewayService {
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let core = self.core.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();

            // Buffer the body once; fingerprinting, auth, and forwarding
            // all read the same bytes.
            let body = match body.collect().await {
                Ok(collected) => Some(collected.to_bytes()),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read request body");
                    None
                }
            };

            let shared = handle_buffered(core, parts, body).await;
            Ok(to_hyper_response(&shared))
        })
    }
}

/// Entry point after body buffering: identical concurrent requests share
/// one pipeline execution and one response.
pub async fn handle_buffered(
    core: Arc<Core>,
    parts: http::request::Parts,
    body: Option<Bytes>,
) -> SharedResponse {
    let request_id = Uuid::new_v4().to_string();
    let key = fingerprint(&parts.method, &parts.uri, body.as_ref());

    let coalescer = core.coalescer.clone();
    let (response, joined) = coalescer
        .run(key, route(core, parts, body, request_id.clone()))
        .await;
    if joined {
        tracing::debug!(request_id = %request_id, "joined identical in-flight request");
    }
    response
}

async fn route(
    core: Arc<Core>,
    parts: http::request::Parts,
    body: Option<Bytes>,
    request_id: String,
) -> SharedResponse {
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();

    tracing::info!(request_id = %request_id, method = %method, path = %path, "handling request");

    if method == Method::POST && (path == "/translate" || path.starts_with("/translate/")) {
        return translate::handle(
            &core,
            &method,
            &path,
            &parts.headers,
            body.as_ref(),
            &request_id,
        )
        .await;
    }

    if let Some(rest) = path.strip_prefix("/providers/") {
        let (provider, upstream_path) = match rest.split_once('/') {
            Some((provider, tail)) => (provider, format!("/{tail}")),
            None => (rest, "/".to_string()),
        };
        if provider != "gemini" {
            return status::not_found(&request_id);
        }
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{upstream_path}?{query}"),
            None => upstream_path,
        };
        return passthrough::handle(
            &core,
            &method,
            parts.version,
            &parts.headers,
            &path_and_query,
            body.as_ref(),
            &request_id,
        )
        .await;
    }

    if path.starts_with("/v1") {
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.clone(),
        };
        return passthrough::handle(
            &core,
            &method,
            parts.version,
            &parts.headers,
            &path_and_query,
            body.as_ref(),
            &request_id,
        )
        .await;
    }

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => status::health(&request_id),
        (&Method::GET, "/") => status::service_info(&request_id),
        (&Method::GET, "/favicon.ico") => status::favicon(&request_id),
        _ => status::not_found(&request_id),
    }
}

fn to_hyper_response(shared: &SharedResponse) -> Response<BoxBody<Bytes, Infallible>> {
    let mut response = Response::new(Full::new(shared.body.clone()).boxed());
    *response.status_mut() = shared.status;
    *response.headers_mut() = shared.headers.clone();
    response
}
