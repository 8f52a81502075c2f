pub mod api;
pub mod auth;
pub mod breaker;
pub mod coalesce;
pub mod config;
pub mod engine;
pub mod errors;
pub mod keypool;
pub mod kv;
pub mod maintenance;
pub mod metrics_defs;
pub mod retry;
pub mod service;
pub mod translation_cache;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutils;

use crate::errors::GatewayError;
use crate::service::{Core, GatewayService};
use std::sync::Arc;

/// Builds the core from config and serves it until the listener fails.
pub async fn run(config: config::Config) -> Result<(), GatewayError> {
    let listener = config.listener.clone();
    let core = Arc::new(Core::from_config(config)?);

    tracing::info!(
        host = %listener.host,
        port = listener.port,
        "starting gateway"
    );

    shared::http::run_http_service(&listener.host, listener.port, GatewayService::new(core))
        .await
        .map_err(GatewayError::from)
}
