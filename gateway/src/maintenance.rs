//! Operator maintenance over the shared credential sets: probing key
//! validity against the upstream, bulk add/remove from files, and pruning
//! expired auth secrets. Driven by the CLI, not the request path.

use crate::config::UpstreamConfig;
use crate::errors::{GatewayError, Result};
use crate::keypool::KeySet;
use crate::kv::KvStore;
use crate::utils::key_preview;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const AUTH_EXPIRATION_HASH: &str = "AUTH_SECRET_EXPIRATION_HASH";

/// Probe cadence when checking key validity.
#[derive(Clone)]
pub struct ProbeOptions {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub concurrency: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions {
            attempts: 3,
            retry_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(20),
            concurrency: 32,
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyCheckReport {
    pub checked: usize,
    pub active: usize,
    pub removed: Vec<String>,
}

/// Probes every member of `set` against the upstream and removes the keys
/// the upstream rejects outright.
pub async fn check_keys(
    store: Arc<dyn KvStore>,
    upstream: &UpstreamConfig,
    set: KeySet,
    options: ProbeOptions,
) -> Result<KeyCheckReport> {
    let keys = store.members(set.set_name()).await?;
    let url = upstream
        .generate_content_url()
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    let client = reqwest::Client::new();
    let limiter = Arc::new(Semaphore::new(options.concurrency.max(1)));

    let mut join_set = JoinSet::new();
    for key in &keys {
        let key = key.clone();
        let url = url.clone();
        let client = client.clone();
        let options = options.clone();
        let limiter = limiter.clone();
        join_set.spawn(async move {
            let _permit = limiter.acquire_owned().await;
            let active = probe_key(&client, &url, &key, &options).await;
            (key, active)
        });
    }

    let mut report = KeyCheckReport {
        checked: keys.len(),
        ..Default::default()
    };
    while let Some(joined) = join_set.join_next().await {
        let Ok((key, active)) = joined else {
            continue;
        };
        if active {
            report.active += 1;
        } else {
            tracing::warn!(key = %key_preview(&key), set = %set, "removing invalid credential");
            match store.remove_member(set.set_name(), &key).await {
                Ok(_) => report.removed.push(key),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to remove invalid credential");
                }
            }
        }
    }

    Ok(report)
}

/// 200 and 429 mean the key works; 403 and 503 mean it does not. Anything
/// else retries until the attempt budget runs out, then counts as invalid.
async fn probe_key(
    client: &reqwest::Client,
    url: &url::Url,
    key: &str,
    options: &ProbeOptions,
) -> bool {
    let payload = serde_json::json!({ "contents": [{ "parts": [{ "text": "hello" }] }] });

    for attempt in 0..options.attempts {
        let mut url = url.clone();
        url.query_pairs_mut().append_pair("key", key);

        let response = client
            .post(url)
            .json(&payload)
            .timeout(options.request_timeout)
            .send()
            .await;

        if let Ok(response) = response {
            match response.status().as_u16() {
                200 | 429 => return true,
                403 | 503 => return false,
                _ => {}
            }
        }

        if attempt + 1 < options.attempts {
            tokio::time::sleep(options.retry_delay).await;
        }
    }
    false
}

/// Adds newline-separated values from `path` to `set`. Returns how many
/// were new.
pub async fn add_keys_from_file(
    store: Arc<dyn KvStore>,
    set: KeySet,
    path: &Path,
) -> Result<usize> {
    let keys = read_key_file(path)?;
    let mut added = 0;
    for key in &keys {
        if store.add_member(set.set_name(), key).await? {
            added += 1;
        }
    }
    tracing::info!(set = %set, total = keys.len(), added, "added credentials from file");
    Ok(added)
}

/// Removes newline-separated values from `path` out of `set`.
pub async fn remove_keys_from_file(
    store: Arc<dyn KvStore>,
    set: KeySet,
    path: &Path,
) -> Result<usize> {
    let keys = read_key_file(path)?;
    let mut removed = 0;
    for key in &keys {
        if store.remove_member(set.set_name(), key).await? {
            removed += 1;
        }
    }
    tracing::info!(set = %set, total = keys.len(), removed, "removed credentials from file");
    Ok(removed)
}

fn read_key_file(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Removes auth secrets whose expiration timestamp (unix seconds) has
/// passed, from both the expiration hash and the auth set. Unparsable
/// timestamps count as expired.
pub async fn prune_expired_auths(
    store: Arc<dyn KvStore>,
    now_epoch_secs: u64,
) -> Result<usize> {
    let entries = store.hgetall(AUTH_EXPIRATION_HASH).await?;

    let expired: Vec<String> = entries
        .into_iter()
        .filter_map(|(secret, timestamp)| match timestamp.parse::<u64>() {
            Ok(expires_at) if expires_at >= now_epoch_secs => None,
            Ok(_) => Some(secret),
            Err(_) => {
                tracing::warn!(
                    secret = %key_preview(&secret),
                    "invalid expiration timestamp, removing"
                );
                Some(secret)
            }
        })
        .collect();

    if expired.is_empty() {
        return Ok(0);
    }

    for secret in &expired {
        if let Err(err) = store
            .remove_member(KeySet::AuthSecrets.set_name(), secret)
            .await
        {
            tracing::warn!(error = %err, "failed to remove expired auth secret");
        }
    }
    store.hdel(AUTH_EXPIRATION_HASH, &expired).await?;

    tracing::info!(count = expired.len(), "pruned expired auth secrets");
    Ok(expired.len())
}
