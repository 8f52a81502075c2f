//! Typed operations against the shared key-value service.
//!
//! The store speaks the Upstash-style Redis REST dialect: single commands
//! are a JSON array POSTed to the base URL with a bearer token, pipelines
//! are an array of command arrays POSTed to `/pipeline`. Every operation
//! here is idempotent and retry-safe at the HTTP layer.

use crate::config::KvConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum KvError {
    #[error("key-value store is not configured")]
    Unavailable,

    #[error("key-value request failed: {0}")]
    Request(String),

    #[error("key-value command rejected: {0}")]
    Command(String),

    #[error("unexpected key-value response: {0}")]
    InvalidResponse(String),
}

/// One operation of a pipelined batch. Results come back in submission
/// order.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Get {
        key: String,
    },
    SetWithTtl {
        key: String,
        value: String,
        ttl_secs: u64,
    },
}

impl KvOp {
    fn to_command(&self) -> Vec<String> {
        match self {
            KvOp::Get { key } => vec!["GET".to_string(), key.clone()],
            KvOp::SetWithTtl {
                key,
                value,
                ttl_secs,
            } => vec![
                "SET".to_string(),
                key.clone(),
                value.clone(),
                "EX".to_string(),
                ttl_secs.to_string(),
            ],
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn members(&self, set: &str) -> Result<Vec<String>, KvError>;
    async fn is_member(&self, set: &str, value: &str) -> Result<bool, KvError>;
    async fn add_member(&self, set: &str, value: &str) -> Result<bool, KvError>;
    async fn remove_member(&self, set: &str, value: &str) -> Result<bool, KvError>;
    async fn incr(&self, counter: &str) -> Result<i64, KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;
    /// Multi-get preserving input order; missing keys yield `None`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError>;
    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>, KvError>;
    async fn hdel(&self, hash: &str, fields: &[String]) -> Result<u64, KvError>;
    /// Executes operations in one round trip, preserving order.
    async fn pipeline(&self, ops: &[KvOp]) -> Result<Vec<Value>, KvError>;
}

struct Connection {
    command_url: Url,
    pipeline_url: Url,
    token: String,
}

/// REST client for the shared store. Constructed "disconnected" when the
/// URL or token is missing, in which case every call reports
/// [`KvError::Unavailable`] and callers degrade explicitly.
pub struct UpstashStore {
    client: reqwest::Client,
    connection: Option<Connection>,
}

impl UpstashStore {
    pub fn new(config: &KvConfig) -> Self {
        let connection = match (&config.url, &config.token) {
            (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => {
                match Self::parse_urls(url) {
                    Ok((command_url, pipeline_url)) => Some(Connection {
                        command_url,
                        pipeline_url,
                        token: token.clone(),
                    }),
                    Err(err) => {
                        tracing::error!(error = %err, "invalid key-value store URL, store disabled");
                        None
                    }
                }
            }
            _ => {
                tracing::warn!("key-value store not configured, credential sets unavailable");
                None
            }
        };

        UpstashStore {
            client: reqwest::Client::new(),
            connection,
        }
    }

    fn parse_urls(base: &str) -> Result<(Url, Url), url::ParseError> {
        let trimmed = base.trim_end_matches('/');
        let command_url: Url = format!("{trimmed}/").parse()?;
        let pipeline_url: Url = format!("{trimmed}/pipeline").parse()?;
        Ok((command_url, pipeline_url))
    }

    fn connection(&self) -> Result<&Connection, KvError> {
        self.connection.as_ref().ok_or(KvError::Unavailable)
    }

    async fn command(&self, command: Vec<String>) -> Result<Value, KvError> {
        let connection = self.connection()?;
        let response = self
            .client
            .post(connection.command_url.clone())
            .bearer_auth(&connection.token)
            .timeout(REQUEST_TIMEOUT)
            .json(&command)
            .send()
            .await
            .map_err(|e| KvError::Request(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| KvError::InvalidResponse(e.to_string()))?;

        extract_result(body, status.as_u16())
    }
}

fn extract_result(body: Value, status: u16) -> Result<Value, KvError> {
    match body {
        Value::Object(mut map) => {
            if let Some(error) = map.get("error").and_then(Value::as_str) {
                return Err(KvError::Command(error.to_string()));
            }
            map.remove("result")
                .ok_or_else(|| KvError::InvalidResponse(format!("missing result (status {status})")))
        }
        other => Err(KvError::InvalidResponse(format!(
            "expected object, got {other}"
        ))),
    }
}

fn as_string_list(value: Value) -> Result<Vec<String>, KvError> {
    let Value::Array(items) = value else {
        return Err(KvError::InvalidResponse("expected array".to_string()));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            other => Err(KvError::InvalidResponse(format!(
                "expected string, got {other}"
            ))),
        })
        .collect()
}

fn as_int(value: &Value) -> Result<i64, KvError> {
    value
        .as_i64()
        .ok_or_else(|| KvError::InvalidResponse(format!("expected integer, got {value}")))
}

fn as_optional_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}

#[async_trait]
impl KvStore for UpstashStore {
    async fn members(&self, set: &str) -> Result<Vec<String>, KvError> {
        let result = self
            .command(vec!["SMEMBERS".to_string(), set.to_string()])
            .await?;
        as_string_list(result)
    }

    async fn is_member(&self, set: &str, value: &str) -> Result<bool, KvError> {
        let result = self
            .command(vec![
                "SISMEMBER".to_string(),
                set.to_string(),
                value.to_string(),
            ])
            .await?;
        Ok(as_int(&result)? == 1)
    }

    async fn add_member(&self, set: &str, value: &str) -> Result<bool, KvError> {
        let result = self
            .command(vec![
                "SADD".to_string(),
                set.to_string(),
                value.to_string(),
            ])
            .await?;
        Ok(as_int(&result)? == 1)
    }

    async fn remove_member(&self, set: &str, value: &str) -> Result<bool, KvError> {
        let result = self
            .command(vec![
                "SREM".to_string(),
                set.to_string(),
                value.to_string(),
            ])
            .await?;
        Ok(as_int(&result)? == 1)
    }

    async fn incr(&self, counter: &str) -> Result<i64, KvError> {
        let result = self
            .command(vec!["INCR".to_string(), counter.to_string()])
            .await?;
        as_int(&result)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let result = self.command(vec!["GET".to_string(), key.to_string()]).await?;
        Ok(as_optional_string(result))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.command(vec![
            "SET".to_string(),
            key.to_string(),
            value.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.command(
            KvOp::SetWithTtl {
                key: key.to_string(),
                value: value.to_string(),
                ttl_secs,
            }
            .to_command(),
        )
        .await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut command = vec!["MGET".to_string()];
        command.extend(keys.iter().cloned());
        let result = self.command(command).await?;

        let Value::Array(items) = result else {
            return Err(KvError::InvalidResponse("expected array".to_string()));
        };
        Ok(items.into_iter().map(as_optional_string).collect())
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>, KvError> {
        let result = self
            .command(vec!["HGETALL".to_string(), hash.to_string()])
            .await?;
        // Flat field/value alternation, per the Redis reply shape.
        let flat = as_string_list(result)?;
        if flat.len() % 2 != 0 {
            return Err(KvError::InvalidResponse(
                "odd number of hash reply items".to_string(),
            ));
        }
        let mut pairs = Vec::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((field, value));
        }
        Ok(pairs)
    }

    async fn hdel(&self, hash: &str, fields: &[String]) -> Result<u64, KvError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut command = vec!["HDEL".to_string(), hash.to_string()];
        command.extend(fields.iter().cloned());
        let result = self.command(command).await?;
        Ok(as_int(&result)?.max(0) as u64)
    }

    async fn pipeline(&self, ops: &[KvOp]) -> Result<Vec<Value>, KvError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let connection = self.connection()?;
        let commands: Vec<Vec<String>> = ops.iter().map(KvOp::to_command).collect();

        let response = self
            .client
            .post(connection.pipeline_url.clone())
            .bearer_auth(&connection.token)
            .timeout(REQUEST_TIMEOUT)
            .json(&commands)
            .send()
            .await
            .map_err(|e| KvError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| KvError::InvalidResponse(e.to_string()))?;

        let Value::Array(items) = body else {
            return Err(KvError::InvalidResponse(format!(
                "expected pipeline array (status {status})"
            )));
        };
        items
            .into_iter()
            .map(|item| extract_result(item, status))
            .collect()
    }
}
