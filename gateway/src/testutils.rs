//! Test doubles shared across the crate's unit tests: an in-memory
//! key-value store and a scripted HTTP server standing in for the
//! upstream API and the remote store.

use crate::kv::{KvError, KvOp, KvStore};
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted reaction of the test server. Steps are consumed in request
/// order; the last step repeats once the script is exhausted.
#[derive(Clone)]
pub enum ScriptStep {
    Reply {
        status: u16,
        content_type: &'static str,
        body: String,
    },
    /// Accept the request but never answer, to exercise timeouts.
    Hang,
}

impl ScriptStep {
    pub fn json(status: u16, body: &str) -> Self {
        ScriptStep::Reply {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

pub struct ScriptedServer {
    addr: SocketAddr,
    cursor: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedServer {
    pub async fn spawn(script: Vec<ScriptStep>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("test server addr");

        let script = Arc::new(script);
        let cursor = Arc::new(AtomicUsize::new(0));
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));

        let loop_script = script.clone();
        let loop_cursor = cursor.clone();
        let loop_requests = requests.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = hyper_util::rt::TokioIo::new(stream);
                let conn_script = loop_script.clone();
                let conn_cursor = loop_cursor.clone();
                let conn_requests = loop_requests.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let script = conn_script.clone();
                        let cursor = conn_cursor.clone();
                        let requests = conn_requests.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body_bytes = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();

                            requests.lock().push(RecordedRequest {
                                method: parts.method.to_string(),
                                path: parts.uri.path().to_string(),
                                query: parts.uri.query().map(str::to_string),
                                headers: parts.headers,
                                body: body_bytes,
                            });

                            let index = cursor.fetch_add(1, Ordering::SeqCst);
                            let step = script
                                .get(index)
                                .or_else(|| script.last())
                                .cloned()
                                .unwrap_or_else(|| ScriptStep::json(200, "{}"));

                            match step {
                                ScriptStep::Reply {
                                    status,
                                    content_type,
                                    body,
                                } => {
                                    let response = Response::builder()
                                        .status(status)
                                        .header("content-type", content_type)
                                        .body(Full::new(Bytes::from(body)))
                                        .expect("build scripted response");
                                    Ok::<_, std::convert::Infallible>(response)
                                }
                                ScriptStep::Hang => {
                                    tokio::time::sleep(Duration::from_secs(3600)).await;
                                    Ok(Response::new(Full::new(Bytes::new())))
                                }
                            }
                        }
                    });

                    let _ = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    )
                    .serve_connection(io, service)
                    .await;
                });
            }
        });

        ScriptedServer {
            addr,
            cursor,
            requests,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of requests the server has received so far.
    pub fn hits(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

#[derive(Default)]
pub struct MockKvState {
    /// Ordered so `members` stays stable across a single test.
    pub sets: HashMap<String, Vec<String>>,
    pub strings: HashMap<String, String>,
    pub hashes: HashMap<String, Vec<(String, String)>>,
    pub counters: HashMap<String, i64>,
}

/// In-memory [`KvStore`] double with call recording.
#[derive(Default)]
pub struct MockKv {
    pub state: Mutex<MockKvState>,
    pub available: AtomicBool,
    pub members_delay: Mutex<Option<Duration>>,
    pub members_calls: AtomicUsize,
    pub is_member_calls: AtomicUsize,
    pub pipeline_calls: AtomicUsize,
    pub removed: Mutex<Vec<(String, String)>>,
    pub plain_sets: Mutex<Vec<(String, String)>>,
    pub ttl_writes: Mutex<Vec<(String, String, u64)>>,
}

impl MockKv {
    pub fn new() -> Arc<Self> {
        let kv = MockKv::default();
        kv.available.store(true, Ordering::SeqCst);
        Arc::new(kv)
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(MockKv::default())
    }

    pub fn with_set(self: Arc<Self>, name: &str, values: &[&str]) -> Arc<Self> {
        self.state.lock().sets.insert(
            name.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_string(self: Arc<Self>, key: &str, value: &str) -> Arc<Self> {
        self.state
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn delay_members(&self, delay: Duration) {
        *self.members_delay.lock() = Some(delay);
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Unavailable)
        }
    }
}

#[async_trait]
impl KvStore for MockKv {
    async fn members(&self, set: &str) -> Result<Vec<String>, KvError> {
        self.check_available()?;
        self.members_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.members_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock().sets.get(set).cloned().unwrap_or_default())
    }

    async fn is_member(&self, set: &str, value: &str) -> Result<bool, KvError> {
        self.check_available()?;
        self.is_member_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .sets
            .get(set)
            .is_some_and(|values| values.iter().any(|v| v == value)))
    }

    async fn add_member(&self, set: &str, value: &str) -> Result<bool, KvError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let values = state.sets.entry(set.to_string()).or_default();
        if values.iter().any(|v| v == value) {
            Ok(false)
        } else {
            values.push(value.to_string());
            Ok(true)
        }
    }

    async fn remove_member(&self, set: &str, value: &str) -> Result<bool, KvError> {
        self.check_available()?;
        self.removed
            .lock()
            .push((set.to_string(), value.to_string()));
        let mut state = self.state.lock();
        let Some(values) = state.sets.get_mut(set) else {
            return Ok(false);
        };
        let before = values.len();
        values.retain(|v| v != value);
        Ok(values.len() < before)
    }

    async fn incr(&self, counter: &str) -> Result<i64, KvError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let value = state.counters.entry(counter.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.check_available()?;
        Ok(self.state.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.check_available()?;
        self.plain_sets
            .lock()
            .push((key.to_string(), value.to_string()));
        self.state
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.check_available()?;
        self.ttl_writes
            .lock()
            .push((key.to_string(), value.to_string(), ttl_secs));
        self.state
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(keys
            .iter()
            .map(|key| state.strings.get(key).cloned())
            .collect())
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>, KvError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .hashes
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn hdel(&self, hash: &str, fields: &[String]) -> Result<u64, KvError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(entries) = state.hashes.get_mut(hash) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|(field, _)| !fields.contains(field));
        Ok((before - entries.len()) as u64)
    }

    async fn pipeline(&self, ops: &[KvOp]) -> Result<Vec<Value>, KvError> {
        self.check_available()?;
        self.pipeline_calls.fetch_add(1, Ordering::SeqCst);
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                KvOp::Get { key } => {
                    let value = self.get(key).await?;
                    results.push(value.map(Value::String).unwrap_or(Value::Null));
                }
                KvOp::SetWithTtl {
                    key,
                    value,
                    ttl_secs,
                } => {
                    self.set_with_ttl(key, value, *ttl_secs).await?;
                    results.push(Value::String("OK".to_string()));
                }
            }
        }
        Ok(results)
    }
}

/// Canned generateContent success body with the given translation.
pub fn gemini_body(text: &str) -> String {
    serde_json::json!({
        "candidates": [
            { "content": { "parts": [{ "text": text }] } }
        ]
    })
    .to_string()
}
