//! In-flight request coalescing.
//!
//! Identical concurrent client requests collapse into one pipeline
//! execution; every joiner receives the same shared result. Completed
//! entries linger for a short tail window so immediate repeats still join.

use crate::metrics_defs::COALESCER_JOINED;
use crate::utils::sha1_hex;
use bytes::Bytes;
use http::{Method, Uri};
use parking_lot::Mutex;
use shared::counter;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

static FALLBACK_SALT: AtomicU64 = AtomicU64::new(0);

/// Canonical identifier of a client request. Idempotent verbs key on the
/// full URL; body-bearing verbs key on a content hash of the buffered
/// body. An unreadable body falls back to a unique salt, which
/// deliberately defeats coalescing for that request.
pub fn fingerprint(method: &Method, uri: &Uri, body: Option<&Bytes>) -> String {
    match *method {
        Method::GET | Method::HEAD | Method::OPTIONS | Method::DELETE | Method::PUT => {
            format!("{method}:{uri}")
        }
        _ => match body {
            Some(bytes) => format!("{}:{}:{}", method, uri.path(), sha1_hex(bytes)),
            None => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or_default();
                let salt = FALLBACK_SALT.fetch_add(1, Ordering::Relaxed);
                format!("{}:{}:{}-{}", method, uri.path(), nanos, salt)
            }
        },
    }
}

enum Role<T> {
    Lead(watch::Sender<Option<T>>),
    Join(watch::Receiver<Option<T>>),
}

pub struct Coalescer<T: Clone> {
    pending: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
    tail_ttl: Duration,
}

impl<T: Clone + Send + Sync + 'static> Coalescer<T> {
    pub fn new(tail_ttl: Duration) -> Self {
        Coalescer {
            pending: Mutex::new(HashMap::new()),
            tail_ttl,
        }
    }

    /// Runs `work` for `key`, or joins an identical in-flight run.
    /// Returns the shared value and whether this caller joined.
    pub async fn run<F>(self: &Arc<Self>, key: String, work: F) -> (T, bool)
    where
        F: Future<Output = T>,
    {
        let role = {
            let mut pending = self.pending.lock();
            match pending.get(&key) {
                Some(rx) => Role::Join(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    pending.insert(key.clone(), rx);
                    Role::Lead(tx)
                }
            }
        };

        match role {
            Role::Join(mut rx) => {
                counter!(COALESCER_JOINED).increment(1);
                if let Ok(slot) = rx.wait_for(|slot| slot.is_some()).await
                    && let Some(value) = slot.as_ref()
                {
                    return (value.clone(), true);
                }
                // The leader vanished without publishing; clean up its
                // entry and run the work directly.
                self.pending.lock().remove(&key);
                (work.await, false)
            }
            Role::Lead(tx) => {
                let value = work.await;
                let _ = tx.send(Some(value.clone()));

                let coalescer = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(coalescer.tail_ttl).await;
                    coalescer.pending.lock().remove(&key);
                });

                (value, false)
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}
