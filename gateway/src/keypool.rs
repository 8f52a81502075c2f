//! Rotating credential sets backed by the shared key-value store.
//!
//! The pool owns one cached snapshot per set plus the round-robin cursor.
//! Stale snapshots refresh lazily; concurrent refreshes collapse into a
//! single store call.

use crate::errors::GatewayError;
use crate::kv::KvStore;
use crate::metrics_defs::{KEY_POOL_EVICTED, KEY_POOL_RELOAD};
use crate::retry::CredentialSource;
use crate::utils::key_preview;
use async_trait::async_trait;
use parking_lot::RwLock;
use shared::counter;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Selections between best-effort counter persistence writes.
const PERSIST_EVERY: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeySet {
    GeminiApi,
    Translate,
    AuthSecrets,
}

impl KeySet {
    pub fn set_name(self) -> &'static str {
        match self {
            KeySet::GeminiApi => "GEMINI_API_KEY_SET",
            KeySet::Translate => "TRANSLATE_KEY_SET",
            KeySet::AuthSecrets => "AUTH_SECRET_SET",
        }
    }

    /// Store key under which the rotation counter is persisted. Auth
    /// secrets are membership-checked, never rotated.
    pub fn counter_name(self) -> Option<&'static str> {
        match self {
            KeySet::GeminiApi => Some("GEMINI_API_KEY_INDEX"),
            KeySet::Translate => Some("TRANSLATE_KEY_INDEX"),
            KeySet::AuthSecrets => None,
        }
    }

    fn slot(self) -> usize {
        match self {
            KeySet::GeminiApi => 0,
            KeySet::Translate => 1,
            KeySet::AuthSecrets => 2,
        }
    }
}

impl fmt::Display for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.set_name())
    }
}

struct Loaded {
    keys: Arc<Vec<String>>,
    loaded_at: Instant,
}

struct SetCache {
    values: RwLock<Option<Loaded>>,
    load_lock: tokio::sync::Mutex<()>,
    counter: AtomicU64,
    counter_seeded: AtomicBool,
}

impl SetCache {
    fn new() -> Self {
        SetCache {
            values: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            counter: AtomicU64::new(0),
            counter_seeded: AtomicBool::new(false),
        }
    }
}

pub struct KeyPool {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    sets: [SetCache; 3],
}

impl KeyPool {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        KeyPool {
            store,
            ttl,
            sets: [SetCache::new(), SetCache::new(), SetCache::new()],
        }
    }

    fn cache(&self, set: KeySet) -> &SetCache {
        &self.sets[set.slot()]
    }

    // A snapshot emptied by evictions counts as stale so selection goes
    // back to the store instead of indexing into nothing.
    fn fresh(&self, set: KeySet) -> Option<Arc<Vec<String>>> {
        let guard = self.cache(set).values.read();
        guard
            .as_ref()
            .filter(|loaded| !loaded.keys.is_empty() && loaded.loaded_at.elapsed() < self.ttl)
            .map(|loaded| loaded.keys.clone())
    }

    /// Returns the values of `set`, refreshing from the store when the
    /// cached snapshot is stale. Waiters park on the load lock and re-check
    /// freshness, so concurrent demand produces exactly one store call.
    pub async fn load(&self, set: KeySet) -> Result<Arc<Vec<String>>, GatewayError> {
        if let Some(keys) = self.fresh(set) {
            return Ok(keys);
        }

        let cache = self.cache(set);
        let _guard = cache.load_lock.lock().await;
        if let Some(keys) = self.fresh(set) {
            return Ok(keys);
        }

        self.seed_counter(set).await;

        let members = self.store.members(set.set_name()).await?;
        if members.is_empty() {
            return Err(GatewayError::NoCredentials(set));
        }
        counter!(KEY_POOL_RELOAD, "set" => set.set_name()).increment(1);
        tracing::debug!(set = %set, count = members.len(), "loaded credential set");

        let keys = Arc::new(members);
        *cache.values.write() = Some(Loaded {
            keys: keys.clone(),
            loaded_at: Instant::now(),
        });
        Ok(keys)
    }

    /// Resumes rotation from the persisted counter, once per process.
    async fn seed_counter(&self, set: KeySet) {
        let cache = self.cache(set);
        if cache.counter_seeded.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(counter_key) = set.counter_name() else {
            return;
        };
        match self.store.get(counter_key).await {
            Ok(Some(value)) => {
                if let Ok(persisted) = value.parse::<u64>() {
                    cache.counter.store(persisted, Ordering::SeqCst);
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(error = %err, counter = counter_key, "could not seed rotation counter");
            }
        }
    }

    /// Round-robin selection over the set's current values.
    pub async fn next_credential(&self, set: KeySet) -> Result<String, GatewayError> {
        let keys = self.load(set).await?;
        let cache = self.cache(set);
        let count = cache.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let key = keys[(count as usize) % keys.len()].clone();

        if count % PERSIST_EVERY == 0
            && let Some(counter_key) = set.counter_name()
        {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(err) = store.set(counter_key, &count.to_string()).await {
                    tracing::debug!(error = %err, counter = counter_key, "failed to persist rotation counter");
                }
            });
        }

        Ok(key)
    }

    /// Removes a credential observed as invalid: immediately from the local
    /// snapshot, best-effort from the store. Never blocks selection.
    pub fn evict(&self, set: KeySet, credential: &str) {
        let removed_locally = {
            let mut guard = self.cache(set).values.write();
            match guard.as_mut() {
                Some(loaded) => match loaded.keys.iter().position(|k| k == credential) {
                    Some(position) => {
                        let mut keys = loaded.keys.as_ref().clone();
                        keys.remove(position);
                        loaded.keys = Arc::new(keys);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };

        if removed_locally {
            counter!(KEY_POOL_EVICTED, "set" => set.set_name()).increment(1);
        }
        tracing::warn!(set = %set, key = %key_preview(credential), "evicting credential");

        let store = self.store.clone();
        let set_name = set.set_name();
        let credential = credential.to_string();
        tokio::spawn(async move {
            if let Err(err) = store.remove_member(set_name, &credential).await {
                tracing::warn!(error = %err, set = set_name, "failed to remove credential from store");
            }
        });
    }

    /// True iff `secret` is a known auth secret. A secret missing from the
    /// cached snapshot falls back to a store membership probe; a store
    /// failure denies.
    pub async fn validate_auth(&self, secret: &str) -> bool {
        match self.load(KeySet::AuthSecrets).await {
            Ok(secrets) if secrets.iter().any(|s| s == secret) => return true,
            Ok(_) | Err(GatewayError::NoCredentials(_)) => {}
            Err(err) => {
                tracing::warn!(error = %err, "auth validation unavailable, denying");
                return false;
            }
        }

        match self
            .store
            .is_member(KeySet::AuthSecrets.set_name(), secret)
            .await
        {
            Ok(true) => {
                self.remember_auth(secret);
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::warn!(error = %err, "auth validation unavailable, denying");
                false
            }
        }
    }

    /// Best-effort warm-up of the auth snapshot after a store hit.
    fn remember_auth(&self, secret: &str) {
        let mut guard = self.cache(KeySet::AuthSecrets).values.write();
        if let Some(loaded) = guard.as_mut()
            && !loaded.keys.iter().any(|s| s == secret)
        {
            let mut keys = loaded.keys.as_ref().clone();
            keys.push(secret.to_string());
            loaded.keys = Arc::new(keys);
        }
    }

    /// [`CredentialSource`] view of one set, for the retry executor.
    pub fn source(self: &Arc<Self>, set: KeySet) -> PoolCredentials {
        PoolCredentials {
            pool: self.clone(),
            set,
        }
    }
}

pub struct PoolCredentials {
    pool: Arc<KeyPool>,
    set: KeySet,
}

#[async_trait]
impl CredentialSource for PoolCredentials {
    async fn next_credential(&self) -> Result<String, GatewayError> {
        self.pool.next_credential(self.set).await
    }

    fn evict(&self, credential: &str) {
        self.pool.evict(self.set, credential);
    }
}
