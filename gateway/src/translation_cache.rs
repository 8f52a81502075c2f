//! Content-addressed cache of prior translations in the shared store.

use crate::kv::{KvOp, KvStore};
use crate::metrics_defs::{TRANSLATION_CACHE_HIT, TRANSLATION_CACHE_MISS};
use crate::utils::sha1_hex;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::counter;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub const CACHE_PREFIX: &str = "translation:";

/// Identifiers shorter than this are embedded in the key directly;
/// longer ones are hashed.
const INLINE_IDENTIFIER_LIMIT: usize = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranslationRecord {
    pub detected_source_lang: String,
    pub text: String,
}

/// Store key for one (text, source, target) triple. Pure: equal inputs
/// produce equal keys, and any differing input changes the key.
pub fn cache_key(text: &str, source_lang: Option<&str>, target_lang: &str) -> String {
    let source = source_lang.unwrap_or("auto");
    let identifier = format!("{source}:{target_lang}:{text}");
    if identifier.len() < INLINE_IDENTIFIER_LIMIT {
        format!("{CACHE_PREFIX}{}", URL_SAFE_NO_PAD.encode(&identifier))
    } else {
        format!("{CACHE_PREFIX}{}", sha1_hex(identifier.as_bytes()))
    }
}

/// Bounded identifier → key memo. Eviction is first-insertion order.
struct KeyMemo {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl KeyMemo {
    fn new(capacity: usize) -> Self {
        KeyMemo {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, identifier: &str) -> Option<String> {
        self.entries.get(identifier).cloned()
    }

    fn insert(&mut self, identifier: String, key: String) {
        if self.capacity == 0 || self.entries.contains_key(&identifier) {
            return;
        }
        if self.entries.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
        }
        self.order.push_back(identifier.clone());
        self.entries.insert(identifier, key);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct TranslationCache {
    store: Arc<dyn KvStore>,
    ttl_secs: u64,
    memo: Mutex<KeyMemo>,
}

impl TranslationCache {
    pub fn new(store: Arc<dyn KvStore>, ttl_secs: u64, memo_capacity: usize) -> Self {
        TranslationCache {
            store,
            ttl_secs,
            memo: Mutex::new(KeyMemo::new(memo_capacity)),
        }
    }

    fn key_for(&self, text: &str, source_lang: Option<&str>, target_lang: &str) -> String {
        let identifier = format!(
            "{}:{}:{}",
            source_lang.unwrap_or("auto"),
            target_lang,
            text
        );
        if let Some(key) = self.memo.lock().get(&identifier) {
            return key;
        }
        let key = cache_key(text, source_lang, target_lang);
        self.memo.lock().insert(identifier, key.clone());
        key
    }

    /// Single lookup. Store failures and undecodable entries read as a miss.
    pub async fn get(
        &self,
        text: &str,
        source_lang: Option<&str>,
        target_lang: &str,
    ) -> Option<TranslationRecord> {
        let key = self.key_for(text, source_lang, target_lang);
        match self.store.get(&key).await {
            Ok(Some(raw)) => {
                let record = decode_record(&raw);
                if record.is_some() {
                    counter!(TRANSLATION_CACHE_HIT).increment(1);
                } else {
                    counter!(TRANSLATION_CACHE_MISS).increment(1);
                }
                record
            }
            Ok(None) => {
                counter!(TRANSLATION_CACHE_MISS).increment(1);
                None
            }
            Err(err) => {
                tracing::debug!(error = %err, "translation cache read failed");
                None
            }
        }
    }

    /// Batch lookup via one multi-get, in input order. Unavailable store
    /// means no hits; the engine still functions.
    pub async fn get_batch(
        &self,
        texts: &[String],
        source_lang: Option<&str>,
        target_lang: &str,
    ) -> HashMap<String, TranslationRecord> {
        if texts.is_empty() {
            return HashMap::new();
        }

        let keys: Vec<String> = texts
            .iter()
            .map(|text| self.key_for(text, source_lang, target_lang))
            .collect();

        let values = match self.store.mget(&keys).await {
            Ok(values) => values,
            Err(err) => {
                tracing::debug!(error = %err, "translation cache batch read failed");
                return HashMap::new();
            }
        };

        let mut hits = HashMap::new();
        for (text, value) in texts.iter().zip(values) {
            if let Some(raw) = value
                && let Some(record) = decode_record(&raw)
            {
                hits.insert(text.clone(), record);
            }
        }

        counter!(TRANSLATION_CACHE_HIT).increment(hits.len() as u64);
        counter!(TRANSLATION_CACHE_MISS).increment((texts.len() - hits.len()) as u64);
        hits
    }

    /// Best-effort single write.
    pub async fn put(
        &self,
        text: &str,
        source_lang: Option<&str>,
        target_lang: &str,
        record: &TranslationRecord,
    ) {
        let key = self.key_for(text, source_lang, target_lang);
        let Ok(raw) = serde_json::to_string(record) else {
            return;
        };
        if let Err(err) = self.store.set_with_ttl(&key, &raw, self.ttl_secs).await {
            tracing::debug!(error = %err, "translation cache write failed");
        }
    }

    /// Best-effort batch write. A single entry takes the plain write path;
    /// anything more goes through one pipeline round trip.
    pub async fn put_batch(
        &self,
        entries: &[(String, TranslationRecord)],
        source_lang: Option<&str>,
        target_lang: &str,
    ) {
        match entries {
            [] => return,
            [(text, record)] => {
                return self.put(text, source_lang, target_lang, record).await;
            }
            _ => {}
        }

        let ops: Vec<KvOp> = entries
            .iter()
            .filter_map(|(text, record)| {
                let raw = serde_json::to_string(record).ok()?;
                Some(KvOp::SetWithTtl {
                    key: self.key_for(text, source_lang, target_lang),
                    value: raw,
                    ttl_secs: self.ttl_secs,
                })
            })
            .collect();

        if let Err(err) = self.store.pipeline(&ops).await {
            tracing::debug!(error = %err, "translation cache batch write failed");
        }
    }
}

fn decode_record(raw: &str) -> Option<TranslationRecord> {
    match serde_json::from_str(raw) {
        Ok(record) => Some(record),
        Err(err) => {
            tracing::debug!(error = %err, "discarding undecodable cache entry");
            None
        }
    }
}
