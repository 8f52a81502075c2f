//! Translation batch engine: dedup, cache probe, bounded fan-out through
//! the retry executor, order-preserving assembly.

use crate::config::UpstreamConfig;
use crate::errors::GatewayError;
use crate::keypool::{KeyPool, KeySet};
use crate::metrics_defs::TRANSLATE_BATCH_SIZE;
use crate::retry::{OutboundRequest, RetryExecutor, validate_json_response};
use crate::translation_cache::{TranslationCache, TranslationRecord};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method};
use serde_json::Value;
use shared::histogram;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Clone)]
pub struct TranslationEngine {
    cache: Arc<TranslationCache>,
    pool: Arc<KeyPool>,
    executor: Arc<RetryExecutor>,
    limiter: Arc<Semaphore>,
    upstream: Arc<UpstreamConfig>,
}

impl TranslationEngine {
    pub fn new(
        cache: Arc<TranslationCache>,
        pool: Arc<KeyPool>,
        executor: Arc<RetryExecutor>,
        upstream: Arc<UpstreamConfig>,
        parallel_limit: usize,
    ) -> Self {
        TranslationEngine {
            cache,
            pool,
            executor,
            limiter: Arc::new(Semaphore::new(parallel_limit.max(1))),
            upstream,
        }
    }

    /// Translates `texts` into `target_lang`, returning one record per
    /// input in input order. Duplicate inputs are translated once; cache
    /// misses fan out concurrently up to the parallel limit. A text whose
    /// translation fails falls back to the original input; only an empty
    /// credential pool fails the whole batch.
    pub async fn translate_batch(
        &self,
        texts: &[String],
        target_lang: &str,
        source_lang: Option<&str>,
        request_id: &str,
    ) -> Result<Vec<TranslationRecord>, GatewayError> {
        histogram!(TRANSLATE_BATCH_SIZE).record(texts.len() as f64);

        // Dedup preserving first occurrence.
        let mut unique_texts: Vec<String> = Vec::new();
        let mut text_to_indices: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, text) in texts.iter().enumerate() {
            text_to_indices
                .entry(text.clone())
                .or_insert_with(|| {
                    unique_texts.push(text.clone());
                    Vec::new()
                })
                .push(index);
        }

        let mut translations = self
            .cache
            .get_batch(&unique_texts, source_lang, target_lang)
            .await;

        let misses: Vec<String> = unique_texts
            .iter()
            .filter(|text| !translations.contains_key(*text))
            .cloned()
            .collect();

        tracing::debug!(
            request_id,
            total = texts.len(),
            unique = unique_texts.len(),
            misses = misses.len(),
            "translating batch"
        );

        let mut join_set = JoinSet::new();
        for text in misses {
            let engine = self.clone();
            let target = target_lang.to_string();
            let source = source_lang.map(str::to_string);
            let request_id = request_id.to_string();
            join_set.spawn(async move {
                let _permit = engine.limiter.clone().acquire_owned().await;
                let result = engine
                    .translate_one(&text, &target, source.as_deref(), &request_id)
                    .await;
                (text, result)
            });
        }

        let mut fresh: Vec<(String, TranslationRecord)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((text, Ok(record))) => fresh.push((text, record)),
                // A response that arrived but was unusable degrades to the
                // original text; pipeline-level failures (no credentials,
                // open circuit, pure timeouts) fail the whole batch.
                Ok((text, Err(err @ (GatewayError::UpstreamStatus(_) | GatewayError::UpstreamInvalidBody(_))))) => {
                    tracing::warn!(
                        request_id,
                        error = %err,
                        "translation failed, returning original text"
                    );
                    translations.insert(text.clone(), failure_record(&text, source_lang));
                }
                Ok((_, Err(err))) => return Err(err),
                Err(join_err) => {
                    tracing::error!(request_id, error = %join_err, "translation task panicked");
                }
            }
        }

        // Persist fresh translations without blocking the response.
        if !fresh.is_empty() {
            for (text, record) in &fresh {
                translations.insert(text.clone(), record.clone());
            }
            let cache = self.cache.clone();
            let source = source_lang.map(str::to_string);
            let target = target_lang.to_string();
            tokio::spawn(async move {
                cache.put_batch(&fresh, source.as_deref(), &target).await;
            });
        }

        // Ordered assembly: place each unique text's record at every
        // position it occupied in the input.
        let mut output: Vec<Option<TranslationRecord>> = vec![None; texts.len()];
        for (text, indices) in &text_to_indices {
            let record = translations
                .get(text)
                .cloned()
                .unwrap_or_else(|| failure_record(text, source_lang));
            for &index in indices {
                output[index] = Some(record.clone());
            }
        }

        Ok(output
            .into_iter()
            .zip(texts)
            .map(|(record, text)| record.unwrap_or_else(|| failure_record(text, source_lang)))
            .collect())
    }

    /// Translates one text through the retry executor, probing the cache
    /// first.
    async fn translate_one(
        &self,
        text: &str,
        target_lang: &str,
        source_lang: Option<&str>,
        request_id: &str,
    ) -> Result<TranslationRecord, GatewayError> {
        if let Some(record) = self.cache.get(text, source_lang, target_lang).await {
            return Ok(record);
        }

        let prompt = match source_lang {
            Some(source) if source != "auto" => {
                format!("Translate from {source} to {target_lang}: \"{text}\"")
            }
            _ => format!("Translate to {target_lang}: \"{text}\""),
        };
        let payload = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "system_instruction": { "parts": [{ "text": self.upstream.system_instruction }] },
        });
        let body = Bytes::from(
            serde_json::to_vec(&payload).map_err(|e| GatewayError::Internal(e.to_string()))?,
        );

        let url = self
            .upstream
            .generate_content_url()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let build = move |credential: &str| {
            let mut url = url.clone();
            url.query_pairs_mut().append_pair("key", credential);
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            OutboundRequest {
                method: Method::POST,
                url,
                headers,
                body: Some(body.clone()),
            }
        };

        let response = self
            .executor
            .execute(
                &self.pool.source(KeySet::GeminiApi),
                build,
                &validate_json_response,
                request_id,
            )
            .await?;

        let Some(response) = response else {
            return Err(GatewayError::Internal(
                "upstream produced no response".to_string(),
            ));
        };
        if !response.is_ok() {
            return Err(GatewayError::UpstreamStatus(response.status.as_u16()));
        }

        let payload = response
            .json()
            .ok_or_else(|| GatewayError::UpstreamInvalidBody("not JSON".to_string()))?;
        let translated = payload
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GatewayError::UpstreamInvalidBody("no text candidate in response".to_string())
            })?
            .trim()
            .to_string();

        Ok(TranslationRecord {
            detected_source_lang: source_lang.unwrap_or("auto").to_string(),
            text: translated,
        })
    }
}

fn failure_record(text: &str, source_lang: Option<&str>) -> TranslationRecord {
    TranslationRecord {
        detected_source_lang: source_lang.unwrap_or("unknown").to_string(),
        text: text.to_string(),
    }
}
