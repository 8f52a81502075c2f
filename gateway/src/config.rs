use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub listener: Listener,
    pub kv: KvConfig,
    pub upstream: UpstreamConfig,
    pub limits: Limits,
    pub breaker: BreakerSettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Connection settings for the shared key-value service. Both fields must
/// be present for the store to be usable; otherwise every operation
/// degrades to an unavailable error.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct KvConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_version: String,
    pub model: String,
    pub system_instruction: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            api_version: "v1beta".to_string(),
            model: "gemini-1.5-flash".to_string(),
            system_instruction: "You are a professional translation engine. \
                                 Reply with the translated text only, without \
                                 explanations or quotes."
                .to_string(),
        }
    }
}

impl UpstreamConfig {
    /// URL of the generateContent endpoint, without the key query parameter.
    pub fn generate_content_url(&self) -> Result<url::Url, url::ParseError> {
        format!(
            "{}/{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.api_version,
            self.model
        )
        .parse()
    }

    /// Base URL for passthrough forwarding, without a trailing slash.
    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Limits {
    pub max_retries: usize,
    pub cache_duration_secs: u64,
    pub translation_cache_ttl_secs: u64,
    pub key_cache_size: usize,
    pub request_timeout_ms: u64,
    pub parallel_translation_limit: usize,
    /// Reserved inter-batch delay; accepted but currently unused.
    pub batch_delay_ms: u64,
    pub request_dedup_ttl_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_retries: 20,
            cache_duration_secs: 600,
            translation_cache_ttl_secs: 86_400,
            key_cache_size: 1_000,
            request_timeout_ms: 20_000,
            parallel_translation_limit: 10,
            batch_delay_ms: 50,
            request_dedup_ttl_ms: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        BreakerSettings {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_secs: 60,
        }
    }
}
