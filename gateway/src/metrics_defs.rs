//! Metrics definitions for the gateway.

use shared::metrics_defs::{MetricDef, MetricType};

pub const TRANSLATION_CACHE_HIT: MetricDef = MetricDef {
    name: "translation_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of translation lookups served from the cache",
};

pub const TRANSLATION_CACHE_MISS: MetricDef = MetricDef {
    name: "translation_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of translation lookups that went to the upstream",
};

pub const KEY_POOL_RELOAD: MetricDef = MetricDef {
    name: "key_pool.reload",
    metric_type: MetricType::Counter,
    description: "Number of credential set loads from the key-value store",
};

pub const KEY_POOL_EVICTED: MetricDef = MetricDef {
    name: "key_pool.evicted",
    metric_type: MetricType::Counter,
    description: "Number of credentials evicted after upstream rejection",
};

pub const UPSTREAM_REQUEST_DURATION: MetricDef = MetricDef {
    name: "upstream.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete one upstream attempt in seconds",
};

pub const RETRY_EXHAUSTED: MetricDef = MetricDef {
    name: "retry.exhausted",
    metric_type: MetricType::Counter,
    description: "Number of requests that ran out of retry attempts",
};

pub const BREAKER_OPENED: MetricDef = MetricDef {
    name: "breaker.opened",
    metric_type: MetricType::Counter,
    description: "Number of circuit breaker transitions to open",
};

pub const BREAKER_REJECTED: MetricDef = MetricDef {
    name: "breaker.rejected",
    metric_type: MetricType::Counter,
    description: "Number of calls rejected by an open circuit breaker",
};

pub const COALESCER_JOINED: MetricDef = MetricDef {
    name: "coalescer.joined",
    metric_type: MetricType::Counter,
    description: "Number of requests that joined an identical in-flight request",
};

pub const TRANSLATE_BATCH_SIZE: MetricDef = MetricDef {
    name: "translate.batch_size",
    metric_type: MetricType::Histogram,
    description: "Number of texts per translate request",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    TRANSLATION_CACHE_HIT,
    TRANSLATION_CACHE_MISS,
    KEY_POOL_RELOAD,
    KEY_POOL_EVICTED,
    UPSTREAM_REQUEST_DURATION,
    RETRY_EXHAUSTED,
    BREAKER_OPENED,
    BREAKER_REJECTED,
    COALESCER_JOINED,
    TRANSLATE_BATCH_SIZE,
];
