pub mod http;
pub mod metrics_defs;

/// Increment-style access to a [`metrics_defs::MetricDef`] counter.
///
/// `counter!(CACHE_HIT).increment(1)` or with labels:
/// `counter!(CACHE_HIT, "set" => name).increment(1)`.
#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        ::metrics::counter!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        ::metrics::counter!($def.name, $($label => $value),+)
    };
}

/// Histogram access to a [`metrics_defs::MetricDef`].
#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        ::metrics::histogram!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        ::metrics::histogram!($def.name, $($label => $value),+)
    };
}
