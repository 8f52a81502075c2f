//! Common types for metrics definitions.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

/// Renders metric definitions as a markdown table, for the CLI and docs.
pub fn render_metrics_table(metrics: &[MetricDef]) -> String {
    let mut lines = vec![
        "| Metric | Type | Description |".to_string(),
        "|--------|------|-------------|".to_string(),
    ];
    for m in metrics {
        lines.push(format!(
            "| `{}` | {} | {} |",
            m.name,
            m.metric_type.as_str(),
            m.description
        ));
    }
    lines.join("\n")
}
