//! Prometheus metrics exposition
//!
//! Gateway-level series, next to the `genai_dispatch_*` counters emitted by
//! the dispatch crate:
//!
//! - `genai_requests_total` (counter): labels `endpoint`, `status`
//! - `genai_request_duration_seconds` (histogram): label `endpoint`
//! - `genai_pool_credentials` (gauge): label `state`, refreshed on scrape

use anyhow::Context;
use credential_pool::PoolStats;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "genai_request_duration_seconds";

/// Calls can wait out cooldowns and run for minutes; buckets reach 5 min.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .context("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a finished API request.
pub fn record_request(endpoint: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("genai_requests_total", "endpoint" => endpoint, "status" => status.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "endpoint" => endpoint).record(duration_secs);
}

/// Publish credential counts per state.
pub fn record_pool(stats: &PoolStats) {
    let states = [
        ("available", stats.available),
        ("cooling_down", stats.cooling_down),
        ("exhausted", stats.exhausted),
        ("dead", stats.dead),
    ];
    for (state, count) in states {
        metrics::gauge!("genai_pool_credentials", "state" => state).set(count as f64);
    }
}
