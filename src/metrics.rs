//! Prometheus metrics for the backplane.
//!
//! Metrics cover:
//! - Publishing (envelopes enqueued, delivery failures per topic)
//! - Consumption (envelopes consumed and skipped per consumer, batch latency)
//! - Chat state merges per field
//! - Rebalances and owned partitions per consumer
//! - Dedicated loop health
//! - Live session delivery outcomes
//!
//! All metrics are registered to a custom registry with the "backplane" prefix
//! so they never collide with metrics of the embedding process. Registration
//! errors fall back to an unregistered metric instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for backplane metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("backplane".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// Each macro expands to a Lazy static with safe registration:
//
//   define_gauge_vec!(MY_GAUGE, "my_metric", "Description", ["label1"]);
//   define_counter_vec!(MY_COUNTER, "my_metric", "Description", ["label1"]);
//   define_histogram_vec!(MY_HISTOGRAM, "my_metric", "Description", ["label"],
//       [0.001, 0.01, 0.1, 1.0]);

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Producer metrics
// =============================================================================

define_counter_vec!(
    ENVELOPES_PUBLISHED,
    "envelopes_published_total",
    "Total number of envelopes handed to the producer",
    ["topic"]
);
define_counter_vec!(
    DELIVERY_FAILURES,
    "delivery_failures_total",
    "Total number of envelopes the broker client failed to deliver",
    ["topic"]
);
define_counter!(
    PRODUCERS_CREATED,
    "producers_created_total",
    "Total number of producer instances created"
);

// =============================================================================
// Consumer metrics
// =============================================================================

define_counter_vec!(
    ENVELOPES_CONSUMED,
    "envelopes_consumed_total",
    "Total number of envelopes processed by a consumer loop",
    ["consumer"]
);
define_counter_vec!(
    ENVELOPES_SKIPPED,
    "envelopes_skipped_total",
    "Total number of undecodable records skipped by a consumer loop",
    ["consumer"]
);
define_counter_vec!(
    BATCHES_RETRIED,
    "batches_retried_total",
    "Total number of batches rewound for redelivery after a storage failure",
    ["consumer"]
);
define_histogram_vec!(
    BATCH_DURATION,
    "batch_duration_seconds",
    "Time to process and commit one polled batch",
    ["consumer"],
    [0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
);

// =============================================================================
// State metrics
// =============================================================================

define_counter_vec!(
    STATE_MERGES,
    "state_merges_total",
    "Total number of chat state merges applied",
    ["field"]
);

// =============================================================================
// Rebalance metrics
// =============================================================================

define_counter_vec!(
    REBALANCES,
    "rebalances_total",
    "Total number of partition assignment changes",
    ["consumer", "kind"]
);
define_gauge_vec!(
    OWNED_PARTITIONS,
    "owned_partitions",
    "Number of partitions currently assigned to a consumer",
    ["consumer"]
);

// =============================================================================
// Loop and session metrics
// =============================================================================

define_gauge_vec!(
    LOOP_HEALTHY,
    "loop_healthy",
    "Whether a dedicated consumer loop is running (1) or has stopped (0)",
    ["loop"]
);
define_counter_vec!(
    SESSIONS_DELIVERED,
    "sessions_delivered_total",
    "Outcome of forwarding an envelope to a live session",
    ["outcome"]
);

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("histogram opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Register every metric so that `/metrics` lists them before first use.
///
/// Idempotent.
pub fn init_metrics() {
    let _ = &*ENVELOPES_PUBLISHED;
    let _ = &*DELIVERY_FAILURES;
    let _ = &*PRODUCERS_CREATED;
    let _ = &*ENVELOPES_CONSUMED;
    let _ = &*ENVELOPES_SKIPPED;
    let _ = &*BATCHES_RETRIED;
    let _ = &*BATCH_DURATION;
    let _ = &*STATE_MERGES;
    let _ = &*REBALANCES;
    let _ = &*OWNED_PARTITIONS;
    let _ = &*LOOP_HEALTHY;
    let _ = &*SESSIONS_DELIVERED;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

pub fn record_published(topic: &str) {
    ENVELOPES_PUBLISHED.with_label_values(&[topic]).inc();
}

pub fn record_delivery_failure(topic: &str) {
    DELIVERY_FAILURES.with_label_values(&[topic]).inc();
}

pub fn record_producer_created() {
    PRODUCERS_CREATED.inc();
}

/// Record a processed batch of `count` envelopes.
pub fn record_batch(consumer: &str, count: usize, duration_secs: f64) {
    ENVELOPES_CONSUMED
        .with_label_values(&[consumer])
        .inc_by(count as u64);
    BATCH_DURATION
        .with_label_values(&[consumer])
        .observe(duration_secs);
}

pub fn record_skipped(consumer: &str) {
    ENVELOPES_SKIPPED.with_label_values(&[consumer]).inc();
}

pub fn record_batch_retry(consumer: &str) {
    BATCHES_RETRIED.with_label_values(&[consumer]).inc();
}

pub fn record_state_merge(field: &str) {
    STATE_MERGES.with_label_values(&[field]).inc();
}

/// Record an assignment change. `kind` is "assigned" or "revoked".
pub fn record_rebalance(consumer: &str, kind: &str) {
    REBALANCES.with_label_values(&[consumer, kind]).inc();
}

pub fn set_owned_partitions(consumer: &str, count: usize) {
    OWNED_PARTITIONS
        .with_label_values(&[consumer])
        .set(count as i64);
}

pub fn set_loop_healthy(loop_name: &str, healthy: bool) {
    LOOP_HEALTHY
        .with_label_values(&[loop_name])
        .set(if healthy { 1 } else { 0 });
}

/// Record a live session delivery. `outcome` is "delivered" or "no_session".
pub fn record_session_delivery(outcome: &str) {
    SESSIONS_DELIVERED.with_label_values(&[outcome]).inc();
}
