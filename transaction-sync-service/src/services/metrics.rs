//! Prometheus metrics for transaction-sync-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for store operation duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "transaction_sync_db_query_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for ingested feed records by outcome.
pub static INGESTED_TRANSACTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "transaction_sync_ingested_total",
        "Feed transactions processed by outcome",
        &["outcome"]
    )
    .expect("Failed to register INGESTED_TRANSACTIONS")
});

/// Counter for merchant resolution by source.
pub static MATCH_RESOLUTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "transaction_sync_match_resolutions_total",
        "Merchant resolutions by source",
        &["source"]
    )
    .expect("Failed to register MATCH_RESOLUTIONS")
});

/// Counter for refund associations.
pub static REFUND_ASSOCIATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "transaction_sync_refund_associations_total",
        "Refund association attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to register REFUND_ASSOCIATIONS")
});

/// Counter for reward-network batch submissions.
pub static REWARD_BATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "transaction_sync_reward_batches_total",
        "Reward network batch submissions by outcome",
        &["outcome"]
    )
    .expect("Failed to register REWARD_BATCHES")
});

/// Counter for webhook signature checks.
pub static WEBHOOK_VERIFICATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "transaction_sync_webhook_verifications_total",
        "Webhook signature verifications by environment and outcome",
        &["environment", "outcome"]
    )
    .expect("Failed to register WEBHOOK_VERIFICATIONS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "transaction_sync_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&INGESTED_TRANSACTIONS);
    Lazy::force(&MATCH_RESOLUTIONS);
    Lazy::force(&REFUND_ASSOCIATIONS);
    Lazy::force(&REWARD_BATCHES);
    Lazy::force(&WEBHOOK_VERIFICATIONS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_ingested(outcome: &str, count: u64) {
    INGESTED_TRANSACTIONS
        .with_label_values(&[outcome])
        .inc_by(count as f64);
}

pub fn record_match_resolution(source: &str) {
    MATCH_RESOLUTIONS.with_label_values(&[source]).inc();
}

pub fn record_refund_association(outcome: &str) {
    REFUND_ASSOCIATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_reward_batch(outcome: &str) {
    REWARD_BATCHES.with_label_values(&[outcome]).inc();
}

pub fn record_webhook_verification(environment: &str, outcome: &str) {
    WEBHOOK_VERIFICATIONS
        .with_label_values(&[environment, outcome])
        .inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
