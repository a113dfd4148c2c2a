//! Prometheus metrics for estimation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Revisions by document kind and outcome (committed, invalid, conflict, failed).
pub static REVISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "estimation_revisions_total",
        "Total number of document revisions attempted",
        &["document_kind", "outcome"]
    )
    .expect("Failed to register revisions_total")
});

/// Validation violations by kind.
pub static VIOLATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "estimation_violations_total",
        "Total number of validation violations reported",
        &["kind"]
    )
    .expect("Failed to register violations_total")
});

/// Ledger postings by entry type; duplicates absorbed by idempotency are
/// counted with outcome "skipped".
pub static LEDGER_POSTINGS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "estimation_ledger_postings_total",
        "Total number of ledger postings",
        &["entry_type", "outcome"]
    )
    .expect("Failed to register ledger_postings_total")
});

/// Overpayment checks that found an excess.
pub static OVERPAYMENTS_DETECTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "estimation_overpayments_detected_total",
        "Total number of overpayment warnings raised",
        &["source"]
    )
    .expect("Failed to register overpayments_detected")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "estimation_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "estimation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&REVISIONS_TOTAL);
    Lazy::force(&VIOLATIONS_TOTAL);
    Lazy::force(&LEDGER_POSTINGS_TOTAL);
    Lazy::force(&OVERPAYMENTS_DETECTED);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

pub fn record_revision(document_kind: &str, outcome: &str) {
    REVISIONS_TOTAL
        .with_label_values(&[document_kind, outcome])
        .inc();
}

pub fn record_ledger_posting(entry_type: &str, outcome: &str) {
    LEDGER_POSTINGS_TOTAL
        .with_label_values(&[entry_type, outcome])
        .inc();
}
