//! Prometheus Metrics
//!
//! Process-wide collectors for probe outcomes, the current storage mode,
//! deduplication effectiveness and orchestrator operations. Exposed by the
//! `/metrics` server in the binary.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge,
};

use crate::domain::events::TransitionTrigger;
use crate::domain::ports::StorageMode;

static STORAGE_MODE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "cardstor_storage_mode",
        "Current storage mode (0=full, 1=fallback, 2=local_only)"
    )
    .expect("metric registration")
});

static PROBE_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cardstor_probe_results_total",
        "Backend health probe outcomes",
        &["backend", "outcome"]
    )
    .expect("metric registration")
});

static MODE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cardstor_mode_transitions_total",
        "Storage mode transitions by trigger",
        &["trigger"]
    )
    .expect("metric registration")
});

static DEDUP_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cardstor_dedup_lookups_total",
        "Resource deduplication lookups by result",
        &["result"]
    )
    .expect("metric registration")
});

static TEMPLATE_OPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cardstor_template_operations_total",
        "Template operations by kind and status",
        &["operation", "status"]
    )
    .expect("metric registration")
});

/// Record one backend probe outcome.
pub fn record_probe(backend: &str, available: bool) {
    let outcome = if available { "up" } else { "down" };
    PROBE_RESULTS.with_label_values(&[backend, outcome]).inc();
}

/// Publish the mode now in effect.
pub fn set_mode(mode: StorageMode) {
    STORAGE_MODE.set(i64::from(mode.as_u8()));
}

/// Record a mode transition.
pub fn record_transition(trigger: TransitionTrigger) {
    MODE_TRANSITIONS
        .with_label_values(&[&trigger.to_string()])
        .inc();
}

/// Record a dedup lookup result (`hit`, `miss`, `migrated`).
pub fn record_dedup(result: &str) {
    DEDUP_LOOKUPS.with_label_values(&[result]).inc();
}

/// Record a template operation outcome.
pub fn record_template_op(operation: &str, success: bool) {
    let status = if success { "ok" } else { "error" };
    TEMPLATE_OPS.with_label_values(&[operation, status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record_without_panic() {
        record_probe("metadata-store", true);
        record_probe("object-store", false);
        set_mode(StorageMode::Fallback);
        record_transition(TransitionTrigger::Auto);
        record_dedup("hit");
        record_template_op("save", true);
    }
}
