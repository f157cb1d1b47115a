//! Metrics module for entitlements-service.
//! Prometheus statics for billing and AI usage, plus the `metrics` recorder
//! that the HTTP middleware writes to.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;
use tracing::warn;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "entitlements_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Entitlement resolutions by winning source
pub static RESOLUTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Entitlement cache lookups
pub static CACHE_LOOKUPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Stripe webhook events by type and outcome
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// AI chat requests by outcome
pub static CHAT_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// AI tokens by tenant and direction
pub static AI_TOKENS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

static RECORDER_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    RECORDER_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            warn!(error = %e, "Metrics recorder already installed");
        }
        handle
    });

    RESOLUTIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlements_resolutions_total",
                "Entitlement resolutions by source"
            ),
            &["source"]
        )
        .expect("Failed to register RESOLUTIONS_TOTAL")
    });

    CACHE_LOOKUPS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlements_cache_lookups_total",
                "Entitlement cache lookups by result"
            ),
            &["result"]
        )
        .expect("Failed to register CACHE_LOOKUPS_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlements_webhook_events_total",
                "Stripe webhook events by type and outcome"
            ),
            &["event_type", "outcome"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    CHAT_REQUESTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("entitlements_chat_requests_total", "AI chat requests by outcome"),
            &["outcome"]
        )
        .expect("Failed to register CHAT_REQUESTS_TOTAL")
    });

    AI_TOKENS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlements_ai_tokens_total",
                "AI tokens by tenant and direction"
            ),
            &["tenant_id", "direction"]
        )
        .expect("Failed to register AI_TOKENS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("entitlements_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Both registries in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
    }
    let mut output = String::from_utf8_lossy(&buffer).into_owned();
    if let Some(handle) = RECORDER_HANDLE.get() {
        output.push_str(&handle.render());
    }
    output
}

pub fn record_resolution(source: &str) {
    if let Some(counter) = RESOLUTIONS_TOTAL.get() {
        counter.with_label_values(&[source]).inc();
    }
}

pub fn record_cache_lookup(hit: bool) {
    if let Some(counter) = CACHE_LOOKUPS_TOTAL.get() {
        counter
            .with_label_values(&[if hit { "hit" } else { "miss" }])
            .inc();
    }
}

pub fn record_webhook_event(event_type: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type, outcome]).inc();
    }
}

pub fn record_chat_request(outcome: &str) {
    if let Some(counter) = CHAT_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_ai_tokens(tenant_id: &str, input_tokens: i64, output_tokens: i64) {
    if let Some(counter) = AI_TOKENS_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, "input"])
            .inc_by(input_tokens.max(0) as u64);
        counter
            .with_label_values(&[tenant_id, "output"])
            .inc_by(output_tokens.max(0) as u64);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
