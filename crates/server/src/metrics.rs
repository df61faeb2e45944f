//! Prometheus metrics for the depot server.
//!
//! Request-level counters are incremented inline; cache and fetch internals
//! keep their own lock-free atomic counters, which are mirrored into gauges
//! when the endpoint is scraped.
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping
//! and should be network-restricted at the infrastructure level.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Inbound resource requests by kind and outcome.
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_requests_total",
            "Resource requests by kind and outcome",
        ),
        &["kind", "outcome"],
    )
    .expect("metric creation failed")
});

pub static PAYLOAD_BYTES_SERVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_payload_bytes_served_total",
        "Total payload bytes written to clients",
    )
    .expect("metric creation failed")
});

// Gauges mirrored from the cache and coordinator atomics at scrape time.

pub static PAYLOAD_BYTES_FETCHED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "depot_payload_bytes_fetched",
        "Total compressed bytes pulled from upstream storage servers",
    )
    .expect("metric creation failed")
});

pub static FETCH_HITS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("depot_fetch_hits", "Successful downloads since startup")
        .expect("metric creation failed")
});

pub static FETCH_FAILURES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("depot_fetch_failures", "Failed downloads since startup")
        .expect("metric creation failed")
});

pub static DOWNLOADS_INFLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("depot_downloads_inflight", "Download tasks currently running")
        .expect("metric creation failed")
});

pub static CACHE_RESIDENT_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("depot_cache_resident_bytes", "Bytes of committed cache entries")
        .expect("metric creation failed")
});

pub static CACHE_ENTRIES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("depot_cache_entries", "Number of committed cache entries")
        .expect("metric creation failed")
});

pub static CACHE_EVICTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("depot_cache_evictions", "Cache evictions since startup")
        .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent; safe to call from integration tests building several routers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PAYLOAD_BYTES_SERVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PAYLOAD_BYTES_FETCHED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FETCH_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FETCH_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DOWNLOADS_INFLIGHT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_RESIDENT_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_ENTRIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_EVICTIONS.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    PAYLOAD_BYTES_FETCHED.set(state.coordinator.bytes_fetched() as i64);
    FETCH_HITS.set(state.coordinator.fetch_hits() as i64);
    FETCH_FAILURES.set(state.coordinator.fetch_failures() as i64);
    DOWNLOADS_INFLIGHT.set(state.coordinator.downloads_inflight());
    CACHE_RESIDENT_BYTES.set(state.cache.resident_bytes() as i64);
    CACHE_ENTRIES.set(state.cache.entry_count() as i64);
    CACHE_EVICTIONS.set(state.cache.evictions() as i64);

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}
