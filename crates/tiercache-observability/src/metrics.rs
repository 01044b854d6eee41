use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Remote Storage Metrics
    // ============================================================================

    /// Object-store requests by operation (one per attempt)
    pub static ref REMOTE_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tiercache_remote_requests_total", "Total remote object-store requests"),
        &["op"] // get, put, put_conditional, head, delete, list
    ).expect("metric can be created");

    /// Failed attempts by operation and failure kind
    pub static ref REMOTE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tiercache_remote_errors_total", "Total failed remote requests"),
        &["op", "kind"] // transient, not_found, permission, precondition, fatal
    ).expect("metric can be created");

    /// Retries scheduled after a transient failure
    pub static ref REMOTE_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tiercache_remote_retries_total", "Total remote request retries"),
        &["op"]
    ).expect("metric can be created");

    /// Per-attempt request latency
    pub static ref REMOTE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("tiercache_remote_latency_seconds", "Remote request latency in seconds")
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["op"]
    ).expect("metric can be created");

    // ============================================================================
    // Cache Metrics
    // ============================================================================

    /// Cache hits
    pub static ref CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "tiercache_cache_hits_total",
        "Total cache hits"
    ).expect("metric can be created");

    /// Cache misses
    pub static ref CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "tiercache_cache_misses_total",
        "Total cache misses"
    ).expect("metric can be created");

    /// Misses that joined a fetch already in flight
    pub static ref CACHE_FETCH_JOINS_TOTAL: IntCounter = IntCounter::new(
        "tiercache_cache_fetch_joins_total",
        "Total misses served by an in-flight fetch"
    ).expect("metric can be created");

    /// Entries evicted to stay under the byte budget
    pub static ref CACHE_EVICTIONS_TOTAL: IntCounter = IntCounter::new(
        "tiercache_cache_evictions_total",
        "Total cache evictions"
    ).expect("metric can be created");

    /// Checksum failures on cached or downloaded data
    pub static ref CACHE_INTEGRITY_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "tiercache_cache_integrity_failures_total",
        "Total checksum mismatches"
    ).expect("metric can be created");

    /// Cache size in bytes
    pub static ref CACHE_SIZE_BYTES: IntGauge = IntGauge::new(
        "tiercache_cache_size_bytes",
        "Current cache size in bytes"
    ).expect("metric can be created");

    /// Resident cache entries
    pub static ref CACHE_ENTRIES: IntGauge = IntGauge::new(
        "tiercache_cache_entries",
        "Number of resident cache entries"
    ).expect("metric can be created");

    // ============================================================================
    // Manifest & Reconciliation Metrics
    // ============================================================================

    /// Manifest stores rejected by the revision check
    pub static ref MANIFEST_CONFLICTS_TOTAL: IntCounter = IntCounter::new(
        "tiercache_manifest_conflicts_total",
        "Total manifest store conflicts"
    ).expect("metric can be created");

    /// Files removed by startup reconciliation
    pub static ref RECONCILE_REMOVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tiercache_reconcile_removed_total", "Total files removed during reconciliation"),
        &["reason"] // partial, orphaned, corrupt
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Remote storage metrics
        REGISTRY
            .register(Box::new(REMOTE_REQUESTS_TOTAL.clone()))
            .expect("remote_requests_total can be registered");
        REGISTRY
            .register(Box::new(REMOTE_ERRORS_TOTAL.clone()))
            .expect("remote_errors_total can be registered");
        REGISTRY
            .register(Box::new(REMOTE_RETRIES_TOTAL.clone()))
            .expect("remote_retries_total can be registered");
        REGISTRY
            .register(Box::new(REMOTE_LATENCY.clone()))
            .expect("remote_latency can be registered");

        // Cache metrics
        REGISTRY
            .register(Box::new(CACHE_HITS_TOTAL.clone()))
            .expect("cache_hits_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_MISSES_TOTAL.clone()))
            .expect("cache_misses_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_FETCH_JOINS_TOTAL.clone()))
            .expect("cache_fetch_joins_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_EVICTIONS_TOTAL.clone()))
            .expect("cache_evictions_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_INTEGRITY_FAILURES_TOTAL.clone()))
            .expect("cache_integrity_failures_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_SIZE_BYTES.clone()))
            .expect("cache_size_bytes can be registered");
        REGISTRY
            .register(Box::new(CACHE_ENTRIES.clone()))
            .expect("cache_entries can be registered");

        // Manifest metrics
        REGISTRY
            .register(Box::new(MANIFEST_CONFLICTS_TOTAL.clone()))
            .expect("manifest_conflicts_total can be registered");
        REGISTRY
            .register(Box::new(RECONCILE_REMOVED_TOTAL.clone()))
            .expect("reconcile_removed_total can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        // If no panic, registration succeeded
    }

    #[test]
    fn test_remote_metrics() {
        REMOTE_RETRIES_TOTAL.with_label_values(&["test-op"]).inc();
        REMOTE_ERRORS_TOTAL
            .with_label_values(&["test-op", "transient"])
            .inc_by(3);

        assert_eq!(REMOTE_RETRIES_TOTAL.with_label_values(&["test-op"]).get(), 1);
        assert_eq!(
            REMOTE_ERRORS_TOTAL
                .with_label_values(&["test-op", "transient"])
                .get(),
            3
        );
    }

    #[test]
    fn test_cache_gauges() {
        CACHE_ENTRIES.set(4);
        assert_eq!(CACHE_ENTRIES.get(), 4);
    }
}
