// Numan Thabit 2025
//! Prometheus registry and instrument handles.

use once_cell::sync::Lazy;
use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder,
};
use thiserror::Error;

static METRICS_ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

/// Failure to render the exposition text.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The prometheus encoder rejected the gathered families.
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),
    /// Encoded output was not valid UTF-8.
    #[error("metrics output not utf8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Cloneable handle to every instrument the engine records.
#[derive(Clone)]
pub struct TelemetryMetrics {
    registry: Registry,
    provider_requests: IntCounterVec,
    provider_latency: HistogramVec,
    provider_fallbacks: IntCounterVec,
    blocks_ingested: IntCounter,
    slots_skipped: IntCounter,
    slot_fetch_failures: IntCounter,
    decode_failures: IntCounterVec,
    epoch_lookups: IntCounterVec,
    epoch_fetch_failures: IntCounter,
    history_writes: IntCounter,
    history_evictions: IntCounter,
    stream_batches: IntCounter,
    stream_dropped: IntCounter,
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryMetrics {
    /// Build a fresh registry with all instruments registered.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("solana_telemetry".into()), None)
            .expect("failed to create registry");

        let provider_requests = IntCounterVec::new(
            opts!(
                "provider_requests_total",
                "Upstream JSON-RPC attempts by endpoint role and outcome"
            ),
            &["role", "outcome"],
        )
        .expect("failed to build provider request counter");

        let provider_latency = HistogramVec::new(
            HistogramOpts::new(
                "provider_latency_seconds",
                "Upstream JSON-RPC round-trip latency per endpoint role",
            )
            .buckets(vec![
                0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0,
            ]),
            &["role"],
        )
        .expect("failed to build provider latency histogram");

        let provider_fallbacks = IntCounterVec::new(
            opts!(
                "provider_fallbacks_total",
                "Calls that had to be retried against the fallback endpoint"
            ),
            &["method"],
        )
        .expect("failed to build fallback counter");

        let blocks_ingested = IntCounter::with_opts(opts!(
            "blocks_ingested_total",
            "Blocks folded into the session accumulator"
        ))
        .expect("failed to build blocks counter");

        let slots_skipped = IntCounter::with_opts(opts!(
            "slots_skipped_total",
            "Slots the upstream reported as skipped or unavailable"
        ))
        .expect("failed to build skipped counter");

        let slot_fetch_failures = IntCounter::with_opts(opts!(
            "slot_fetch_failures_total",
            "Per-slot fetches dropped from a cycle after failing"
        ))
        .expect("failed to build slot failure counter");

        let decode_failures = IntCounterVec::new(
            opts!(
                "decode_failures_total",
                "Units dropped because their raw payload could not be decoded"
            ),
            &["unit"],
        )
        .expect("failed to build decode failure counter");

        let epoch_lookups = IntCounterVec::new(
            opts!(
                "epoch_cache_lookups_total",
                "Epoch aggregate cache lookups by result"
            ),
            &["result"],
        )
        .expect("failed to build epoch lookup counter");

        let epoch_fetch_failures = IntCounter::with_opts(opts!(
            "epoch_fetch_failures_total",
            "Epoch aggregate fetches that failed upstream"
        ))
        .expect("failed to build epoch failure counter");

        let history_writes = IntCounter::with_opts(opts!(
            "history_rows_written_total",
            "Block aggregates written to the historical store"
        ))
        .expect("failed to build history write counter");

        let history_evictions = IntCounter::with_opts(opts!(
            "history_rows_evicted_total",
            "Block aggregates removed by the retention sweep"
        ))
        .expect("failed to build history eviction counter");

        let stream_batches = IntCounter::with_opts(opts!(
            "stream_batches_flushed_total",
            "Update batches published to stream subscribers"
        ))
        .expect("failed to build stream batch counter");

        let stream_dropped = IntCounter::with_opts(opts!(
            "stream_items_dropped_total",
            "Updates dropped because the stream buffer was full"
        ))
        .expect("failed to build stream drop counter");

        registry
            .register(Box::new(provider_requests.clone()))
            .expect("register provider_requests");
        registry
            .register(Box::new(provider_latency.clone()))
            .expect("register provider_latency");
        registry
            .register(Box::new(provider_fallbacks.clone()))
            .expect("register provider_fallbacks");
        registry
            .register(Box::new(blocks_ingested.clone()))
            .expect("register blocks_ingested");
        registry
            .register(Box::new(slots_skipped.clone()))
            .expect("register slots_skipped");
        registry
            .register(Box::new(slot_fetch_failures.clone()))
            .expect("register slot_fetch_failures");
        registry
            .register(Box::new(decode_failures.clone()))
            .expect("register decode_failures");
        registry
            .register(Box::new(epoch_lookups.clone()))
            .expect("register epoch_lookups");
        registry
            .register(Box::new(epoch_fetch_failures.clone()))
            .expect("register epoch_fetch_failures");
        registry
            .register(Box::new(history_writes.clone()))
            .expect("register history_writes");
        registry
            .register(Box::new(history_evictions.clone()))
            .expect("register history_evictions");
        registry
            .register(Box::new(stream_batches.clone()))
            .expect("register stream_batches");
        registry
            .register(Box::new(stream_dropped.clone()))
            .expect("register stream_dropped");

        Self {
            registry,
            provider_requests,
            provider_latency,
            provider_fallbacks,
            blocks_ingested,
            slots_skipped,
            slot_fetch_failures,
            decode_failures,
            epoch_lookups,
            epoch_fetch_failures,
            history_writes,
            history_evictions,
            stream_batches,
            stream_dropped,
        }
    }

    /// Record one upstream attempt.
    pub fn record_provider_attempt(&self, role: &str, outcome: &str, latency: f64) {
        self.provider_requests
            .with_label_values(&[role, outcome])
            .inc();
        self.provider_latency
            .with_label_values(&[role])
            .observe(latency);
    }

    /// Count a call that fell through to the fallback endpoint.
    pub fn inc_fallback(&self, method: &str) {
        self.provider_fallbacks.with_label_values(&[method]).inc();
    }

    /// Count a block folded into the session.
    pub fn inc_blocks_ingested(&self) {
        self.blocks_ingested.inc();
    }

    /// Count a slot the upstream had no block for.
    pub fn inc_slots_skipped(&self) {
        self.slots_skipped.inc();
    }

    /// Count a slot dropped from a fetch cycle.
    pub fn inc_slot_fetch_failure(&self) {
        self.slot_fetch_failures.inc();
    }

    /// Count undecodable units (`block` or `transaction`).
    pub fn add_decode_failures(&self, unit: &str, count: u64) {
        if count > 0 {
            self.decode_failures.with_label_values(&[unit]).inc_by(count);
        }
    }

    /// Record epoch cache hits and misses for one batch.
    pub fn record_epoch_lookups(&self, hits: u64, misses: u64) {
        self.epoch_lookups.with_label_values(&["hit"]).inc_by(hits);
        self.epoch_lookups.with_label_values(&["miss"]).inc_by(misses);
    }

    /// Count a failed epoch fetch.
    pub fn inc_epoch_fetch_failure(&self) {
        self.epoch_fetch_failures.inc();
    }

    /// Record a historical write and the rows its sweep removed.
    pub fn record_history_write(&self, evicted: u64) {
        self.history_writes.inc();
        self.history_evictions.inc_by(evicted);
    }

    /// Count a flushed stream batch.
    pub fn inc_stream_batches(&self) {
        self.stream_batches.inc();
    }

    /// Count updates dropped by a full stream buffer.
    pub fn add_stream_dropped(&self, count: u64) {
        self.stream_dropped.inc_by(count);
    }

    /// Render the registry in the text exposition format.
    pub fn gather(&self) -> Result<String, MetricsError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::with_capacity(8192);
        METRICS_ENCODER.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
