// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Emits through the `metrics` facade; the host application installs the
//! exporter (Prometheus or otherwise).
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `tenant_cache_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a primary/secondary cache lookup.
pub fn record_cache_lookup(entry: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("tenant_cache_lookups_total", "entry" => entry, "result" => result).increment(1);
}

/// Record a swallowed store error on the KV path.
pub fn record_store_error(operation: &'static str, kind: &'static str) {
    counter!("tenant_cache_store_errors_total", "operation" => operation, "kind" => kind)
        .increment(1);
}

/// Record store round-trip latency.
pub fn record_store_latency(operation: &'static str, duration: Duration) {
    histogram!("tenant_cache_store_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record the outcome of one indexer during a sync.
pub fn record_index_outcome(platform: &str, outcome: &'static str) {
    counter!(
        "tenant_cache_index_writes_total",
        "platform" => platform.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a repository fallback read.
pub fn record_repository_read(kind: &'static str, found: bool) {
    let result = if found { "found" } else { "not_found" };
    counter!("tenant_cache_repository_reads_total", "kind" => kind, "result" => result)
        .increment(1);
}

/// Record a background repopulation job outcome.
pub fn record_repopulation(outcome: &'static str) {
    counter!("tenant_cache_repopulations_total", "outcome" => outcome).increment(1);
}

/// Gauge for background jobs queued or running.
pub fn set_repopulation_in_flight(count: usize) {
    gauge!("tenant_cache_repopulation_in_flight").set(count as f64);
}

/// Record messages read by a consumer.
pub fn record_stream_read(stream: &str, pending: bool, count: usize) {
    let mode = if pending { "pending" } else { "new" };
    counter!(
        "tenant_cache_stream_messages_read_total",
        "stream" => stream.to_string(),
        "mode" => mode
    )
    .increment(count as u64);
}

/// Record messages acknowledged.
pub fn record_stream_ack(stream: &str, count: u64) {
    counter!("tenant_cache_stream_messages_acked_total", "stream" => stream.to_string())
        .increment(count);
}

/// Record how far behind the stream head a message was when handled.
pub fn record_stream_lag(stream: &str, lag_ms: u64) {
    histogram!("tenant_cache_stream_lag_seconds", "stream" => stream.to_string())
        .record(lag_ms as f64 / 1000.0);
}

/// Record a handler failure (message left pending).
pub fn record_handler_failure(stream: &str) {
    counter!("tenant_cache_stream_handler_failures_total", "stream" => stream.to_string())
        .increment(1);
}

/// Record a pub/sub publish.
pub fn record_publish(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("tenant_cache_publishes_total", "status" => status).increment(1);
}

/// Record store connection state.
pub fn set_store_connected(connected: bool) {
    gauge!("tenant_cache_store_connected").set(if connected { 1.0 } else { 0.0 });
}
