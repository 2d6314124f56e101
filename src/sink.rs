//! Metrics sinks.
//!
//! Every observed handle is given a [`MetricsSink`]. [`MetricsRecorderSink`]
//! forwards to whatever recorder is installed for the `metrics` crate (for
//! example a Prometheus exporter); [`InMemorySink`] keeps samples in memory.

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use parking_lot::Mutex;

/// Connection pool statistics at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: u64,
    pub in_use: u64,
    pub open: u64,
    /// Total number of connections waited for.
    pub wait_count: u64,
    /// Total time blocked waiting for a new connection.
    pub wait_duration: Duration,
    pub max_idle_closed: u64,
    pub max_idle_time_closed: u64,
    pub max_lifetime_closed: u64,
}

impl PoolStats {
    /// `sql_connections` gauge values by `state` label.
    pub fn states(&self) -> [(&'static str, u64); 3] {
        [("idle", self.idle), ("inuse", self.in_use), ("open", self.open)]
    }

    /// `sql_connections_counters` gauge values by `counter` label.
    pub fn counters(&self) -> [(&'static str, u64); 5] {
        [
            ("wait_count", self.wait_count),
            ("wait_ms", self.wait_duration.as_millis() as u64),
            ("max_idle_closed", self.max_idle_closed),
            ("max_idle_time_closed", self.max_idle_time_closed),
            ("max_lifetime_closed", self.max_lifetime_closed),
        ]
    }
}

/// Destination for query latency, error and pool metrics.
pub trait MetricsSink: Send + Sync + Debug {
    /// Record one latency sample, labelled by operation kind and handle id.
    fn record_query(&self, operation: &str, id: &str, elapsed_ms: u64);

    /// Count one error for the handle id.
    fn record_error(&self, id: &str);

    /// Publish a pool statistics sample for the handle id.
    fn record_pool_stats(&self, id: &str, stats: &PoolStats);
}

pub const QUERIES_HISTOGRAM: &str = "sql_queries";
pub const ERRORS_COUNTER: &str = "sql_errors";
pub const CONNECTIONS_GAUGE: &str = "sql_connections";
pub const CONNECTION_COUNTERS_GAUGE: &str = "sql_connections_counters";

/// Register metric descriptions with the installed recorder.
///
/// Safe to call more than once.
pub fn describe_metrics() {
    describe_histogram!(
        QUERIES_HISTOGRAM,
        metrics::Unit::Milliseconds,
        "Time in milliseconds queries take"
    );
    describe_counter!(ERRORS_COUNTER, "Errors returned by the database, excluding no rows");
    describe_gauge!(
        CONNECTIONS_GAUGE,
        "How many connections the pool holds and what state they are in"
    );
    describe_gauge!(
        CONNECTION_COUNTERS_GAUGE,
        "Pool counters: wait_count, wait_ms, max_idle_closed, max_idle_time_closed, max_lifetime_closed"
    );
}

/// Sink backed by the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorderSink;

impl MetricsSink for MetricsRecorderSink {
    fn record_query(&self, operation: &str, id: &str, elapsed_ms: u64) {
        histogram!(
            QUERIES_HISTOGRAM,
            "operation" => operation.to_string(),
            "id" => id.to_string(),
        )
        .record(elapsed_ms as f64);
    }

    fn record_error(&self, id: &str) {
        counter!(ERRORS_COUNTER, "id" => id.to_string()).increment(1);
    }

    fn record_pool_stats(&self, id: &str, stats: &PoolStats) {
        for (state, value) in stats.states() {
            gauge!(CONNECTIONS_GAUGE, "state" => state, "id" => id.to_string()).set(value as f64);
        }
        for (name, value) in stats.counters() {
            gauge!(CONNECTION_COUNTERS_GAUGE, "counter" => name, "id" => id.to_string())
                .set(value as f64);
        }
    }
}

/// Sink that keeps everything in memory, mainly for tests.
#[derive(Debug, Default)]
pub struct InMemorySink {
    recorded: Mutex<Recorded>,
}

#[derive(Debug, Default)]
struct Recorded {
    queries: Vec<QuerySample>,
    errors: HashMap<String, u64>,
    pools: HashMap<String, PoolStats>,
    pool_samples: u64,
}

/// One latency sample held by [`InMemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySample {
    pub operation: String,
    pub id: String,
    pub elapsed_ms: u64,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queries(&self) -> Vec<QuerySample> {
        self.recorded.lock().queries.clone()
    }

    /// Latency samples for one `{operation, id}` label set.
    pub fn query_samples(&self, operation: &str, id: &str) -> Vec<u64> {
        self.recorded
            .lock()
            .queries
            .iter()
            .filter(|sample| sample.operation == operation && sample.id == id)
            .map(|sample| sample.elapsed_ms)
            .collect()
    }

    pub fn error_count(&self, id: &str) -> u64 {
        self.recorded.lock().errors.get(id).copied().unwrap_or(0)
    }

    /// Latest pool sample for the id.
    pub fn pool_stats(&self, id: &str) -> Option<PoolStats> {
        self.recorded.lock().pools.get(id).copied()
    }

    /// Number of pool samples received across all ids.
    pub fn pool_samples(&self) -> u64 {
        self.recorded.lock().pool_samples
    }
}

impl MetricsSink for InMemorySink {
    fn record_query(&self, operation: &str, id: &str, elapsed_ms: u64) {
        self.recorded.lock().queries.push(QuerySample {
            operation: operation.to_string(),
            id: id.to_string(),
            elapsed_ms,
        });
    }

    fn record_error(&self, id: &str) {
        *self.recorded.lock().errors.entry(id.to_string()).or_default() += 1;
    }

    fn record_pool_stats(&self, id: &str, stats: &PoolStats) {
        let mut recorded = self.recorded.lock();
        recorded.pools.insert(id.to_string(), *stats);
        recorded.pool_samples += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stat_labels() {
        let stats = PoolStats {
            idle: 2,
            in_use: 3,
            open: 5,
            wait_duration: Duration::from_millis(1500),
            ..PoolStats::default()
        };
        assert_eq!(stats.states(), [("idle", 2), ("inuse", 3), ("open", 5)]);
        assert_eq!(stats.counters()[1], ("wait_ms", 1500));
    }

    #[test]
    fn test_in_memory_sink() {
        let sink = InMemorySink::new();
        sink.record_query("exec", "primary", 12);
        sink.record_query("query", "primary", 4);
        sink.record_query("exec", "replica", 1);
        sink.record_error("primary");
        sink.record_error("primary");

        assert_eq!(sink.query_samples("exec", "primary"), vec![12]);
        assert_eq!(sink.queries().len(), 3);
        assert_eq!(sink.error_count("primary"), 2);
        assert_eq!(sink.error_count("replica"), 0);
        assert_eq!(sink.pool_stats("primary"), None);
    }

    #[test]
    fn test_recorder_sink_without_recorder() {
        describe_metrics();
        let sink = MetricsRecorderSink;
        sink.record_query("exec", "primary", 10);
        sink.record_error("primary");
        sink.record_pool_stats("primary", &PoolStats::default());
    }
}
