//! Per-call latency timing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::observer::Observer;
use crate::query::clean_query;

/// Kind of database call, used as the `operation` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Exec,
    Query,
    QueryRow,
    Prepare,
    Transaction,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Exec => "exec",
            Operation::Query => "query",
            Operation::QueryRow => "query-row",
            Operation::Prepare => "prepare",
            Operation::Transaction => "tx",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Times one call and reports it when stopped.
///
/// Stopping records a latency sample and, when the call took at least the
/// observer's slow-query threshold, logs a warning. Only the first stop does
/// anything; dropping an unstopped timer stops it.
#[derive(Debug)]
pub struct QueryTimer<'q> {
    observer: Observer,
    operation: Operation,
    query: &'q str,
    args: usize,
    started: Instant,
    stopped: AtomicBool,
}

impl<'q> QueryTimer<'q> {
    pub fn start(observer: &Observer, operation: Operation, query: &'q str, args: usize) -> Self {
        Self {
            observer: observer.clone(),
            operation,
            query,
            args,
            started: Instant::now(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the timer, returning the elapsed milliseconds on the first call
    /// and `None` afterwards.
    pub fn stop(&self) -> Option<u64> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return None;
        }

        let elapsed_ms = self.elapsed().as_millis() as u64;
        let id = self.observer.id();
        self.observer
            .sink()
            .record_query(self.operation.as_str(), id, elapsed_ms);

        if elapsed_ms >= self.observer.slow_query_threshold().as_millis() as u64 {
            tracing::warn!(
                query = %clean_query(self.query),
                query_id = %id,
                query_op = self.operation.as_str(),
                query_time_ms = elapsed_ms,
                query_args = self.args,
                "slow query detected"
            );
        }

        Some(elapsed_ms)
    }
}

impl Drop for QueryTimer<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}
