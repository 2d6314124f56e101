//! Background connection pool statistics.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;

use crate::cancel::CancellationToken;
use crate::sink::{MetricsSink, PoolStats};

/// Serializes samplers so a label set is never half updated.
static SAMPLE_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Anything that can report connection pool statistics.
pub trait PoolStatsSource: Send + Sync + 'static {
    /// Current statistics, or `None` if the pool cannot report them.
    fn pool_stats(&self) -> Option<PoolStats>;
}

impl PoolStatsSource for DatabaseConnection {
    #[allow(unreachable_code)]
    fn pool_stats(&self) -> Option<PoolStats> {
        #[cfg(feature = "sqlx-postgres")]
        if let DatabaseConnection::SqlxPostgresPoolConnection(_) = self {
            let pool = self.get_postgres_connection_pool();
            return Some(sqlx_pool_stats(pool.size(), pool.num_idle()));
        }
        #[cfg(feature = "sqlx-mysql")]
        if let DatabaseConnection::SqlxMySqlPoolConnection(_) = self {
            let pool = self.get_mysql_connection_pool();
            return Some(sqlx_pool_stats(pool.size(), pool.num_idle()));
        }
        #[cfg(feature = "sqlx-sqlite")]
        if let DatabaseConnection::SqlxSqlitePoolConnection(_) = self {
            let pool = self.get_sqlite_connection_pool();
            return Some(sqlx_pool_stats(pool.size(), pool.num_idle()));
        }
        None
    }
}

/// sqlx pools only report their size and idle count.
#[cfg(any(feature = "sqlx-postgres", feature = "sqlx-mysql", feature = "sqlx-sqlite"))]
fn sqlx_pool_stats(size: u32, idle: usize) -> PoolStats {
    let open = u64::from(size);
    let idle = idle as u64;
    PoolStats {
        idle,
        in_use: open.saturating_sub(idle),
        open,
        ..PoolStats::default()
    }
}

/// Take one sample from `source` and publish it under `id`.
///
/// Returns `false` when the source has nothing to report.
pub fn measure_stats(source: &dyn PoolStatsSource, id: &str, sink: &dyn MetricsSink) -> bool {
    let _guard = SAMPLE_LOCK.lock();
    match source.pool_stats() {
        Some(stats) => {
            sink.record_pool_stats(id, &stats);
            true
        }
        None => false,
    }
}

/// Handle to a running pool poller. Dropping it stops the poller.
#[derive(Debug)]
pub struct PoolMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PoolMonitor {
    /// Sample `source` every `interval` on the current tokio runtime.
    ///
    /// Returns `None` outside a runtime or for a zero interval.
    pub fn spawn(
        source: Arc<dyn PoolStatsSource>,
        id: Arc<str>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Option<Self> {
        if interval.is_zero() {
            return None;
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        let task = handle.spawn(async move {
            // the first tick of an interval fires immediately
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if !measure_stats(source.as_ref(), &id, sink.as_ref()) {
                            tracing::trace!(query_id = %id, "pool statistics unavailable");
                        }
                    }
                }
            }
            tracing::debug!(query_id = %id, "pool monitor stopped");
        });

        Some(Self {
            cancel,
            task: Some(task),
        })
    }

    /// Signal the poller to stop. Calling this again is a no-op.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the poller and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PoolMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
