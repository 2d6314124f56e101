//! # sea-orm-observe
//!
//! Query metrics, slow-query alarms, tracing spans and retry-with-backoff for
//! SeaORM database connections.
//!
//! Wrap a `DatabaseConnection` once and every call made through it, through
//! statements prepared on it and through transactions begun on it is timed,
//! traced and accounted for under one identifier.
//!
//! ## Features
//!
//! - **Latency metrics**: every call feeds the `sql_queries` histogram,
//!   labelled by operation (`exec`, `query`, `query-row`, `prepare`, `tx`)
//!   and connection id
//! - **Error accounting**: failures other than "no rows" increment `sql_errors`
//! - **Slow query alarms**: calls at or over a threshold log a warning with
//!   the normalized SQL
//! - **Transaction summaries**: commit and rollback log one entry listing the
//!   first statements run and how many ran in total
//! - **Retry with backoff**: `_retryable` variants retry errors a policy
//!   accepts, backing off with jitter between attempts
//! - **Cancellation**: `_context` variants give up when a token fires
//! - **Pool statistics**: a background task republishes pool gauges
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sea_orm::Database;
//! use sea_orm_observe::prelude::*;
//!
//! let db = Database::connect("postgres://localhost/mydb")
//!     .await?
//!     .observe("primary");
//!
//! db.exec("DELETE FROM sessions WHERE expires_at < now()", []).await?;
//!
//! let tx = db.begin().await?;
//! tx.exec("INSERT INTO audit (msg) VALUES ($1)", ["purged".into()]).await?;
//! tx.commit().await?;
//! ```
//!
//! ## Retrying
//!
//! ```rust,ignore
//! use sea_orm_observe::{classify, CancellationToken, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(classify::is_transient_error)
//!     .with_max_attempts(5)
//!     .with_backoff(Duration::from_millis(50), Duration::from_millis(500));
//! let cancel = CancellationToken::new();
//!
//! db.exec_context_retryable(&cancel, &policy, "UPDATE jobs SET state = 'done'", [])
//!     .await?;
//! ```
//!
//! ## Span Attributes
//!
//! | Attribute | Description |
//! |-----------|-------------|
//! | `sql.query` | Normalized SQL |
//! | `sql.query_id` | Connection identifier |
//! | `sql.query_op` | `exec`, `query`, `query-row`, `prepare` or `tx` |
//! | `sql.query_args` | Number of bound values |
//! | `sql.query_time_ms` | Elapsed milliseconds |
//! | `db.system` | "postgresql", "mysql" or "sqlite" |
//! | `db.operation` | Leading SQL keyword |
//! | `db.sql.table` | Target table name (when detectable) |
//! | `otel.status_code` | "OK" or "ERROR" |
//! | `error.message` | Error details (on failure) |

mod cancel;
pub mod classify;
mod config;
mod connection;
mod error;
pub mod monitor;
mod observer;
pub mod query;
pub mod ratelimit;
pub mod retry;
mod row;
pub mod sink;
mod statement;
mod timer;
mod transaction;

#[cfg(test)]
mod test_support;

pub use cancel::CancellationToken;
pub use config::{ObserveConfig, DEFAULT_MAX_LOGGED_QUERIES};
pub use connection::{ObserveExt, ObservedConnection};
pub use error::{AttemptError, Error, RetryError};
pub use monitor::{PoolMonitor, PoolStatsSource};
pub use observer::Observer;
pub use query::clean_query;
pub use ratelimit::{RateLimitError, RateLimiter};
pub use retry::RetryPolicy;
pub use row::Row;
pub use sink::{InMemorySink, MetricsRecorderSink, MetricsSink, PoolStats};
pub use statement::ObservedStatement;
pub use timer::{Operation, QueryTimer};
pub use transaction::{ObservedTransaction, QueryExecutionRecord, QueryLog};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CancellationToken, ObserveConfig, ObserveExt, ObservedConnection, ObservedTransaction,
        RetryPolicy,
    };
}
