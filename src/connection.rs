//! Observed database connection wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DbBackend, DbErr, ExecResult,
    IsolationLevel, QueryResult, Statement, StreamTrait, TransactionTrait, Value,
};

use crate::cancel::{cancellable, CancellationToken};
use crate::config::ObserveConfig;
use crate::error::Error;
use crate::monitor::{self, PoolMonitor, PoolStatsSource};
use crate::observer::Observer;
use crate::retry::{self, RetryPolicy};
use crate::row::{require_row, Row};
use crate::sink::{MetricsRecorderSink, MetricsSink};
use crate::statement::ObservedStatement;
use crate::timer::Operation;
use crate::transaction::ObservedTransaction;

/// An observed wrapper around SeaORM's `DatabaseConnection`.
///
/// Every call is timed into the `sql_queries` histogram, failures other than
/// "no rows" count towards `sql_errors`, calls at or over the slow-query
/// threshold log a warning and each call opens a `sql` span. All metrics,
/// logs and spans carry the connection's identifier.
///
/// The wrapper implements `ConnectionTrait` and `StreamTrait`, so entity
/// queries run through the same instrumentation:
///
/// ```rust,ignore
/// use sea_orm::{Database, EntityTrait};
/// use sea_orm_observe::ObserveExt;
///
/// let db = Database::connect("postgres://localhost/mydb").await?.observe("primary");
/// let users = Users::find().all(&db).await?;
/// ```
///
/// Unless disabled in [`ObserveConfig`], a background task republishes pool
/// statistics until the connection is closed or its last clone is dropped.
#[derive(Debug, Clone)]
pub struct ObservedConnection {
    inner: Arc<DatabaseConnection>,
    observer: Observer,
    config: Arc<ObserveConfig>,
    monitor: Option<Arc<PoolMonitor>>,
}

impl ObservedConnection {
    /// Wrap `connection` under `id`, reporting to the global `metrics`
    /// recorder.
    pub fn new(connection: DatabaseConnection, id: impl Into<Arc<str>>, config: ObserveConfig) -> Self {
        Self::with_sink(connection, id, config, Arc::new(MetricsRecorderSink))
    }

    /// Wrap `connection` under `id` with the default configuration.
    pub fn wrap(connection: DatabaseConnection, id: impl Into<Arc<str>>) -> Self {
        Self::new(connection, id, ObserveConfig::default())
    }

    /// Wrap `connection` under `id`, reporting to `sink`.
    pub fn with_sink(
        connection: DatabaseConnection,
        id: impl Into<Arc<str>>,
        config: ObserveConfig,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let id: Arc<str> = id.into();
        let observer = Observer::new(id.clone(), sink.clone())
            .with_slow_query_threshold(config.slow_query_threshold)
            .with_backend(connection.get_database_backend())
            .with_database_name(config.database_name.as_deref());

        let inner = Arc::new(connection);
        let monitor = if config.monitor_pool {
            let source: Arc<dyn PoolStatsSource> = inner.clone();
            PoolMonitor::spawn(source, id, sink, config.pool_monitor_interval).map(Arc::new)
        } else {
            None
        };

        Self {
            inner,
            observer,
            config: Arc::new(config),
            monitor,
        }
    }

    pub fn id(&self) -> &str {
        self.observer.id()
    }

    /// Get a reference to the underlying `DatabaseConnection`.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    pub fn config(&self) -> &ObserveConfig {
        &self.config
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn slow_query_threshold(&self) -> Duration {
        self.observer.slow_query_threshold()
    }

    /// Change the slow-query threshold for calls made through this handle
    /// and the statements and transactions it creates from now on.
    pub fn set_slow_query_threshold(&mut self, threshold: Duration) {
        self.observer.set_slow_query_threshold(threshold);
    }

    /// Publish one sample of pool statistics now. Returns `false` when the
    /// pool cannot report them.
    pub fn measure_stats(&self) -> bool {
        monitor::measure_stats(&*self.inner, self.observer.id(), self.observer.sink())
    }

    /// Whether the pool poller is running.
    pub fn is_monitoring(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| !m.is_stopped())
    }

    /// Stop the pool poller, then close the connection.
    ///
    /// The poller is stopped even if closing fails, and even while clones of
    /// this handle are alive.
    pub async fn close(self) -> Result<(), DbErr> {
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        self.observer.count(self.inner.close_by_ref().await)
    }

    fn statement(&self, query: &str, values: Vec<Value>) -> Statement {
        Statement::from_sql_and_values(self.inner.get_database_backend(), query, values)
    }

    /// Prepare `query` for repeated execution on this connection.
    pub async fn prepare(&self, query: &str) -> Result<ObservedStatement<'_, DatabaseConnection>, DbErr> {
        self.observer
            .observe(Operation::Prepare, query, 0, async { Ok::<_, DbErr>(()) })
            .await?;
        Ok(ObservedStatement::new(&*self.inner, self.observer.clone(), query))
    }

    pub async fn prepare_context(
        &self,
        cancel: &CancellationToken,
        query: &str,
    ) -> Result<ObservedStatement<'_, DatabaseConnection>, Error> {
        self.observer
            .observe(Operation::Prepare, query, 0, async {
                self.observer.count(cancellable(cancel, async { Ok(()) }).await)
            })
            .await?;
        Ok(ObservedStatement::new(&*self.inner, self.observer.clone(), query))
    }

    pub async fn exec<I>(&self, query: &str, values: I) -> Result<ExecResult, DbErr>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let stmt = self.statement(query, values);
        self.observer
            .observe(Operation::Exec, query, args, async {
                self.observer.count(self.inner.execute(stmt).await)
            })
            .await
    }

    pub async fn exec_context<I>(
        &self,
        cancel: &CancellationToken,
        query: &str,
        values: I,
    ) -> Result<ExecResult, Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let stmt = self.statement(query, values);
        self.observer
            .observe(Operation::Exec, query, args, async {
                self.observer
                    .count(cancellable(cancel, self.inner.execute(stmt)).await)
            })
            .await
    }

    /// Run `query` under `policy`, retrying errors the policy accepts.
    ///
    /// The whole sequence is one timed call; every failed attempt is counted.
    pub async fn exec_context_retryable<I>(
        &self,
        cancel: &CancellationToken,
        policy: &RetryPolicy<Error>,
        query: &str,
        values: I,
    ) -> Result<ExecResult, Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        self.observer
            .observe(Operation::Exec, query, args, async {
                retry::execute(
                    |token| {
                        let stmt = self.statement(query, values.clone());
                        async move {
                            self.observer
                                .count(cancellable(&token, self.inner.execute(stmt)).await)
                        }
                    },
                    policy,
                    cancel,
                )
                .await
                .map_err(Error::from)
            })
            .await
    }

    pub async fn query<I>(&self, query: &str, values: I) -> Result<Vec<QueryResult>, DbErr>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let stmt = self.statement(query, values);
        self.observer
            .observe(Operation::Query, query, args, async {
                self.observer.count(self.inner.query_all(stmt).await)
            })
            .await
    }

    pub async fn query_context<I>(
        &self,
        cancel: &CancellationToken,
        query: &str,
        values: I,
    ) -> Result<Vec<QueryResult>, Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let stmt = self.statement(query, values);
        self.observer
            .observe(Operation::Query, query, args, async {
                self.observer
                    .count(cancellable(cancel, self.inner.query_all(stmt)).await)
            })
            .await
    }

    pub async fn query_context_retryable<I>(
        &self,
        cancel: &CancellationToken,
        policy: &RetryPolicy<Error>,
        query: &str,
        values: I,
    ) -> Result<Vec<QueryResult>, Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        self.observer
            .observe(Operation::Query, query, args, async {
                retry::execute(
                    |token| {
                        let stmt = self.statement(query, values.clone());
                        async move {
                            self.observer
                                .count(cancellable(&token, self.inner.query_all(stmt)).await)
                        }
                    },
                    policy,
                    cancel,
                )
                .await
                .map_err(Error::from)
            })
            .await
    }

    pub async fn query_row<I>(&self, query: &str, values: I) -> Row
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let stmt = self.statement(query, values);
        let result = self
            .observer
            .observe(Operation::QueryRow, query, args, async {
                self.observer
                    .count(require_row(self.inner.query_one(stmt).await, query))
            })
            .await;
        Row::new(result)
    }

    pub async fn query_row_context<I>(
        &self,
        cancel: &CancellationToken,
        query: &str,
        values: I,
    ) -> Row<Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let stmt = self.statement(query, values);
        let result = self
            .observer
            .observe(Operation::QueryRow, query, args, async {
                let row = cancellable(cancel, self.inner.query_one(stmt)).await;
                self.observer.count(require_row(row, query))
            })
            .await;
        Row::new(result)
    }

    /// A missing row is [`DbErr::RecordNotFound`] inside each attempt, so the
    /// policy decides whether it is worth retrying.
    pub async fn query_row_context_retryable<I>(
        &self,
        cancel: &CancellationToken,
        policy: &RetryPolicy<Error>,
        query: &str,
        values: I,
    ) -> Row<Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let result = self
            .observer
            .observe(Operation::QueryRow, query, args, async {
                retry::execute(
                    |token| {
                        let stmt = self.statement(query, values.clone());
                        async move {
                            let row = cancellable(&token, self.inner.query_one(stmt)).await;
                            self.observer.count(require_row(row, query))
                        }
                    },
                    policy,
                    cancel,
                )
                .await
                .map_err(Error::from)
            })
            .await;
        Row::new(result)
    }

    /// Start an observed transaction.
    pub async fn begin(&self) -> Result<ObservedTransaction, DbErr> {
        ObservedTransaction::begin(
            self.observer.clone(),
            self.config.max_logged_queries,
            self.inner.begin(),
        )
        .await
    }

    /// Start an observed transaction with explicit options, giving up if
    /// `cancel` fires first.
    pub async fn begin_tx(
        &self,
        cancel: &CancellationToken,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<ObservedTransaction, Error> {
        ObservedTransaction::begin(
            self.observer.clone(),
            self.config.max_logged_queries,
            cancellable(
                cancel,
                self.inner.begin_with_config(isolation_level, access_mode),
            ),
        )
        .await
    }
}

impl AsRef<DatabaseConnection> for ObservedConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

fn statement_args(stmt: &Statement) -> usize {
    stmt.values.as_ref().map_or(0, |values| values.0.len())
}

#[async_trait]
impl ConnectionTrait for ObservedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let query = stmt.sql.clone();
        let args = statement_args(&stmt);
        self.observer
            .observe(Operation::Exec, &query, args, async {
                self.observer.count(self.inner.execute(stmt).await)
            })
            .await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.observer
            .observe(Operation::Exec, sql, 0, async {
                self.observer.count(self.inner.execute_unprepared(sql).await)
            })
            .await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let query = stmt.sql.clone();
        let args = statement_args(&stmt);
        self.observer
            .observe(Operation::QueryRow, &query, args, async {
                self.observer.count(self.inner.query_one(stmt).await)
            })
            .await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let query = stmt.sql.clone();
        let args = statement_args(&stmt);
        self.observer
            .observe(Operation::Query, &query, args, async {
                self.observer.count(self.inner.query_all(stmt).await)
            })
            .await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

impl StreamTrait for ObservedConnection {
    type Stream<'a> = <DatabaseConnection as StreamTrait>::Stream<'a>;

    /// Only opening the stream is timed; rows are consumed untraced.
    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        Box::pin(async move {
            let query = stmt.sql.clone();
            let args = statement_args(&stmt);
            self.observer
                .observe(Operation::Query, &query, args, async {
                    self.observer.count(self.inner.stream(stmt).await)
                })
                .await
        })
    }
}

/// Extension trait for wrapping database connections.
pub trait ObserveExt {
    /// Observe this connection under `id` with the default configuration.
    fn observe(self, id: impl Into<Arc<str>>) -> ObservedConnection;

    /// Observe this connection under `id` with a custom configuration.
    fn observe_with(self, id: impl Into<Arc<str>>, config: ObserveConfig) -> ObservedConnection;
}

impl ObserveExt for DatabaseConnection {
    fn observe(self, id: impl Into<Arc<str>>) -> ObservedConnection {
        ObservedConnection::wrap(self, id)
    }

    fn observe_with(self, id: impl Into<Arc<str>>, config: ObserveConfig) -> ObservedConnection {
        ObservedConnection::new(self, id, config)
    }
}
