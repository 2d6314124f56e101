//! Observed transactions and their per-statement history.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use parking_lot::Mutex;
use sea_orm::{
    ConnectionTrait, DatabaseTransaction, DbBackend, DbErr, ExecResult, QueryResult, Statement,
    Value,
};
use tokio::time::Instant;
use tracing::{Instrument, Span};

use crate::cancel::{cancellable, CancellationToken};
use crate::classify::NoRows;
use crate::error::Error;
use crate::observer::Observer;
use crate::query::clean_query;
use crate::row::{require_row, Row};
use crate::statement::ObservedStatement;
use crate::timer::{Operation, QueryTimer};

/// Query text reported for the transaction as a whole.
const TRANSACTION_QUERY: &str = "Transaction";

/// One statement run inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryExecutionRecord {
    pub operation: Operation,
    /// Normalized with [`clean_query`].
    pub query: String,
    pub duration_ms: u64,
    pub args: usize,
}

impl fmt::Display for QueryExecutionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}ms, {} args): {}",
            self.operation, self.duration_ms, self.args, self.query
        )
    }
}

/// Keeps the first `capacity` records and counts all of them.
#[derive(Debug, Clone, Default)]
pub struct QueryLog {
    capacity: usize,
    records: Vec<QueryExecutionRecord>,
    total: usize,
}

impl QueryLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            records: Vec::with_capacity(capacity),
            total: 0,
        }
    }

    pub fn push(&mut self, record: QueryExecutionRecord) {
        if self.records.len() < self.capacity {
            self.records.push(record);
        }
        self.total += 1;
    }

    pub fn records(&self) -> &[QueryExecutionRecord] {
        &self.records
    }

    /// Statements seen, stored or not.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Display for QueryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{record}")?;
        }
        Ok(())
    }
}

/// A transaction that times, traces and remembers every statement run
/// through it.
///
/// The transaction itself is timed as one `tx` operation from the moment it
/// opens until `commit` or `rollback`, both of which log a single summary of the
/// statements. Statement spans are children of the transaction span.
///
/// Dropping the handle without finishing it rolls back through sea-orm and
/// stops the timer, but logs no summary.
#[derive(Debug)]
pub struct ObservedTransaction {
    inner: DatabaseTransaction,
    observer: Observer,
    log: Mutex<QueryLog>,
    span: Span,
    timer: QueryTimer<'static>,
}

impl ObservedTransaction {
    /// Trace `begin`, wrapping the transaction it opens.
    ///
    /// The `tx` timer starts once the transaction is open; a failed begin is
    /// counted and recorded on the span only.
    pub(crate) async fn begin<E, F>(observer: Observer, capacity: usize, begin: F) -> Result<Self, E>
    where
        F: Future<Output = Result<DatabaseTransaction, E>>,
        E: NoRows + fmt::Display,
    {
        let span = observer.span(Operation::Transaction, TRANSACTION_QUERY, 0);
        let started = Instant::now();

        match observer.count(begin.instrument(span.clone()).await) {
            Ok(inner) => Ok(Self {
                inner,
                timer: observer.start(Operation::Transaction, TRANSACTION_QUERY, 0),
                observer,
                log: Mutex::new(QueryLog::with_capacity(capacity)),
                span,
            }),
            Err(err) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let result: Result<(), &E> = Err(&err);
                observer.record_result(&span, &result, elapsed_ms);
                Err(err)
            }
        }
    }

    pub fn id(&self) -> &str {
        self.observer.id()
    }

    pub fn inner(&self) -> &DatabaseTransaction {
        &self.inner
    }

    /// The records kept so far, in call order.
    pub fn records(&self) -> Vec<QueryExecutionRecord> {
        self.log.lock().records().to_vec()
    }

    /// Statements run so far, including those past the log capacity.
    pub fn query_count(&self) -> usize {
        self.log.lock().total()
    }

    async fn run<T, E, F>(&self, operation: Operation, query: &str, args: usize, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let (result, duration_ms) = self
            .observer
            .observe_in(Some(&self.span), operation, query, args, call)
            .await;

        self.log.lock().push(QueryExecutionRecord {
            operation,
            query: clean_query(query),
            duration_ms,
            args,
        });
        result
    }

    fn statement(&self, query: &str, values: Vec<Value>) -> Statement {
        Statement::from_sql_and_values(self.inner.get_database_backend(), query, values)
    }

    pub async fn exec<I>(&self, query: &str, values: I) -> Result<ExecResult, DbErr>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let stmt = self.statement(query, values);
        self.run(Operation::Exec, query, args, async {
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
        self.run(Operation::Exec, query, args, async {
            self.observer
                .count(cancellable(cancel, self.inner.execute(stmt)).await)
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
        self.run(Operation::Query, query, args, async {
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
        self.run(Operation::Query, query, args, async {
            self.observer
                .count(cancellable(cancel, self.inner.query_all(stmt)).await)
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
            .run(Operation::QueryRow, query, args, async {
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
            .run(Operation::QueryRow, query, args, async {
                let row = cancellable(cancel, self.inner.query_one(stmt)).await;
                self.observer.count(require_row(row, query))
            })
            .await;
        Row::new(result)
    }

    /// Prepare `query` on this transaction. Statement calls are traced but
    /// not added to the transaction's history.
    pub async fn prepare(&self, query: &str) -> Result<ObservedStatement<'_, DatabaseTransaction>, DbErr> {
        self.run(Operation::Prepare, query, 0, async { Ok::<_, DbErr>(()) })
            .await?;
        Ok(ObservedStatement::new(&self.inner, self.observer.clone(), query))
    }

    pub async fn prepare_context(
        &self,
        cancel: &CancellationToken,
        query: &str,
    ) -> Result<ObservedStatement<'_, DatabaseTransaction>, Error> {
        self.run(Operation::Prepare, query, 0, async {
            self.observer.count(cancellable(cancel, async { Ok(()) }).await)
        })
        .await?;
        Ok(ObservedStatement::new(&self.inner, self.observer.clone(), query))
    }

    /// Commit, then log the summary and stop the transaction timer whatever
    /// the outcome.
    pub async fn commit(self) -> Result<(), DbErr> {
        let Self {
            inner,
            observer,
            log,
            span,
            timer,
        } = self;
        let result = observer.count(inner.commit().instrument(span.clone()).await);
        finish(&observer, &log.into_inner(), &span, &timer, &result, "commit");
        result
    }

    /// Roll back, then log the summary and stop the transaction timer
    /// whatever the outcome.
    pub async fn rollback(self) -> Result<(), DbErr> {
        let Self {
            inner,
            observer,
            log,
            span,
            timer,
        } = self;
        let result = observer.count(inner.rollback().instrument(span.clone()).await);
        finish(&observer, &log.into_inner(), &span, &timer, &result, "rollback");
        result
    }
}

fn finish(
    observer: &Observer,
    log: &QueryLog,
    span: &Span,
    timer: &QueryTimer<'_>,
    result: &Result<(), DbErr>,
    outcome: &'static str,
) {
    let elapsed_ms = timer.stop().unwrap_or_default();
    observer.record_result(span, result, elapsed_ms);
    tracing::info!(
        parent: span,
        query_id = %observer.id(),
        query_cnt = log.total(),
        query_logged = log.records().len(),
        query_time_ms = elapsed_ms,
        outcome,
        queries = %log,
        "transaction finished"
    );
}

#[async_trait]
impl ConnectionTrait for ObservedTransaction {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let query = stmt.sql.clone();
        let args = stmt.values.as_ref().map_or(0, |v| v.0.len());
        self.run(Operation::Exec, &query, args, async {
            self.observer.count(self.inner.execute(stmt).await)
        })
        .await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.run(Operation::Exec, sql, 0, async {
            self.observer.count(self.inner.execute_unprepared(sql).await)
        })
        .await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let query = stmt.sql.clone();
        let args = stmt.values.as_ref().map_or(0, |v| v.0.len());
        self.run(Operation::QueryRow, &query, args, async {
            self.observer.count(self.inner.query_one(stmt).await)
        })
        .await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let query = stmt.sql.clone();
        let args = stmt.values.as_ref().map_or(0, |v| v.0.len());
        self.run(Operation::Query, &query, args, async {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemorySink;
    use crate::test_support::capture;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, TransactionTrait};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn exec_results(n: usize) -> Vec<MockExecResult> {
        (0..n)
            .map(|_| MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            })
            .collect()
    }

    async fn begin(
        db: &sea_orm::DatabaseConnection,
        sink: &Arc<InMemorySink>,
        capacity: usize,
    ) -> ObservedTransaction {
        let observer = Observer::new("ledger", sink.clone());
        ObservedTransaction::begin(observer, capacity, db.begin())
            .await
            .expect("begin")
    }

    #[test]
    fn test_query_log_keeps_first_records() {
        let mut log = QueryLog::with_capacity(2);
        for i in 0..5 {
            log.push(QueryExecutionRecord {
                operation: Operation::Exec,
                query: format!("DELETE FROM t WHERE id = {i}"),
                duration_ms: i,
                args: 0,
            });
        }
        assert_eq!(log.total(), 5);
        assert_eq!(log.records().len(), 2);
        assert_eq!(log.records()[1].query, "DELETE FROM t WHERE id = 1");
        assert_eq!(
            log.to_string(),
            "exec (0ms, 0 args): DELETE FROM t WHERE id = 0; exec (1ms, 0 args): DELETE FROM t WHERE id = 1"
        );
    }

    #[tokio::test]
    async fn test_commit_flushes_bounded_summary() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results(exec_results(10))
            .into_connection();
        let sink = Arc::new(InMemorySink::new());
        let (captures, _guard) = capture();

        let tx = begin(&db, &sink, 7).await;
        for i in 0..10 {
            tx.exec(
                "INSERT INTO entries (id)\n\tVALUES ($1)",
                [Value::from(i as i32)],
            )
            .await
            .expect("insert");
        }

        assert_eq!(tx.query_count(), 10);
        let records = tx.records();
        assert_eq!(records.len(), 7);
        assert_eq!(records[0].query, "INSERT INTO entries (id) VALUES ($1)");
        assert_eq!(records[0].args, 1);
        assert_eq!(records[0].operation, Operation::Exec);

        tx.commit().await.expect("commit");

        let summary = captures.named("transaction finished");
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].field("query_cnt"), Some("10"));
        assert_eq!(summary[0].field("query_logged"), Some("7"));
        assert_eq!(summary[0].field("query_id"), Some("ledger"));
        assert_eq!(summary[0].field("outcome"), Some("commit"));

        assert_eq!(sink.query_samples("tx", "ledger").len(), 1);
        assert_eq!(sink.query_samples("exec", "ledger").len(), 10);
    }

    #[tokio::test]
    async fn test_rollback_flushes_summary() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![BTreeMap::from([("balance", Value::from(10i64))])]])
            .into_connection();
        let sink = Arc::new(InMemorySink::new());
        let (captures, _guard) = capture();

        let tx = begin(&db, &sink, 7).await;
        let row = tx
            .query_row("SELECT balance FROM accounts WHERE id = $1", [Value::from(1i32)])
            .await;
        assert_eq!(row.try_get::<i64>("balance").expect("balance"), 10);

        tx.rollback().await.expect("rollback");

        let summary = captures.named("transaction finished");
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].field("query_cnt"), Some("1"));
        assert_eq!(summary[0].field("outcome"), Some("rollback"));
        assert_eq!(sink.query_samples("tx", "ledger").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_begin_is_counted_but_not_timed() {
        let sink = Arc::new(InMemorySink::new());
        let (captures, _guard) = capture();
        let observer = Observer::new("ledger", sink.clone());

        let err = ObservedTransaction::begin(observer, 7, async {
            Err::<DatabaseTransaction, _>(DbErr::Custom("connection refused".into()))
        })
        .await
        .expect_err("begin fails");

        assert!(err.to_string().contains("connection refused"));
        assert_eq!(sink.error_count("ledger"), 1);
        assert!(sink.query_samples("tx", "ledger").is_empty());
        let span = &captures.spans("sql")[0];
        assert_eq!(span.field("sql.query_op"), Some("tx"));
        assert_eq!(span.field("otel.status_code"), Some("ERROR"));
        assert!(captures.named("transaction finished").is_empty());
    }

    #[tokio::test]
    async fn test_failed_statement_is_counted_and_logged() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_errors([DbErr::Custom("constraint".into())])
            .into_connection();
        let sink = Arc::new(InMemorySink::new());

        let tx = begin(&db, &sink, 7).await;
        let err = tx.exec("DELETE FROM accounts", []).await.expect_err("fails");
        assert!(err.to_string().contains("constraint"));
        assert_eq!(tx.query_count(), 1);
        assert_eq!(sink.error_count("ledger"), 1);
        tx.rollback().await.expect("rollback");
    }

    #[tokio::test]
    async fn test_statement_spans_nest_under_transaction() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results(exec_results(1))
            .into_connection();
        let sink = Arc::new(InMemorySink::new());
        let (captures, _guard) = capture();

        let tx = begin(&db, &sink, 7).await;
        tx.exec("UPDATE accounts SET balance = 0", []).await.expect("update");
        tx.commit().await.expect("commit");

        let spans = captures.spans("sql");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].field("sql.query_op"), Some("tx"));
        assert_eq!(spans[1].field("sql.query_op"), Some("exec"));
        assert_eq!(spans[0].field("otel.status_code"), Some("OK"));
    }

    #[tokio::test]
    async fn test_prepared_statement_on_transaction() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results(exec_results(2))
            .into_connection();
        let sink = Arc::new(InMemorySink::new());

        let tx = begin(&db, &sink, 7).await;
        {
            let stmt = tx
                .prepare("UPDATE accounts SET balance = $1")
                .await
                .expect("prepare");
            stmt.exec([Value::from(1i64)]).await.expect("first");
            stmt.exec([Value::from(2i64)]).await.expect("second");
        }
        assert_eq!(tx.query_count(), 1);
        assert_eq!(tx.records()[0].operation, Operation::Prepare);
        assert_eq!(sink.query_samples("exec", "ledger").len(), 2);
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn test_context_call_cancelled() {
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let sink = Arc::new(InMemorySink::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let tx = begin(&db, &sink, 7).await;
        let err = tx
            .exec_context(&cancel, "DELETE FROM accounts", [])
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(tx.query_count(), 1);
        tx.rollback().await.expect("rollback");
    }
}
