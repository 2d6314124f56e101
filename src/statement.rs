//! Observed prepared statements.

use sea_orm::{ConnectionTrait, DbErr, ExecResult, QueryResult, Statement, Value};

use crate::cancel::{cancellable, CancellationToken};
use crate::error::Error;
use crate::observer::Observer;
use crate::row::{require_row, Row};
use crate::timer::Operation;

/// A statement prepared on an observed connection or transaction.
///
/// The SQL is bound to the executor it was prepared on and run with fresh
/// values on every call. Closing is idempotent; a closed statement refuses
/// to run.
#[derive(Debug)]
pub struct ObservedStatement<'c, C> {
    conn: &'c C,
    observer: Observer,
    query: String,
    closed: bool,
}

impl<'c, C> ObservedStatement<'c, C>
where
    C: ConnectionTrait,
{
    pub(crate) fn new(conn: &'c C, observer: Observer, query: impl Into<String>) -> Self {
        Self {
            conn,
            observer,
            query: query.into(),
            closed: false,
        }
    }

    pub fn query_text(&self) -> &str {
        &self.query
    }

    pub fn id(&self) -> &str {
        self.observer.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the statement. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), DbErr> {
        self.closed = true;
        Ok(())
    }

    fn bind(&self, values: Vec<Value>) -> Result<Statement, DbErr> {
        if self.closed {
            return Err(DbErr::Custom("statement is closed".to_string()));
        }
        Ok(Statement::from_sql_and_values(
            self.conn.get_database_backend(),
            self.query.as_str(),
            values,
        ))
    }

    async fn run_exec(&self, values: Vec<Value>) -> Result<ExecResult, DbErr> {
        let stmt = self.bind(values)?;
        self.conn.execute(stmt).await
    }

    async fn run_query(&self, values: Vec<Value>) -> Result<Vec<QueryResult>, DbErr> {
        let stmt = self.bind(values)?;
        self.conn.query_all(stmt).await
    }

    async fn run_query_row(&self, values: Vec<Value>) -> Result<QueryResult, DbErr> {
        let stmt = self.bind(values)?;
        require_row(self.conn.query_one(stmt).await, &self.query)
    }

    pub async fn exec<I>(&self, values: I) -> Result<ExecResult, DbErr>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        self.observer
            .observe(Operation::Exec, &self.query, args, async {
                self.observer.count(self.run_exec(values).await)
            })
            .await
    }

    pub async fn exec_context<I>(
        &self,
        cancel: &CancellationToken,
        values: I,
    ) -> Result<ExecResult, Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        self.observer
            .observe(Operation::Exec, &self.query, args, async {
                self.observer
                    .count(cancellable(cancel, self.run_exec(values)).await)
            })
            .await
    }

    pub async fn query<I>(&self, values: I) -> Result<Vec<QueryResult>, DbErr>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        self.observer
            .observe(Operation::Query, &self.query, args, async {
                self.observer.count(self.run_query(values).await)
            })
            .await
    }

    pub async fn query_context<I>(
        &self,
        cancel: &CancellationToken,
        values: I,
    ) -> Result<Vec<QueryResult>, Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        self.observer
            .observe(Operation::Query, &self.query, args, async {
                self.observer
                    .count(cancellable(cancel, self.run_query(values)).await)
            })
            .await
    }

    pub async fn query_row<I>(&self, values: I) -> Row
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let result = self
            .observer
            .observe(Operation::QueryRow, &self.query, args, async {
                self.observer.count(self.run_query_row(values).await)
            })
            .await;
        Row::new(result)
    }

    pub async fn query_row_context<I>(&self, cancel: &CancellationToken, values: I) -> Row<Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        let args = values.len();
        let result = self
            .observer
            .observe(Operation::QueryRow, &self.query, args, async {
                self.observer
                    .count(cancellable(cancel, self.run_query_row(values)).await)
            })
            .await;
        Row::new(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemorySink;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn observer(sink: &Arc<InMemorySink>) -> Observer {
        Observer::new("accounts", sink.clone())
    }

    #[tokio::test]
    async fn test_exec_and_query_row() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .append_query_results([vec![BTreeMap::from([("name", Value::from("ada"))])]])
            .append_query_results([Vec::<BTreeMap<&str, Value>>::new()])
            .into_connection();
        let sink = Arc::new(InMemorySink::new());

        let stmt = ObservedStatement::new(&db, observer(&sink), "UPDATE accounts SET name = $1 WHERE id = $2");
        let result = stmt
            .exec([Value::from("ada"), Value::from(1i32)])
            .await
            .expect("exec");
        assert_eq!(result.rows_affected(), 1);

        let lookup = ObservedStatement::new(&db, observer(&sink), "SELECT name FROM accounts WHERE id = $1");
        let row = lookup.query_row([Value::from(1i32)]).await;
        assert!(row.err().is_none());
        assert_eq!(row.try_get::<String>("name").expect("name"), "ada");

        let missing = lookup.query_row([Value::from(2i32)]).await;
        assert!(matches!(missing.err(), Some(DbErr::RecordNotFound(_))));

        assert_eq!(sink.query_samples("exec", "accounts").len(), 1);
        assert_eq!(sink.query_samples("query-row", "accounts").len(), 2);
        assert_eq!(sink.error_count("accounts"), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_use() {
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let sink = Arc::new(InMemorySink::new());
        let mut stmt = ObservedStatement::new(&db, observer(&sink), "DELETE FROM sessions");

        stmt.close().expect("close");
        stmt.close().expect("close again");
        assert!(stmt.is_closed());

        let err = stmt.exec([]).await.expect_err("closed");
        assert!(err.to_string().contains("statement is closed"));
        assert_eq!(sink.error_count("accounts"), 1);
    }

    #[tokio::test]
    async fn test_context_variant_cancelled() {
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let sink = Arc::new(InMemorySink::new());
        let stmt = ObservedStatement::new(&db, observer(&sink), "SELECT 1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = stmt.query_context(&cancel, []).await.expect_err("cancelled");
        assert!(err.is_cancelled());

        let row = stmt.query_row_context(&cancel, []).await;
        assert!(row.err().is_some_and(Error::is_cancelled));
        assert_eq!(sink.error_count("accounts"), 2);
    }
}
