//! Shared instrumentation for observed handles.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::DbBackend;
use tracing::{field, Instrument, Span};

use crate::classify::{measure_error, NoRows};
use crate::query::{clean_query, ParsedSql};
use crate::sink::MetricsSink;
use crate::timer::{Operation, QueryTimer};

/// Identity and reporting targets of an observed handle.
///
/// Connections hand a copy to every statement and transaction they create, so
/// all of them share the same identifier, sink and threshold.
#[derive(Debug, Clone)]
pub struct Observer {
    id: Arc<str>,
    slow_query_threshold: Duration,
    sink: Arc<dyn MetricsSink>,
    db_system: &'static str,
    database_name: Option<Arc<str>>,
}

impl Observer {
    pub fn new(id: impl Into<Arc<str>>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            id: id.into(),
            slow_query_threshold: Duration::from_secs(2),
            sink,
            db_system: "other_sql",
            database_name: None,
        }
    }

    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    pub fn with_backend(mut self, backend: DbBackend) -> Self {
        self.db_system = match backend {
            DbBackend::Postgres => "postgresql",
            DbBackend::MySql => "mysql",
            DbBackend::Sqlite => "sqlite",
        };
        self
    }

    pub fn with_database_name(mut self, name: Option<&str>) -> Self {
        self.database_name = name.map(Arc::from);
        self
    }

    /// The correlation key used on metrics, logs and spans.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn slow_query_threshold(&self) -> Duration {
        self.slow_query_threshold
    }

    pub(crate) fn set_slow_query_threshold(&mut self, threshold: Duration) {
        self.slow_query_threshold = threshold;
    }

    pub fn sink(&self) -> &dyn MetricsSink {
        self.sink.as_ref()
    }

    pub fn start<'q>(&self, operation: Operation, query: &'q str, args: usize) -> QueryTimer<'q> {
        QueryTimer::start(self, operation, query, args)
    }

    /// Count the error of a failed result, if any.
    pub fn count<T, E: NoRows>(&self, result: Result<T, E>) -> Result<T, E> {
        result.map_err(|err| measure_error(self.sink(), &self.id, err))
    }

    /// Open a span for one call. It becomes a child of the current span.
    pub(crate) fn span(&self, operation: Operation, query: &str, args: usize) -> Span {
        let parsed = ParsedSql::parse(query);
        let span_name = format!("sql {operation}");
        let span = tracing::info_span!(
            "sql",
            otel.name = %span_name,
            otel.kind = "internal",
            db.system = self.db_system,
            db.name = field::Empty,
            db.operation = parsed.verb.as_str(),
            db.sql.table = field::Empty,
            sql.query = %clean_query(query),
            sql.query_id = %self.id,
            sql.query_op = operation.as_str(),
            sql.query_args = args,
            sql.query_time_ms = field::Empty,
            otel.status_code = field::Empty,
            error.message = field::Empty,
        );

        if let Some(table) = &parsed.table {
            span.record("db.sql.table", table.as_str());
        }
        if let Some(name) = &self.database_name {
            span.record("db.name", &**name);
        }

        span
    }

    /// Record the outcome of a call on its span.
    pub(crate) fn record_result<T, E: Display>(
        &self,
        span: &Span,
        result: &Result<T, E>,
        elapsed_ms: u64,
    ) {
        span.record("sql.query_time_ms", elapsed_ms);

        match result {
            Ok(_) => {
                span.record("otel.status_code", "OK");
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.message", e.to_string().as_str());
                tracing::debug!(parent: span, error = %e, "database call failed");
            }
        }
    }

    /// Time and trace `call`. Errors are not counted here; `call` counts
    /// them so retried calls count every attempt.
    pub(crate) async fn observe<T, E, F>(
        &self,
        operation: Operation,
        query: &str,
        args: usize,
        call: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.observe_in(None, operation, query, args, call).await.0
    }

    /// Like [`observe`](Self::observe) under an explicit parent span, also
    /// returning the elapsed milliseconds.
    pub(crate) async fn observe_in<T, E, F>(
        &self,
        parent: Option<&Span>,
        operation: Operation,
        query: &str,
        args: usize,
        call: F,
    ) -> (Result<T, E>, u64)
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let timer = self.start(operation, query, args);
        let span = match parent {
            Some(parent) => parent.in_scope(|| self.span(operation, query, args)),
            None => self.span(operation, query, args),
        };

        let result = call.instrument(span.clone()).await;

        let elapsed_ms = timer.stop().unwrap_or_default();
        self.record_result(&span, &result, elapsed_ms);
        (result, elapsed_ms)
    }
}
