//! Error accounting and engine-specific error classification.

use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::DbErr;

use crate::error::{Error, RetryError};
use crate::sink::MetricsSink;

/// Errors that can represent the "no rows" condition.
pub trait NoRows {
    fn is_no_rows(&self) -> bool;
}

impl NoRows for DbErr {
    fn is_no_rows(&self) -> bool {
        matches!(self, DbErr::RecordNotFound(_))
    }
}

impl NoRows for Error {
    fn is_no_rows(&self) -> bool {
        Error::is_no_rows(self)
    }
}

impl<E: NoRows> NoRows for RetryError<E> {
    fn is_no_rows(&self) -> bool {
        self.inner().is_no_rows()
    }
}

/// Count `err` against `id` unless it is "no rows", then hand it back.
pub fn measure_error<E: NoRows>(sink: &dyn MetricsSink, id: &str, err: E) -> E {
    if !err.is_no_rows() {
        sink.record_error(id);
    }
    err
}

static UNIQUE_VIOLATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b23505\b|duplicate key value violates unique constraint|\b1062\b|Duplicate entry|UNIQUE constraint failed|Failed to insert row with primary key",
    )
    .expect("unique violation regex is valid")
});

static DEADLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b40P01\b|deadlock detected|\b1213\b|Deadlock found when trying to get lock")
        .expect("deadlock regex is valid")
});

static DATA_TOO_LONG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b1406\b|Data too long|\b22001\b|value too long for type")
        .expect("data too long regex is valid")
});

/// The driver message behind a runtime error, or nothing for errors that do
/// not come from the database.
fn driver_message(err: &DbErr) -> Option<String> {
    match err {
        DbErr::Conn(_) | DbErr::Exec(_) | DbErr::Query(_) | DbErr::Custom(_) => {
            Some(err.to_string())
        }
        _ => None,
    }
}

/// True when the error reports a duplicate entry on a unique constraint
/// (PostgreSQL, MySQL, SQLite or Spanner wording).
pub fn is_unique_violation(err: &DbErr) -> bool {
    driver_message(err).is_some_and(|msg| UNIQUE_VIOLATION.is_match(&msg))
}

pub fn is_deadlock(err: &DbErr) -> bool {
    driver_message(err).is_some_and(|msg| DEADLOCK.is_match(&msg))
}

pub fn is_data_too_long(err: &DbErr) -> bool {
    driver_message(err).is_some_and(|msg| DATA_TOO_LONG.is_match(&msg))
}

/// Errors worth retrying: deadlocks and failures to reach the database.
pub fn is_transient(err: &DbErr) -> bool {
    matches!(err, DbErr::ConnectionAcquire(_) | DbErr::Conn(_)) || is_deadlock(err)
}

/// [`is_transient`] lifted to [`Error`], for use as a retry predicate.
/// Cancellation is never retried.
pub fn is_transient_error(err: &Error) -> bool {
    match err {
        Error::Db(err) => is_transient(err),
        Error::Cancelled | Error::Retry(_) => false,
    }
}
