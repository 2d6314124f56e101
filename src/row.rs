//! Single-row results.

use sea_orm::{DbErr, QueryResult, TryGetable};

use crate::error::Error;

/// The result of a query-row call.
///
/// Like a driver row, it carries its own error: a missing row is
/// [`DbErr::RecordNotFound`], anything else is the error the call produced.
#[derive(Debug)]
pub struct Row<E = DbErr> {
    result: Result<QueryResult, E>,
}

impl<E> Row<E> {
    pub(crate) fn new(result: Result<QueryResult, E>) -> Self {
        Self { result }
    }

    /// The error this row carries, if any.
    pub fn err(&self) -> Option<&E> {
        self.result.as_ref().err()
    }

    pub fn result(&self) -> Result<&QueryResult, &E> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Result<QueryResult, E> {
        self.result
    }
}

impl Row<DbErr> {
    /// Read a column from the row, or the row's error.
    pub fn try_get<T: TryGetable>(&self, column: &str) -> Result<T, DbErr> {
        match &self.result {
            Ok(row) => row.try_get("", column),
            Err(err) => Err(clone_db_err(err)),
        }
    }
}

impl Row<Error> {
    /// Read a column from the row, or the row's error rendered as a
    /// [`DbErr`].
    pub fn try_get<T: TryGetable>(&self, column: &str) -> Result<T, DbErr> {
        match &self.result {
            Ok(row) => row.try_get("", column),
            Err(Error::Db(err)) => Err(clone_db_err(err)),
            Err(err) => Err(DbErr::Custom(err.to_string())),
        }
    }
}

/// Turn a `query_one` outcome into a row result; no row is
/// [`DbErr::RecordNotFound`].
pub(crate) fn require_row<E>(result: Result<Option<QueryResult>, E>, query: &str) -> Result<QueryResult, E>
where
    E: From<DbErr>,
{
    result.and_then(|row| {
        row.ok_or_else(|| E::from(DbErr::RecordNotFound(format!("no rows for query: {query}"))))
    })
}

// `DbErr` is not `Clone`; keep "no rows" recognizable and flatten the rest.
fn clone_db_err(err: &DbErr) -> DbErr {
    match err {
        DbErr::RecordNotFound(msg) => DbErr::RecordNotFound(msg.clone()),
        other => DbErr::Custom(other.to_string()),
    }
}
