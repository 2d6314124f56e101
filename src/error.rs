//! Error types.

use sea_orm::DbErr;

/// Errors returned by the cancellable and retryable call variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Whatever the driver returned, unchanged.
    #[error(transparent)]
    Db(#[from] DbErr),

    /// The caller's cancellation token fired before the call completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A retryable call ran out of attempts.
    #[error(transparent)]
    Retry(Box<RetryError<Error>>),
}

impl Error {
    /// Whether this is the "no rows" condition rather than a failure.
    pub fn is_no_rows(&self) -> bool {
        matches!(self, Error::Db(DbErr::RecordNotFound(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The driver error at the bottom of this error, if there is one.
    pub fn db_err(&self) -> Option<&DbErr> {
        match self {
            Error::Db(err) => Some(err),
            Error::Cancelled => None,
            Error::Retry(retry) => retry.inner().db_err(),
        }
    }
}

/// A rejected retry is the bare operation error; exhaustion keeps its context.
impl From<RetryError<Error>> for Error {
    fn from(err: RetryError<Error>) -> Self {
        match err {
            RetryError::Rejected(err) => err,
            exhausted => Error::Retry(Box::new(exhausted)),
        }
    }
}

/// Outcome of a failed [`retry::execute`](crate::retry::execute).
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The retry predicate refused the error; returned exactly as produced.
    #[error(transparent)]
    Rejected(E),

    /// Every attempt failed with a retryable error.
    #[error("hit max tries {max_tries}: {last}")]
    Exhausted {
        max_tries: u32,
        #[source]
        last: AttemptError<E>,
    },
}

impl<E> RetryError<E> {
    /// The operation error that ended the sequence.
    pub fn inner(&self) -> &E {
        match self {
            RetryError::Rejected(err) => err,
            RetryError::Exhausted { last, .. } => &last.source,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Rejected(err) => err,
            RetryError::Exhausted { last, .. } => last.source,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// An operation error annotated with the attempt that produced it.
#[derive(Debug, thiserror::Error)]
#[error("try {attempt} of {max_tries}: {source}")]
pub struct AttemptError<E> {
    pub attempt: u32,
    pub max_tries: u32,
    pub source: E,
}
