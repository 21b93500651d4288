//! Error taxonomy shared by every workflow operation.
use sled::transaction::{ConflictableTransactionError, TransactionError};

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Referenced entity is absent or soft-removed
    #[error("{0} not found")]
    NotFound(String),
    #[error("permission denied: {0}")]
    Forbidden(String),
    /// A state-machine guard was violated: wrong status, duplicate key or a lost race
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    /// The store failed underneath us. Callers decide whether to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl CoreError {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::Conflict(_) => "conflict",
            CoreError::Invalid(_) => "invalid",
            CoreError::Unavailable(_) => "unavailable",
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    pub fn forbidden(what: impl Into<String>) -> Self {
        CoreError::Forbidden(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        CoreError::Conflict(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        CoreError::Invalid(what.into())
    }
}

impl From<sled::Error> for CoreError {
    fn from(e: sled::Error) -> Self {
        CoreError::Unavailable(e.to_string())
    }
}

impl From<minicbor::decode::Error> for CoreError {
    fn from(e: minicbor::decode::Error) -> Self {
        CoreError::Unavailable(format!("corrupt record: {e}"))
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for CoreError {
    fn from(e: minicbor::encode::Error<E>) -> Self {
        CoreError::Unavailable(format!("failed to encode record: {e}"))
    }
}

impl From<TransactionError<CoreError>> for CoreError {
    fn from(e: TransactionError<CoreError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(storage) => storage.into(),
        }
    }
}

impl From<CoreError> for ConflictableTransactionError<CoreError> {
    fn from(e: CoreError) -> Self {
        ConflictableTransactionError::Abort(e)
    }
}
