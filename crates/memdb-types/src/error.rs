//! Engine error types.

use thiserror::Error;

/// Stable error class, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Programmer error: the engine was driven into a state it forbids.
    Logic,
    /// Malformed query detected at execution time.
    QueryExec,
    /// Invalid parameters supplied by the caller.
    Params,
    /// Conflicting state (duplicate PK, unsupported composite member).
    Conflict,
    /// Operation not permitted.
    Forbidden,
    /// Referenced namespace, index or item does not exist.
    NotFound,
    /// Data failed validation.
    NotValid,
    /// Underlying storage failure.
    Storage,
}

/// Result-carrying error value: a class plus a human-readable message.
///
/// The query core never throws for runtime conditions - every query-time
/// failure is surfaced through this type. Only invariant violations abort.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Programmer error.
    #[error("logic error: {0}")]
    Logic(String),

    /// Malformed query at runtime.
    #[error("query execution error: {0}")]
    QueryExec(String),

    /// Invalid parameters.
    #[error("invalid parameters: {0}")]
    Params(String),

    /// Conflicting state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation not permitted.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Missing namespace, index or item.
    #[error("not found: {0}")]
    NotFound(String),

    /// Data failed validation.
    #[error("not valid: {0}")]
    NotValid(String),

    /// Storage layer failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// The stable class of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Logic(_) => ErrorCode::Logic,
            Error::QueryExec(_) => ErrorCode::QueryExec,
            Error::Params(_) => ErrorCode::Params,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::Forbidden(_) => ErrorCode::Forbidden,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::NotValid(_) => ErrorCode::NotValid,
            Error::Storage(_) => ErrorCode::Storage,
        }
    }

    /// Construct a `Logic` error.
    pub fn logic(msg: impl Into<String>) -> Self {
        Error::Logic(msg.into())
    }

    /// Construct a `QueryExec` error.
    pub fn query_exec(msg: impl Into<String>) -> Self {
        Error::QueryExec(msg.into())
    }

    /// Construct a `Params` error.
    pub fn params(msg: impl Into<String>) -> Self {
        Error::Params(msg.into())
    }

    /// Construct a `Conflict` error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    /// Construct a `NotFound` error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Construct a `NotValid` error.
    pub fn not_valid(msg: impl Into<String>) -> Self {
        Error::NotValid(msg.into())
    }

    /// Construct a `Storage` error from any displayable source.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Convenience alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::logic("x").code(), ErrorCode::Logic);
        assert_eq!(Error::query_exec("x").code(), ErrorCode::QueryExec);
        assert_eq!(Error::conflict("x").code(), ErrorCode::Conflict);
        assert_eq!(Error::not_found("x").code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_error_display() {
        let err = Error::query_exec("OR operator in first condition");
        assert_eq!(
            err.to_string(),
            "query execution error: OR operator in first condition"
        );
    }
}
