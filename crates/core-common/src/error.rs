//! The error taxonomy shared by every subsystem. Each subsystem defines its own
//! `thiserror` enum for the errors it can actually produce, but every variant maps
//! onto one of these kinds so the HTTP-adapter boundary and the cron scheduler's
//! retry logic can reason about errors uniformly.

use std::fmt;

/// The kind of failure, independent of which subsystem raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    NotAuthorized,
    IllegalState,
    Timeout,
    CapacityExhausted,
    UpstreamFailure,
    ContentUnavailable,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotAuthorized => "not_authorized",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CapacityExhausted => "capacity_exhausted",
            ErrorKind::UpstreamFailure => "upstream_failure",
            ErrorKind::ContentUnavailable => "content_unavailable",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Implemented by every subsystem error enum so callers can classify an error without
/// matching on subsystem-specific variants.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// The error surfaced at the application boundary (composition root / HTTP adapter).
/// Subsystem errors convert into this via `From` impls defined alongside them.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    #[error("content unavailable: {0}")]
    ContentUnavailable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Classify for CoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::NotAuthorized(_) => ErrorKind::NotAuthorized,
            CoreError::IllegalState(_) => ErrorKind::IllegalState,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::CapacityExhausted(_) => ErrorKind::CapacityExhausted,
            CoreError::UpstreamFailure(_) => ErrorKind::UpstreamFailure,
            CoreError::ContentUnavailable(_) => ErrorKind::ContentUnavailable,
            CoreError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
