//! Error types for bluetree-core.
//!
//! Two layers: [`BrokerError`] is what a remote call can come back with,
//! already classified by cause so callers can distinguish a missing object
//! from a permission problem or a timed-out call. [`Error`] is the crate
//! error, wrapping broker failures and adding the lookup and state-machine
//! cases the components themselves produce.
//!
//! Propagation policy: broker failures during discovery start/stop and
//! connect/disconnect reset the affected component to its idle state and
//! surface one error event; failures during value reads are logged and
//! treated as "no value available". No operation retries automatically;
//! retry policy belongs to the caller re-invoking the entry point.

use std::time::Duration;

use thiserror::Error;

use bluetree_types::ObjectHandle;

use serde::{Deserialize, Serialize};

/// A failed remote call, classified by cause.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new causes
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The addressed remote object does not exist at the broker.
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// The broker rejected the call for authorization reasons.
    #[error("access denied: {0}")]
    PermissionDenied(String),

    /// The call did not complete within its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The reply arrived but did not have the expected shape.
    #[error("malformed reply: {0}")]
    InvalidReply(String),

    /// Any other failed call or error reply.
    #[error("broker call failed: {0}")]
    Failed(String),
}

/// Errors produced by the bluetree core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error
/// variants in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A remote call to the object broker failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A lookup by UUID missed.
    #[error("not found: {0}")]
    NotFound(String),

    /// A remote object handle is no longer addressable.
    #[error("stale handle: {0}")]
    StaleHandle(ObjectHandle),

    /// An operation was invoked outside its valid state.
    ///
    /// Benign cases (connect while connected, re-entrant start) are
    /// handled as logged no-ops and never reach this variant.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Create a not-found error for a UUID or name lookup.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid-state error with context.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}

/// Classification of an error for the public event stream.
///
/// Events carry a kind rather than the full error so they stay cheap to
/// clone and serializable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// A remote object was missing.
    ObjectNotFound,
    /// The broker denied access.
    PermissionDenied,
    /// A call timed out.
    Timeout,
    /// Any other broker failure.
    BrokerFailure,
    /// An operation was invoked outside its valid state.
    InvalidState,
}

impl From<&BrokerError> for ErrorKind {
    fn from(err: &BrokerError) -> Self {
        match err {
            BrokerError::NotFound(_) => Self::ObjectNotFound,
            BrokerError::PermissionDenied(_) => Self::PermissionDenied,
            BrokerError::Timeout(_) => Self::Timeout,
            BrokerError::InvalidReply(_) | BrokerError::Failed(_) => Self::BrokerFailure,
        }
    }
}

impl From<&Error> for ErrorKind {
    fn from(err: &Error) -> Self {
        match err {
            Error::Broker(broker) => Self::from(broker),
            Error::NotFound(_) | Error::StaleHandle(_) => Self::ObjectNotFound,
            Error::InvalidState(_) => Self::InvalidState,
        }
    }
}

/// Result type alias using bluetree-core's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
