//! Error types for rdmavar.

use std::io;

use thiserror::Error;

use crate::connection::ConnectionState;

/// Error type for connection and proxy operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Endpoint setup or the credential handshake failed.
    #[error("connection failed during {context}: {source}")]
    Connection {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Rejected argument (zero-length transfer, zero-sized array, overflow).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Array index past the end.
    #[error("index {index} out of range for length {len}")]
    OutOfRange { index: usize, len: usize },

    /// A posted READ/WRITE did not complete successfully.
    #[error("remote {op} failed: {reason}")]
    RemoteAccess { op: &'static str, reason: String },

    /// Arithmetic precondition violated before any transfer.
    #[error("domain error: {0}")]
    Domain(&'static str),

    /// Operation attempted outside the `Ready` state.
    #[error("connection is not ready (state: {0:?})")]
    NotReady(ConnectionState),

    /// The log filter did not parse or a subscriber was already installed.
    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl Error {
    pub(crate) fn connection(context: &'static str, source: io::Error) -> Self {
        Error::Connection { context, source }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn remote(op: &'static str, reason: impl ToString) -> Self {
        Error::RemoteAccess {
            op,
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for rdmavar operations.
pub type Result<T> = std::result::Result<T, Error>;
