//! CSI error types.
//!
//! Every RPC handler returns a [`CsiError`] on failure.  The enum derives
//! [`thiserror::Error`] for ergonomic propagation and [`Serialize`]/
//! [`Deserialize`] so errors can travel across the socket transport.  Each
//! variant maps onto the gRPC status code the orchestrator expects via
//! [`CsiError::code`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// A required request field was missing or malformed.  Always raised
    /// before any filesystem side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A subvolume or path expected to pre-exist does not.
    #[error("not found: {0}")]
    NotFound(String),

    /// An external command failed or its output could not be parsed.  The
    /// message carries the tool's combined output verbatim.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation is outside the plugin's declared capability set.
    /// Callers must treat this as "not offered" and must not retry.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A socket / framing error between client and server.
    #[error("transport error: {0}")]
    TransportError(String),
}

impl CsiError {
    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Shorthand for the stable "capability not offered" answer.
    pub fn unimplemented(operation: &str) -> Self {
        Self::Unimplemented(operation.to_owned())
    }

    /// The status code this error is surfaced as.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound(_) => Code::NotFound,
            Self::Internal(_) => Code::Internal,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::TransportError(_) => Code::Unavailable,
        }
    }
}

/// gRPC status codes used by the CSI surface.
///
/// Discriminants match the [gRPC status codes specification](https://github.com/grpc/grpc/blob/master/doc/statuscodes.md).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Some requested entity was not found.
    NotFound = 5,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
}

impl Code {
    /// Get human-readable description of this code
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "Client specified an invalid argument",
            Code::NotFound => "Some requested entity was not found",
            Code::Unimplemented => "Operation is not implemented or not supported",
            Code::Internal => "Internal error",
            Code::Unavailable => "The service is currently unavailable",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> i32 {
        code as i32
    }
}
