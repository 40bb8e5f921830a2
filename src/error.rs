//! Error types for decoding and serving
//!
//!  Decode errors are recovered per message, server errors per instance.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Why a single device message could not be turned into a reading
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// No known message shape matched the input
    #[error("Cannot parse GPS data from device")]
    Unrecognized,

    /// A matcher needed a field that is not there
    #[error("missing field {index}")]
    MissingField { index: usize },

    /// Numeric field could not be parsed
    #[error("invalid number in field {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    /// Coordinate must carry at least 7 minute characters plus degrees
    #[error("coordinate too short: {0:?}")]
    ShortCoordinate(String),

    /// Status field too short to hold a flag byte
    #[error("status field has no byte {byte}")]
    MissingStatusByte { byte: usize },

    /// Status field contains a non-hex character
    #[error("invalid hex in status field: {0:?}")]
    InvalidHex(String),
}

/// Errors returned by server lifecycle operations
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IP or port not available: {addr}")]
    AddrNotAvailable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server not started")]
    NotStarted,

    #[error("server already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("server is already starting")]
    Starting,

    #[error(transparent)]
    Io(#[from] io::Error),
}
