use std::{error, fmt, io, result};

use crate::Value;

/// The error type for this crate.
#[derive(Debug)]
pub enum Error {
    /// The bus address was malformed, or named an unsupported transport.
    Configuration(String),
    /// The SASL handshake with the bus daemon failed.
    Handshake(String),
    /// A reply or signal had a different shape than the protocol promises.
    Protocol(String),
    /// A remote method call returned an `Error` message.
    MethodError {
        name: String,
        body: Vec<Value>,
    },
    /// A pending call was abandoned because the transport closed or failed, distinct
    /// from a genuine remote `Error` reply.
    Transport(String),
    /// An I/O error occurred on the underlying socket.
    Io(io::Error),
    /// The caller misused the API (double registration, closed connection, ...).
    Usage(String),
    /// A value could not be marshaled or unmarshaled.
    Value(crate::value::Error),
    /// This operation is not supported by this connection.
    Unsupported,
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Value(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(s) => write!(f, "invalid bus address: {}", s),
            Error::Handshake(s) => write!(f, "handshake failed: {}", s),
            Error::Protocol(s) => write!(f, "protocol error: {}", s),
            Error::MethodError { name, .. } => write!(f, "remote error: {}", name),
            Error::Transport(s) => write!(f, "transport error: {}", s),
            Error::Io(e) => e.fmt(f),
            Error::Usage(s) => write!(f, "usage error: {}", s),
            Error::Value(e) => e.fmt(f),
            Error::Unsupported => write!(f, "operation not supported on this connection"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<crate::value::Error> for Error {
    fn from(e: crate::value::Error) -> Self {
        Error::Value(e)
    }
}

/// Alias for a `Result` with the error type [`Error`].
pub type Result<T> = result::Result<T, Error>;
