//! RPC error types.

use labwire_codec::{CodecError, Value};
use std::fmt;

/// Result alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by RPC servers and clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A payload could not be encoded, decoded or converted.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The requested target does not exist on the server.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// Automatic target selection found more than one target.
    #[error("ambiguous target selection, server offers {0:?}")]
    AmbiguousTarget(Vec<String>),

    /// The selected target has no method with this name.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The peer does not speak this protocol.
    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),

    /// A target name is empty, contains whitespace or is already registered.
    #[error("invalid target name: {0:?}")]
    InvalidTargetName(String),

    /// The remote method failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The connection closed before the operation completed.
    #[error("connection lost")]
    ConnectionLost,

    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Socket error, including bind failures.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The peer sent a message that does not follow the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether the error means the connection is no longer usable.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::Timeout
                | Self::Tls(_)
                | Self::Io(_)
                | Self::Protocol(_)
                | Self::HandshakeMismatch(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        if let Some(tls) = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Self::Tls(tls.to_string());
        }
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::ConnectionLost,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

/// A failure raised by a method on the server, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Error class reported by the server
    pub kind: String,
    /// Human readable message
    pub message: String,
    /// Server-side trace lines
    pub traceback: Vec<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote {}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl RemoteError {
    /// Wire form: `{"class": .., "message": .., "traceback": [..]}`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::map([
            ("class", Value::from(self.kind.as_str())),
            ("message", Value::from(self.message.as_str())),
            ("traceback", Value::from(self.traceback.clone())),
        ])
    }

    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the descriptor is incomplete.
    pub fn from_value(value: &Value) -> Result<Self> {
        let field = |name: &str| {
            value
                .get_str(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Protocol(format!("exception descriptor without `{name}`")))
        };
        let traceback = match value.get_str("traceback") {
            None | Some(Value::None) => Vec::new(),
            Some(lines) => lines.extract()?,
        };
        Ok(Self {
            kind: field("class")?,
            message: field("message")?,
            traceback,
        })
    }
}

/// A failure produced by a target method on the server side.
///
/// It travels to the caller as a [`RemoteError`] with the same kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    /// Error class, e.g. `ValueError`
    pub kind: String,
    /// Human readable message
    pub message: String,
}

impl CallError {
    /// Class used when the method does not exist.
    pub const UNKNOWN_METHOD: &'static str = "UnknownMethod";
    /// Class used when the target does not exist.
    pub const UNKNOWN_TARGET: &'static str = "UnknownTarget";
    /// Class used when the method panicked.
    pub const PANIC: &'static str = "Panic";
    /// Class used for bad arguments.
    pub const TYPE_ERROR: &'static str = "TypeError";
    /// Class used for bad argument values.
    pub const VALUE_ERROR: &'static str = "ValueError";

    /// Build a call error of the given class.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A `ValueError`.
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(Self::VALUE_ERROR, message)
    }

    /// A `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(Self::TYPE_ERROR, message)
    }
}

impl From<CodecError> for CallError {
    fn from(e: CodecError) -> Self {
        Self::type_error(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_wire_form() {
        let err = RemoteError {
            kind: "ZeroDivisionError".to_string(),
            message: "division by zero".to_string(),
            traceback: vec!["in calc.div".to_string()],
        };
        assert_eq!(RemoteError::from_value(&err.to_value()).unwrap(), err);
        assert_eq!(err.to_string(), "remote ZeroDivisionError: division by zero");
    }

    #[test]
    fn io_errors_map_to_connection_errors() {
        let lost: Error = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(lost, Error::ConnectionLost));
        let bind: Error = std::io::Error::from(std::io::ErrorKind::AddrInUse).into();
        assert!(matches!(bind, Error::Io(ref e) if e.kind() == std::io::ErrorKind::AddrInUse));
        assert!(bind.is_connection_error());
        let remote = Error::Remote(RemoteError {
            kind: "X".into(),
            message: String::new(),
            traceback: Vec::new(),
        });
        assert!(!remote.is_connection_error());
    }
}
