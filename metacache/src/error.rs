//! Client-facing error type.
//!
//! Errors are opaque apart from their [`ErrorKind`]; each carries a short
//! message, an optional underlying cause, and the source location where it
//! was raised.

use std::fmt;
use std::panic::Location;

/// Classification of client errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The connection is not running or has terminated; submissions and
    /// in-flight requests resolve with this kind after any fatal failure.
    ConnectionShutdown,
    /// The server violated the wire protocol, answered with a return code
    /// that is unexpected for the operation, or sent a payload the
    /// requested type could not decode.
    ProtocolError,
    /// The operation required the key to exist and it did not.
    KeyNotFound,
    /// `add` failed because the key already exists.
    KeyExist,
}

impl ErrorKind {
    /// Short human-readable description of this kind.
    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::ConnectionShutdown => "connection shut down",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::KeyNotFound => "key not found",
            ErrorKind::KeyExist => "key exists",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A metacache error with kind, message, optional cause, and the location
/// where it was constructed.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    location: &'static Location<'static>,
}

impl Error {
    /// Create a new error with the given kind and message.
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            source: None,
            location: Location::caller(),
        }
    }

    /// Create a new error wrapping an underlying cause.
    #[track_caller]
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
            location: Location::caller(),
        }
    }

    /// Create a `ConnectionShutdown` error.
    #[track_caller]
    pub fn shutdown(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::ConnectionShutdown, message)
    }

    /// Create a `ConnectionShutdown` error with a cause.
    #[track_caller]
    pub fn shutdown_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::with_source(ErrorKind::ConnectionShutdown, message, source)
    }

    /// Create a `ProtocolError`.
    #[track_caller]
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::ProtocolError, message)
    }

    /// Create a `ProtocolError` with a cause.
    #[track_caller]
    pub fn protocol_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::with_source(ErrorKind::ProtocolError, message, source)
    }

    /// Create a `KeyNotFound` error.
    #[track_caller]
    pub fn key_not_found(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::KeyNotFound, message)
    }

    /// Create a `KeyExist` error.
    #[track_caller]
    pub fn key_exist(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::KeyExist, message)
    }

    /// The error classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where this error was raised.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|source| source.as_ref() as _)
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
