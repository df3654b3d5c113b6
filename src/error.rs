use std::fmt;
use std::io;
use thiserror::Error;

/// Classifies transport-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Connect, acquire, read or request deadline elapsed
    Timeout,
    /// Endpoint refused or could not be resolved
    Refused,
    /// Peer reset or aborted the session
    Reset,
    /// Peer closed the session cleanly
    Closed,
    Other,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionErrorKind::Timeout => "timeout",
            ConnectionErrorKind::Refused => "refused",
            ConnectionErrorKind::Reset => "reset",
            ConnectionErrorKind::Closed => "closed",
            ConnectionErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Machine-checkable error code carried by every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MissingParameter,
    CorruptResponse,
    ConnectionTimeout,
    ConnectionFailure,
    ObjectDisposed,
    NotSupported,
    ServerError,
    Canceled,
    Config,
    Unknown,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing or invalid parameter: {0}")]
    MissingParameter(String),

    #[error("Corrupt response: {0}")]
    CorruptResponse(String),

    #[error("Connection error ({kind}): {message}")]
    Connection {
        kind: ConnectionErrorKind,
        message: String,
    },

    #[error("Object disposed: {0}")]
    ObjectDisposed(&'static str),

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Error reply sent by the server (`-ERR ...`, `-NOSCRIPT ...`)
    #[error("{0}")]
    Server(String),

    #[error("Request canceled")]
    Canceled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Error::CorruptResponse(message.into())
    }

    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::connection(ConnectionErrorKind::Timeout, message)
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::MissingParameter(_) => ErrorCode::MissingParameter,
            Error::CorruptResponse(_) => ErrorCode::CorruptResponse,
            Error::Connection {
                kind: ConnectionErrorKind::Timeout,
                ..
            } => ErrorCode::ConnectionTimeout,
            Error::Connection { .. } => ErrorCode::ConnectionFailure,
            Error::ObjectDisposed(_) => ErrorCode::ObjectDisposed,
            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Server(_) => ErrorCode::ServerError,
            Error::Canceled => ErrorCode::Canceled,
            Error::Config(_) => ErrorCode::Config,
            Error::Other(_) => ErrorCode::Unknown,
        }
    }

    /// Wire and transport faults poison the connection they happened on.
    /// A server error reply leaves the session usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CorruptResponse(_) | Error::Connection { .. })
    }

    pub fn is_timeout(&self) -> bool {
        self.code() == ErrorCode::ConnectionTimeout
    }

    /// Server error prefix such as `ERR`, `WRONGTYPE` or `NOSCRIPT`
    pub fn server_prefix(&self) -> Option<&str> {
        match self {
            Error::Server(message) => message.split_whitespace().next(),
            _ => None,
        }
    }

    /// Cheap structural copy used when one failure has to be fanned out to
    /// several pending requests.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::MissingParameter(m) => Error::MissingParameter(m.clone()),
            Error::CorruptResponse(m) => Error::CorruptResponse(m.clone()),
            Error::Connection { kind, message } => Error::Connection {
                kind: *kind,
                message: message.clone(),
            },
            Error::ObjectDisposed(what) => Error::ObjectDisposed(what),
            Error::NotSupported(m) => Error::NotSupported(m.clone()),
            Error::Server(m) => Error::Server(m.clone()),
            Error::Canceled => Error::Canceled,
            Error::Config(m) => Error::Config(m.clone()),
            Error::Other(e) => Error::Other(anyhow::anyhow!("{:#}", e)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectionErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable => ConnectionErrorKind::Refused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ConnectionErrorKind::Reset,
            io::ErrorKind::UnexpectedEof => ConnectionErrorKind::Closed,
            _ => ConnectionErrorKind::Other,
        };
        Error::Connection {
            kind,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_connection_kinds() {
        let err: Error = io::Error::new(io::ErrorKind::WouldBlock, "slow").into();
        assert_eq!(err.code(), ErrorCode::ConnectionTimeout);
        assert!(err.is_fatal());

        let err: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "nope").into();
        assert_eq!(err.code(), ErrorCode::ConnectionFailure);
    }

    #[test]
    fn server_errors_are_recoverable() {
        let err = Error::Server("NOSCRIPT No matching script".to_string());
        assert!(!err.is_fatal());
        assert_eq!(err.server_prefix(), Some("NOSCRIPT"));
        assert_eq!(err.to_string(), "NOSCRIPT No matching script");
    }

    #[test]
    fn duplicate_keeps_code() {
        let err = Error::timeout("acquire");
        assert_eq!(err.duplicate().code(), err.code());
    }
}
