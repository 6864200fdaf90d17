use std::fmt;
use std::io;

/// The taxonomy of failures a loomio operation can report, independent of
/// the platform or backend that produced them.
///
/// Callers should match on `kind`, not on the underlying `io::Error`: the
/// same logical failure (connection refused, say) can surface through
/// different `io::ErrorKind`s depending on the active backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An argument violated a documented precondition (e.g. a zero-sized
    /// buffer passed where one is required to be non-empty).
    InvalidArgument,
    /// The operation is not valid in the handle's current lifecycle state
    /// (e.g. writing to a handle that is already closing).
    InvalidState,
    /// A bind failed because the address was already in use.
    AddressInUse,
    /// An address string or structure could not be interpreted.
    AddressInvalid,
    /// The remote peer actively refused the connection.
    ConnectionRefused,
    /// The connection was reset by the peer.
    ConnectionReset,
    /// The connection was already closed when the operation was attempted.
    ConnectionClosed,
    /// A deadline associated with the operation elapsed.
    Timeout,
    /// The operation was cancelled before completion.
    Cancelled,
    /// Data received did not conform to the expected wire protocol.
    ProtocolError,
    /// A resource limit (file descriptors, queue capacity, backpressure
    /// high-water mark) was exceeded.
    ResourceExhausted,
    /// An I/O failure that doesn't fit a more specific kind above.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::AddressInUse => "address in use",
            ErrorKind::AddressInvalid => "address invalid",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::ConnectionClosed => "connection closed",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::Io => "i/o error",
        };
        f.write_str(s)
    }
}

/// The crate's unified error type. Carries a [`ErrorKind`], a human-readable
/// message, and an optional underlying `io::Error` for diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: io::Error) -> Self {
        Error {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::AddrInUse => ErrorKind::AddressInUse,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                ErrorKind::AddressInvalid
            }
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => {
                ErrorKind::ConnectionClosed
            }
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        };
        let message = e.to_string();
        Error::with_source(kind, message, e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
