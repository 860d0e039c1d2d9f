// ABOUTME: Error model shared by every socket and adapter in the crate
// ABOUTME: Maps underlying I/O failures into a closed set of transport error kinds

use std::io;
use thiserror::Error;

/// Error kinds surfaced by socket operations.
///
/// Every operation in the crate reports failure through this closed set.
/// Stateful adapters latch a direction after a fatal condition: once latched,
/// further operations on that direction return [`Error::ConnectionReset`]
/// without touching the underlying socket. A graceful half-close latches the
/// direction as done and surfaces as [`Error::BrokenPipe`] instead, so callers
/// can tell clean EOF apart from a broken link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Deadline reached before the operation could complete.
    #[error("operation timed out")]
    TimedOut,

    /// Operation canceled by close or teardown.
    #[error("operation canceled")]
    Canceled,

    /// Local or remote side half-closed gracefully.
    #[error("broken pipe")]
    BrokenPipe,

    /// Fatal transport or protocol error; the direction is latched.
    #[error("connection reset")]
    ConnectionReset,

    /// Incoming message exceeds the provided buffer capacity.
    #[error("message too big")]
    MessageTooBig,

    /// Caller-supplied arguments violate the contract.
    #[error("invalid argument")]
    InvalidArgument,

    /// Operation not applicable to this socket.
    #[error("operation not supported")]
    NotSupported,

    /// Framing violation detected on the wire.
    #[error("protocol violation")]
    Protocol,

    /// Authentication failure.
    #[error("permission denied")]
    PermissionDenied,

    /// Allocation failure.
    #[error("out of memory")]
    NoMemory,
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    /// Collapse an I/O error into the transport error set.
    ///
    /// A closed pipe is deliberately reported as `ConnectionReset`: by the
    /// time the kernel reports it the link is unusable, and latching the
    /// direction is the only safe reaction for a framing layer above.
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::TimedOut,
            io::ErrorKind::UnexpectedEof => Error::BrokenPipe,
            io::ErrorKind::OutOfMemory => Error::NoMemory,
            io::ErrorKind::InvalidInput => Error::InvalidArgument,
            _ => Error::ConnectionReset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(err, Error::ConnectionReset);

        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(err, Error::BrokenPipe);

        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "late").into();
        assert_eq!(err, Error::TimedOut);
    }
}
