//! Error types for the `sse` crate.
//!
//! Follows the same pattern as the other crates in the workspace: a root
//! `Error` struct holding an `ErrorKind` plus an optional source for chaining.
//! The kind is what callers branch on; the source is kept for diagnostics.

use std::error::Error as StdError;
use std::fmt;
use std::io;

pub type Result<T> = core::result::Result<T, Error>;

/// Top-level error type for the `sse` crate.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Classification of everything that can go wrong while encoding, decoding or
/// streaming events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A field name or value is not valid UTF-8. Scoped to one event; the
    /// connection stays usable.
    InvalidEncoding,
    /// An event was decoded but carried no payload (keep-alive).
    EmptyData,
    /// The transport could not be established.
    ConnectionFailed,
    /// The transport was torn down by the peer or the stream ended.
    ConnectionClosed,
    /// Terminal: the source was closed or the server asked us to stop.
    Closed,
    /// Terminal: wrong content type or a status that must not be retried.
    UnrecoverableProtocol,
    /// No bytes arrived within the idle timeout.
    Timeout,
    /// Any other I/O failure from the underlying reader or writer.
    Io,
}

impl Error {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            source: Some(message.into().into()),
            error_kind,
        }
    }

    pub fn with_source(
        error_kind: ErrorKind,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Error {
            source: Some(source.into()),
            error_kind,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error_kind
    }

    /// Terminal errors disable any further reconnection attempts.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::Closed | ErrorKind::UnrecoverableProtocol
        )
    }

    /// True for failures that mean the peer is gone.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::ConnectionClosed | ErrorKind::ConnectionFailed
        )
    }

    /// Rebuilds an equivalent error from this one. The source is flattened
    /// into its message since boxed sources cannot be cloned.
    pub(crate) fn duplicate(&self) -> Self {
        match &self.source {
            Some(source) => Error::new(self.error_kind, source.to_string()),
            None => Error {
                source: None,
                error_kind: self.error_kind,
            },
        }
    }

    pub(crate) fn invalid_encoding() -> Self {
        Error::new(ErrorKind::InvalidEncoding, "invalid UTF-8 sequence")
    }

    pub(crate) fn closed() -> Self {
        Error::new(ErrorKind::Closed, "closed")
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidEncoding => "invalid encoding",
            ErrorKind::EmptyData => "empty data",
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::ConnectionClosed => "connection closed",
            ErrorKind::Closed => "closed",
            ErrorKind::UnrecoverableProtocol => "unrecoverable protocol error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "i/o error",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "SSE error ({}): {}", self.error_kind, source),
            None => write!(f, "SSE error ({})", self.error_kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Io,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Builder errors happen before any network call is made and will not
        // go away by retrying.
        let error_kind = if err.is_builder() {
            ErrorKind::UnrecoverableProtocol
        } else if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::ConnectionFailed
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

/// Returns true if the I/O error means the other end went away.
pub(crate) fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_kinds() {
        assert!(Error::closed().is_terminal());
        assert!(Error::new(ErrorKind::UnrecoverableProtocol, "bad status").is_terminal());
        assert!(!Error::new(ErrorKind::Timeout, "idle").is_terminal());
        assert!(!Error::invalid_encoding().is_terminal());
    }

    #[test]
    fn test_io_error_maps_to_io_kind() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "deadline").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_duplicate_keeps_kind_and_message() {
        let err = Error::new(ErrorKind::UnrecoverableProtocol, "unrecoverable HTTP status: 404");
        let copy = err.duplicate();
        assert_eq!(copy.kind(), ErrorKind::UnrecoverableProtocol);
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn test_peer_gone_classification() {
        assert!(is_peer_gone(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_peer_gone(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_peer_gone(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
