//! IMAP error types.

use std::io::Error as IoError;
use std::path::PathBuf;
use std::result;
use std::string::FromUtf8Error;

use thiserror::Error;

use crate::types::MessageId;

/// A convenience wrapper around `Result` for `imap_disco::Error`.
pub type Result<T> = result::Result<T, Error>;

/// A set of errors that can occur while talking to the server or maintaining the local mirror.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    #[error("{0}")]
    Io(#[from] IoError),
    /// TLS negotiation with the server failed.
    #[error("TLS error: {0}")]
    Tls(String),
    /// The connection was terminated unexpectedly.
    #[error("Connection Lost")]
    ConnectionLost,
    /// A NO response from the IMAP server.
    #[error("No Response: {0}")]
    No(String),
    /// A BAD response from the IMAP server.
    #[error("Bad Response: {0}")]
    Bad(String),
    /// Error parsing a server response.
    #[error("{0}")]
    Parse(#[from] ParseError),
    /// Command inputs were not valid [IMAP
    /// strings](https://tools.ietf.org/html/rfc3501#section-4.3).
    #[error("{0}")]
    Validate(#[from] ValidateError),
    /// The server rejected our credentials, or none were available. The caller may prompt
    /// again and retry the whole connect sequence.
    #[error("Authentication failed: {0}")]
    Authentication(String),
    /// The caller asked for the running operation to stop.
    #[error("Operation cancelled")]
    Cancelled,
    /// Reading or writing the on-disk message cache failed.
    #[error("Cache error at {}: {source}", path.display())]
    Cache {
        /// The cache file involved.
        path: PathBuf,
        /// The underlying I/O failure.
        source: IoError,
    },
    /// A persisted summary or diary could not be read or written.
    #[error("Summary error at {}: {message}", path.display())]
    Summary {
        /// The summary file involved.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },
    /// An internal invariant was violated; the offending record is skipped.
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),
    /// The operation needs a live connection but the store is offline.
    #[error("Not available while offline: {0}")]
    Offline(String),
    /// The named folder does not exist.
    #[error("No such folder: {0}")]
    NoSuchFolder(String),
    /// The message does not exist in the folder.
    #[error("No such message: {0}")]
    NoSuchMessage(MessageId),
}

/// The coarse category of an [`Error`], used to decide how callers recover.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level failure; the store falls back to offline mode.
    Connection,
    /// Tagged NO/BAD or malformed server data.
    Protocol,
    /// Credentials were rejected.
    Authentication,
    /// The caller asked to stop.
    Cancelled,
    /// Local disk trouble with cached bodies, summaries or the diary.
    Cache,
    /// Internal invariant violation.
    InconsistentState,
    /// Needs a connection.
    Offline,
    /// The folder or message does not exist.
    NotFound,
    /// Caller-supplied input could not be encoded.
    Validation,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Tls(_) | Error::ConnectionLost => ErrorKind::Connection,
            Error::No(_) | Error::Bad(_) | Error::Parse(_) => ErrorKind::Protocol,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Cache { .. } | Error::Summary { .. } => ErrorKind::Cache,
            Error::InconsistentState(_) => ErrorKind::InconsistentState,
            Error::Offline(_) => ErrorKind::Offline,
            Error::NoSuchFolder(_) | Error::NoSuchMessage(_) => ErrorKind::NotFound,
            Error::Validate(_) => ErrorKind::Validation,
        }
    }

    /// Whether repeating the operation later may succeed. Diary replay stops at the first
    /// retryable failure and drops entries that fail otherwise.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Cancelled | ErrorKind::Offline
        )
    }

    pub(crate) fn cache(path: impl Into<PathBuf>, source: IoError) -> Self {
        Error::Cache {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn summary(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Error::Summary {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// An error occured while trying to parse a server response.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A literal announced a length that could not be read.
    #[error("Malformed literal length in response: {0}")]
    LiteralLength(String),
    /// A quoted string ran to the end of the line.
    #[error("Unterminated quoted string in response: {0}")]
    Unterminated(String),
    /// The response ended before the grammar was satisfied.
    #[error("Truncated response: {0}")]
    Truncated(String),
    /// Indicates an error parsing the status response. Such as OK, NO, and BAD.
    #[error("Unable to parse status response")]
    Invalid(Vec<u8>),
    /// The client received data that was not UTF-8 encoded.
    #[error("Unable to parse data as UTF-8 text")]
    DataNotUtf8(#[from] FromUtf8Error),
}

/// An [invalid character](https://tools.ietf.org/html/rfc3501#section-4.3) was found in an input
/// string.
#[derive(Debug, Error)]
#[error("Invalid character in input: {0:?}")]
pub struct ValidateError(pub char);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_retryable() {
        assert!(Error::ConnectionLost.is_retryable());
        assert!(Error::Cancelled.is_retryable());
        assert!(!Error::No("Mailbox doesn't exist".into()).is_retryable());
        assert!(!Error::InconsistentState("append-1".into()).is_retryable());
    }

    #[test]
    fn validate_error_shows_char() {
        let e = Error::Validate(ValidateError('\n'));
        assert_eq!(e.to_string(), "Invalid character in input: '\\n'");
        assert_eq!(e.kind(), ErrorKind::Validation);
    }
}
