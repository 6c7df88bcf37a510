//! Error types for the notarization log.

use std::io;
use thiserror::Error;

use crate::types::Timestamp;

/// Result type alias for packchain operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// Errors are `Clone` because a single storage failure is delivered to every
/// caller whose entry was in the failed batch.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Conditional storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Sequence encoding errors.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Peer forwarding errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Gossip membership errors.
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    /// The entry's timestamp precedes the prefix's last committed timestamp.
    #[error("timestamp {timestamp} precedes last committed timestamp {last}")]
    OrderingViolation { timestamp: Timestamp, last: Timestamp },

    /// The caller's deadline passed or its context was cancelled.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The component was shut down.
    #[error("closed")]
    Closed,

    /// Every commit attempt for a batch lost a race with another writer.
    #[error("gave up committing to prefix {prefix:?} after {attempts} attempts")]
    RetriesExhausted { prefix: String, attempts: u32 },

    /// The entry cannot be encoded into a pack.
    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    /// A stored pack failed validation.
    #[error("corrupt pack {name}: {reason}")]
    Corrupt { name: String, reason: String },

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Error relayed from the peer that owns the prefix.
    #[error("remote error ({kind:?}): {message}")]
    Remote { kind: ErrorKind, message: String },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    AlreadyExists,
    AlreadyOpening,
    Io,
    BadEncoding,
    OrderingViolation,
    DeadlineExceeded,
    Closed,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Storage(StoreError::AlreadyExists(_)) => ErrorKind::AlreadyExists,
            Error::Storage(StoreError::AlreadyOpening(_)) => ErrorKind::AlreadyOpening,
            Error::Storage(_) | Error::Network(_) => ErrorKind::Io,
            Error::Codec(CodecError::BadEncoding(_)) => ErrorKind::BadEncoding,
            Error::OrderingViolation { .. } => ErrorKind::OrderingViolation,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::Closed => ErrorKind::Closed,
            Error::Remote { kind, .. } => *kind,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }
}

/// Conditional store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An object with this name already exists; it was left untouched.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Another writer holds an open handle for this name.
    #[error("object is already being written: {0}")]
    AlreadyOpening(String),

    /// No object with this name.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The name cannot be used as an object name.
    #[error("invalid object name: {0:?}")]
    InvalidName(String),

    /// Backend I/O failure.
    #[error("storage io error: {0}")]
    Io(String),
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Sortable sequence encoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Not a well-formed encoded sequence number.
    #[error("bad encoding: {0}")]
    BadEncoding(String),

    /// Increment past the largest encodable value.
    #[error("sequence number overflow")]
    Overflow,

    /// Decrement below zero.
    #[error("sequence number underflow")]
    Underflow,
}

/// Peer forwarding errors.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Frame exceeds the configured limit.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// No response within the request timeout.
    #[error("request to {0} timed out")]
    Timeout(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected message on the wire.
    #[error("unexpected message: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for NetworkError {
    fn from(e: io::Error) -> Self {
        NetworkError::Io(e.to_string())
    }
}

/// Gossip membership errors.
#[derive(Error, Debug, Clone)]
pub enum MembershipError {
    /// Failed to bind the gossip transport.
    #[error("failed to bind: {0}")]
    BindError(String),

    /// Join failed.
    #[error("join failed: {0}")]
    JoinError(String),

    /// Transport error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The provider has not been started.
    #[error("membership not started")]
    NotStarted,

    /// Member lacks a required tag.
    #[error("member {member} has no {tag:?} tag")]
    MissingTag { member: String, tag: String },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert!(Error::from(StoreError::AlreadyExists("x".into())).is_already_exists());
        assert_eq!(
            Error::from(StoreError::Io("disk".into())).kind(),
            ErrorKind::Io
        );
        assert_eq!(
            Error::from(CodecError::BadEncoding("?".into())).kind(),
            ErrorKind::BadEncoding
        );
        let remote = Error::Remote {
            kind: ErrorKind::OrderingViolation,
            message: "late".into(),
        };
        assert_eq!(remote.kind(), ErrorKind::OrderingViolation);
    }
}
