use std::fmt::{Display, Formatter};
use std::sync::PoisonError;

/// Result alias used across the library.
pub type CResult<T> = Result<T, Error>;

/// Errors surfaced by the weaver library. Recoverable kinds map onto the
/// CLIENT_* terminators at the coordinator; the rest are internal faults.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A node handle referenced by a transaction or program request is
    /// unknown or tombstoned at the requested timestamp.
    BadHandle(String),

    /// A handle→shard mapping already exists for a handle a transaction
    /// tried to create. Surfaced to clients the same way as BadHandle.
    Conflict(String),

    /// The cluster identifier changed under us. Fatal for the process.
    MembershipChanged(String),

    /// A peer broke the message protocol (duplicate TX_DONE, unknown
    /// message kind, bad shard id).
    Protocol(String),

    /// Malformed bytes on the wire or in a durable record.
    Parse(String),

    Io(String),

    Internal(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BadHandle(s) => write!(f, "bad handle: {}", s),
            Error::Conflict(s) => write!(f, "handle conflict: {}", s),
            Error::MembershipChanged(s) => write!(f, "membership changed: {}", s),
            Error::Protocol(s) => write!(f, "protocol violation: {}", s),
            Error::Parse(s) => write!(f, "parse error: {}", s),
            Error::Io(s) => write!(f, "io error: {}", s),
            Error::Internal(s) => write!(f, "internal error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {}", err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
