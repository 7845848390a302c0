//! Error types for pipelines, dispatch servers and descriptor files.
//!
//! This module defines the central [`Error`] enum along with [`CreateError`],
//! the failure type a [`ServiceFactory`] reports when it cannot produce a
//! service for an accepted connection.
//!
//! ## Error Cases
//! - Argument errors: caller misuse such as an out-of-range port, a reserved
//!   parameter key, closing an unknown pipeline or an impossible stage count.
//!   Operating on an orchestrator or server that is not running is misuse
//!   too.
//! - Connection errors: a hop could not be reached or dropped mid-stream.
//! - Data-flow errors: the caller's feeder failed.
//! - Usage-leak errors: the pipeline output was never fully read.
//! - Descriptor errors: a server descriptor file could not be parsed.
//!
//! [`ServiceFactory`]: crate::service::ServiceFactory

use std::{io, path::PathBuf};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller misused an API. Never retried.
    Argument,
    /// A service could not be created for a connection.
    ServiceCreate,
    /// A hop could not be reached or failed mid-stream.
    Connection,
    /// A caller-supplied feeder failed.
    DataFlow,
    /// The pipeline output was abandoned before it was fully read.
    UsageLeak,
    /// A server descriptor could not be read or parsed.
    Descriptor,
}

/// Unified error type for the pipeline client and dispatch server.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Port outside `1..=65535`.
    #[error("invalid port {port}: must be within 1..=65535")]
    InvalidPort { port: i64 },

    /// Parameter keys starting with `.` are reserved.
    #[error("parameter key `{key}` uses the reserved prefix `.`")]
    ReservedKey { key: String },

    /// A pipeline needs at least one hop.
    #[error("a pipeline needs at least one stage")]
    EmptyPipeline,

    /// The pipeline needs more concurrent pumps than the orchestrator allows.
    #[error("pipeline of {stages} stages exceeds the pump capacity of {capacity}")]
    TooManyStages { stages: usize, capacity: usize },

    /// Invalid sizing passed to a constructor.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// `close` was given a pipeline that is not currently open.
    #[error("pipeline {id} is not open")]
    UnknownPipeline { id: u64 },

    /// The orchestrator or server has not been started.
    #[error("server not running")]
    NotRunning,

    /// The dispatch server's accept loop was already started.
    #[error("server already running")]
    AlreadyRunning,

    /// The orchestrator or server was shut down.
    #[error("server has been shut down")]
    ShutDown,

    /// A hop could not be reached, or failed while bytes were flowing.
    #[error("service unavailable ({source}) at {addr}")]
    ServiceUnavailable {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The caller-supplied feeder failed; the source keeps its original kind.
    #[error("feeder failed: {0}")]
    Feeder(#[source] io::Error),

    /// The caller closed the pipeline before reading its output to the end.
    #[error("pipeline output from {addr} was closed before it was fully consumed")]
    DataNotConsumed { addr: String },

    /// A service could not be created for a connection.
    #[error(transparent)]
    Create(#[from] CreateError),

    /// A server descriptor file could not be read or parsed.
    #[error("descriptor {}: {reason}", path.display())]
    Descriptor { path: PathBuf, reason: String },

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the taxonomy bucket this error belongs to.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPort { .. }
            | Self::ReservedKey { .. }
            | Self::EmptyPipeline
            | Self::TooManyStages { .. }
            | Self::InvalidConfig { .. }
            | Self::UnknownPipeline { .. }
            | Self::NotRunning
            | Self::AlreadyRunning
            | Self::ShutDown => ErrorKind::Argument,
            Self::Create(_) => ErrorKind::ServiceCreate,
            Self::ServiceUnavailable { .. } | Self::Io(_) => ErrorKind::Connection,
            Self::Feeder(_) => ErrorKind::DataFlow,
            Self::DataNotConsumed { .. } => ErrorKind::UsageLeak,
            Self::Descriptor { .. } => ErrorKind::Descriptor,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Argument`.
    pub fn is_argument(&self) -> bool {
        self.kind() == ErrorKind::Argument
    }

    pub(crate) fn unavailable(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ServiceUnavailable {
            addr: addr.into(),
            source,
        }
    }
}

/// Failure reported by a service factory.
///
/// `Permanent` means the service can never be created for this input (for
/// example a malformed header or bad parameters). `Transient` means a later
/// attempt may succeed, such as when the server is overloaded.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateError {
    #[error("service cannot be created: {0}")]
    Permanent(String),

    #[error("service temporarily unavailable: {0}")]
    Transient(String),
}

impl CreateError {
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    /// Whether a retry against a later connection is sensible.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_message_ends_with_address() {
        let err = Error::unavailable(
            "localhost:9",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(err.to_string().ends_with("localhost:9"));
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn classifies_argument_errors() {
        assert!(Error::InvalidPort { port: 0 }.is_argument());
        assert!(Error::UnknownPipeline { id: 3 }.is_argument());
        assert!(Error::NotRunning.is_argument());
        assert!(!Error::Feeder(io::Error::other("x")).is_argument());
        assert_eq!(Error::NotRunning.to_string(), "server not running");
    }

    #[test]
    fn create_error_transience() {
        assert!(CreateError::transient("busy").is_transient());
        assert!(!CreateError::permanent("bad header").is_transient());
        assert_eq!(
            Error::from(CreateError::permanent("x")).kind(),
            ErrorKind::ServiceCreate
        );
    }
}
