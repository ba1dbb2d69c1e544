//! Error types and the error-reporting seam shared by every session.
//!
//! Nothing in the core is fatal to the process: a failing session is closed,
//! the host and its other sessions keep running. Failures that do not flow
//! back to a caller are handed to an [`ErrorReporter`].

use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::AuthorId;

/// Coarse classification of a [`SpaceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// EOF in the middle of a record
    Truncated,
    /// Unknown tag, impossible bitmap, bad string payload
    MalformedRecord,
    /// Wrong log header
    InvalidFormat,
    /// Instruction carries an author other than the sending session's
    AuthorForgery,
    /// `BirdsEyeView` found while replaying a log
    UnexpectedViewpoint,
    /// Read or write on a closed or errored pipe
    PipeBroken,
    /// File I/O failure on the log
    StorageFailure,
    /// An observer rejected an instruction
    ObserverFailure,
    /// The host has handed out every author number
    AuthorsExhausted,
}

/// Errors raised by the codec, log store and sessions.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("record truncated at byte {offset}: needed {needed} more bytes")]
    Truncated { offset: u64, needed: usize },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("invalid log header in '{}'", path.display())]
    InvalidFormat { path: PathBuf },

    #[error("session {session} sent an instruction claiming author {claimed}")]
    AuthorForgery { session: AuthorId, claimed: AuthorId },

    #[error("viewpoint record found in log at instruction {index}")]
    UnexpectedViewpoint { index: u64 },

    #[error("pipe broken: {0}")]
    PipeBroken(String),

    #[error("storage failure: {0}")]
    StorageFailure(#[from] std::io::Error),

    #[error("observer failed: {0}")]
    ObserverFailure(String),

    #[error("all {} author numbers have been assigned", u16::MAX)]
    AuthorsExhausted,
}

impl SpaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpaceError::Truncated { .. } => ErrorKind::Truncated,
            SpaceError::MalformedRecord(_) => ErrorKind::MalformedRecord,
            SpaceError::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            SpaceError::AuthorForgery { .. } => ErrorKind::AuthorForgery,
            SpaceError::UnexpectedViewpoint { .. } => ErrorKind::UnexpectedViewpoint,
            SpaceError::PipeBroken(_) => ErrorKind::PipeBroken,
            SpaceError::StorageFailure(_) => ErrorKind::StorageFailure,
            SpaceError::ObserverFailure(_) => ErrorKind::ObserverFailure,
            SpaceError::AuthorsExhausted => ErrorKind::AuthorsExhausted,
        }
    }

    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        SpaceError::MalformedRecord(detail.into())
    }

    pub(crate) fn pipe(detail: impl std::fmt::Display) -> Self {
        SpaceError::PipeBroken(detail.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SpaceError>;

/// Sink for errors that cannot be returned to a caller.
///
/// Called from session tasks, so implementations must be thread-safe.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: SpaceError);
}

impl<F> ErrorReporter for F
where
    F: Fn(SpaceError) + Send + Sync,
{
    fn report(&self, error: SpaceError) {
        self(error)
    }
}

/// Reporter that writes every error to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: SpaceError) {
        match error.kind() {
            ErrorKind::StorageFailure => log::error!("{error}"),
            kind => log::warn!("{kind:?}: {error}"),
        }
    }
}
