//! The error kinds the repository core surfaces.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The requested block, blob, or manifest entry is absent or tombstoned.
    #[error("{0} not found")]
    NotFound(String),

    /// Verification failed: an HMAC mismatch, an AEAD open failure,
    /// or an index entry pointing outside its pack.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// The backend failed in a way that may be transient.
    ///
    /// Retried with backoff for idempotent operations; see [`crate::store::Retrying`].
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported repository format version {0}")]
    FormatUnsupported(u32),

    /// Only surfaced when creating a repository over an existing one;
    /// block writes are idempotent and never raise this.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Local-disk failure (cache files, config files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid {what}: {why}")]
    Invalid { what: &'static str, why: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub(crate) fn corrupt(why: impl Into<String>) -> Self {
        Error::Corrupt(why.into())
    }

    pub(crate) fn unavailable(why: impl Into<String>) -> Self {
        Error::StorageUnavailable(why.into())
    }

    pub(crate) fn invalid(what: &'static str, why: impl Into<String>) -> Self {
        Error::Invalid {
            what,
            why: why.into(),
        }
    }

    /// Is this worth retrying?
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;
        let kind = match &e {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Corrupt(_) => ErrorKind::InvalidData,
            Error::Cancelled => ErrorKind::Interrupted,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}
