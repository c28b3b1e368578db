//! Unified error model for engine operations.

use crate::types::PageIndex;

/// Result alias that uses the crate-wide [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure during the given action.
    #[error("I/O error during {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The file or a page failed structural validation.
    #[error("corrupt file in {context}: {details}")]
    CorruptFile {
        context: &'static str,
        details: String,
    },

    /// A seek demanded presence and the key was absent.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Unique index insert collision.
    #[error("duplicate key in index '{index}'")]
    DuplicateKey { index: String },

    /// Optimistic validation failed at commit.
    #[error("transaction conflict on page {page}")]
    TxConflict { page: PageIndex },

    /// A mutation was attempted outside a transaction.
    #[error("no active transaction")]
    NoActiveTransaction,

    /// A structural invariant did not hold.
    #[error("invariant violation in {context}: {details}")]
    InvariantViolation {
        context: &'static str,
        details: String,
    },

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed statement or a value that does not fit its column.
    #[error("bad input: {details}")]
    BadInput { details: String },
}

impl Error {
    /// Helper for wrapping `std::io::Error` with the failing action.
    pub fn io(action: &'static str, source: std::io::Error) -> Self {
        Self::Io { action, source }
    }

    /// Helper for corrupt-file errors with structural context.
    pub fn corrupt(context: &'static str, details: impl Into<String>) -> Self {
        Self::CorruptFile {
            context,
            details: details.into(),
        }
    }

    /// Helper for invariant violations with structural context.
    pub fn invariant(context: &'static str, details: impl Into<String>) -> Self {
        Self::InvariantViolation {
            context,
            details: details.into(),
        }
    }

    /// Helper for bad statement input.
    pub fn bad_input(details: impl Into<String>) -> Self {
        Self::BadInput {
            details: details.into(),
        }
    }
}
