//! Error types for the resembl core.
//!
//! These are the pure, small error kinds the core boundary exposes (see
//! the error-handling design: one variant per documented failure mode,
//! no ambient panics). The tokenizer never fails; every other component
//! returns one of these.

use std::io;

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, ResemblError>;

/// Errors surfaced at the core boundary.
#[derive(Error, Debug)]
pub enum ResemblError {
    /// No snippet, collection, or tag matches the given key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A prefix or name matched more than one row.
    #[error("ambiguous: {key} matches {count} rows")]
    Ambiguous {
        /// The prefix or name that was ambiguous.
        key: String,
        /// Number of rows it matched.
        count: usize,
    },

    /// A unique constraint would be violated (e.g. an alias already used
    /// by a different snippet).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Removing a name would leave a snippet with zero names.
    #[error("cannot remove the last name from a snippet")]
    EmptyAliasSet,

    /// Index parameters disagree with the minhashes currently stored;
    /// caller must reindex before the index can be trusted.
    #[error("index is stale and must be rebuilt: {0}")]
    StaleIndex(String),

    /// The on-disk cache was corrupt; callers recover by rebuilding, this
    /// is a warning-level condition rather than a hard error.
    #[error("cache is corrupt: {0}")]
    CorruptCache(String),

    /// A storage operation failed transiently; the caller may retry.
    #[error("transient storage error: {0}")]
    TransientStorageError(String),

    /// A storage operation failed permanently.
    #[error("storage error: {0}")]
    PermanentStorageError(String),

    /// Malformed input: bad config value, non-UTF-8 code, unsupported
    /// `num_permutations`, and similar caller mistakes.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Underlying I/O failure while reading/writing the cache or config.
    #[error("I/O error: {message}")]
    Io {
        /// Human-readable context.
        message: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Failure serializing or deserializing a stored value.
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable context.
        message: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl ResemblError {
    /// Construct an [`ResemblError::Ambiguous`] from a prefix/name and match count.
    pub fn ambiguous(key: impl Into<String>, count: usize) -> Self {
        Self::Ambiguous {
            key: key.into(),
            count,
        }
    }

    /// Construct an [`ResemblError::Io`] with context.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Maps this error to the process exit code documented for the CLI
    /// surface: 0 success, 1 user error, 2 integrity error, 3 cancelled,
    /// 4 unexpected. The core never calls `exit` itself; this is a pure
    /// mapping function for the thin CLI layer.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound(_)
            | Self::Ambiguous { .. }
            | Self::AlreadyExists(_)
            | Self::EmptyAliasSet
            | Self::BadInput(_) => 1,
            Self::CorruptCache(_) => 2,
            Self::StaleIndex(_)
            | Self::TransientStorageError(_)
            | Self::PermanentStorageError(_)
            | Self::Io { .. }
            | Self::Serialization { .. } => 4,
        }
    }
}

impl From<io::Error> for ResemblError {
    fn from(err: io::Error) -> Self {
        Self::io("I/O operation failed", err)
    }
}

impl From<serde_json::Error> for ResemblError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: format!("JSON (de)serialization failed: {err}"),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec() {
        assert_eq!(ResemblError::NotFound("x".into()).exit_code(), 1);
        assert_eq!(ResemblError::ambiguous("abc", 2).exit_code(), 1);
        assert_eq!(ResemblError::EmptyAliasSet.exit_code(), 1);
        assert_eq!(ResemblError::CorruptCache("bad crc".into()).exit_code(), 2);
        assert_eq!(
            ResemblError::StaleIndex("params changed".into()).exit_code(),
            4
        );
    }
}
