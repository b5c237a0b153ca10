//! Error types for cache operations.

use std::path::PathBuf;

/// Errors that can occur while touching the cache or the build tree.
///
/// Only paths the driver must react to are distinguished; everything the
/// driver treats as "fall back to the real compiler" collapses into the
/// `Io` variant.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error at a known path.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A cached artifact disappeared between lookup and use. Treated as
    /// a miss, not a failure.
    #[error("cache file {path} disappeared")]
    Missing {
        /// The artifact that vanished.
        path: PathBuf,
    },

    /// Preprocessor output that could not be parsed (a line marker with
    /// no closing quote).
    #[error("failed to parse included file path in {path}")]
    UnparseableMarker {
        /// The preprocessed file being scanned.
        path: PathBuf,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means "the artifact vanished", which readers
    /// treat as an ordinary miss.
    pub fn is_missing(&self) -> bool {
        matches!(self, CacheError::Missing { .. })
    }
}
