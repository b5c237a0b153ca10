//! Error types for configuration loading.

/// Errors that can occur while building the configuration.
///
/// Almost every malformed variable is tolerated (ignored or clamped, as
/// the original tool does); only a missing cache directory is fatal,
/// since nothing can be cached without one.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Neither `CCACHE_DIR` nor `HOME` is set, so no cache directory can
    /// be determined.
    #[error("unable to determine cache directory (set CCACHE_DIR or HOME)")]
    NoCacheDir,
}
