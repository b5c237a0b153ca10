//! Building a [`Config`] from the environment.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::{CompilerCheck, Config, Sloppiness};

/// Builds the configuration from the process environment.
pub fn from_env() -> Result<Config, ConfigError> {
    from_lookup(|name| std::env::var(name).ok())
}

/// Builds the configuration from an arbitrary key→value lookup.
///
/// This is the real loader; `from_env` just binds it to `std::env`.
/// Useful for testing without mutating the process environment.
pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
    let cache_dir = match get("CCACHE_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => match get("HOME") {
            Some(home) if !home.is_empty() => Path::new(&home).join(".ccache"),
            _ => return Err(ConfigError::NoCacheDir),
        },
    };

    let temp_dir = match get("CCACHE_TEMPDIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => cache_dir.join("tmp"),
    };

    // A relative base directory would make the rewrite ambiguous, so it
    // is ignored rather than rejected.
    let base_dir = get("CCACHE_BASEDIR")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute());

    let nlevels = get("CCACHE_NLEVELS")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|n| n.clamp(1, 8) as usize)
        .unwrap_or(2);

    let enable_unify = get("CCACHE_UNIFY").is_some();
    let enable_direct = !enable_unify && get("CCACHE_NODIRECT").is_none();

    let umask = get("CCACHE_UMASK").and_then(|v| u32::from_str_radix(&v, 8).ok());

    Ok(Config {
        cache_dir,
        temp_dir,
        log_file: get("CCACHE_LOGFILE").map(PathBuf::from),
        base_dir,
        nlevels,
        enable_direct,
        enable_unify,
        enable_compression: get("CCACHE_COMPRESS").is_some(),
        compile_preprocessed_source_code: get("CCACHE_CPP2").is_none(),
        compiler_check: get("CCACHE_COMPILERCHECK")
            .map(|v| CompilerCheck::parse(&v))
            .unwrap_or(CompilerCheck::Mtime),
        hash_dir: get("CCACHE_HASHDIR").is_some(),
        extra_files_to_hash: get("CCACHE_EXTRAFILES")
            .map(|v| {
                v.split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default(),
        sloppiness: get("CCACHE_SLOPPINESS")
            .map(|v| Sloppiness::parse(&v))
            .unwrap_or_default(),
        recache: get("CCACHE_RECACHE").is_some(),
        read_only: get("CCACHE_READONLY").is_some(),
        hard_link: get("CCACHE_HARDLINK").is_some(),
        prefix_command: get("CCACHE_PREFIX").filter(|v| !v.is_empty()),
        disabled: get("CCACHE_DISABLE").is_some(),
        compiler: get("CCACHE_CC").filter(|v| !v.is_empty()),
        extension_override: get("CCACHE_EXTENSION").filter(|v| !v.is_empty()),
        umask,
    })
}
