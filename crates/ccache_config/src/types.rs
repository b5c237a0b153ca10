//! Configuration value types.

use std::path::PathBuf;

/// How the compiler binary is folded into the hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompilerCheck {
    /// Don't identify the compiler at all.
    None,
    /// Hash the compiler's file size and mtime (fast, default).
    Mtime,
    /// Hash the compiler binary's full contents.
    Content,
}

impl CompilerCheck {
    /// Parses a `CCACHE_COMPILERCHECK` value. Unrecognized values fall
    /// back to `Mtime`, matching the permissive original behavior.
    pub fn parse(value: &str) -> Self {
        match value {
            "none" => CompilerCheck::None,
            "content" => CompilerCheck::Content,
            _ => CompilerCheck::Mtime,
        }
    }
}

/// Relaxations that trade cache correctness for hit rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sloppiness {
    /// Don't hash the input file name, so `__FILE__` differences are
    /// ignored.
    pub file_macro: bool,
    /// Accept include files modified after compilation started.
    pub include_file_mtime: bool,
    /// Ignore `__TIME__` and `__DATE__` occurrences in sources.
    pub time_macros: bool,
}

impl Sloppiness {
    /// Parses a comma- or space-delimited `CCACHE_SLOPPINESS` value.
    /// Unrecognized words are ignored.
    pub fn parse(value: &str) -> Self {
        let mut result = Sloppiness::default();
        for word in value.split([',', ' ']).filter(|w| !w.is_empty()) {
            match word {
                "file_macro" => result.file_macro = true,
                "include_file_mtime" => result.include_file_mtime = true,
                "time_macros" => result.time_macros = true,
                _ => {}
            }
        }
        result
    }
}

/// Immutable snapshot of the cache's configuration.
///
/// Built once per invocation from the environment; see the crate docs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root of the cache directory tree.
    pub cache_dir: PathBuf,
    /// Staging area for temporary files (preprocessor output, etc).
    pub temp_dir: PathBuf,
    /// Debug log destination, if any.
    pub log_file: Option<PathBuf>,
    /// Prefix under which absolute paths are rewritten to relative
    /// before hashing. `None` unless set to an absolute path.
    pub base_dir: Option<PathBuf>,
    /// Fan-out depth of the cache directory tree, in `[1, 8]`.
    pub nlevels: usize,
    /// Whether to attempt the direct (manifest) lookup.
    pub enable_direct: bool,
    /// Whether to hash a whitespace/comment-insensitive rendition of the
    /// preprocessed source. Implies direct mode is off.
    pub enable_unify: bool,
    /// Whether to gzip objects and dependency files on write. Manifests
    /// are always compressed.
    pub enable_compression: bool,
    /// Whether to feed the already-preprocessed source to the compile
    /// step instead of re-reading the original source.
    pub compile_preprocessed_source_code: bool,
    /// How to identify the compiler in the hash.
    pub compiler_check: CompilerCheck,
    /// Whether the current working directory participates in the hash.
    pub hash_dir: bool,
    /// Extra files whose contents are mixed into every hash.
    pub extra_files_to_hash: Vec<PathBuf>,
    /// Enabled correctness relaxations.
    pub sloppiness: Sloppiness,
    /// Force misses (but still store results).
    pub recache: bool,
    /// Never write to the cache.
    pub read_only: bool,
    /// Materialize hits by hardlink when the cached file is
    /// uncompressed.
    pub hard_link: bool,
    /// Command prepended to every invocation of the real compiler.
    pub prefix_command: Option<String>,
    /// Pass everything straight through to the real compiler.
    pub disabled: bool,
    /// Compiler name override (`CCACHE_CC`).
    pub compiler: Option<String>,
    /// Intermediate-extension override (`CCACHE_EXTENSION`), without the
    /// dot.
    pub extension_override: Option<String>,
    /// Umask override, already parsed from octal.
    pub umask: Option<u32>,
}
