//! Scanning preprocessed translation units.
//!
//! Preprocessor output interleaves source text with line markers naming
//! the files it came from. The scanner hashes the whole stream while
//! normalizing the marker paths (so builds from different checkouts
//! under one base directory hash identically) and, when direct mode is
//! live, collects each referenced include file with its content hash
//! into an [`IncludeSet`] for the manifest.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use tracing::debug;

use ccache_common::paths::make_relative_path;
use ccache_common::{FileHash, Hasher};
use ccache_config::Sloppiness;

use crate::error::CacheError;

/// Include path → content hash, byte-wise ordered.
///
/// Never contains the input file itself, directories, or the
/// `<built-in>`/`<command-line>` pseudo-files.
pub type IncludeSet = BTreeMap<String, FileHash>;

/// What the time-macro scan found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceHashOutcome {
    /// No `__TIME__`/`__DATE__` (or the check was waived).
    Clean,
    /// The source mentions `__TIME__` or `__DATE__`, so a content hash
    /// alone cannot prove the output is reusable.
    TimeMacroFound,
}

/// Hashes source bytes, scanning for time macros unless waived.
///
/// The bytes are always fed to the hasher; the outcome only reports
/// whether a time macro was seen.
pub fn hash_source_bytes(
    hasher: &mut Hasher,
    data: &[u8],
    sloppy_time_macros: bool,
) -> SourceHashOutcome {
    hasher.update(data);
    if !sloppy_time_macros && (contains(data, b"__TIME__") || contains(data, b"__DATE__")) {
        SourceHashOutcome::TimeMacroFound
    } else {
        SourceHashOutcome::Clean
    }
}

/// Reads and hashes a source file; see [`hash_source_bytes`].
pub fn hash_source_file(
    hasher: &mut Hasher,
    path: &Path,
    sloppy_time_macros: bool,
) -> Result<SourceHashOutcome, CacheError> {
    let data = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
    Ok(hash_source_bytes(hasher, &data, sloppy_time_macros))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Inputs the scanner needs beyond the hasher and the file itself.
pub struct ScanParams<'a> {
    /// Logical working directory, for base-directory rewriting.
    pub cwd: &'a Path,
    /// Base directory under which paths are rewritten, if any.
    pub base_dir: Option<&'a Path>,
    /// The translation unit being compiled (never collected).
    pub input_file: &'a str,
    /// Start of the compilation; includes modified at or after this
    /// point are suspect.
    pub time_of_compilation: SystemTime,
    /// Enabled correctness relaxations.
    pub sloppiness: Sloppiness,
    /// Whether to build an include set (direct mode is still live).
    pub collect_includes: bool,
}

/// Hashes a preprocessed translation unit, extracting include paths
/// from line markers.
///
/// Recognizes the GCC form `# N "path"` and the HP form
/// `#line N "path"` at the start of a line. Returns the collected
/// include set, or `None` when collection was off or had to be
/// abandoned (direct-mode demotion); the stream hash is complete either
/// way. A marker with no closing quote is a hard error.
pub fn scan_preprocessed(
    hasher: &mut Hasher,
    path: &Path,
    params: &ScanParams<'_>,
) -> Result<Option<IncludeSet>, CacheError> {
    let data = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;

    let mut includes = params.collect_includes.then(IncludeSet::new);
    let end = data.len();
    let mut p = 0; // start of bytes pending hashing
    let mut q = 0; // scan cursor

    // A marker needs at least `# 1 "x"` left in the buffer.
    while q + 7 < end {
        let at_line_start = q == 0 || data[q - 1] == b'\n';
        let gcc_form = data[q] == b'#' && data[q + 1] == b' ' && data[q + 2].is_ascii_digit();
        let hp_form = data[q..].starts_with(b"#line ");
        if at_line_start && (gcc_form || hp_form) {
            // Hash up to and including the opening quote, then swap the
            // quoted path for its rewritten form.
            while q < end && data[q] != b'"' {
                q += 1;
            }
            q += 1;
            if q >= end {
                return Err(CacheError::UnparseableMarker {
                    path: path.to_path_buf(),
                });
            }
            hasher.update(&data[p..q]);
            p = q;
            while q < end && data[q] != b'"' {
                q += 1;
            }
            let raw = String::from_utf8_lossy(&data[p..q]).into_owned();
            let rewritten = make_relative_path(params.cwd, params.base_dir, &raw);
            hasher.update_str(&rewritten);
            let demote = match &mut includes {
                Some(set) => !remember_include(set, params, rewritten),
                None => false,
            };
            if demote {
                debug!("include processing failed; abandoning include set");
                includes = None;
            }
            p = q;
        } else {
            q += 1;
        }
    }

    hasher.update(&data[p..]);
    Ok(includes)
}

/// Adds one referenced file to the include set.
///
/// Returns `false` when the file cannot be trusted (unreadable, too
/// new, or contains time macros), which demotes direct mode for this
/// compilation. Pseudo-files, directories, duplicates, and the input
/// file itself are ignored without prejudice.
fn remember_include(set: &mut IncludeSet, params: &ScanParams<'_>, path: String) -> bool {
    if path.starts_with('<') && path.ends_with('>') {
        // Typically <built-in> or <command-line>.
        return true;
    }
    if path == params.input_file {
        return true;
    }
    if set.contains_key(&path) {
        return true;
    }

    let meta = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(e) => {
            debug!(path = %path, error = %e, "failed to stat include file");
            return false;
        }
    };
    if meta.is_dir() {
        // Typically $PWD appearing in a marker.
        return true;
    }
    if !params.sloppiness.include_file_mtime {
        if let Ok(mtime) = meta.modified() {
            if mtime >= params.time_of_compilation {
                debug!(path = %path, "include file too new");
                return false;
            }
        }
    }

    let data = match std::fs::read(&path) {
        Ok(d) => d,
        Err(e) => {
            debug!(path = %path, error = %e, "failed to read include file");
            return false;
        }
    };

    let mut hasher = Hasher::new();
    match hash_source_bytes(&mut hasher, &data, params.sloppiness.time_macros) {
        SourceHashOutcome::Clean => {
            set.insert(path, hasher.finish());
            true
        }
        SourceHashOutcome::TimeMacroFound => {
            debug!(path = %path, "include file contains __TIME__ or __DATE__");
            false
        }
    }
}
