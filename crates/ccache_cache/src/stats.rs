//! Statistics counter files.
//!
//! Each top-level cache bucket has a `stats` file: one line of ASCII
//! unsigned counters in a fixed order. Failures that happen before any
//! digest exists (argument rejection, missing compiler) are counted in a
//! `stats` file at the cache root, which the summary folds in.
//!
//! Updates are read-modify-write under a best-effort `.lock` file; the
//! rewrite itself goes through temp + rename, so a reader never sees a
//! torn line. Unknown trailing fields are preserved so newer versions
//! can extend the file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::error::CacheError;

/// A statistics counter. The discriminant is the field's position in
/// the file; existing positions must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    /// Cache hit decided from the manifest alone.
    DirectCacheHit = 0,
    /// Cache hit decided from the preprocessor output.
    PreprocessedCacheHit = 1,
    /// Had to run the real compiler.
    CacheMiss = 2,
    /// Invoked for linking, not compiling.
    CalledForLink = 3,
    /// Invoked on an autoconf probe.
    AutoconfTest = 4,
    /// More than one source file on the command line.
    MultipleSourceFiles = 5,
    /// The compiler wrote to stdout.
    CompilerProducedStdout = 6,
    /// The compiler produced no object file.
    CompilerProducedNoOutput = 7,
    /// The compiler produced an empty object file.
    CompilerProducedEmptyOutput = 8,
    /// The compiler exited nonzero.
    CompileFailed = 9,
    /// An internal error in the cache itself.
    InternalError = 10,
    /// The preprocessor exited nonzero.
    PreprocessorError = 11,
    /// The real compiler could not be found.
    CouldNotFindCompiler = 12,
    /// A cached artifact vanished between lookup and use.
    CacheFileMissing = 13,
    /// An option was missing its operand.
    BadCompilerArguments = 14,
    /// The source language is not supported.
    UnsupportedSourceLanguage = 15,
    /// An option the cache cannot handle.
    UnsupportedCompilerOption = 16,
    /// The object was directed to stdout.
    OutputToStdout = 17,
    /// The output path exists but is not a regular file.
    BadOutputFile = 18,
    /// No input file on the command line.
    NoInputFile = 19,
    /// A CCACHE_EXTRAFILES entry could not be read.
    BadExtraFile = 20,
    /// Number of files currently in this bucket.
    FilesInCache = 21,
    /// Total size of this bucket in KiB.
    CacheSizeKib = 22,
    /// Configured file-count limit (0 = none).
    MaxFiles = 23,
    /// Configured size limit in KiB (0 = none).
    MaxSizeKib = 24,
}

/// Number of known counters.
pub const NUM_COUNTERS: usize = 25;

/// Counters that describe bucket contents or limits rather than events;
/// `--zero-stats` leaves them alone and the summary treats them
/// specially.
const FIRST_SIZE_COUNTER: usize = Counter::FilesInCache as usize;

/// One stats file's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counters(Vec<u64>);

impl Counters {
    /// All-zero counters.
    pub fn new() -> Self {
        Counters(vec![0; NUM_COUNTERS])
    }

    /// Parses a stats file's contents. Short files are padded with
    /// zeros, garbage fields read as zero, longer files keep their
    /// extra fields.
    pub fn parse(content: &str) -> Self {
        let mut values: Vec<u64> = content
            .split_whitespace()
            .map(|w| w.parse().unwrap_or(0))
            .collect();
        if values.len() < NUM_COUNTERS {
            values.resize(NUM_COUNTERS, 0);
        }
        Counters(values)
    }

    fn render(&self) -> String {
        let words: Vec<String> = self.0.iter().map(u64::to_string).collect();
        let mut line = words.join(" ");
        line.push('\n');
        line
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<Counter> for Counters {
    type Output = u64;
    fn index(&self, c: Counter) -> &u64 {
        &self.0[c as usize]
    }
}

impl IndexMut<Counter> for Counters {
    fn index_mut(&mut self, c: Counter) -> &mut u64 {
        &mut self.0[c as usize]
    }
}

/// Reads a stats file; a missing or unreadable file is all zeros.
pub fn read(path: &Path) -> Counters {
    match fs::read_to_string(path) {
        Ok(content) => Counters::parse(&content),
        Err(_) => Counters::new(),
    }
}

/// Applies `f` to the counters in `path` under the stats lock.
pub fn update(path: &Path, f: impl FnOnce(&mut Counters)) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }
    let _lock = StatsLock::acquire(path);
    let mut counters = read(path);
    f(&mut counters);
    write(path, &counters)
}

/// Bumps one counter by one. Best effort: failures are swallowed, a
/// statistics problem must never break a compile.
pub fn bump(path: &Path, counter: Counter) {
    let _ = update(path, |c| c[counter] += 1);
}

/// Adds to the file-count and size accounting of a bucket.
pub fn add_size(path: &Path, files: u64, kib: u64) {
    let _ = update(path, |c| {
        c[Counter::FilesInCache] += files;
        c[Counter::CacheSizeKib] += kib;
    });
}

fn write(path: &Path, counters: &Counters) -> Result<(), CacheError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| CacheError::io(parent, e))?;
    tmp.write_all(counters.render().as_bytes())
        .map_err(|e| CacheError::io(path, e))?;
    tmp.persist(path).map_err(|e| CacheError::io(path, e.error))?;
    Ok(())
}

/// The stats files of every top-level bucket plus the root, existing or
/// not.
fn all_stats_files(cache_dir: &Path) -> Vec<PathBuf> {
    let mut files = vec![cache_dir.join("stats")];
    for c in "0123456789abcdef".chars() {
        files.push(cache_dir.join(c.to_string()).join("stats"));
    }
    files
}

/// Sums event counters across all buckets. Contents counters are
/// summed too; the limits are taken as the maximum configured anywhere.
pub fn summarize(cache_dir: &Path) -> Counters {
    let mut total = Counters::new();
    for file in all_stats_files(cache_dir) {
        let c = read(&file);
        for i in 0..NUM_COUNTERS {
            if i == Counter::MaxFiles as usize || i == Counter::MaxSizeKib as usize {
                total.0[i] = total.0[i].max(c.0[i]);
            } else {
                total.0[i] += c.0[i];
            }
        }
    }
    total
}

/// Zeros the event counters everywhere, preserving contents and limits.
pub fn zero_all(cache_dir: &Path) -> Result<(), CacheError> {
    for file in all_stats_files(cache_dir) {
        if file.exists() {
            update(&file, |c| {
                for v in &mut c.0[..FIRST_SIZE_COUNTER] {
                    *v = 0;
                }
            })?;
        }
    }
    Ok(())
}

/// Writes cache limits into every bucket (creating the buckets), so
/// cleanup passes can find them. `None` leaves a limit unchanged.
pub fn set_limits(
    cache_dir: &Path,
    max_files: Option<u64>,
    max_size_kib: Option<u64>,
) -> Result<(), CacheError> {
    for c in "0123456789abcdef".chars() {
        let file = cache_dir.join(c.to_string()).join("stats");
        update(&file, |counters| {
            if let Some(files) = max_files {
                counters[Counter::MaxFiles] = files;
            }
            if let Some(kib) = max_size_kib {
                counters[Counter::MaxSizeKib] = kib;
            }
        })?;
    }
    Ok(())
}

/// Best-effort exclusive lock: an O_EXCL-created sibling file. If the
/// lock cannot be had within the retry budget it is stolen; losing a
/// counter tick beats blocking a compile forever.
struct StatsLock {
    path: PathBuf,
}

impl StatsLock {
    fn acquire(stats_file: &Path) -> Self {
        let path = stats_file.with_extension("lock");
        for _ in 0..100 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return StatsLock { path },
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        StatsLock { path }
    }
}

impl Drop for StatsLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
