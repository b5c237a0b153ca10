//! Cache cleanup: LRU trimming and full wipes.
//!
//! Cleanup works one top-level bucket at a time so concurrent compiles
//! touching other buckets are unaffected. Files are removed oldest
//! mtime first until the bucket is at 80% of its configured limits,
//! then the bucket's contents counters are rewritten from what is
//! actually on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::error::CacheError;
use crate::stats::{self, Counter};

/// Trim target as a fraction of the limit, so one cleanup buys some
/// headroom.
const LIMIT_MULTIPLE: f64 = 0.8;

/// One cached file, as seen by the cleanup walk.
struct CacheFile {
    path: PathBuf,
    size: u64,
    mtime: SystemTime,
}

/// Trims one bucket to 80% of the given limits (0 means unlimited) and
/// rewrites its contents counters. Returns the number of files removed.
pub fn cleanup_dir(bucket: &Path, max_files: u64, max_size_kib: u64) -> Result<usize, CacheError> {
    let mut files = Vec::new();
    collect_files(bucket, &mut files)?;
    files.sort_by_key(|f| f.mtime);

    let mut count = files.len() as u64;
    let mut size_kib: u64 = files.iter().map(|f| f.size / 1024).sum();

    let file_target = (max_files as f64 * LIMIT_MULTIPLE) as u64;
    let size_target = (max_size_kib as f64 * LIMIT_MULTIPLE) as u64;

    let mut removed = 0;
    for file in &files {
        let over_files = max_files > 0 && count > file_target;
        let over_size = max_size_kib > 0 && size_kib > size_target;
        if !over_files && !over_size {
            break;
        }
        match fs::remove_file(&file.path) {
            Ok(()) => {
                debug!(path = %file.path.display(), "removed from cache");
                count -= 1;
                size_kib = size_kib.saturating_sub(file.size / 1024);
                removed += 1;
            }
            Err(_) => {
                // Raced with another process; its accounting wins.
            }
        }
    }

    stats::update(&bucket.join("stats"), |c| {
        c[Counter::FilesInCache] = count;
        c[Counter::CacheSizeKib] = size_kib;
    })?;

    Ok(removed)
}

/// Runs cleanup on every bucket, using each bucket's own stored limits.
pub fn cleanup_all(cache_dir: &Path) -> Result<usize, CacheError> {
    let mut removed = 0;
    for bucket in buckets(cache_dir) {
        if !bucket.is_dir() {
            continue;
        }
        let counters = stats::read(&bucket.join("stats"));
        removed += cleanup_dir(
            &bucket,
            counters[Counter::MaxFiles],
            counters[Counter::MaxSizeKib],
        )?;
    }
    Ok(removed)
}

/// Deletes every cached artifact, preserving the stats files (with
/// zeroed contents counters).
pub fn wipe_all(cache_dir: &Path) -> Result<(), CacheError> {
    for bucket in buckets(cache_dir) {
        if !bucket.is_dir() {
            continue;
        }
        let mut files = Vec::new();
        collect_files(&bucket, &mut files)?;
        for file in files {
            let _ = fs::remove_file(&file.path);
        }
        stats::update(&bucket.join("stats"), |c| {
            c[Counter::FilesInCache] = 0;
            c[Counter::CacheSizeKib] = 0;
        })?;
    }
    Ok(())
}

fn buckets(cache_dir: &Path) -> Vec<PathBuf> {
    "0123456789abcdef"
        .chars()
        .map(|c| cache_dir.join(c.to_string()))
        .collect()
}

/// Collects cached files under `dir`, skipping the bookkeeping files
/// (`stats`, locks) that are not cache contents.
fn collect_files(dir: &Path, out: &mut Vec<CacheFile>) -> Result<(), CacheError> {
    if !dir.exists() {
        return Ok(());
    }
    let entries = fs::read_dir(dir).map_err(|e| CacheError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_dir() {
            collect_files(&path, out)?;
            continue;
        }
        let name = entry.file_name();
        if name == "stats" || path.extension().is_some_and(|e| e == "lock") {
            continue;
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        out.push(CacheFile {
            path,
            size: meta.len(),
            mtime,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    /// Writes a file with a given size and an mtime `age_secs` in the
    /// past.
    fn put_file(path: &Path, size: usize, age_secs: u64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'x'; size]).unwrap();
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            - age_secs;
        let cpath = CString::new(path.as_os_str().as_bytes()).unwrap();
        let times = libc::utimbuf {
            actime: secs as libc::time_t,
            modtime: secs as libc::time_t,
        };
        unsafe { libc::utime(cpath.as_ptr(), &times) };
    }

    #[test]
    fn removes_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("a");
        put_file(&bucket.join("b").join("old.o"), 10, 3000);
        put_file(&bucket.join("b").join("mid.o"), 10, 2000);
        put_file(&bucket.join("b").join("new.o"), 10, 1000);

        // Limit of 2 files: trim to 80% of 2 = 1 file.
        let removed = cleanup_dir(&bucket, 2, 0).unwrap();
        assert_eq!(removed, 2);
        assert!(!bucket.join("b").join("old.o").exists());
        assert!(!bucket.join("b").join("mid.o").exists());
        assert!(bucket.join("b").join("new.o").exists());
    }

    #[test]
    fn size_limit_respected() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("a");
        put_file(&bucket.join("x1.o"), 4096, 300);
        put_file(&bucket.join("x2.o"), 4096, 200);
        put_file(&bucket.join("x3.o"), 4096, 100);

        // 12 KiB present, limit 8 KiB: trim to 6.4 KiB, i.e. one file
        // left.
        let removed = cleanup_dir(&bucket, 0, 8).unwrap();
        assert_eq!(removed, 2);
        assert!(bucket.join("x3.o").exists());
    }

    #[test]
    fn no_limits_only_recounts() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("a");
        put_file(&bucket.join("x.o"), 2048, 100);
        put_file(&bucket.join("y.o"), 2048, 100);

        let removed = cleanup_dir(&bucket, 0, 0).unwrap();
        assert_eq!(removed, 0);

        let c = stats::read(&bucket.join("stats"));
        assert_eq!(c[Counter::FilesInCache], 2);
        assert_eq!(c[Counter::CacheSizeKib], 4);
    }

    #[test]
    fn stats_file_never_removed() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("a");
        put_file(&bucket.join("x.o"), 10, 100);
        stats::bump(&bucket.join("stats"), Counter::CacheMiss);

        cleanup_dir(&bucket, 1, 0).unwrap();
        assert!(bucket.join("stats").exists());
    }

    #[test]
    fn cleanup_all_uses_stored_limits() {
        let dir = tempfile::tempdir().unwrap();
        stats::set_limits(dir.path(), Some(1), None).unwrap();
        put_file(&dir.path().join("0").join("a.o"), 10, 200);
        put_file(&dir.path().join("0").join("b.o"), 10, 100);

        let removed = cleanup_all(dir.path()).unwrap();
        // Two files over a limit of 1: trimmed to 80% of 1 = 0 files.
        assert_eq!(removed, 2);
    }

    #[test]
    fn wipe_all_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        put_file(&dir.path().join("0").join("1").join("a.o"), 10, 100);
        put_file(&dir.path().join("f").join("b.manifest"), 10, 100);
        stats::add_size(&dir.path().join("0").join("stats"), 1, 1);

        wipe_all(dir.path()).unwrap();
        assert!(!dir.path().join("0").join("1").join("a.o").exists());
        assert!(!dir.path().join("f").join("b.manifest").exists());
        let c = stats::read(&dir.path().join("0").join("stats"));
        assert_eq!(c[Counter::FilesInCache], 0);
    }
}
