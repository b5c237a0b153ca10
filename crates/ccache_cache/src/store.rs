//! The on-disk artifact store.
//!
//! Artifacts are addressed by `FileHash` and stored under a configurable
//! fan-out: the first `nlevels` hex characters of the digest become
//! directory components, the rest (plus the size suffix and the artifact
//! kind's extension) the file name. All writes go through a temp file in
//! the destination directory and a single rename, so readers observe
//! either a complete artifact or nothing.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

use ccache_common::FileHash;

use crate::error::CacheError;

/// First bytes of a gzip stream, used for compression sniffing.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Handle to the cache directory tree.
pub struct CacheStore {
    cache_dir: PathBuf,
    nlevels: usize,
}

impl CacheStore {
    /// Creates a store rooted at `cache_dir` with the given fan-out
    /// depth (`nlevels` must already be clamped to `[1, 8]`).
    pub fn new(cache_dir: impl Into<PathBuf>, nlevels: usize) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            nlevels,
        }
    }

    /// The cache root.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Maps a hash to the path of one of its sibling artifacts,
    /// creating the fan-out directories.
    ///
    /// Equal hashes always yield equal paths.
    pub fn object_path(&self, hash: &FileHash, suffix: &str) -> Result<PathBuf, CacheError> {
        let name = hash.object_name();
        let mut dir = self.cache_dir.clone();
        for ch in name[..self.nlevels].chars() {
            dir.push(ch.to_string());
        }
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        Ok(dir.join(format!("{}{suffix}", &name[self.nlevels..])))
    }

    /// The statistics counter file of the bucket this hash falls into.
    pub fn stats_file_for(&self, hash: &FileHash) -> PathBuf {
        let name = hash.object_name();
        self.cache_dir.join(&name[..1]).join("stats")
    }

    /// Moves a staged temp file into the cache, optionally gzipping it.
    ///
    /// The source is always consumed. Uncompressed staging is a plain
    /// rename when possible (the driver stages next to the final
    /// location, so it normally is).
    pub fn stage_file(&self, src: &Path, dest: &Path, compress: bool) -> Result<(), CacheError> {
        if !compress {
            if fs::rename(src, dest).is_ok() {
                return Ok(());
            }
        }
        let result = write_cache_file(src, dest, compress);
        let _ = fs::remove_file(src);
        result
    }

    /// Copies a build-tree file into the cache (used for dependency
    /// files the compiler wrote directly to their destination).
    pub fn copy_into_cache(&self, src: &Path, dest: &Path, compress: bool) -> Result<(), CacheError> {
        write_cache_file(src, dest, compress)
    }

    /// Materializes a cached artifact at `dest`.
    ///
    /// Hardlinks when allowed and the artifact is uncompressed;
    /// otherwise copies, decompressing on the fly. A vanished artifact
    /// is reported as [`CacheError::Missing`] so callers can treat it as
    /// a miss.
    pub fn materialize(
        &self,
        cached: &Path,
        dest: &Path,
        allow_hardlink: bool,
    ) -> Result<(), CacheError> {
        let compressed = match is_compressed(cached) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::Missing {
                    path: cached.to_path_buf(),
                })
            }
            Err(e) => return Err(CacheError::io(cached, e)),
        };

        let _ = fs::remove_file(dest);

        if allow_hardlink && !compressed {
            return match fs::hard_link(cached, dest) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CacheError::Missing {
                    path: cached.to_path_buf(),
                }),
                Err(e) => Err(CacheError::io(cached, e)),
            };
        }

        let src = match File::open(cached) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::Missing {
                    path: cached.to_path_buf(),
                })
            }
            Err(e) => return Err(CacheError::io(cached, e)),
        };
        let mut out = File::create(dest).map_err(|e| CacheError::io(dest, e))?;
        let copy_result = if compressed {
            io::copy(&mut GzDecoder::new(src), &mut out)
        } else {
            let mut src = src;
            io::copy(&mut src, &mut out)
        };
        copy_result.map_err(|e| CacheError::io(dest, e))?;
        Ok(())
    }

    /// Streams a cached artifact into `writer`, decompressing when
    /// needed. Used to replay captured stderr.
    pub fn cat_to(&self, cached: &Path, writer: &mut dyn Write) -> io::Result<()> {
        let file = File::open(cached)?;
        if is_compressed(cached)? {
            io::copy(&mut GzDecoder::new(file), writer)?;
        } else {
            let mut file = file;
            io::copy(&mut file, writer)?;
        }
        Ok(())
    }
}

/// Writes `src`'s bytes to `dest` atomically, optionally gzipped.
fn write_cache_file(src: &Path, dest: &Path, compress: bool) -> Result<(), CacheError> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    let mut input = File::open(src).map_err(|e| CacheError::io(src, e))?;
    let tmp = NamedTempFile::new_in(parent).map_err(|e| CacheError::io(parent, e))?;

    if compress {
        let mut encoder = GzEncoder::new(tmp, Compression::default());
        io::copy(&mut input, &mut encoder).map_err(|e| CacheError::io(dest, e))?;
        let tmp = encoder.finish().map_err(|e| CacheError::io(dest, e))?;
        tmp.persist(dest)
            .map_err(|e| CacheError::io(dest, e.error))?;
    } else {
        let mut tmp = tmp;
        io::copy(&mut input, &mut tmp).map_err(|e| CacheError::io(dest, e))?;
        tmp.persist(dest)
            .map_err(|e| CacheError::io(dest, e.error))?;
    }
    Ok(())
}

/// Detects gzip compression by magic sniffing.
///
/// An empty or one-byte file is uncompressed by definition.
pub fn is_compressed(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Bumps a file's mtime to now, saving it from LRU cleanup. Best
/// effort: failures are ignored (the file may be racing with cleanup).
pub fn refresh_mtime(path: &Path) {
    if let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) {
        // SAFETY: cpath is NUL-terminated; a null times pointer means
        // "set both timestamps to now".
        unsafe {
            libc::utime(cpath.as_ptr(), std::ptr::null());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccache_common::Hasher;

    fn make_store(nlevels: usize) -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path(), nlevels);
        (dir, store)
    }

    fn hash_of(data: &[u8]) -> FileHash {
        let mut h = Hasher::new();
        h.update(data);
        h.finish()
    }

    #[test]
    fn object_path_fan_out() {
        let (_dir, store) = make_store(2);
        let fh = hash_of(b"content");
        let path = store.object_path(&fh, ".o").unwrap();

        let name = fh.object_name();
        let expected_tail: PathBuf = [
            name[..1].to_string(),
            name[1..2].to_string(),
            format!("{}.o", &name[2..]),
        ]
        .iter()
        .collect();
        assert!(path.ends_with(&expected_tail));
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn equal_hashes_equal_paths() {
        let (_dir, store) = make_store(3);
        let a = store.object_path(&hash_of(b"x"), ".manifest").unwrap();
        let b = store.object_path(&hash_of(b"x"), ".manifest").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn stats_file_in_first_level() {
        let (_dir, store) = make_store(2);
        let fh = hash_of(b"content");
        let stats = store.stats_file_for(&fh);
        assert_eq!(
            stats.parent().unwrap().file_name().unwrap().to_str().unwrap(),
            &fh.object_name()[..1]
        );
        assert_eq!(stats.file_name().unwrap(), "stats");
    }

    #[test]
    fn stage_uncompressed_is_byte_identical() {
        let (dir, store) = make_store(2);
        let src = dir.path().join("tmp.obj");
        fs::write(&src, b"object bytes").unwrap();
        let dest = store.object_path(&hash_of(b"k1"), ".o").unwrap();

        store.stage_file(&src, &dest, false).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"object bytes");
        assert!(!is_compressed(&dest).unwrap());
    }

    #[test]
    fn stage_compressed_roundtrips() {
        let (dir, store) = make_store(2);
        let src = dir.path().join("tmp.obj");
        fs::write(&src, b"compressible object bytes").unwrap();
        let dest = store.object_path(&hash_of(b"k2"), ".o").unwrap();

        store.stage_file(&src, &dest, true).unwrap();
        assert!(!src.exists());
        assert!(is_compressed(&dest).unwrap());

        let out = dir.path().join("out.o");
        store.materialize(&dest, &out, false).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"compressible object bytes");
    }

    #[test]
    fn materialize_copy() {
        let (dir, store) = make_store(2);
        let dest = store.object_path(&hash_of(b"k3"), ".o").unwrap();
        fs::write(&dest, b"cached").unwrap();

        let out = dir.path().join("result.o");
        store.materialize(&dest, &out, false).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"cached");
    }

    #[test]
    fn materialize_hardlink_when_uncompressed() {
        use std::os::unix::fs::MetadataExt;
        let (dir, store) = make_store(2);
        let dest = store.object_path(&hash_of(b"k4"), ".o").unwrap();
        fs::write(&dest, b"cached").unwrap();

        let out = dir.path().join("result.o");
        store.materialize(&dest, &out, true).unwrap();
        assert_eq!(
            fs::metadata(&dest).unwrap().ino(),
            fs::metadata(&out).unwrap().ino()
        );
    }

    #[test]
    fn materialize_compressed_never_hardlinks() {
        use std::os::unix::fs::MetadataExt;
        let (dir, store) = make_store(2);
        let src = dir.path().join("tmp");
        fs::write(&src, b"data").unwrap();
        let dest = store.object_path(&hash_of(b"k5"), ".o").unwrap();
        store.stage_file(&src, &dest, true).unwrap();

        let out = dir.path().join("result.o");
        store.materialize(&dest, &out, true).unwrap();
        assert_ne!(
            fs::metadata(&dest).unwrap().ino(),
            fs::metadata(&out).unwrap().ino()
        );
        assert_eq!(fs::read(&out).unwrap(), b"data");
    }

    #[test]
    fn materialize_missing_is_a_miss() {
        let (dir, store) = make_store(2);
        let err = store
            .materialize(
                &dir.path().join("0/0/nothere.o"),
                &dir.path().join("out.o"),
                false,
            )
            .unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn materialize_replaces_existing_destination() {
        let (dir, store) = make_store(2);
        let dest = store.object_path(&hash_of(b"k6"), ".o").unwrap();
        fs::write(&dest, b"new").unwrap();
        let out = dir.path().join("result.o");
        fs::write(&out, b"old").unwrap();

        store.materialize(&dest, &out, false).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"new");
    }

    #[test]
    fn repeated_materialize_is_idempotent() {
        let (dir, store) = make_store(2);
        let dest = store.object_path(&hash_of(b"k7"), ".o").unwrap();
        fs::write(&dest, b"stable contents").unwrap();
        let out = dir.path().join("result.o");

        store.materialize(&dest, &out, false).unwrap();
        let first = fs::read(&out).unwrap();
        store.materialize(&dest, &out, false).unwrap();
        assert_eq!(fs::read(&out).unwrap(), first);
    }

    #[test]
    fn cat_to_decompresses() {
        let (dir, store) = make_store(2);
        let src = dir.path().join("tmp");
        fs::write(&src, b"stderr text\n").unwrap();
        let dest = store.object_path(&hash_of(b"k8"), ".stderr").unwrap();
        store.stage_file(&src, &dest, true).unwrap();

        let mut sink = Vec::new();
        store.cat_to(&dest, &mut sink).unwrap();
        assert_eq!(sink, b"stderr text\n");
    }

    #[test]
    fn is_compressed_on_short_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        fs::write(&empty, b"").unwrap();
        assert!(!is_compressed(&empty).unwrap());

        let one = dir.path().join("one");
        fs::write(&one, b"x").unwrap();
        assert!(!is_compressed(&one).unwrap());
    }

    #[test]
    fn refresh_mtime_bumps() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        // Backdate, then refresh.
        let cpath = CString::new(file.as_os_str().as_bytes()).unwrap();
        let secs = old
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as libc::time_t;
        let times = libc::utimbuf {
            actime: secs,
            modtime: secs,
        };
        unsafe { libc::utime(cpath.as_ptr(), &times) };
        let backdated = fs::metadata(&file).unwrap().modified().unwrap();

        refresh_mtime(&file);
        let refreshed = fs::metadata(&file).unwrap().modified().unwrap();
        assert!(refreshed > backdated);
    }
}
