//! Per-source manifests for direct-mode lookups.
//!
//! A manifest maps one source fingerprint to a list of candidate
//! results: each entry records the set of include files (by path and
//! content hash) that were in effect when an object was produced, plus
//! the hash under which that object is stored. A direct-mode lookup
//! probes the entries against the current filesystem and takes the first
//! one whose includes all still match.
//!
//! On-disk format (version 0, magic `cCmF`), big-endian, the whole file
//! gzip-compressed:
//!
//! - header: 4-byte magic, 1-byte version, 1-byte hash size, 2 reserved
//!   bytes
//! - paths: u32 count, then NUL-terminated strings
//! - file infos: u32 count, then {u32 path index, digest, u32 size}
//! - objects: u32 count, then {u32 count M, M × u32 file-info indexes,
//!   digest, u32 size}
//!
//! Any malformed manifest is treated as absent; the next write simply
//! replaces it.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use tracing::debug;

use ccache_common::hash::DIGEST_LEN;
use ccache_common::FileHash;

use crate::scan::IncludeSet;

/// Magic bytes identifying a manifest file.
const MAGIC: [u8; 4] = *b"cCmF";

/// Current manifest format version.
const VERSION: u8 = 0;

/// Cap on the path and file-info pools. Beyond this a manifest stops
/// accepting new entries rather than evicting old ones.
const MAX_MANIFEST_ENTRIES: usize = 16384;

/// A (path index, content hash) pair shared between entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileInfo {
    path_index: u32,
    hash: FileHash,
}

/// One candidate result: an include-set signature and the object hash it
/// maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObjectEntry {
    file_info_indexes: Vec<u32>,
    object_hash: FileHash,
}

/// In-memory form of a manifest file.
#[derive(Debug, Default)]
struct Manifest {
    paths: Vec<String>,
    file_infos: Vec<FileInfo>,
    objects: Vec<ObjectEntry>,
}

/// Looks up an object hash in the manifest at `path`.
///
/// `verify` is called with each include path and must return the current
/// `FileHash` of that file, or `None` when it cannot be trusted
/// (unreadable, or contains time macros). Results are memoized across
/// entries. Returns `None` on any kind of mismatch or manifest damage.
pub fn get(
    path: &Path,
    mut verify: impl FnMut(&str) -> Option<FileHash>,
) -> Option<FileHash> {
    let manifest = read(path)?;

    // Memoized verification per file-info index; distinct infos can
    // share a path, so the path lookup itself is also memoized by the
    // caller's closure if it cares.
    let mut verified: Vec<Option<bool>> = vec![None; manifest.file_infos.len()];
    let mut current: Vec<Option<Option<FileHash>>> = vec![None; manifest.paths.len()];

    'entries: for entry in &manifest.objects {
        for &fi_index in &entry.file_info_indexes {
            let fi = manifest.file_infos.get(fi_index as usize)?;
            let ok = match verified[fi_index as usize] {
                Some(ok) => ok,
                None => {
                    let path_index = fi.path_index as usize;
                    let actual = current
                        .get_mut(path_index)?
                        .get_or_insert_with(|| verify(&manifest.paths[path_index]))
                        .as_ref()
                        .copied();
                    let ok = actual == Some(fi.hash);
                    verified[fi_index as usize] = Some(ok);
                    ok
                }
            };
            if !ok {
                continue 'entries;
            }
        }
        return Some(entry.object_hash);
    }
    None
}

/// Records that `included` produced `object_hash`, appending to the
/// manifest at `path` (creating it if needed).
///
/// Returns `false` without writing when the manifest is full or the
/// write fails; callers treat that as a shrug, never an error. An entry
/// identical to an existing one is not duplicated (but still counts as
/// success).
pub fn put(path: &Path, object_hash: FileHash, included: &IncludeSet) -> bool {
    let mut manifest = read(path).unwrap_or_default();

    if manifest.paths.len() > MAX_MANIFEST_ENTRIES
        || manifest.file_infos.len() > MAX_MANIFEST_ENTRIES
    {
        debug!(path = %path.display(), "manifest has too many entries; not adding");
        return false;
    }

    let mut file_info_indexes = Vec::with_capacity(included.len());
    for (include_path, hash) in included {
        let path_index = match manifest.paths.iter().position(|p| p == include_path) {
            Some(i) => i as u32,
            None => {
                manifest.paths.push(include_path.clone());
                (manifest.paths.len() - 1) as u32
            }
        };
        let info = FileInfo {
            path_index,
            hash: *hash,
        };
        let fi_index = match manifest.file_infos.iter().position(|fi| *fi == info) {
            Some(i) => i as u32,
            None => {
                manifest.file_infos.push(info);
                (manifest.file_infos.len() - 1) as u32
            }
        };
        file_info_indexes.push(fi_index);
    }

    let entry = ObjectEntry {
        file_info_indexes,
        object_hash,
    };
    if manifest.objects.contains(&entry) {
        return true;
    }
    manifest.objects.push(entry);

    match write(path, &manifest) {
        Ok(()) => true,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "failed to write manifest");
            false
        }
    }
}

/// Reads and validates a manifest. Any failure (missing file, bad gzip,
/// bad magic, wrong version, truncation) yields `None`.
fn read(path: &Path) -> Option<Manifest> {
    let file = File::open(path).ok()?;
    let mut data = Vec::new();
    GzDecoder::new(file).read_to_end(&mut data).ok()?;
    parse(&data)
}

fn parse(data: &[u8]) -> Option<Manifest> {
    let mut r = Reader { data, pos: 0 };

    if r.bytes(4)? != MAGIC {
        return None;
    }
    if r.u8()? != VERSION {
        return None;
    }
    if r.u8()? as usize != DIGEST_LEN {
        return None;
    }
    r.u16()?; // reserved

    let n_paths = r.u32()? as usize;
    let mut paths = Vec::with_capacity(n_paths.min(MAX_MANIFEST_ENTRIES));
    for _ in 0..n_paths {
        paths.push(r.cstring()?);
    }

    let n_infos = r.u32()? as usize;
    let mut file_infos = Vec::with_capacity(n_infos.min(MAX_MANIFEST_ENTRIES));
    for _ in 0..n_infos {
        let path_index = r.u32()?;
        if path_index as usize >= paths.len() {
            return None;
        }
        let digest: [u8; DIGEST_LEN] = r.bytes(DIGEST_LEN)?.try_into().ok()?;
        let size = r.u32()?;
        file_infos.push(FileInfo {
            path_index,
            hash: FileHash::from_parts(digest, size),
        });
    }

    let n_objects = r.u32()? as usize;
    let mut objects = Vec::with_capacity(n_objects.min(MAX_MANIFEST_ENTRIES));
    for _ in 0..n_objects {
        let n_indexes = r.u32()? as usize;
        let mut file_info_indexes = Vec::with_capacity(n_indexes.min(MAX_MANIFEST_ENTRIES));
        for _ in 0..n_indexes {
            let index = r.u32()?;
            if index as usize >= file_infos.len() {
                return None;
            }
            file_info_indexes.push(index);
        }
        let digest: [u8; DIGEST_LEN] = r.bytes(DIGEST_LEN)?.try_into().ok()?;
        let size = r.u32()?;
        objects.push(ObjectEntry {
            file_info_indexes,
            object_hash: FileHash::from_parts(digest, size),
        });
    }

    Some(Manifest {
        paths,
        file_infos,
        objects,
    })
}

/// Serializes and atomically replaces the manifest at `path`.
fn write(path: &Path, manifest: &Manifest) -> std::io::Result<()> {
    let mut data = Vec::new();
    data.extend_from_slice(&MAGIC);
    data.push(VERSION);
    data.push(DIGEST_LEN as u8);
    data.extend_from_slice(&0u16.to_be_bytes());

    data.extend_from_slice(&(manifest.paths.len() as u32).to_be_bytes());
    for p in &manifest.paths {
        data.extend_from_slice(p.as_bytes());
        data.push(0);
    }

    data.extend_from_slice(&(manifest.file_infos.len() as u32).to_be_bytes());
    for fi in &manifest.file_infos {
        data.extend_from_slice(&fi.path_index.to_be_bytes());
        data.extend_from_slice(fi.hash.digest());
        data.extend_from_slice(&fi.hash.size().to_be_bytes());
    }

    data.extend_from_slice(&(manifest.objects.len() as u32).to_be_bytes());
    for obj in &manifest.objects {
        data.extend_from_slice(&(obj.file_info_indexes.len() as u32).to_be_bytes());
        for &i in &obj.file_info_indexes {
            data.extend_from_slice(&i.to_be_bytes());
        }
        data.extend_from_slice(obj.object_hash.digest());
        data.extend_from_slice(&obj.object_hash.size().to_be_bytes());
    }

    let parent = path.parent().unwrap_or(Path::new("."));
    let tmp = NamedTempFile::new_in(parent)?;
    let mut encoder = GzEncoder::new(tmp, Compression::default());
    encoder.write_all(&data)?;
    let tmp = encoder.finish()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Cursor over the decompressed manifest bytes.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes(self.bytes(2)?.try_into().ok()?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes(self.bytes(4)?.try_into().ok()?))
    }

    fn cstring(&mut self) -> Option<String> {
        let rest = self.data.get(self.pos..)?;
        let nul = rest.iter().position(|&b| b == 0)?;
        let s = std::str::from_utf8(&rest[..nul]).ok()?.to_string();
        self.pos += nul + 1;
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccache_common::Hasher;
    use std::collections::BTreeMap;

    fn hash_of(data: &[u8]) -> FileHash {
        let mut h = Hasher::new();
        h.update(data);
        h.finish()
    }

    fn include_set(items: &[(&str, &[u8])]) -> IncludeSet {
        items
            .iter()
            .map(|&(p, data)| (p.to_string(), hash_of(data)))
            .collect()
    }

    /// A verifier that resolves include paths from a fixed map.
    fn verifier(
        files: BTreeMap<String, FileHash>,
    ) -> impl FnMut(&str) -> Option<FileHash> {
        move |path| files.get(path).copied()
    }

    #[test]
    fn get_on_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        assert!(get(&path, |_| None).is_none());
    }

    #[test]
    fn put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        let includes = include_set(&[("a.h", b"alpha"), ("b/c.h", b"beta")]);
        let obj = hash_of(b"object");

        assert!(put(&path, obj, &includes));
        let got = get(&path, verifier(includes.clone())).unwrap();
        assert_eq!(got, obj);
    }

    #[test]
    fn changed_include_misses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        let includes = include_set(&[("a.h", b"alpha"), ("b.h", b"beta")]);
        let obj = hash_of(b"object");
        assert!(put(&path, obj, &includes));

        let mut edited = includes.clone();
        edited.insert("a.h".to_string(), hash_of(b"alpha edited"));
        assert!(get(&path, verifier(edited)).is_none());
    }

    #[test]
    fn unverifiable_include_misses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        let includes = include_set(&[("a.h", b"alpha")]);
        assert!(put(&path, hash_of(b"object"), &includes));

        // The include can no longer be hashed (deleted, or contains
        // time macros).
        assert!(get(&path, |_| None).is_none());
    }

    #[test]
    fn multiple_entries_probed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");

        let old_includes = include_set(&[("a.h", b"old contents")]);
        let old_obj = hash_of(b"old object");
        assert!(put(&path, old_obj, &old_includes));

        let new_includes = include_set(&[("a.h", b"new contents")]);
        let new_obj = hash_of(b"new object");
        assert!(put(&path, new_obj, &new_includes));

        // Whichever state a.h is in decides which entry matches.
        assert_eq!(get(&path, verifier(old_includes)), Some(old_obj));
        assert_eq!(get(&path, verifier(new_includes)), Some(new_obj));
    }

    #[test]
    fn identical_entry_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        let includes = include_set(&[("a.h", b"alpha")]);
        let obj = hash_of(b"object");

        assert!(put(&path, obj, &includes));
        let size_after_first = std::fs::metadata(&path).unwrap().len();
        assert!(put(&path, obj, &includes));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size_after_first);

        let manifest = read(&path).unwrap();
        assert_eq!(manifest.objects.len(), 1);
    }

    #[test]
    fn pools_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");

        // Two entries share a.h with identical contents; the path and
        // file-info pools must not grow.
        let shared = include_set(&[("a.h", b"alpha"), ("b.h", b"beta v1")]);
        assert!(put(&path, hash_of(b"obj1"), &shared));
        let shared2 = include_set(&[("a.h", b"alpha"), ("b.h", b"beta v2")]);
        assert!(put(&path, hash_of(b"obj2"), &shared2));

        let manifest = read(&path).unwrap();
        assert_eq!(manifest.paths.len(), 2);
        assert_eq!(manifest.file_infos.len(), 3);
        assert_eq!(manifest.objects.len(), 2);
    }

    #[test]
    fn corrupt_gzip_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        std::fs::write(&path, b"definitely not gzip").unwrap();
        assert!(get(&path, |_| None).is_none());

        // And a put simply replaces it.
        let includes = include_set(&[("a.h", b"alpha")]);
        let obj = hash_of(b"object");
        assert!(put(&path, obj, &includes));
        assert_eq!(get(&path, verifier(includes)), Some(obj));
    }

    #[test]
    fn bad_magic_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");

        let mut data = Vec::new();
        data.extend_from_slice(b"XXXX");
        data.push(VERSION);
        data.push(DIGEST_LEN as u8);
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());

        let file = File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(&data).unwrap();
        enc.finish().unwrap();

        assert!(read(&path).is_none());
    }

    #[test]
    fn wrong_version_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        let includes = include_set(&[("a.h", b"alpha")]);
        assert!(put(&path, hash_of(b"object"), &includes));

        // Flip the version byte inside the gzip stream.
        let mut raw = Vec::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_end(&mut raw)
            .unwrap();
        raw[4] = VERSION + 1;
        let file = File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(&raw).unwrap();
        enc.finish().unwrap();

        assert!(read(&path).is_none());
    }

    #[test]
    fn truncated_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        let includes = include_set(&[("a.h", b"alpha")]);
        assert!(put(&path, hash_of(b"object"), &includes));

        let mut raw = Vec::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_end(&mut raw)
            .unwrap();
        raw.truncate(raw.len() - 5);
        let file = File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(&raw).unwrap();
        enc.finish().unwrap();

        assert!(read(&path).is_none());
    }

    #[test]
    fn empty_include_set_entry() {
        // A source with no includes at all still gets an entry that
        // always matches.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        let obj = hash_of(b"object");
        assert!(put(&path, obj, &IncludeSet::new()));
        assert_eq!(get(&path, |_| None), Some(obj));
    }

    #[test]
    fn on_disk_layout_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        let includes = include_set(&[("a.h", b"alpha")]);
        assert!(put(&path, hash_of(b"object"), &includes));

        let mut raw = Vec::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_end(&mut raw)
            .unwrap();
        assert_eq!(&raw[..4], b"cCmF");
        assert_eq!(raw[4], 0);
        assert_eq!(raw[5], 16);
        assert_eq!(&raw[6..8], &[0, 0]);
        // One path...
        assert_eq!(&raw[8..12], &1u32.to_be_bytes());
        assert_eq!(&raw[12..16], b"a.h\0");
        // ...one file info...
        assert_eq!(&raw[16..20], &1u32.to_be_bytes());
        // ...pointing at path 0.
        assert_eq!(&raw[20..24], &0u32.to_be_bytes());
    }
}
