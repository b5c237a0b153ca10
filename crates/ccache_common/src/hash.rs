//! Streaming content hashing for cache keys.
//!
//! Cache keys are built incrementally from many logical fields (compiler
//! identity, argument tokens, source bytes, ...). The `Hasher` wraps a
//! streaming XXH3-128 state and adds two things the raw hash lacks: a
//! field delimiter that makes the concatenation of fields unambiguous,
//! and a count of the total bytes consumed, which becomes part of the
//! resulting identity.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use xxhash_rust::xxh3::Xxh3;

/// Width of a digest in bytes.
pub const DIGEST_LEN: usize = 16;

/// Identity of a hashed byte stream: the 128-bit digest plus the number
/// of bytes that produced it.
///
/// Two `FileHash`es are equal iff both the digest and the size match.
/// The size participates in cache path derivation, so a digest collision
/// between streams of different lengths still maps to distinct cache
/// entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHash {
    digest: [u8; DIGEST_LEN],
    size: u32,
}

impl FileHash {
    /// Builds a `FileHash` from raw parts (used when deserializing
    /// manifests).
    pub fn from_parts(digest: [u8; DIGEST_LEN], size: u32) -> Self {
        Self { digest, size }
    }

    /// The raw digest bytes.
    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Total bytes fed to the hasher that produced this digest.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Renders the name under which artifacts for this hash are stored:
    /// 32 lowercase hex characters, a dash, and the decimal size.
    pub fn object_name(&self) -> String {
        format!("{self}-{}", self.size)
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.digest {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileHash({:02x}{:02x}.., {})",
            self.digest[0], self.digest[1], self.size
        )
    }
}

/// Streaming fingerprint accumulator.
///
/// Clonable so that a common prefix (everything shared between the direct
/// and preprocessor lookups) can be computed once and forked.
#[derive(Clone)]
pub struct Hasher {
    state: Xxh3,
    count: u64,
}

impl Hasher {
    /// Starts a fresh hash state.
    pub fn new() -> Self {
        Self {
            state: Xxh3::new(),
            count: 0,
        }
    }

    /// Feeds raw bytes into the hash.
    pub fn update(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
        self.count += bytes.len() as u64;
    }

    /// Feeds a string into the hash.
    pub fn update_str(&mut self, s: &str) {
        self.update(s.as_bytes());
    }

    /// Feeds an integer into the hash (little-endian bytes).
    pub fn update_u64(&mut self, value: u64) {
        self.update(&value.to_le_bytes());
    }

    /// Marks a field boundary.
    ///
    /// Mixes in a NUL byte, the label, and another NUL byte, so that two
    /// different splits of the same total byte stream hash differently.
    /// Must be used between every pair of logical fields.
    pub fn delimiter(&mut self, label: &str) {
        self.update(&[0]);
        self.update(label.as_bytes());
        self.update(&[0]);
    }

    /// Streams a file's contents into the hash.
    pub fn update_file(&mut self, path: &Path) -> io::Result<()> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            self.update(&buf[..n]);
        }
    }

    /// Total bytes consumed so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.count
    }

    /// Finalizes into a `FileHash` without consuming the state.
    pub fn finish(&self) -> FileHash {
        FileHash {
            digest: self.state.digest128().to_le_bytes(),
            size: self.count as u32,
        }
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
