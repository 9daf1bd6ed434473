//! # kiln-hash
//!
//! Content fingerprinting for kiln.
//!
//! Every node in the build graph is identified by a SHA-1 digest of its
//! content: source files hash their bytes, derived nodes hash a
//! null-separated stream of their constituents. The null separator after
//! each element keeps ragged sequences distinct ("ab","c" never collides
//! with "a","bc"), and makes feeding elements one at a time equivalent to
//! feeding them in batches.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

/// Length of a fingerprint in bytes (SHA-1)
pub const DIGEST_LEN: usize = 20;

/// Separator appended after every element fed to a [`FingerprintHasher`]
const ELEMENT_SEPARATOR: u8 = 0;

/// A content fingerprint.
///
/// Displayed and parsed as 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; DIGEST_LEN]);

impl Fingerprint {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse 40 hex characters. Returns `None` on wrong length or invalid digits.
    pub fn from_hex(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        let bytes: [u8; DIGEST_LEN] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// One element of a fingerprint stream.
///
/// Byte elements enter the hash verbatim; text elements enter as their
/// UTF-8 representation.
#[derive(Debug, Clone, Copy)]
pub enum Element<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
}

/// Streaming hasher over heterogeneous elements.
///
/// Each pushed element is followed by a single null byte.
#[derive(Default)]
pub struct FingerprintHasher {
    inner: Sha1,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a byte element.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
        self.inner.update([ELEMENT_SEPARATOR]);
    }

    /// Feed a textual element as UTF-8.
    pub fn push_text(&mut self, text: impl fmt::Display) {
        self.inner.update(text.to_string().as_bytes());
        self.inner.update([ELEMENT_SEPARATOR]);
    }

    pub fn push_element(&mut self, element: Element<'_>) {
        match element {
            Element::Bytes(b) => self.push_bytes(b),
            Element::Text(t) => self.push_text(t),
        }
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.inner.finalize().into())
    }
}

/// Hash a sequence of element slices.
///
/// Multiple slices are equivalent to their concatenation:
/// `hash_iterable(&[a, b]) == hash_iterable(&[ab])`.
pub fn hash_iterable(parts: &[&[Element<'_>]]) -> Fingerprint {
    let mut hasher = FingerprintHasher::new();
    for part in parts {
        for element in *part {
            hasher.push_element(*element);
        }
    }
    hasher.finish()
}

/// Hash the contents of a file.
///
/// The file is memory-mapped read-only; an empty file cannot be mapped and
/// hashes to the digest of the empty input.
pub fn hash_file(path: &Path) -> io::Result<Fingerprint> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut hasher = Sha1::new();
    if len > 0 {
        // SAFETY: the map is read-only and dropped before this function
        // returns. Concurrent truncation of the underlying file is UB the
        // same way it is for any mmap consumer; build inputs are expected
        // to be quiescent while they are fingerprinted.
        let map = unsafe { Mmap::map(&file)? };
        hasher.update(&map[..]);
    }
    Ok(Fingerprint(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const EMPTY_SHA1: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

    fn text(s: &str) -> Element<'_> {
        Element::Text(s)
    }

    // ========== Digest Type ==========

    #[test]
    fn hex_roundtrip() {
        let fp = hash_iterable(&[&[text("x")]]);
        let parsed = Fingerprint::from_hex(&fp.to_hex()).unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Fingerprint::from_hex("da39").is_none());
        assert!(Fingerprint::from_hex(&"g".repeat(40)).is_none());
    }

    // ========== Iterable Hashing ==========

    #[test]
    fn concatenation_equivalence() {
        let a = [text("one"), text("two")];
        let b = [text("three")];
        let joined = [text("one"), text("two"), text("three")];
        assert_eq!(hash_iterable(&[&a, &b]), hash_iterable(&[&joined]));
    }

    #[test]
    fn ragged_splits_are_distinct() {
        let left = [text("ab"), text("c")];
        let right = [text("a"), text("bc")];
        assert_ne!(hash_iterable(&[&left]), hash_iterable(&[&right]));
    }

    #[test]
    fn bytes_and_text_agree_on_utf8() {
        let as_text = [Element::Text("abc")];
        let as_bytes = [Element::Bytes(b"abc")];
        assert_eq!(hash_iterable(&[&as_text]), hash_iterable(&[&as_bytes]));
    }

    #[test]
    fn incremental_matches_batch() {
        let mut hasher = FingerprintHasher::new();
        hasher.push_text("one");
        hasher.push_bytes(b"two");
        let batch = [Element::Text("one"), Element::Bytes(b"two")];
        assert_eq!(hasher.finish(), hash_iterable(&[&batch]));
    }

    #[test]
    fn empty_stream_hashes_empty_input() {
        assert_eq!(hash_iterable(&[]).to_hex(), EMPTY_SHA1);
    }

    // ========== File Hashing ==========

    #[test]
    fn empty_file_hashes_to_empty_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.txt");
        fs::write(&path, "").unwrap();
        assert_eq!(hash_file(&path).unwrap().to_hex(), EMPTY_SHA1);
    }

    #[test]
    fn known_content_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            hash_file(&path).unwrap().to_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(hash_file(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn large_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let content = vec![0xa5u8; 1 << 20];
        fs::write(&path, &content).unwrap();

        let mut expected = Sha1::new();
        expected.update(&content);
        let expected = Fingerprint(expected.finalize().into());

        assert_eq!(hash_file(&path).unwrap(), expected);
    }
}
