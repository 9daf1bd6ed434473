//! # kiln-cache
//!
//! Size-bounded content-addressed store for build outputs.
//!
//! Every cached build step is keyed by its *full* fingerprint (builder,
//! inputs and learned implicit dependencies) and indexed by its *partial*
//! fingerprint (implicit dependencies excluded). The partial index is what
//! makes look-before-build possible: an application that has never run in
//! this process can ask for the implicit-dependency sets of every prior
//! run with the same builder and inputs, and rehydrate the first one whose
//! files still match.
//!
//! ## Directory layout
//!
//! ```text
//! <root>/
//! ├── metadata.bin          # versioned bincode metadata, only while idle
//! └── ab/
//!     └── cdef0123…         # one directory per entry (2+38 hex chars),
//!         └── <name>        # output files under their plain names
//! ```
//!
//! Entries are evicted least-recently-used when an insert would exceed the
//! size limit.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use kiln_hash::Fingerprint;

/// Version stamp of the persisted metadata format
pub const FORMAT_VERSION: u32 = 1;

/// Default cache budget: 1 GB
pub const DEFAULT_SIZE_LIMIT: u64 = 1_000_000_000;

const METADATA_NAME: &str = "metadata.bin";

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("item of {size} bytes does not fit a cache limited to {limit} bytes")]
    TooSmall { size: u64, limit: u64 },

    #[error("entry {0} is already cached")]
    DuplicateEntry(Fingerprint),

    #[error("entry {0} is not in the cache")]
    UnknownEntry(Fingerprint),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// The invariant that `verify_state` found broken.
///
/// One variant per check so tests can assert exactly which one tripped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateViolation {
    #[error("a partial-fingerprint bucket is empty")]
    EmptyBucket,

    #[error("a full fingerprint appears twice in one bucket")]
    DuplicateInBucket,

    #[error("an entry's partial fingerprint does not match the bucket that lists it")]
    MismatchedPartialHash,

    #[error("a bucket references a full fingerprint with no entry")]
    DanglingBucketEntry,

    #[error("an entry is not referenced by any bucket")]
    UnreferencedEntry,

    #[error("a path under the cache root is not owned by any entry")]
    StrayPath,

    #[error("on-disk size does not match the accounted size")]
    SizeMismatch,

    #[error("accounted size exceeds the size limit")]
    OverLimit,
}

/// An implicit dependency as remembered by the cache: the absolute path the
/// builder read, and the fingerprint its content had at build time.
pub type ImplicitDep = (PathBuf, Fingerprint);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    size: u64,
    partial: Fingerprint,
    implicit_deps: Vec<ImplicitDep>,
}

/// Persisted image of the in-memory indices.
///
/// Entries are stored least-recently-used first so the recency order
/// survives a round trip. The version field gates decoding: a mismatch is
/// treated the same as a corrupt file.
#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    version: u32,
    size_used: u64,
    entries: Vec<(Fingerprint, Entry)>,
    buckets: Vec<(Fingerprint, Vec<Fingerprint>)>,
}

/// Content-addressed output cache.
///
/// Not internally synchronized; the engine wraps it in its own lock.
#[derive(Debug)]
pub struct Cache {
    root: PathBuf,
    size_limit: u64,
    size_used: u64,
    entries: HashMap<Fingerprint, Entry>,
    /// Recency order over `entries` keys: front is evicted first.
    recency: VecDeque<Fingerprint>,
    /// partial fingerprint → full fingerprints, in insertion order.
    buckets: HashMap<Fingerprint, Vec<Fingerprint>>,
}

impl Cache {
    /// Open a cache rooted at `root` with the given size budget.
    ///
    /// Starts empty; call [`Cache::load`] to restore persisted metadata.
    /// No filesystem state is touched until the first mutation.
    pub fn open(root: impl Into<PathBuf>, size_limit: u64) -> Self {
        let root = root.into();
        trace!(?root, size_limit, "open cache");
        Self {
            root,
            size_limit,
            size_used: 0,
            entries: HashMap::new(),
            recency: VecDeque::new(),
            buckets: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn size_used(&self) -> u64 {
        self.size_used
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Directory that holds (or would hold) the output files of an entry:
    /// `<root>/<first two hex chars>/<remaining 38>`.
    pub fn entry_dir(&self, full: &Fingerprint) -> PathBuf {
        let hex = full.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    /// Move `paths` into the cache under `full`.
    ///
    /// The entry must be new under both indices. Space is reserved first by
    /// evicting least-recently-used entries; if the item alone exceeds the
    /// budget the cache is left untouched and `TooSmall` is returned. The
    /// new entry becomes the most recently used.
    pub fn put(
        &mut self,
        full: Fingerprint,
        partial: Fingerprint,
        paths: &[PathBuf],
        implicit_deps: Vec<ImplicitDep>,
    ) -> Result<()> {
        if self.entries.contains_key(&full) {
            return Err(CacheError::DuplicateEntry(full));
        }
        if let Some(bucket) = self.buckets.get(&partial) {
            if bucket.contains(&full) {
                return Err(CacheError::DuplicateEntry(full));
            }
        }

        let mut size = 0u64;
        for path in paths {
            size += fs::metadata(path)?.len();
        }
        if size > self.size_limit {
            return Err(CacheError::TooSmall {
                size,
                limit: self.size_limit,
            });
        }
        self.reserve(size)?;

        let dir = self.entry_dir(&full);
        if dir.exists() {
            return Err(CacheError::DuplicateEntry(full));
        }
        fs::create_dir_all(&dir)?;
        for path in paths {
            let name = path.file_name().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "output path has no file name")
            })?;
            fs::rename(path, dir.join(name))?;
        }

        self.entries.insert(
            full,
            Entry {
                size,
                partial,
                implicit_deps,
            },
        );
        self.recency.push_back(full);
        self.buckets.entry(partial).or_default().push(full);
        self.size_used += size;
        debug!(%full, %partial, size, used = self.size_used, "cached entry");
        Ok(())
    }

    /// Implicit-dependency sets of every entry sharing `partial`, in
    /// insertion order. Unknown partial fingerprints yield an empty list.
    pub fn get_candidate_implicit_dependencies(
        &self,
        partial: &Fingerprint,
    ) -> Vec<Vec<ImplicitDep>> {
        let Some(bucket) = self.buckets.get(partial) else {
            return Vec::new();
        };
        bucket
            .iter()
            .map(|full| self.entries[full].implicit_deps.clone())
            .collect()
    }

    /// Mark `full` as the most recently used entry.
    pub fn accessed(&mut self, full: &Fingerprint) -> Result<()> {
        if !self.entries.contains_key(full) {
            return Err(CacheError::UnknownEntry(*full));
        }
        let position = self
            .recency
            .iter()
            .position(|candidate| candidate == full)
            .expect("entry present in map but missing from recency order");
        let _ = self.recency.remove(position);
        self.recency.push_back(*full);
        Ok(())
    }

    /// Forget everything; optionally delete the on-disk directory as well.
    pub fn clear(&mut self, delete_directory: bool) -> Result<()> {
        self.size_used = 0;
        self.entries.clear();
        self.recency.clear();
        self.buckets.clear();

        if delete_directory {
            match fs::remove_dir_all(&self.root) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Persist the metadata next to the entries.
    ///
    /// An empty cache writes nothing: there is nothing worth restoring and
    /// the root directory may not even exist yet.
    pub fn save(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }

        let entries = self
            .recency
            .iter()
            .map(|full| (*full, self.entries[full].clone()))
            .collect();
        let buckets = self
            .buckets
            .iter()
            .map(|(partial, fulls)| (*partial, fulls.clone()))
            .collect();
        let metadata = Metadata {
            version: FORMAT_VERSION,
            size_used: self.size_used,
            entries,
            buckets,
        };

        let encoded = bincode::serialize(&metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(self.root.join(METADATA_NAME), encoded)?;
        debug!(entries = self.entries.len(), "saved cache metadata");
        Ok(())
    }

    /// Restore metadata written by [`Cache::save`].
    ///
    /// Returns `Ok(true)` if an intact save file was restored. A missing
    /// file, a decode failure, a version mismatch or a broken invariant all
    /// downgrade to an empty cache and return `Ok(false)`; only I/O errors
    /// propagate. The save file is unlinked as soon as it has been read so
    /// that a crash between later mutations cannot replay stale metadata.
    ///
    /// The size limit is ignored while loading; a limit smaller than the
    /// restored contents takes effect on the next `put`.
    pub fn load(&mut self) -> Result<bool> {
        let path = self.root.join(METADATA_NAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;

        let metadata: Metadata = match bincode::deserialize(&bytes) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "cache metadata is unreadable, starting empty");
                self.clear(true)?;
                return Ok(false);
            }
        };
        if metadata.version != FORMAT_VERSION {
            warn!(
                found = metadata.version,
                expected = FORMAT_VERSION,
                "cache metadata version mismatch, starting empty"
            );
            self.clear(true)?;
            return Ok(false);
        }

        self.size_used = metadata.size_used;
        self.entries = metadata
            .entries
            .iter()
            .map(|(full, entry)| (*full, entry.clone()))
            .collect();
        self.recency = metadata.entries.iter().map(|(full, _)| *full).collect();
        self.buckets = metadata.buckets.into_iter().collect();

        // Verify with the limit out of the way, like an unbounded cache: a
        // shrunken limit must not reject an otherwise intact save file.
        let limit = self.size_limit;
        self.size_limit = u64::MAX;
        let verified = self.verify_state();
        self.size_limit = limit;

        if let Err(violation) = verified {
            warn!(%violation, "cache metadata is inconsistent, starting empty");
            self.clear(true)?;
            return Ok(false);
        }
        debug!(entries = self.entries.len(), "restored cache metadata");
        Ok(true)
    }

    /// Check every internal invariant, including agreement with the disk.
    ///
    /// The save file counts as a stray path; this is meant to run while the
    /// metadata lives in memory (it is consumed on load and only written
    /// back when the cache goes idle).
    pub fn verify_state(&self) -> std::result::Result<(), StateViolation> {
        let mut referenced: HashMap<Fingerprint, Fingerprint> = HashMap::new();
        for (partial, bucket) in &self.buckets {
            if bucket.is_empty() {
                return Err(StateViolation::EmptyBucket);
            }
            for (i, full) in bucket.iter().enumerate() {
                if bucket[..i].contains(full) {
                    return Err(StateViolation::DuplicateInBucket);
                }
                match self.entries.get(full) {
                    None => return Err(StateViolation::DanglingBucketEntry),
                    Some(entry) if entry.partial != *partial => {
                        return Err(StateViolation::MismatchedPartialHash)
                    }
                    Some(_) => {}
                }
                referenced.insert(*full, *partial);
            }
        }
        for full in self.entries.keys() {
            if !referenced.contains_key(full) {
                return Err(StateViolation::UnreferencedEntry);
            }
        }

        let disk_size = self.scan_disk()?;
        if disk_size != self.size_used {
            return Err(StateViolation::SizeMismatch);
        }
        if self.size_used > self.size_limit {
            return Err(StateViolation::OverLimit);
        }
        Ok(())
    }

    /// Walk the root and sum the sizes of files under owned entry
    /// directories. Anything else is a stray path: a file outside every
    /// owned directory, or a directory that neither contains an owned
    /// directory nor lies under one.
    fn scan_disk(&self) -> std::result::Result<u64, StateViolation> {
        if !self.root.exists() {
            return Ok(0);
        }
        let owned: Vec<PathBuf> = self.entries.keys().map(|f| self.entry_dir(f)).collect();

        let mut size = 0u64;
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|_| StateViolation::StrayPath)?;
            let path = entry.path();

            if owned.iter().any(|dir| path.starts_with(dir)) {
                if entry.file_type().is_file() {
                    let metadata = entry.metadata().map_err(|_| StateViolation::StrayPath)?;
                    size += metadata.len();
                }
                continue;
            }
            let shelters_owned = entry.file_type().is_dir()
                && owned.iter().any(|dir| dir.starts_with(path) && dir.as_path() != path);
            if !shelters_owned {
                return Err(StateViolation::StrayPath);
            }
        }
        Ok(size)
    }

    /// Evict least-recently-used entries until `size` more bytes fit.
    fn reserve(&mut self, size: u64) -> Result<()> {
        while self.size_used + size > self.size_limit {
            let Some(victim) = self.recency.front().copied() else {
                return Err(CacheError::TooSmall {
                    size,
                    limit: self.size_limit,
                });
            };
            self.discard(victim)?;
        }
        Ok(())
    }

    fn discard(&mut self, full: Fingerprint) -> Result<()> {
        let entry = self
            .entries
            .remove(&full)
            .ok_or(CacheError::UnknownEntry(full))?;
        self.recency.retain(|candidate| candidate != &full);

        let bucket = self
            .buckets
            .get_mut(&entry.partial)
            .expect("bucket missing for cached entry");
        bucket.retain(|candidate| candidate != &full);
        if bucket.is_empty() {
            self.buckets.remove(&entry.partial);
        }

        let dir = self.entry_dir(&full);
        fs::remove_dir_all(&dir)?;
        if let Some(parent) = dir.parent() {
            // Prune the two-hex-char fan-out directory once its last entry
            // is gone; an empty one would read as a stray path.
            let _ = fs::remove_dir(parent);
        }

        self.size_used -= entry.size;
        debug!(%full, freed = entry.size, used = self.size_used, "evicted entry");
        Ok(())
    }
}
