//! # kiln-monitor
//!
//! Filesystem change monitor feeding the engine's dirty set.
//!
//! Watches registered paths and reports the set of files whose *content*
//! actually changed since the last query. Raw watcher events are noisy
//! (editors rewrite files in place, builds touch timestamps), so every
//! event re-fingerprints the file and compares against the last known
//! state; a rewrite with identical bytes is not a change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{debug, trace};
use walkdir::WalkDir;

use kiln_hash::{hash_file, Fingerprint};

/// Errors that can occur while monitoring
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Last known content state of a path. `None` means the path is currently
/// unreadable (deleted, or not a regular file).
type ContentState = Option<Fingerprint>;

#[derive(Default)]
struct State {
    /// Content state at the last query (or at `watch` time)
    known: HashMap<PathBuf, ContentState>,
    /// Paths whose current state differs from `known`
    changed: HashMap<PathBuf, ContentState>,
}

impl State {
    fn examine(&mut self, path: &Path) {
        let path = match std::path::absolute(path) {
            Ok(p) => p,
            Err(_) => path.to_path_buf(),
        };
        let current = hash_file(&path).ok();

        if self.known.get(&path).copied().flatten() == current {
            // Back to the last reported state: a change that un-happened
            // is not a change.
            self.changed.remove(&path);
        } else {
            trace!(?path, "content changed");
            self.changed.insert(path, current);
        }
    }
}

/// Content-hash-filtered filesystem watcher.
pub struct Monitor {
    watcher: RecommendedWatcher,
    state: Arc<Mutex<State>>,
}

impl Monitor {
    pub fn new() -> Result<Self> {
        let state = Arc::new(Mutex::new(State::default()));
        let handler_state = Arc::clone(&state);
        let watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            let mut state = handler_state.lock().unwrap();
            for path in &event.paths {
                state.examine(path);
            }
        })?;
        Ok(Self { watcher, state })
    }

    /// Start watching `path`, snapshotting the current content state of
    /// every file beneath it (or the file itself when not recursive).
    pub fn watch(&mut self, path: &Path, recursive: bool) -> Result<()> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher.watch(path, mode)?;
        debug!(?path, recursive, "watching");

        let mut state = self.state.lock().unwrap();
        if recursive {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    let file = std::path::absolute(entry.path())?;
                    let fingerprint = hash_file(&file).ok();
                    state.known.insert(file, fingerprint);
                }
            }
        } else {
            let file = std::path::absolute(path)?;
            let fingerprint = hash_file(&file).ok();
            state.known.insert(file, fingerprint);
        }
        Ok(())
    }

    /// Stop watching `path`.
    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.watcher.unwatch(path)?;
        Ok(())
    }

    /// Absolute paths whose content changed since the last query.
    ///
    /// Reported states become the new baseline, so each change is
    /// reported exactly once.
    pub fn take_changed(&self) -> Vec<PathBuf> {
        let mut state = self.state.lock().unwrap();
        let changed: Vec<(PathBuf, ContentState)> = state.changed.drain().collect();
        let mut paths = Vec::with_capacity(changed.len());
        for (path, fingerprint) in changed {
            state.known.insert(path.clone(), fingerprint);
            paths.push(path);
        }
        paths
    }
}
