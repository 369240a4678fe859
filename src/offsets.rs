// SPDX-License-Identifier: Apache-2.0

//! Durable per-file read cursors.
//!
//! Each monitored source registers once at startup and gets back its resume
//! offset. The tailer mints a [`LineCursor`] per enqueued line; the sender
//! commits cursors after the broker accepts a batch. Commits are the only
//! way a cursor advances, so the durable read position never leads the
//! broker's acknowledged state.
//!
//! State is kept in memory behind a mutex and checkpointed to a JSON file
//! with a write-to-temp-then-rename, so a partially written state file is
//! never observed. A store without a backing path is purely in-memory,
//! which the tests use.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::record::{LineCursor, SourceId};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    version: u32,
    /// Source path -> byte offset just past the last committed line.
    #[serde(default)]
    offsets: HashMap<String, u64>,
}

#[derive(Debug)]
struct SourceState {
    path: String,
    /// Sequence of the most recently enqueued line, 0 before any enqueue.
    enqueued_seq: u64,
    /// Sequence of the most recently committed line.
    committed_seq: u64,
    /// Byte offset just past the last committed line.
    committed_offset: u64,
}

struct Inner {
    sources: Vec<SourceState>,
    /// Offsets loaded from disk for paths not yet registered.
    loaded: HashMap<String, u64>,
}

pub struct OffsetStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl OffsetStore {
    /// Open the store backed by `path`, loading any previously committed
    /// offsets.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let loaded = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| Error::Persistence(format!("failed to open offset file: {}", e)))?;
            let state: PersistedState = serde_json::from_reader(BufReader::new(file))
                .map_err(|e| Error::Persistence(format!("failed to parse offset file: {}", e)))?;
            state.offsets
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).map_err(|e| {
                        Error::Persistence(format!("failed to create offset directory: {}", e))
                    })?;
                }
            }
            HashMap::new()
        };

        Ok(Self {
            path: Some(path),
            inner: Mutex::new(Inner {
                sources: Vec::new(),
                loaded,
            }),
        })
    }

    /// An in-memory store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner {
                sources: Vec::new(),
                loaded: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-update of
        // plain counters; the state is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a source file, returning its id. Reading resumes strictly
    /// after the offset committed in a previous run, if any.
    pub fn register(&self, path: &str) -> SourceId {
        let mut inner = self.lock();
        let committed_offset = inner.loaded.remove(path).unwrap_or(0);
        inner.sources.push(SourceState {
            path: path.to_string(),
            enqueued_seq: 0,
            committed_seq: 0,
            committed_offset,
        });
        inner.sources.len() - 1
    }

    /// Byte offset to resume reading from.
    pub fn committed_offset(&self, source: SourceId) -> u64 {
        self.lock().sources[source].committed_offset
    }

    /// Mint the commit token for the next line of `source`; `offset` is the
    /// byte position just past the line.
    pub fn note_enqueued(&self, source: SourceId, offset: u64) -> LineCursor {
        let mut inner = self.lock();
        let state = &mut inner.sources[source];
        state.enqueued_seq += 1;
        LineCursor {
            source,
            seq: state.enqueued_seq,
            offset,
        }
    }

    /// Advance the source's cursor. Monotonic and idempotent: a cursor at or
    /// below the committed sequence is ignored.
    pub fn commit(&self, cursor: LineCursor) {
        let mut inner = self.lock();
        let state = &mut inner.sources[cursor.source];
        if cursor.seq > state.committed_seq {
            state.committed_seq = cursor.seq;
            state.committed_offset = cursor.offset;
        }
    }

    /// Reset a source's cursor to the start of its file, for when the file
    /// was truncated or rotated below the committed offset. Sequence
    /// numbering continues, so cursors already in flight stay valid.
    pub fn rewind(&self, source: SourceId) {
        let mut inner = self.lock();
        inner.sources[source].committed_offset = 0;
    }

    /// True once every line enqueued for `source` has been committed.
    pub fn all_committed(&self, source: SourceId) -> bool {
        let inner = self.lock();
        let state = &inner.sources[source];
        state.committed_seq == state.enqueued_seq
    }

    /// Checkpoint committed offsets to disk.
    pub fn sync(&self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };

        let state = {
            let inner = self.lock();
            let mut offsets: HashMap<String, u64> = inner.loaded.clone();
            for source in &inner.sources {
                offsets.insert(source.path.clone(), source.committed_offset);
            }
            PersistedState {
                version: STATE_VERSION,
                offsets,
            }
        };

        atomic_write(path, &state)
    }
}

fn atomic_write(path: &Path, state: &PersistedState) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp)
            .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, state)
            .map_err(|e| Error::Persistence(format!("failed to serialize offsets: {}", e)))?;
        writer
            .flush()
            .map_err(|e| Error::Persistence(format!("failed to flush offsets: {}", e)))?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| Error::Persistence(format!("failed to replace offset file: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn commit_is_monotonic_and_idempotent() {
        let store = OffsetStore::in_memory();
        let id = store.register("/var/log/a.log");

        let c1 = store.note_enqueued(id, 10);
        let c2 = store.note_enqueued(id, 20);
        assert_eq!(1, c1.seq);
        assert_eq!(2, c2.seq);
        assert!(!store.all_committed(id));

        store.commit(c2);
        assert_eq!(20, store.committed_offset(id));
        assert!(store.all_committed(id));

        // Stale and duplicate cursors are no-ops.
        store.commit(c1);
        store.commit(c2);
        assert_eq!(20, store.committed_offset(id));
    }

    #[test]
    fn commit_order_matches_enqueue_order() {
        let store = OffsetStore::in_memory();
        let id = store.register("/var/log/a.log");

        let cursors: Vec<_> = (1..=5).map(|n| store.note_enqueued(id, n * 100)).collect();
        for c in &cursors {
            store.commit(*c);
        }
        assert_eq!(500, store.committed_offset(id));
        assert!(store.all_committed(id));
    }

    #[test]
    fn rewind_resets_the_committed_offset() {
        let store = OffsetStore::in_memory();
        let id = store.register("/var/log/a.log");

        let c = store.note_enqueued(id, 10);
        store.commit(c);
        assert_eq!(10, store.committed_offset(id));

        store.rewind(id);
        assert_eq!(0, store.committed_offset(id));
        assert!(store.all_committed(id));

        // Commits picked up again after the rewind advance as usual.
        let c = store.note_enqueued(id, 6);
        store.commit(c);
        assert_eq!(6, store.committed_offset(id));
    }

    #[test]
    fn sources_are_independent() {
        let store = OffsetStore::in_memory();
        let a = store.register("/var/log/a.log");
        let b = store.register("/var/log/b.log");

        let ca = store.note_enqueued(a, 10);
        let _cb = store.note_enqueued(b, 30);

        store.commit(ca);
        assert!(store.all_committed(a));
        assert!(!store.all_committed(b));
        assert_eq!(10, store.committed_offset(a));
        assert_eq!(0, store.committed_offset(b));
    }

    #[test]
    fn offsets_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("offsets.json");

        {
            let store = OffsetStore::open(&state_path).unwrap();
            let id = store.register("/var/log/a.log");
            let c = store.note_enqueued(id, 42);
            store.commit(c);
            store.sync().unwrap();
        }

        let store = OffsetStore::open(&state_path).unwrap();
        let id = store.register("/var/log/a.log");
        assert_eq!(42, store.committed_offset(id));

        // Unknown paths start at the beginning.
        let other = store.register("/var/log/new.log");
        assert_eq!(0, store.committed_offset(other));
    }
}
