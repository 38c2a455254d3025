//! Versioned store for the sealed value
//!
//! The store keeps an append-only history of snapshots, each addressed by
//! a creation-time version identifier (epoch milliseconds, strictly
//! increasing, unique). The most recently inserted snapshot is the head.
//! History is immutable except for truncation: a revert replaces the head
//! with its predecessor and discards everything newer, so a reverted-away
//! future cannot be resurrected by a later insert.
//!
//! One store instance owns one backing directory. Operations are
//! synchronous and assume a single logical writer; concurrent mutation of
//! the same directory must be serialized by the caller.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::error::{ErrorCategory, ErrorKind, PillboxError, Result};
use crate::persist::{FsBackend, HistoryBackend, StoreLayout};

/// Version identifier: creation timestamp in milliseconds since the epoch,
/// bumped as needed to stay strictly increasing.
pub type VersionId = u64;

/// One stored version: the plaintext and the pill sealing it.
///
/// Immutable once written; the store never rewrites a snapshot in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub plaintext: String,
    pub envelope: Vec<u8>,
}

impl Snapshot {
    pub fn new(plaintext: impl Into<String>, envelope: Vec<u8>) -> Self {
        Self {
            plaintext: plaintext.into(),
            envelope,
        }
    }

    /// The well-defined sentinel returned by reads against a store that
    /// has never seen an insert.
    pub fn empty() -> Self {
        Self {
            plaintext: String::new(),
            envelope: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plaintext.is_empty() && self.envelope.is_empty()
    }
}

/// Locate a version identifier in a strictly sorted id sequence.
///
/// Returns the exact index in O(log n) comparisons, or `None` when the id
/// is absent. Identifiers are unique, so there are never duplicate
/// matches to tie-break.
pub fn find_version(ids: &[VersionId], id: VersionId) -> Option<usize> {
    ids.binary_search(&id).ok()
}

/// Handle over one backing directory's history.
pub struct VersionStore {
    backend: Box<dyn HistoryBackend>,
}

impl VersionStore {
    /// Open a store rooted at `dir` using the default file layout.
    ///
    /// No I/O happens until the first operation; a store over a directory
    /// that does not yet exist reads as empty.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        Self::with_backend(Box::new(FsBackend::new(StoreLayout::under(dir.as_ref()))))
    }

    pub fn with_backend(backend: Box<dyn HistoryBackend>) -> Self {
        Self { backend }
    }

    /// Append a snapshot as the new head.
    ///
    /// The history entry is written before the current-state and head
    /// records advance; a crash in between leaves the previous head
    /// authoritative with its entry intact, never a head pointer without
    /// a corresponding entry. On failure the previous head is untouched
    /// and retrying is safe (a retried insert simply gets a newer id).
    pub fn insert(&mut self, snapshot: Snapshot) -> Result<VersionId> {
        let head = self.backend.read_head()?;
        let now = unix_millis();
        let id = match head {
            Some(h) if now <= h => h + 1,
            _ => now,
        };

        self.backend.append_history_entry(id, &snapshot)?;
        self.backend.write_current(&snapshot)?;
        self.backend.write_head(id)?;

        Ok(id)
    }

    /// The head snapshot, or the empty sentinel if nothing was ever
    /// inserted. An empty store is not an error.
    pub fn current(&self) -> Result<Snapshot> {
        Ok(self.backend.read_current()?.unwrap_or_else(Snapshot::empty))
    }

    /// Step the store back to the version immediately preceding the head.
    ///
    /// The predecessor is located by binary search over the sorted id
    /// sequence, applied as the new head (current-state and head records
    /// physically rewritten), and returned; history strictly after it is
    /// pruned so the reverted-away future stays gone.
    ///
    /// When nothing earlier exists - first version, empty store, or a
    /// head pointer with no matching entry - the store wipes itself back
    /// to the empty state and fails with [`ErrorKind::NoPreviousVersion`].
    pub fn previous_version(&mut self) -> Result<Snapshot> {
        let ids = self.backend.list_history_ids()?;
        let head = self.backend.read_head()?;

        let prev_id = head
            .and_then(|h| find_version(&ids, h))
            .and_then(|idx| idx.checked_sub(1))
            .map(|idx| ids[idx]);

        let Some(prev_id) = prev_id else {
            if !self.wipe_all()? {
                warn!("wipe left stale artifacts behind; logical state is empty");
            }
            return Err(PillboxError::with_kind(
                ErrorCategory::User,
                ErrorKind::NoPreviousVersion,
                "no previous version exists; the store has been reset to an empty state",
            ));
        };

        let snapshot = self.backend.read_history_entry(prev_id)?;
        self.backend.write_current(&snapshot)?;
        self.backend.write_head(prev_id)?;
        self.prune_after(prev_id)?;

        Ok(snapshot)
    }

    /// Delete every history entry strictly newer than `id`.
    ///
    /// Deletion is best-effort per artifact: the logical head has already
    /// moved, so a leftover orphan is a cleanup nicety, logged and
    /// skipped. Pruning an already-pruned range is a no-op.
    pub fn prune_after(&mut self, id: VersionId) -> Result<()> {
        let ids = self.backend.list_history_ids()?;
        let cut = match find_version(&ids, id) {
            Some(idx) => idx + 1,
            // The pivot itself is already gone; everything at or past its
            // insertion point is strictly newer.
            None => ids.partition_point(|&v| v < id),
        };

        for &stale in &ids[cut..] {
            if let Err(err) = self.backend.delete_history_entry(stale) {
                warn!("failed to delete stale history entry {}: {}", stale, err);
            }
        }

        Ok(())
    }

    /// Remove the entire history and the current/head records.
    ///
    /// Returns whether the wipe fully succeeded. The store stays usable
    /// either way, equivalent to a fresh empty store.
    pub fn wipe_all(&mut self) -> Result<bool> {
        self.backend.delete_all()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemBackend;

    fn snapshot(text: &str) -> Snapshot {
        Snapshot::new(text, format!("pill of {}", text).into_bytes())
    }

    fn mem_store() -> VersionStore {
        VersionStore::with_backend(Box::new(MemBackend::default()))
    }

    #[test]
    fn test_find_version() {
        let ids = [10u64, 20, 30, 40, 50];

        for (idx, &id) in ids.iter().enumerate() {
            assert_eq!(find_version(&ids, id), Some(idx));
        }
        for absent in [0u64, 15, 55] {
            assert_eq!(find_version(&ids, absent), None);
        }
        assert_eq!(find_version(&[], 10), None);
    }

    #[test]
    fn test_empty_store_reads_as_sentinel() {
        let store = mem_store();
        assert_eq!(store.current().unwrap(), Snapshot::empty());
    }

    #[test]
    fn test_insert_advances_head() {
        let mut store = mem_store();

        store.insert(snapshot("one")).unwrap();
        assert_eq!(store.current().unwrap(), snapshot("one"));

        store.insert(snapshot("two")).unwrap();
        assert_eq!(store.current().unwrap(), snapshot("two"));
    }

    #[test]
    fn test_ids_strictly_increase_under_rapid_inserts() {
        let mut store = mem_store();

        // Millisecond resolution means consecutive inserts can land on
        // the same clock reading; the id must still advance.
        let ids: Vec<VersionId> = (0..10)
            .map(|i| store.insert(snapshot(&format!("v{}", i))).unwrap())
            .collect();

        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "ids not strictly increasing: {:?}", ids);
        }
    }

    #[test]
    fn test_revert_chain_down_to_wipe() {
        let mut store = mem_store();

        store.insert(snapshot("first")).unwrap();
        store.insert(snapshot("second")).unwrap();
        store.insert(snapshot("third")).unwrap();

        assert_eq!(store.previous_version().unwrap(), snapshot("second"));
        assert_eq!(store.current().unwrap(), snapshot("second"));

        assert_eq!(store.previous_version().unwrap(), snapshot("first"));
        assert_eq!(store.current().unwrap(), snapshot("first"));

        // Nothing earlier than the first version: the store resets.
        let err = store.previous_version().expect_err("expected terminal signal");
        assert_eq!(err.kind, Some(ErrorKind::NoPreviousVersion));
        assert_eq!(store.current().unwrap(), Snapshot::empty());
    }

    #[test]
    fn test_revert_on_empty_store() {
        let mut store = mem_store();

        let err = store.previous_version().expect_err("expected terminal signal");
        assert_eq!(err.kind, Some(ErrorKind::NoPreviousVersion));
        assert_eq!(store.current().unwrap(), Snapshot::empty());
    }

    #[test]
    fn test_store_usable_after_wipe() {
        let mut store = mem_store();

        store.insert(snapshot("only")).unwrap();
        let _ = store.previous_version();

        let id = store.insert(snapshot("fresh start")).unwrap();
        assert!(id > 0);
        assert_eq!(store.current().unwrap(), snapshot("fresh start"));
    }

    #[test]
    fn test_reverted_future_is_pruned() {
        let mut store = mem_store();

        store.insert(snapshot("keep")).unwrap();
        let t2 = store.insert(snapshot("also keep")).unwrap();
        store.insert(snapshot("doomed")).unwrap();

        store.previous_version().unwrap();

        // A fresh insert lands strictly after the restored version and the
        // doomed entry is no longer reachable by stepping back.
        let t4 = store.insert(snapshot("new branch")).unwrap();
        assert!(t4 > t2);

        assert_eq!(store.previous_version().unwrap(), snapshot("also keep"));
        assert_eq!(store.previous_version().unwrap(), snapshot("keep"));
        let err = store.previous_version().expect_err("history exhausted");
        assert_eq!(err.kind, Some(ErrorKind::NoPreviousVersion));
    }

    #[test]
    fn test_prune_after_is_idempotent() {
        let mut store = mem_store();

        let t1 = store.insert(snapshot("a")).unwrap();
        store.insert(snapshot("b")).unwrap();

        store.prune_after(t1).unwrap();
        store.prune_after(t1).unwrap();
        // Pruning around an id that no longer exists is also a no-op.
        store.prune_after(t1 + 1).unwrap();
    }

    #[test]
    fn test_failed_insert_leaves_head_authoritative() {
        let mut backend = MemBackend::default();
        backend.seed(snapshot("stable"), 100);
        backend.fail_writes = true;

        let mut store = VersionStore::with_backend(Box::new(backend));

        let err = store.insert(snapshot("lost")).expect_err("expected write failure");
        assert_eq!(err.kind, Some(ErrorKind::WriteFailure));
        assert_eq!(store.current().unwrap(), snapshot("stable"));
    }

    #[test]
    fn test_prune_survives_delete_failures() {
        let mut backend = MemBackend::default();
        backend.seed(snapshot("a"), 1);
        backend.seed(snapshot("b"), 2);
        backend.fail_writes = true;

        let mut store = VersionStore::with_backend(Box::new(backend));
        // Deletes fail underneath, prune logs and carries on.
        store.prune_after(1).unwrap();
    }
}
