//! Persistence primitive backing the version store
//!
//! The store talks to its storage through [`HistoryBackend`], a small
//! contract over a current-state record, a head pointer, and a directory
//! of history entries addressed by version id. [`FsBackend`] implements
//! it over JSON files with atomic tempfile-and-rename replacement;
//! [`MemBackend`] is an in-memory stand-in for tests.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::armor;
use crate::error::{ErrorCategory, ErrorKind, PillboxError, Result};
use crate::store::{Snapshot, VersionId};

/// Storage operations the version store requires.
///
/// `list_history_ids` must return a strictly sorted, duplicate-free
/// sequence. Writes must be durable on success; on failure the previously
/// recorded state must remain readable.
pub trait HistoryBackend {
    fn read_current(&self) -> Result<Option<Snapshot>>;
    fn write_current(&mut self, snapshot: &Snapshot) -> Result<()>;
    fn read_head(&self) -> Result<Option<VersionId>>;
    fn write_head(&mut self, id: VersionId) -> Result<()>;
    fn append_history_entry(&mut self, id: VersionId, snapshot: &Snapshot) -> Result<()>;
    fn read_history_entry(&self, id: VersionId) -> Result<Snapshot>;
    fn list_history_ids(&self) -> Result<Vec<VersionId>>;
    fn delete_history_entry(&mut self, id: VersionId) -> Result<()>;
    /// Remove everything. Returns whether the wipe fully succeeded; the
    /// backend must remain usable (as a fresh empty store) either way.
    fn delete_all(&mut self) -> Result<bool>;
}

/// File locations for one store directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub source_file: PathBuf,
    pub head_file: PathBuf,
    pub history_dir: PathBuf,
    pub diff_prefix: String,
}

impl StoreLayout {
    /// The default layout under a root directory.
    pub fn under(root: &Path) -> Self {
        Self {
            source_file: root.join("source.json"),
            head_file: root.join("head.json"),
            history_dir: root.join("history"),
            diff_prefix: "diff_".to_string(),
        }
    }
}

/// On-disk form of a snapshot: plaintext in the clear (the independently
/// trusted copy), the pill armored.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    data: String,
    pill: String,
}

impl SnapshotRecord {
    fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            data: snapshot.plaintext.clone(),
            // The empty-state sentinel serializes as an empty string, not
            // as armored empty bytes.
            pill: if snapshot.envelope.is_empty() {
                String::new()
            } else {
                armor::wrap(&snapshot.envelope)
            },
        }
    }

    fn into_snapshot(self) -> Result<Snapshot> {
        let envelope = if self.pill.is_empty() {
            Vec::new()
        } else {
            armor::unwrap(&self.pill)
                .map_err(|e| e.with_context("stored pill record failed to unarmor"))?
        };
        Ok(Snapshot::new(self.data, envelope))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HeadRecord {
    version: VersionId,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryRecord {
    version: VersionId,
    #[serde(flatten)]
    snapshot: SnapshotRecord,
}

/// JSON-files-in-a-directory backend.
pub struct FsBackend {
    layout: StoreLayout,
}

impl FsBackend {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn history_path(&self, id: VersionId) -> PathBuf {
        self.layout
            .history_dir
            .join(format!("{}{}.json", self.layout.diff_prefix, id))
    }

    /// Parse a history file name back into its version id.
    fn id_from_file_name(&self, name: &str) -> Option<VersionId> {
        name.strip_prefix(&self.layout.diff_prefix)?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }
}

impl HistoryBackend for FsBackend {
    fn read_current(&self) -> Result<Option<Snapshot>> {
        match read_json::<SnapshotRecord>(&self.layout.source_file)? {
            Some(record) => Ok(Some(record.into_snapshot()?)),
            None => Ok(None),
        }
    }

    fn write_current(&mut self, snapshot: &Snapshot) -> Result<()> {
        write_json(&self.layout.source_file, &SnapshotRecord::from_snapshot(snapshot))
    }

    fn read_head(&self) -> Result<Option<VersionId>> {
        Ok(read_json::<HeadRecord>(&self.layout.head_file)?.map(|record| record.version))
    }

    fn write_head(&mut self, id: VersionId) -> Result<()> {
        write_json(&self.layout.head_file, &HeadRecord { version: id })
    }

    fn append_history_entry(&mut self, id: VersionId, snapshot: &Snapshot) -> Result<()> {
        let record = HistoryRecord {
            version: id,
            snapshot: SnapshotRecord::from_snapshot(snapshot),
        };
        write_json(&self.history_path(id), &record)
    }

    fn read_history_entry(&self, id: VersionId) -> Result<Snapshot> {
        match read_json::<HistoryRecord>(&self.history_path(id))? {
            Some(record) => record.snapshot.into_snapshot(),
            None => Err(PillboxError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                format!("history entry {} is listed but missing on disk", id),
            )),
        }
    }

    fn list_history_ids(&self) -> Result<Vec<VersionId>> {
        let entries = match fs::read_dir(&self.layout.history_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PillboxError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    format!(
                        "failed to list history directory {}",
                        self.layout.history_dir.display()
                    ),
                    e,
                ));
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                PillboxError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to read history directory entry",
                    e,
                )
            })?;
            let name = entry.file_name();
            match name.to_str().and_then(|n| self.id_from_file_name(n)) {
                Some(id) => ids.push(id),
                None => warn!(
                    "skipping unrecognized file in history directory: {:?}",
                    name
                ),
            }
        }

        // File names are unique, so sorting alone yields the strictly
        // increasing, duplicate-free sequence the store relies on.
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete_history_entry(&mut self, id: VersionId) -> Result<()> {
        match fs::remove_file(self.history_path(id)) {
            Ok(()) => Ok(()),
            // Already gone is as good as deleted.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PillboxError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("failed to delete history entry {}", id),
                e,
            )),
        }
    }

    fn delete_all(&mut self) -> Result<bool> {
        let mut complete = true;

        if let Err(e) = fs::remove_dir_all(&self.layout.history_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    "failed to remove history directory {}: {}",
                    self.layout.history_dir.display(),
                    e
                );
                complete = false;
            }
        }
        for path in [&self.layout.source_file, &self.layout.head_file] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {}", path.display(), e);
                    complete = false;
                }
            }
        }

        Ok(complete)
    }
}

/// Read and parse a JSON record, mapping a missing file to `None`.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PillboxError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("failed to read {}", path.display()),
                e,
            ));
        }
    };

    let value = serde_json::from_slice(&bytes).map_err(|e| {
        PillboxError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            format!("failed to parse record {}", path.display()),
            e,
        )
    })?;
    Ok(Some(value))
}

/// Durably replace a JSON record: write to a tempfile in the target
/// directory, flush, fsync, then rename over the destination. A crash at
/// any point leaves either the old record or the new one, never a
/// partial file. Files are created 0o600 on Unix.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let write_failure = |msg: String, e: io::Error| {
        PillboxError::with_kind_and_source(ErrorCategory::Internal, ErrorKind::WriteFailure, msg, e)
    };

    let parent = path.parent().ok_or_else(|| {
        PillboxError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::WriteFailure,
            format!("{} has no parent directory", path.display()),
        )
    })?;
    fs::create_dir_all(parent)
        .map_err(|e| write_failure(format!("failed to create {}", parent.display()), e))?;

    let body = serde_json::to_vec(value).map_err(|e| {
        PillboxError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::WriteFailure,
            format!("failed to encode record for {}", path.display()),
            e,
        )
    })?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| write_failure("failed to create tempfile".to_string(), e))?;
    temp_file
        .write_all(&body)
        .map_err(|e| write_failure("failed to write to tempfile".to_string(), e))?;
    temp_file
        .flush()
        .map_err(|e| write_failure("failed to flush tempfile".to_string(), e))?;
    // fsync() so that the rename, if it succeeds, points at a fully
    // written file.
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| write_failure("failed to sync file prior to rename".to_string(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = temp_file
            .as_file()
            .metadata()
            .map_err(|e| write_failure("failed to get tempfile metadata".to_string(), e))?
            .permissions();
        perms.set_mode(0o600);
        temp_file
            .as_file()
            .set_permissions(perms)
            .map_err(|e| write_failure("failed to set tempfile permissions".to_string(), e))?;
    }

    temp_file.persist(path).map_err(|e| {
        PillboxError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::WriteFailure,
            format!("failed to rename into place at {}", path.display()),
            e.error,
        )
    })?;

    Ok(())
}

/// In-memory backend for tests: same contract, no filesystem, plus a
/// switch that makes every mutating operation fail.
#[derive(Debug, Default)]
pub struct MemBackend {
    current: Option<Snapshot>,
    head: Option<VersionId>,
    entries: BTreeMap<VersionId, Snapshot>,
    pub fail_writes: bool,
}

impl MemBackend {
    /// Install a snapshot as an existing version, bypassing the failure
    /// switch. Test setup only.
    pub fn seed(&mut self, snapshot: Snapshot, id: VersionId) {
        self.entries.insert(id, snapshot.clone());
        self.current = Some(snapshot);
        self.head = Some(id);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes {
            Err(PillboxError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::WriteFailure,
                "backend is refusing writes",
            ))
        } else {
            Ok(())
        }
    }
}

impl HistoryBackend for MemBackend {
    fn read_current(&self) -> Result<Option<Snapshot>> {
        Ok(self.current.clone())
    }

    fn write_current(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.check_writable()?;
        self.current = Some(snapshot.clone());
        Ok(())
    }

    fn read_head(&self) -> Result<Option<VersionId>> {
        Ok(self.head)
    }

    fn write_head(&mut self, id: VersionId) -> Result<()> {
        self.check_writable()?;
        self.head = Some(id);
        Ok(())
    }

    fn append_history_entry(&mut self, id: VersionId, snapshot: &Snapshot) -> Result<()> {
        self.check_writable()?;
        self.entries.insert(id, snapshot.clone());
        Ok(())
    }

    fn read_history_entry(&self, id: VersionId) -> Result<Snapshot> {
        self.entries.get(&id).cloned().ok_or_else(|| {
            PillboxError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                format!("history entry {} is missing", id),
            )
        })
    }

    fn list_history_ids(&self) -> Result<Vec<VersionId>> {
        Ok(self.entries.keys().copied().collect())
    }

    fn delete_history_entry(&mut self, id: VersionId) -> Result<()> {
        self.check_writable()?;
        self.entries.remove(&id);
        Ok(())
    }

    fn delete_all(&mut self) -> Result<bool> {
        if self.fail_writes {
            return Ok(false);
        }
        self.current = None;
        self.head = None;
        self.entries.clear();
        Ok(true)
    }
}
