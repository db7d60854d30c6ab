//! Namespaced key-value persistence with explicit update scopes
//!
//! Writes are staged inside an update opened with
//! [`Persistence::begin_update`] and become visible to readers only on
//! [`Persistence::commit`]. At most one update is open at a time; a second
//! `begin_update` fails instead of waiting.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::debug;
use viewmesh_core::{Result, ViewMeshError};

/// Snapshot of a key range, in key order
pub type StateEntries = std::vec::IntoIter<(String, Vec<u8>)>;

type Namespaces = BTreeMap<String, BTreeMap<String, Vec<u8>>>;
type Staged = BTreeMap<(String, String), Option<Vec<u8>>>;

/// Transactional namespaced key-value store
pub trait Persistence: Send + Sync {
    /// Committed value of `key` in `namespace`
    fn get_state(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stage a write; requires an open update
    fn set_state(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Stage a delete; requires an open update
    fn delete_state(&self, namespace: &str, key: &str) -> Result<()>;

    /// Committed entries with keys in `[start, end)`; an empty `end` is unbounded
    fn get_state_range_scan_iterator(
        &self,
        namespace: &str,
        start: &str,
        end: &str,
    ) -> Result<StateEntries>;

    /// Open an update scope
    fn begin_update(&self) -> Result<()>;

    /// Apply the staged writes atomically
    fn commit(&self) -> Result<()>;

    /// Drop the staged writes
    fn discard(&self) -> Result<()>;

    /// Release the store; later calls fail
    fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct KvState {
    committed: Namespaces,
    pending: Option<Staged>,
    closed: bool,
}

impl KvState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ViewMeshError::storage("store closed"));
        }
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self
            .committed
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn stage(&mut self, namespace: &str, key: &str, value: Option<Vec<u8>>) -> Result<()> {
        self.ensure_open()?;
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| ViewMeshError::storage("no update in progress"))?;
        pending.insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    fn range(&self, namespace: &str, start: &str, end: &str) -> Result<StateEntries> {
        self.ensure_open()?;
        let Some(entries) = self.committed.get(namespace) else {
            return Ok(Vec::new().into_iter());
        };
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else if start >= end {
            return Ok(Vec::new().into_iter());
        } else {
            Bound::Excluded(end)
        };
        let snapshot: Vec<(String, Vec<u8>)> = entries
            .range::<str, _>((Bound::Included(start), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(snapshot.into_iter())
    }

    fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(ViewMeshError::storage("update already in progress"));
        }
        self.pending = Some(Staged::new());
        Ok(())
    }

    fn staged(&self) -> Result<&Staged> {
        self.ensure_open()?;
        self.pending
            .as_ref()
            .ok_or_else(|| ViewMeshError::storage("no update in progress"))
    }

    fn discard(&mut self) -> Result<()> {
        self.staged()?;
        self.pending = None;
        Ok(())
    }
}

/// Committed state with `staged` applied
fn apply(mut base: Namespaces, staged: &Staged) -> Namespaces {
    for ((namespace, key), value) in staged {
        match value {
            Some(value) => {
                base.entry(namespace.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            None => {
                if let Some(entries) = base.get_mut(namespace) {
                    entries.remove(key);
                }
            }
        }
    }
    base
}

/// Volatile persistence for tests and ephemeral nodes
#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<KvState>,
}

impl MemoryPersistence {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
    fn get_state(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.state.lock().get(namespace, key)
    }

    fn set_state(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.state.lock().stage(namespace, key, Some(value))
    }

    fn delete_state(&self, namespace: &str, key: &str) -> Result<()> {
        self.state.lock().stage(namespace, key, None)
    }

    fn get_state_range_scan_iterator(
        &self,
        namespace: &str,
        start: &str,
        end: &str,
    ) -> Result<StateEntries> {
        self.state.lock().range(namespace, start, end)
    }

    fn begin_update(&self) -> Result<()> {
        self.state.lock().begin()
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.staged()?;
        let staged = state.pending.take().unwrap_or_default();
        let committed = std::mem::take(&mut state.committed);
        state.committed = apply(committed, &staged);
        Ok(())
    }

    fn discard(&self) -> Result<()> {
        self.state.lock().discard()
    }

    fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// Persistence backed by a single snapshot file
///
/// The whole committed state is loaded on open and rewritten on every
/// commit through a temporary file renamed over the snapshot, so a crash
/// leaves either the previous or the new committed state on disk.
pub struct FilePersistence {
    path: PathBuf,
    state: Mutex<KvState>,
}

impl FilePersistence {
    /// Open the snapshot at `path`, starting empty if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let committed = match fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes).map_err(|e| {
                ViewMeshError::storage(format!("corrupt snapshot {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Namespaces::new(),
            Err(e) => {
                return Err(ViewMeshError::storage(format!(
                    "read snapshot {}: {e}",
                    path.display()
                )))
            }
        };
        debug!(path = %path.display(), namespaces = committed.len(), "opened file persistence");
        Ok(Self {
            path,
            state: Mutex::new(KvState {
                committed,
                ..KvState::default()
            }),
        })
    }

    /// Snapshot location
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_snapshot(&self, snapshot: &Namespaces) -> Result<()> {
        let storage_err =
            |e: &dyn std::fmt::Display| ViewMeshError::storage(format!("write snapshot {}: {e}", self.path.display()));

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| storage_err(&e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| storage_err(&e))?;
        bincode::serialize_into(&mut tmp, snapshot).map_err(|e| storage_err(&e))?;
        tmp.as_file().sync_all().map_err(|e| storage_err(&e))?;
        tmp.persist(&self.path).map_err(|e| storage_err(&e.error))?;
        Ok(())
    }
}

impl Persistence for FilePersistence {
    fn get_state(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.state.lock().get(namespace, key)
    }

    fn set_state(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.state.lock().stage(namespace, key, Some(value))
    }

    fn delete_state(&self, namespace: &str, key: &str) -> Result<()> {
        self.state.lock().stage(namespace, key, None)
    }

    fn get_state_range_scan_iterator(
        &self,
        namespace: &str,
        start: &str,
        end: &str,
    ) -> Result<StateEntries> {
        self.state.lock().range(namespace, start, end)
    }

    fn begin_update(&self) -> Result<()> {
        self.state.lock().begin()
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let next = apply(state.committed.clone(), state.staged()?);
        // On failure the update stays open so the caller can discard it
        self.write_snapshot(&next)?;
        state.committed = next;
        state.pending = None;
        debug!(path = %self.path.display(), "committed snapshot");
        Ok(())
    }

    fn discard(&self) -> Result<()> {
        self.state.lock().discard()
    }

    fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
