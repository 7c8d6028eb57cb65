//! Epoch log gateway.
//!
//! Every epoch ≥ 1 has an immutable snapshot: the sorted member entries that
//! were live at that epoch. The cluster creation time (`ctime`) is persisted
//! once at format time. Snapshot writes are atomic per epoch
//! (write-to-temp + rename), so a crash never leaves a torn snapshot behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::warn;

use shoal_core::{Epoch, NodeEntry};

use crate::cluster::PeerClient;

// ---------------------------------------------------------------------------
// EpochStore trait
// ---------------------------------------------------------------------------

/// Persistent store of epoch snapshots and the cluster creation time.
pub trait EpochStore: Send + Sync {
    /// Highest epoch with a persisted snapshot; 0 when never formatted.
    fn latest(&self) -> Epoch;

    /// Reads the snapshot for an epoch; `None` maps to `NoTag` upstream.
    fn read(&self, epoch: Epoch) -> Option<Vec<NodeEntry>>;

    /// Persists the snapshot for an epoch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot cannot be made durable.
    fn write(&self, epoch: Epoch, entries: &[NodeEntry]) -> anyhow::Result<()>;

    /// Removes the snapshot for an epoch, if present.
    fn remove(&self, epoch: Epoch);

    /// Cluster creation time; 0 when never formatted.
    fn ctime(&self) -> u64;

    /// Records the cluster creation time. Written once by format; join
    /// adoption rewrites the same value.
    ///
    /// # Errors
    ///
    /// Returns an error when the value cannot be made durable.
    fn set_ctime(&self, ctime: u64) -> anyhow::Result<()>;
}

impl<T: EpochStore + ?Sized> EpochStore for std::sync::Arc<T> {
    fn latest(&self) -> Epoch {
        (**self).latest()
    }

    fn read(&self, epoch: Epoch) -> Option<Vec<NodeEntry>> {
        (**self).read(epoch)
    }

    fn write(&self, epoch: Epoch, entries: &[NodeEntry]) -> anyhow::Result<()> {
        (**self).write(epoch, entries)
    }

    fn remove(&self, epoch: Epoch) {
        (**self).remove(epoch);
    }

    fn ctime(&self) -> u64 {
        (**self).ctime()
    }

    fn set_ctime(&self, ctime: u64) -> anyhow::Result<()> {
        (**self).set_ctime(ctime)
    }
}

/// Reads an epoch snapshot, falling back to peer RPC when the local copy is
/// missing. Used by cluster stat, which walks history that may predate this
/// node's membership.
pub fn read_or_remote(
    store: &dyn EpochStore,
    peers: &dyn PeerClient,
    members: &[NodeEntry],
    this: &NodeEntry,
    epoch: Epoch,
) -> Option<Vec<NodeEntry>> {
    if let Some(entries) = store.read(epoch) {
        return Some(entries);
    }
    for peer in members.iter().filter(|m| *m != this) {
        match peers.read_epoch(peer, epoch) {
            Ok(entries) => return Some(entries),
            Err(err) => warn!(?peer, epoch, %err, "remote epoch read failed"),
        }
    }
    None
}

// ---------------------------------------------------------------------------
// FileEpochStore
// ---------------------------------------------------------------------------

/// Directory-backed epoch store: one `MsgPack` file per epoch plus a `ctime`
/// file.
pub struct FileEpochStore {
    dir: PathBuf,
}

impl FileEpochStore {
    /// Opens (creating if needed) an epoch directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn epoch_path(&self, epoch: Epoch) -> PathBuf {
        self.dir.join(format!("{epoch:08x}"))
    }

    fn ctime_path(&self) -> PathBuf {
        self.dir.join("ctime")
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl EpochStore for FileEpochStore {
    fn latest(&self) -> Epoch {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| Epoch::from_str_radix(&e.file_name().to_string_lossy(), 16).ok())
            .max()
            .unwrap_or(0)
    }

    fn read(&self, epoch: Epoch) -> Option<Vec<NodeEntry>> {
        let bytes = fs::read(self.epoch_path(epoch)).ok()?;
        match rmp_serde::from_slice(&bytes) {
            Ok(entries) => Some(entries),
            Err(err) => {
                warn!(epoch, %err, "corrupt epoch snapshot");
                None
            }
        }
    }

    fn write(&self, epoch: Epoch, entries: &[NodeEntry]) -> anyhow::Result<()> {
        let bytes = rmp_serde::to_vec_named(entries)?;
        self.write_atomic(&self.epoch_path(epoch), &bytes)
    }

    fn remove(&self, epoch: Epoch) {
        let _ = fs::remove_file(self.epoch_path(epoch));
    }

    fn ctime(&self) -> u64 {
        let Ok(bytes) = fs::read(self.ctime_path()) else {
            return 0;
        };
        rmp_serde::from_slice(&bytes).unwrap_or(0)
    }

    fn set_ctime(&self, ctime: u64) -> anyhow::Result<()> {
        let bytes = rmp_serde::to_vec(&ctime)?;
        self.write_atomic(&self.ctime_path(), &bytes)
    }
}

// ---------------------------------------------------------------------------
// MemEpochStore
// ---------------------------------------------------------------------------

/// In-memory epoch store for tests and embedders.
#[derive(Default)]
pub struct MemEpochStore {
    inner: RwLock<MemInner>,
}

#[derive(Default)]
struct MemInner {
    snapshots: BTreeMap<Epoch, Vec<NodeEntry>>,
    ctime: u64,
}

impl MemEpochStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds a snapshot; test setup helper.
    pub fn seed(&self, epoch: Epoch, entries: Vec<NodeEntry>) {
        self.inner.write().snapshots.insert(epoch, entries);
    }
}

impl EpochStore for MemEpochStore {
    fn latest(&self) -> Epoch {
        self.inner
            .read()
            .snapshots
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    fn read(&self, epoch: Epoch) -> Option<Vec<NodeEntry>> {
        self.inner.read().snapshots.get(&epoch).cloned()
    }

    fn write(&self, epoch: Epoch, entries: &[NodeEntry]) -> anyhow::Result<()> {
        self.inner.write().snapshots.insert(epoch, entries.to_vec());
        Ok(())
    }

    fn remove(&self, epoch: Epoch) {
        self.inner.write().snapshots.remove(&epoch);
    }

    fn ctime(&self) -> u64 {
        self.inner.read().ctime
    }

    fn set_ctime(&self, ctime: u64) -> anyhow::Result<()> {
        self.inner.write().ctime = ctime;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(last: u8) -> NodeEntry {
        let mut addr = [0u8; 16];
        addr[15] = last;
        NodeEntry::new(addr, 7000, None)
    }

    #[test]
    fn file_store_round_trips_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEpochStore::open(dir.path()).unwrap();

        assert_eq!(store.latest(), 0);
        assert!(store.read(1).is_none());

        store.write(1, &[entry(1)]).unwrap();
        store.write(2, &[entry(1), entry(2)]).unwrap();

        assert_eq!(store.latest(), 2);
        assert_eq!(store.read(1).unwrap(), vec![entry(1)]);
        assert_eq!(store.read(2).unwrap().len(), 2);
    }

    #[test]
    fn file_store_remove_and_ctime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEpochStore::open(dir.path()).unwrap();

        store.write(1, &[entry(1)]).unwrap();
        store.remove(1);
        assert!(store.read(1).is_none());
        assert_eq!(store.latest(), 0);

        assert_eq!(store.ctime(), 0);
        store.set_ctime(1_700_000_000).unwrap();
        assert_eq!(store.ctime(), 1_700_000_000);
    }

    #[test]
    fn file_store_write_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEpochStore::open(dir.path()).unwrap();

        store.write(3, &[entry(1)]).unwrap();
        store.write(3, &[entry(1), entry(2)]).unwrap();
        assert_eq!(store.read(3).unwrap().len(), 2);
        // No stray temp file left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{names:?}");
    }

    #[test]
    fn mem_store_latest_tracks_highest() {
        let store = MemEpochStore::new();
        store.write(5, &[entry(5)]).unwrap();
        store.write(2, &[entry(2)]).unwrap();
        assert_eq!(store.latest(), 5);
        store.remove(5);
        assert_eq!(store.latest(), 2);
    }
}
