use super::writer_lock::WriterLock;
use super::{Handover, Snapshot, StoreConnection, StoreEngine, Table, WriteTxn};
use crate::config::{DurabilityMode, KelpConfig};
use crate::error::KelpError;
use crate::version::VersionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, info};

const STORE_FORMAT: u32 = 1;

/// File-backed engine: snapshots live in memory while a file has open
/// connections, and every commit is written atomically to the store path.
#[derive(Clone)]
pub struct FileEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    files: Mutex<HashMap<PathBuf, FileEntry>>,
    next_connection_id: AtomicU64,
    max_retained_versions: usize,
}

struct FileEntry {
    shared: Arc<SharedFile>,
    connections: usize,
}

struct SharedFile {
    path: PathBuf,
    durability: DurabilityMode,
    chain: Mutex<VersionChain>,
    writer: WriterLock,
}

struct VersionChain {
    versions: VecDeque<Arc<Snapshot>>,
    max_retained: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStore {
    format: u32,
    generation: u64,
    index: u64,
    schema_version: Option<u64>,
    tables: BTreeMap<String, PersistedTable>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedTable {
    next_id: u64,
    rows: BTreeMap<u64, Value>,
}

impl Default for FileEngine {
    fn default() -> Self {
        Self::new(64)
    }
}

impl FileEngine {
    pub fn new(max_retained_versions: usize) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                files: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
                max_retained_versions: max_retained_versions.max(1),
            }),
        }
    }

    /// Latest committed version of `path`, if the file is currently loaded.
    pub fn loaded_version(&self, path: &Path) -> Option<VersionId> {
        let files = self.inner.files.lock();
        files.get(path).map(|e| e.shared.latest().version())
    }

    /// Number of versions currently retained for `path`.
    pub fn retained_versions(&self, path: &Path) -> usize {
        let files = self.inner.files.lock();
        files
            .get(path)
            .map(|e| e.shared.chain.lock().versions.len())
            .unwrap_or(0)
    }
}

impl StoreEngine for FileEngine {
    fn connect(&self, config: &KelpConfig) -> Result<Box<dyn StoreConnection>, KelpError> {
        let shared = {
            let mut files = self.inner.files.lock();
            match files.get_mut(config.path()) {
                Some(entry) => {
                    entry.connections += 1;
                    Arc::clone(&entry.shared)
                }
                None => {
                    let snapshot = load_store(config.path())?;
                    info!(
                        path = %config.path().display(),
                        version = %snapshot.version(),
                        schema_version = ?snapshot.schema_version(),
                        "store file loaded"
                    );
                    let shared = Arc::new(SharedFile {
                        path: config.path().to_path_buf(),
                        durability: config.durability_mode,
                        chain: Mutex::new(VersionChain::new(
                            snapshot,
                            self.inner.max_retained_versions,
                        )),
                        writer: WriterLock::default(),
                    });
                    files.insert(
                        config.path().to_path_buf(),
                        FileEntry {
                            shared: Arc::clone(&shared),
                            connections: 1,
                        },
                    );
                    shared
                }
            }
        };
        let snapshot = shared.latest();
        Ok(Box::new(FileConnection {
            id: self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed),
            engine: Arc::clone(&self.inner),
            shared,
            snapshot,
            write: None,
            closed: false,
        }))
    }

    fn delete(&self, path: &Path) -> Result<bool, KelpError> {
        let files = self.inner.files.lock();
        if files.contains_key(path) {
            return Err(KelpError::StoreInUse {
                path: path.to_path_buf(),
            });
        }
        match fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "store file deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn open_connections(&self, path: &Path) -> usize {
        let files = self.inner.files.lock();
        files.get(path).map(|e| e.connections).unwrap_or(0)
    }
}

impl EngineInner {
    fn disconnect(&self, path: &Path) {
        let mut files = self.files.lock();
        let Some(entry) = files.get_mut(path) else {
            return;
        };
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections == 0 {
            files.remove(path);
            debug!(path = %path.display(), "store file unloaded");
        }
    }
}

impl SharedFile {
    fn latest(&self) -> Arc<Snapshot> {
        self.chain.lock().latest()
    }
}

impl VersionChain {
    fn new(initial: Snapshot, max_retained: usize) -> Self {
        let mut versions = VecDeque::new();
        versions.push_back(Arc::new(initial));
        Self {
            versions,
            max_retained,
        }
    }

    fn latest(&self) -> Arc<Snapshot> {
        // The chain is never empty: pruning always keeps the newest version.
        match self.versions.back() {
            Some(s) => Arc::clone(s),
            None => Arc::new(Snapshot::empty(VersionId::new(0, 0))),
        }
    }

    fn push(&mut self, snapshot: Arc<Snapshot>) {
        self.versions.push_back(snapshot);
        self.prune();
    }

    fn find(&self, version: VersionId) -> Result<Arc<Snapshot>, KelpError> {
        if let Some(s) = self.versions.iter().find(|s| s.version() == version) {
            return Ok(Arc::clone(s));
        }
        let newest = self.latest().version();
        if version > newest {
            return Err(KelpError::Validation(format!(
                "requested version {version} is not yet visible (latest visible: {newest})"
            )));
        }
        Err(KelpError::SnapshotExpired(version))
    }

    /// Drops old versions nobody pins any more. The newest is always kept.
    fn prune(&mut self) {
        let mut excess = self.versions.len().saturating_sub(self.max_retained);
        if excess == 0 {
            return;
        }
        let newest = self.versions.len() - 1;
        let mut kept = VecDeque::with_capacity(self.versions.len());
        for (idx, snapshot) in self.versions.drain(..).enumerate() {
            if excess > 0 && idx != newest && Arc::strong_count(&snapshot) == 1 {
                excess -= 1;
                continue;
            }
            kept.push_back(snapshot);
        }
        self.versions = kept;
    }
}

struct FileConnection {
    id: u64,
    engine: Arc<EngineInner>,
    shared: Arc<SharedFile>,
    snapshot: Arc<Snapshot>,
    write: Option<WriteTxn>,
    closed: bool,
}

impl FileConnection {
    fn ensure_open(&self) -> Result<(), KelpError> {
        if self.closed {
            return Err(KelpError::Closed);
        }
        Ok(())
    }

    fn ensure_not_writing(&self) -> Result<(), KelpError> {
        if self.write.is_some() {
            return Err(KelpError::AlreadyInTransaction);
        }
        Ok(())
    }
}

impl StoreConnection for FileConnection {
    fn current_version(&self) -> VersionId {
        self.snapshot.version()
    }

    fn latest_version(&self) -> VersionId {
        self.shared.latest().version()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot)
    }

    fn begin_read(&mut self) -> Result<VersionId, KelpError> {
        self.ensure_open()?;
        self.ensure_not_writing()?;
        self.snapshot = self.shared.latest();
        Ok(self.snapshot.version())
    }

    fn advance_to(&mut self, target: VersionId) -> Result<(), KelpError> {
        self.ensure_open()?;
        self.ensure_not_writing()?;
        if target == self.snapshot.version() {
            return Ok(());
        }
        if target < self.snapshot.version() {
            return Err(KelpError::Validation(format!(
                "cannot move snapshot back from {} to {target}",
                self.snapshot.version()
            )));
        }
        let found = self.shared.chain.lock().find(target)?;
        self.snapshot = found;
        Ok(())
    }

    fn begin_write(&mut self) -> Result<(), KelpError> {
        self.ensure_open()?;
        self.ensure_not_writing()?;
        self.shared.writer.acquire(self.id)?;
        self.snapshot = self.shared.latest();
        self.write = Some(WriteTxn::new(&self.snapshot));
        Ok(())
    }

    fn write_txn(&mut self) -> Result<&mut WriteTxn, KelpError> {
        self.ensure_open()?;
        self.write.as_mut().ok_or(KelpError::NotInTransaction)
    }

    fn is_in_write(&self) -> bool {
        self.write.is_some()
    }

    fn commit(&mut self) -> Result<VersionId, KelpError> {
        self.ensure_open()?;
        let txn = self.write.take().ok_or(KelpError::NotInTransaction)?;
        let version = txn.base_version().next();
        let snapshot = Arc::new(txn.into_snapshot(version));
        let persisted = persist_store(&self.shared.path, &snapshot, self.shared.durability);
        if persisted.is_ok() {
            self.shared.chain.lock().push(Arc::clone(&snapshot));
        }
        self.shared.writer.release(self.id);
        persisted?;
        self.snapshot = snapshot;
        debug!(path = %self.shared.path.display(), %version, "commit persisted");
        Ok(version)
    }

    fn cancel(&mut self) -> Result<(), KelpError> {
        self.ensure_open()?;
        if self.write.take().is_none() {
            return Err(KelpError::NotInTransaction);
        }
        self.shared.writer.release(self.id);
        Ok(())
    }

    fn handover_latest(&self) -> Result<Handover<Arc<Snapshot>>, KelpError> {
        self.ensure_open()?;
        let latest = self.shared.latest();
        Ok(Handover::new(latest.version(), latest))
    }

    fn close(&mut self) -> Result<(), KelpError> {
        if self.closed {
            return Ok(());
        }
        if self.write.take().is_some() {
            self.shared.writer.release(self.id);
        }
        self.closed = true;
        self.engine.disconnect(&self.shared.path);
        Ok(())
    }
}

impl Drop for FileConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn load_store(path: &Path) -> Result<Snapshot, KelpError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Snapshot::empty(VersionId::new(0, 0)));
        }
        Err(e) => return Err(e.into()),
    };
    let persisted: PersistedStore =
        serde_json::from_slice(&bytes).map_err(|e| KelpError::Decode(e.to_string()))?;
    if persisted.format != STORE_FORMAT {
        return Err(KelpError::Decode(format!(
            "unsupported store format {} in {}",
            persisted.format,
            path.display()
        )));
    }
    let tables = persisted
        .tables
        .into_iter()
        .map(|(name, t)| {
            let rows: im::OrdMap<u64, Value> = t.rows.into_iter().collect();
            (name, Table::from_parts(t.next_id, rows))
        })
        .collect();
    Ok(Snapshot::from_parts(
        VersionId::new(persisted.generation, persisted.index),
        persisted.schema_version,
        tables,
    ))
}

fn persist_store(
    path: &Path,
    snapshot: &Snapshot,
    durability: DurabilityMode,
) -> Result<(), KelpError> {
    let mut tables = BTreeMap::new();
    for name in snapshot.table_names() {
        let table = snapshot.table(name)?;
        tables.insert(
            name.to_string(),
            PersistedTable {
                next_id: table.next_id(),
                rows: table.iter().map(|(id, v)| (id, v.clone())).collect(),
            },
        );
    }
    let persisted = PersistedStore {
        format: STORE_FORMAT,
        generation: snapshot.version().generation(),
        index: snapshot.version().index(),
        schema_version: snapshot.schema_version(),
        tables,
    };
    let bytes = serde_json::to_vec(&persisted).map_err(|e| KelpError::Encode(e.to_string()))?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    if durability == DurabilityMode::Full {
        tmp.as_file().sync_all()?;
    }
    tmp.persist(path).map_err(|e| KelpError::Io(e.error))?;
    if durability == DurabilityMode::Full {
        fsync_dir(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> Result<(), KelpError> {
    let dir = fs::File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> Result<(), KelpError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::FileEngine;
    use crate::config::KelpConfig;
    use crate::engine::StoreEngine;
    use crate::error::KelpError;
    use crate::version::{VersionId, VersionOrdering};
    use serde_json::json;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> KelpConfig {
        KelpConfig::new(dir.join("store.kelp")).expect("config")
    }

    #[test]
    fn commit_persists_and_reloads_after_last_disconnect() {
        let dir = tempdir().expect("temp");
        let cfg = config(dir.path());
        let engine = FileEngine::default();
        let mut conn = engine.connect(&cfg).expect("connect");
        conn.begin_write().expect("write");
        let txn = conn.write_txn().expect("txn");
        txn.create_table("dogs");
        txn.set_schema_version(1);
        txn.insert("dogs", json!({"name": "rex"})).expect("insert");
        let v = conn.commit().expect("commit");
        assert_eq!(v, VersionId::new(0, 1));
        conn.close().expect("close");
        assert_eq!(engine.open_connections(cfg.path()), 0);

        let conn = engine.connect(&cfg).expect("reconnect");
        let snap = conn.snapshot();
        assert_eq!(snap.version(), v);
        assert_eq!(snap.schema_version(), Some(1));
        assert_eq!(snap.table("dogs").expect("dogs").len(), 1);
    }

    #[test]
    fn connections_keep_their_pinned_snapshot_until_advanced() {
        let dir = tempdir().expect("temp");
        let cfg = config(dir.path());
        let engine = FileEngine::default();
        let mut writer = engine.connect(&cfg).expect("writer");
        let mut reader = engine.connect(&cfg).expect("reader");
        let before = reader.current_version();

        writer.begin_write().expect("write");
        writer.write_txn().expect("txn").create_table("dogs");
        let committed = writer.commit().expect("commit");

        assert_eq!(reader.current_version(), before);
        assert_eq!(reader.latest_version(), committed);
        assert_eq!(committed.compare(&before), VersionOrdering::Ahead);
        reader.advance_to(committed).expect("advance");
        assert!(reader.snapshot().has_table("dogs"));
        assert!(reader.advance_to(before).is_err());
    }

    #[test]
    fn cancel_discards_writes_and_releases_writer() {
        let dir = tempdir().expect("temp");
        let cfg = config(dir.path());
        let engine = FileEngine::default();
        let mut a = engine.connect(&cfg).expect("a");
        let mut b = engine.connect(&cfg).expect("b");
        a.begin_write().expect("write");
        a.write_txn().expect("txn").create_table("dogs");
        a.cancel().expect("cancel");
        b.begin_write().expect("b can write after cancel");
        assert!(!b.write_txn().expect("txn").snapshot().has_table("dogs"));
        b.cancel().expect("cancel");
        assert!(matches!(a.commit(), Err(KelpError::NotInTransaction)));
    }

    #[test]
    fn unpinned_versions_are_pruned_but_pinned_ones_survive() {
        let dir = tempdir().expect("temp");
        let cfg = config(dir.path());
        let engine = FileEngine::new(2);
        let mut writer = engine.connect(&cfg).expect("writer");
        let reader = engine.connect(&cfg).expect("reader");
        let pinned = reader.handover_latest().expect("pin");
        for _ in 0..5 {
            writer.begin_write().expect("write");
            writer.write_txn().expect("txn").set_schema_version(1);
            writer.commit().expect("commit");
        }
        assert!(engine.retained_versions(cfg.path()) <= 3);
        assert_eq!(pinned.version(), VersionId::new(0, 0));
        let mut reader = reader;
        let err = reader.advance_to(VersionId::new(0, 2)).expect_err("pruned");
        assert!(matches!(err, KelpError::SnapshotExpired(_)));
        reader.advance_to(VersionId::new(0, 5)).expect("latest is retained");
    }

    #[test]
    fn delete_refuses_open_store() {
        let dir = tempdir().expect("temp");
        let cfg = config(dir.path());
        let engine = FileEngine::default();
        let mut conn = engine.connect(&cfg).expect("connect");
        conn.begin_write().expect("write");
        conn.write_txn().expect("txn").create_table("dogs");
        conn.commit().expect("commit");
        assert!(matches!(
            engine.delete(cfg.path()),
            Err(KelpError::StoreInUse { .. })
        ));
        drop(conn);
        assert!(engine.delete(cfg.path()).expect("delete"));
        assert!(!engine.delete(cfg.path()).expect("already gone"));
    }
}
