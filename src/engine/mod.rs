//! Versioned snapshot store consumed by the coordination layer.
//!
//! [`StoreEngine`] and [`StoreConnection`] are the seam to the storage
//! engine: connections pin an immutable [`Snapshot`], advance it explicitly
//! and serialize writers per file. [`file::FileEngine`] is the bundled
//! implementation.

pub mod file;
mod writer_lock;

use crate::config::KelpConfig;
use crate::error::KelpError;
use crate::version::VersionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// One stored document, as returned by queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub table: String,
    pub id: u64,
    pub value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    next_id: u64,
    rows: im::OrdMap<u64, Value>,
}

impl Table {
    pub(crate) fn from_parts(next_id: u64, rows: im::OrdMap<u64, Value>) -> Self {
        Self { next_id, rows }
    }

    pub fn get(&self, id: u64) -> Option<&Value> {
        self.rows.get(&id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Value)> {
        self.rows.iter().map(|(id, value)| (*id, value))
    }
}

/// Immutable view of a store at one version.
///
/// Cloning is cheap; tables share structure with the versions around them.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: VersionId,
    schema_version: Option<u64>,
    tables: im::OrdMap<String, Table>,
}

impl Snapshot {
    pub fn empty(version: VersionId) -> Self {
        Self {
            version,
            schema_version: None,
            tables: im::OrdMap::new(),
        }
    }

    pub(crate) fn from_parts(
        version: VersionId,
        schema_version: Option<u64>,
        tables: im::OrdMap<String, Table>,
    ) -> Self {
        Self {
            version,
            schema_version,
            tables,
        }
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    /// `None` until the store has been initialized with a schema.
    pub fn schema_version(&self) -> Option<u64> {
        self.schema_version
    }

    pub fn table(&self, name: &str) -> Result<&Table, KelpError> {
        self.tables
            .get(name)
            .ok_or_else(|| KelpError::TableNotFound(name.to_string()))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// Working copy of an open write transaction.
#[derive(Debug, Clone)]
pub struct WriteTxn {
    base: VersionId,
    working: Snapshot,
    dirty: bool,
}

impl WriteTxn {
    pub fn new(base: &Snapshot) -> Self {
        Self {
            base: base.version(),
            working: base.clone(),
            dirty: false,
        }
    }

    pub fn base_version(&self) -> VersionId {
        self.base
    }

    /// The transaction's own view, including uncommitted writes.
    pub fn snapshot(&self) -> &Snapshot {
        &self.working
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns false if the table already existed.
    pub fn create_table(&mut self, name: &str) -> bool {
        if self.working.tables.contains_key(name) {
            return false;
        }
        self.working.tables.insert(name.to_string(), Table::default());
        self.dirty = true;
        true
    }

    pub fn set_schema_version(&mut self, version: u64) {
        self.working.schema_version = Some(version);
        self.dirty = true;
    }

    pub fn insert(&mut self, table: &str, value: Value) -> Result<u64, KelpError> {
        let t = self.table_mut(table)?;
        let id = t.next_id;
        t.next_id = t.next_id.saturating_add(1);
        t.rows.insert(id, value);
        self.dirty = true;
        Ok(id)
    }

    pub fn update(&mut self, table: &str, id: u64, value: Value) -> Result<(), KelpError> {
        let t = self.table_mut(table)?;
        let Some(slot) = t.rows.get_mut(&id) else {
            return Err(KelpError::ObjectNotFound {
                table: table.to_string(),
                id,
            });
        };
        *slot = value;
        self.dirty = true;
        Ok(())
    }

    pub fn remove(&mut self, table: &str, id: u64) -> Result<Value, KelpError> {
        let t = self.table_mut(table)?;
        let removed = t.rows.remove(&id).ok_or_else(|| KelpError::ObjectNotFound {
            table: table.to_string(),
            id,
        })?;
        self.dirty = true;
        Ok(removed)
    }

    pub fn clear(&mut self, table: &str) -> Result<usize, KelpError> {
        let t = self.table_mut(table)?;
        let removed = t.rows.len();
        t.rows.clear();
        self.dirty = true;
        Ok(removed)
    }

    pub(crate) fn into_snapshot(self, version: VersionId) -> Snapshot {
        Snapshot {
            version,
            ..self.working
        }
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, KelpError> {
        self.working
            .tables
            .get_mut(name)
            .ok_or_else(|| KelpError::TableNotFound(name.to_string()))
    }
}

/// A value bound to the version it was computed against, ready to be moved
/// to another thread and imported into a handle at that same version.
#[derive(Debug, Clone)]
pub struct Handover<T> {
    version: VersionId,
    payload: T,
}

impl<T> Handover<T> {
    pub fn new(version: VersionId, payload: T) -> Self {
        Self { version, payload }
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Handover<U> {
        Handover {
            version: self.version,
            payload: f(self.payload),
        }
    }

    /// Imports the payload into a view positioned at `target`.
    pub fn import(self, target: VersionId) -> Result<T, KelpError> {
        if self.version != target {
            return Err(KelpError::VersionMismatch {
                expected: target,
                actual: self.version,
            });
        }
        Ok(self.payload)
    }
}

/// Opens connections to store files. Shared by every thread of a registry.
pub trait StoreEngine: Send + Sync {
    fn connect(&self, config: &KelpConfig) -> Result<Box<dyn StoreConnection>, KelpError>;

    /// Removes the store's files. Fails with `StoreInUse` while connected.
    fn delete(&self, path: &Path) -> Result<bool, KelpError>;

    /// Number of live connections to `path`.
    fn open_connections(&self, path: &Path) -> usize;
}

/// One connection's view of a store: a pinned snapshot that only moves when
/// asked to, plus at most one write transaction.
pub trait StoreConnection: Send {
    fn current_version(&self) -> VersionId;

    fn latest_version(&self) -> VersionId;

    fn snapshot(&self) -> Arc<Snapshot>;

    /// Re-pins the connection at the latest committed version.
    fn begin_read(&mut self) -> Result<VersionId, KelpError>;

    fn advance_to(&mut self, target: VersionId) -> Result<(), KelpError>;

    /// Blocks until this connection holds the file's writer lock, then
    /// re-pins at the latest version.
    fn begin_write(&mut self) -> Result<(), KelpError>;

    fn write_txn(&mut self) -> Result<&mut WriteTxn, KelpError>;

    fn is_in_write(&self) -> bool;

    fn commit(&mut self) -> Result<VersionId, KelpError>;

    fn cancel(&mut self) -> Result<(), KelpError>;

    fn handover_current(&self) -> Handover<Arc<Snapshot>> {
        Handover::new(self.current_version(), self.snapshot())
    }

    /// Pins the latest committed version without moving this connection.
    fn handover_latest(&self) -> Result<Handover<Arc<Snapshot>>, KelpError>;

    fn close(&mut self) -> Result<(), KelpError>;
}

#[cfg(test)]
mod tests {
    use super::{Handover, Snapshot, WriteTxn};
    use crate::error::KelpError;
    use crate::version::VersionId;
    use serde_json::json;

    #[test]
    fn write_txn_does_not_touch_base_snapshot() {
        let base = Snapshot::empty(VersionId::new(0, 0));
        let mut txn = WriteTxn::new(&base);
        assert!(txn.create_table("dogs"));
        assert!(!txn.create_table("dogs"));
        let id = txn.insert("dogs", json!({"name": "rex"})).expect("insert");
        assert_eq!(id, 0);
        txn.update("dogs", id, json!({"name": "max"})).expect("update");
        assert!(!base.has_table("dogs"));

        let next = txn.into_snapshot(VersionId::new(0, 1));
        let table = next.table("dogs").expect("table");
        assert_eq!(table.get(0), Some(&json!({"name": "max"})));
        assert_eq!(table.next_id(), 1);
    }

    #[test]
    fn write_txn_reports_missing_targets() {
        let mut txn = WriteTxn::new(&Snapshot::empty(VersionId::new(0, 0)));
        assert!(matches!(
            txn.insert("cats", json!(1)),
            Err(KelpError::TableNotFound(_))
        ));
        txn.create_table("cats");
        assert!(matches!(
            txn.remove("cats", 7),
            Err(KelpError::ObjectNotFound { id: 7, .. })
        ));
    }

    #[test]
    fn handover_import_requires_matching_version() {
        let h = Handover::new(VersionId::new(0, 3), "rows");
        let err = h.clone().import(VersionId::new(0, 4)).expect_err("mismatch");
        assert!(matches!(err, KelpError::VersionMismatch { .. }));
        assert_eq!(h.import(VersionId::new(0, 3)).expect("import"), "rows");
    }
}
