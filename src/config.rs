use crate::engine::WriteTxn;
use crate::error::KelpError;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DurabilityMode {
    /// fsync the store file and its directory on every commit.
    #[default]
    Full,
    /// Leave flushing to the OS page cache.
    OsBuffered,
}

type MigrationFn = dyn Fn(&mut WriteTxn, u64, u64) -> Result<(), KelpError> + Send + Sync;

/// Migration body run by [`crate::registry::Registry::migrate`].
///
/// Receives the open write transaction, the on-disk schema version and the
/// requested one. Two hooks are equal only if they are the same allocation.
#[derive(Clone)]
pub struct MigrationHook(Arc<MigrationFn>);

impl MigrationHook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut WriteTxn, u64, u64) -> Result<(), KelpError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn run(&self, txn: &mut WriteTxn, from: u64, to: u64) -> Result<(), KelpError> {
        (self.0)(txn, from, to)
    }
}

impl PartialEq for MigrationHook {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for MigrationHook {}

impl Hash for MigrationHook {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl fmt::Debug for MigrationHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MigrationHook")
    }
}

/// Identifies one store and how it should be opened.
///
/// Equality is structural and the value is used as the per-thread cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KelpConfig {
    path: PathBuf,
    pub schema_version: u64,
    pub tables: BTreeSet<String>,
    pub durability_mode: DurabilityMode,
    pub delete_if_migration_needed: bool,
    pub migration: Option<MigrationHook>,
}

impl KelpConfig {
    /// Builds a configuration for the store file at `path`.
    ///
    /// The parent directory must exist; the file itself may not.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, KelpError> {
        Ok(Self {
            path: canonical_store_path(path.as_ref())?,
            schema_version: 0,
            tables: BTreeSet::new(),
            durability_mode: DurabilityMode::Full,
            delete_if_migration_needed: false,
            migration: None,
        })
    }

    /// Canonical path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn with_schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_table(mut self, name: impl Into<String>) -> Self {
        self.tables.insert(name.into());
        self
    }

    pub fn with_durability(mut self, mode: DurabilityMode) -> Self {
        self.durability_mode = mode;
        self
    }

    pub fn with_delete_if_migration_needed(mut self, enabled: bool) -> Self {
        self.delete_if_migration_needed = enabled;
        self
    }

    pub fn with_migration(mut self, hook: MigrationHook) -> Self {
        self.migration = Some(hook);
        self
    }

    /// Checks whether `self` may share a file with an already registered
    /// configuration. Migration hooks are allowed to differ.
    pub fn check_compatible(&self, other: &KelpConfig) -> Result<(), KelpError> {
        let conflict = |message: String| KelpError::ConfigurationConflict {
            path: self.path.clone(),
            message,
        };
        if self.schema_version != other.schema_version {
            return Err(conflict(format!(
                "schema version {} differs from open configuration {}",
                self.schema_version, other.schema_version
            )));
        }
        if self.tables != other.tables {
            return Err(conflict("schema tables differ from open configuration".into()));
        }
        if self.durability_mode != other.durability_mode {
            return Err(conflict(format!(
                "durability {:?} differs from open configuration {:?}",
                self.durability_mode, other.durability_mode
            )));
        }
        if self.delete_if_migration_needed != other.delete_if_migration_needed {
            return Err(conflict(
                "delete_if_migration_needed differs from open configuration".into(),
            ));
        }
        Ok(())
    }
}

fn canonical_store_path(path: &Path) -> Result<PathBuf, KelpError> {
    let file_name = path.file_name().ok_or_else(|| {
        KelpError::Validation(format!("store path has no file name: {}", path.display()))
    })?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.canonicalize()?.join(file_name))
}

/// Process-wide runtime knobs for a [`crate::registry::Registry`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub async_worker_threads: usize,
    pub max_queued_tasks: usize,
    /// Unpinned versions kept per file for `advance_to` lookups.
    pub max_retained_versions: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            async_worker_threads: std::thread::available_parallelism()
                .map(|n| n.get().clamp(2, 8))
                .unwrap_or(4),
            max_queued_tasks: 1024,
            max_retained_versions: 64,
        }
    }
}

impl RuntimeConfig {
    /// One worker, so queued tasks run strictly one after another.
    pub fn single_worker() -> Self {
        Self {
            async_worker_threads: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), KelpError> {
        if self.async_worker_threads == 0 {
            return Err(KelpError::Validation(
                "async_worker_threads must be > 0".into(),
            ));
        }
        if self.max_queued_tasks == 0 {
            return Err(KelpError::Validation("max_queued_tasks must be > 0".into()));
        }
        if self.max_retained_versions == 0 {
            return Err(KelpError::Validation(
                "max_retained_versions must be > 0".into(),
            ));
        }
        Ok(())
    }
}
