use crate::config::{KelpConfig, RuntimeConfig};
use crate::engine::file::FileEngine;
use crate::engine::{StoreConnection, StoreEngine};
use crate::error::KelpError;
use crate::notifier::{self, MailboxSender, Message};
use crate::scheduler::AsyncQueryScheduler;
use crate::version::VersionId;
use crate::{HandleInner, KelpHandle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

/// Process-wide tables, all guarded by one lock.
#[derive(Default)]
struct GlobalTables {
    open_counts: HashMap<PathBuf, usize>,
    /// Each configuration with the number of open handles using it.
    path_configs: HashMap<PathBuf, Vec<(KelpConfig, usize)>>,
    validated: HashSet<PathBuf>,
    subscribers: HashMap<PathBuf, Vec<(u64, MailboxSender)>>,
    default_config: Option<KelpConfig>,
}

struct LocalEntry {
    inner: Arc<HandleInner>,
    count: usize,
}

#[derive(Default)]
struct LocalTable {
    handles: HashMap<KelpConfig, LocalEntry>,
}

/// Hands out thread-confined handles and keeps their reference counts.
///
/// Each thread gets at most one handle per configuration; opening it again
/// on the same thread returns the cached handle with its count raised. The
/// store connection of a path lives while any thread holds a handle to it.
pub struct Registry {
    engine: Arc<dyn StoreEngine>,
    runtime: RuntimeConfig,
    scheduler: AsyncQueryScheduler,
    global: Mutex<GlobalTables>,
    locals: Mutex<HashMap<ThreadId, LocalTable>>,
    next_handle_id: AtomicU64,
}

impl Registry {
    pub fn new(
        engine: Arc<dyn StoreEngine>,
        runtime: RuntimeConfig,
    ) -> Result<Arc<Self>, KelpError> {
        runtime.validate()?;
        let scheduler =
            AsyncQueryScheduler::new(runtime.async_worker_threads, runtime.max_queued_tasks)?;
        info!(
            async_worker_threads = runtime.async_worker_threads,
            max_queued_tasks = runtime.max_queued_tasks,
            "registry started"
        );
        Ok(Arc::new(Self {
            engine,
            runtime,
            scheduler,
            global: Mutex::new(GlobalTables::default()),
            locals: Mutex::new(HashMap::new()),
            next_handle_id: AtomicU64::new(1),
        }))
    }

    /// Registry over the bundled file engine.
    pub fn with_file_engine(runtime: RuntimeConfig) -> Result<Arc<Self>, KelpError> {
        let engine = Arc::new(FileEngine::new(runtime.max_retained_versions));
        Self::new(engine, runtime)
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn scheduler(&self) -> &AsyncQueryScheduler {
        &self.scheduler
    }

    /// Returns this thread's handle for `config`, opening the store if needed.
    ///
    /// The first open of a path in the process validates its schema, or
    /// initializes an empty file. With `delete_if_migration_needed` a store
    /// that needs migration is deleted and opened fresh.
    pub fn open(self: &Arc<Self>, config: KelpConfig) -> Result<KelpHandle, KelpError> {
        match self.open_once(&config) {
            Err(KelpError::MigrationRequired {
                on_disk, requested, ..
            }) if config.delete_if_migration_needed => {
                warn!(
                    path = %config.path().display(),
                    on_disk,
                    requested,
                    "schema mismatch; deleting store as configured"
                );
                self.delete_store(&config)?;
                self.open_once(&config)
            }
            other => other,
        }
    }

    fn open_once(self: &Arc<Self>, config: &KelpConfig) -> Result<KelpHandle, KelpError> {
        let thread = thread::current().id();
        {
            let mut locals = self.locals.lock();
            if let Some(entry) = locals
                .get_mut(&thread)
                .and_then(|table| table.handles.get_mut(config))
            {
                let orphans = entry.inner.take_orphans();
                entry.count = entry.count.saturating_sub(orphans) + 1;
                return Ok(KelpHandle::from_inner(Arc::clone(&entry.inner)));
            }
        }

        let path = config.path().to_path_buf();
        let mut global = self.global.lock();
        if let Some(existing) = global.path_configs.get(&path) {
            for (other, _) in existing {
                config.check_compatible(other)?;
            }
        }
        let mut connection = self.engine.connect(config)?;
        if !global.validated.contains(&path) {
            if let Err(error) = validate_schema(connection.as_mut(), config) {
                if let Err(close_error) = connection.close() {
                    warn!(%close_error, "closing connection after failed validation");
                }
                return Err(error);
            }
            global.validated.insert(path.clone());
        }

        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mailbox) = notifier::mailbox();
        let inner = Arc::new(HandleInner::new(
            id,
            config.clone(),
            Arc::clone(self),
            connection,
            (sender.clone(), mailbox),
        ));
        let open_count = {
            let count = global.open_counts.entry(path.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let configs = global.path_configs.entry(path.clone()).or_default();
        match configs.iter_mut().find(|(c, _)| c == config) {
            Some((_, handles)) => *handles += 1,
            None => configs.push((config.clone(), 1)),
        }
        global
            .subscribers
            .entry(path.clone())
            .or_default()
            .push((id, sender));
        drop(global);

        self.locals.lock().entry(thread).or_default().handles.insert(
            config.clone(),
            LocalEntry {
                inner: Arc::clone(&inner),
                count: 1,
            },
        );
        info!(
            path = %path.display(),
            handle = id,
            schema_version = config.schema_version,
            durability = ?config.durability_mode,
            open_count,
            "store handle opened"
        );
        Ok(KelpHandle::from_inner(inner))
    }

    /// Drops one reference to `inner` held by its owning thread, plus any
    /// references given up for it on other threads.
    pub(crate) fn release(&self, inner: &Arc<HandleInner>) -> Result<(), KelpError> {
        self.release_references(inner, 1)
    }

    /// Drops only the references handed over from other threads.
    pub(crate) fn reclaim_orphans(&self, inner: &Arc<HandleInner>) -> Result<(), KelpError> {
        self.release_references(inner, 0)
    }

    fn release_references(&self, inner: &Arc<HandleInner>, own: usize) -> Result<(), KelpError> {
        let thread = inner.owner();
        {
            let mut locals = self.locals.lock();
            let Some(table) = locals.get_mut(&thread) else {
                warn!(handle = inner.id(), "release of a handle unknown to its thread");
                return Ok(());
            };
            let Some(entry) = table.handles.get_mut(inner.config()) else {
                warn!(handle = inner.id(), "release of a handle unknown to its thread");
                return Ok(());
            };
            if !Arc::ptr_eq(&entry.inner, inner) {
                warn!(handle = inner.id(), "release of a stale handle ignored");
                return Ok(());
            }
            let dropped = own + inner.take_orphans();
            if dropped == 0 {
                return Ok(());
            }
            entry.count = entry.count.saturating_sub(dropped);
            if entry.count > 0 {
                return Ok(());
            }
            table.handles.remove(inner.config());
            if table.handles.is_empty() {
                locals.remove(&thread);
            }
        }

        let closed = inner.shutdown();
        let path = inner.config().path().to_path_buf();
        let mut global = self.global.lock();
        if let Some(subs) = global.subscribers.get_mut(&path) {
            subs.retain(|(id, _)| *id != inner.id());
        }
        if let Some(configs) = global.path_configs.get_mut(&path) {
            if let Some((_, handles)) = configs.iter_mut().find(|(c, _)| c == inner.config()) {
                *handles = handles.saturating_sub(1);
            }
            configs.retain(|(_, handles)| *handles > 0);
        }
        let remaining = match global.open_counts.get_mut(&path) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            global.open_counts.remove(&path);
            global.path_configs.remove(&path);
            global.validated.remove(&path);
            global.subscribers.remove(&path);
            debug!(path = %path.display(), "last handle closed; path caches evicted");
        }
        drop(global);
        debug!(handle = inner.id(), remaining, "store handle closed");
        closed
    }

    /// Posts a remote change to every other handle open on `path`.
    pub(crate) fn notify_commit(&self, path: &Path, origin: u64) {
        let targets: Vec<MailboxSender> = {
            let global = self.global.lock();
            global
                .subscribers
                .get(path)
                .map(|subs| {
                    subs.iter()
                        .filter(|(id, _)| *id != origin)
                        .map(|(_, sender)| sender.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for target in &targets {
            target.post(Message::RemoteChange);
        }
        debug!(path = %path.display(), notified = targets.len(), "commit broadcast");
    }

    /// Runs the configuration's migration and stamps its schema version.
    ///
    /// The store must not be open anywhere in the process. Missing tables are
    /// created after the hook ran.
    pub fn migrate(&self, config: &KelpConfig) -> Result<VersionId, KelpError> {
        let path = config.path();
        let global = self.global.lock();
        if global.open_counts.contains_key(path) || self.engine.open_connections(path) > 0 {
            return Err(KelpError::StoreInUse {
                path: path.to_path_buf(),
            });
        }
        let mut connection = self.engine.connect(config)?;
        let from = connection.snapshot().schema_version();
        let migrated = run_migration(connection.as_mut(), config);
        if migrated.is_err() && connection.is_in_write() {
            connection.cancel()?;
        }
        connection.close()?;
        drop(global);
        let version = migrated?;
        info!(
            path = %path.display(),
            from = ?from,
            to = config.schema_version,
            %version,
            "store migrated"
        );
        Ok(version)
    }

    /// Deletes the store file. Returns false if there was nothing to delete.
    pub fn delete_store(&self, config: &KelpConfig) -> Result<bool, KelpError> {
        let path = config.path();
        let global = self.global.lock();
        if global.open_counts.contains_key(path) {
            return Err(KelpError::StoreInUse {
                path: path.to_path_buf(),
            });
        }
        self.engine.delete(path)
    }

    /// Handles open on `path` across all threads.
    pub fn global_open_count(&self, path: &Path) -> usize {
        self.global.lock().open_counts.get(path).copied().unwrap_or(0)
    }

    /// References the calling thread holds on its handle for `config`. Ones
    /// already given up on other threads are not counted.
    pub fn local_open_count(&self, config: &KelpConfig) -> usize {
        let thread = thread::current().id();
        self.locals
            .lock()
            .get(&thread)
            .and_then(|table| table.handles.get(config))
            .map(|entry| entry.count.saturating_sub(entry.inner.pending_orphans()))
            .unwrap_or(0)
    }

    pub fn is_schema_validated(&self, path: &Path) -> bool {
        self.global.lock().validated.contains(path)
    }

    /// Configurations registered for `path` by currently open handles.
    pub fn configurations_for(&self, path: &Path) -> Vec<KelpConfig> {
        self.global
            .lock()
            .path_configs
            .get(path)
            .map(|configs| configs.iter().map(|(c, _)| c.clone()).collect())
            .unwrap_or_default()
    }

    /// Sets the configuration [`Registry::open_default`] opens.
    pub fn set_default_config(&self, config: KelpConfig) {
        info!(path = %config.path().display(), "default configuration set");
        self.global.lock().default_config = Some(config);
    }

    pub fn default_config(&self) -> Option<KelpConfig> {
        self.global.lock().default_config.clone()
    }

    /// Clears the default configuration and returns it. Open handles are
    /// not affected.
    pub fn remove_default_config(&self) -> Option<KelpConfig> {
        self.global.lock().default_config.take()
    }

    pub fn open_default(self: &Arc<Self>) -> Result<KelpHandle, KelpError> {
        let config = self
            .default_config()
            .ok_or(KelpError::NoDefaultConfiguration)?;
        self.open(config)
    }
}

fn validate_schema(
    connection: &mut dyn StoreConnection,
    config: &KelpConfig,
) -> Result<(), KelpError> {
    let snapshot = connection.snapshot();
    let requested = config.schema_version;
    match snapshot.schema_version() {
        None => {
            let initialized = initialize_schema(connection, config);
            if initialized.is_err() && connection.is_in_write() {
                connection.cancel()?;
            }
            let version = initialized?;
            info!(
                path = %config.path().display(),
                schema_version = requested,
                tables = config.tables.len(),
                %version,
                "store schema initialized"
            );
            Ok(())
        }
        Some(on_disk) if on_disk < requested => Err(KelpError::MigrationRequired {
            path: config.path().to_path_buf(),
            on_disk,
            requested,
        }),
        Some(on_disk) if on_disk > requested => Err(KelpError::SchemaTooNew {
            path: config.path().to_path_buf(),
            on_disk,
            requested,
        }),
        Some(on_disk) => {
            let missing: Vec<&str> = config
                .tables
                .iter()
                .map(String::as_str)
                .filter(|t| !snapshot.has_table(t))
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            debug!(path = %config.path().display(), ?missing, "schema tables missing");
            Err(KelpError::MigrationRequired {
                path: config.path().to_path_buf(),
                on_disk,
                requested,
            })
        }
    }
}

fn initialize_schema(
    connection: &mut dyn StoreConnection,
    config: &KelpConfig,
) -> Result<VersionId, KelpError> {
    connection.begin_write()?;
    let txn = connection.write_txn()?;
    for table in &config.tables {
        txn.create_table(table);
    }
    txn.set_schema_version(config.schema_version);
    connection.commit()
}

fn run_migration(
    connection: &mut dyn StoreConnection,
    config: &KelpConfig,
) -> Result<VersionId, KelpError> {
    let requested = config.schema_version;
    let on_disk = connection.snapshot().schema_version();
    if let Some(on_disk) = on_disk
        && on_disk > requested
    {
        return Err(KelpError::SchemaTooNew {
            path: config.path().to_path_buf(),
            on_disk,
            requested,
        });
    }
    connection.begin_write()?;
    let txn = connection.write_txn()?;
    if let Some(hook) = &config.migration {
        hook.run(txn, on_disk.unwrap_or(0), requested)?;
    }
    for table in &config.tables {
        txn.create_table(table);
    }
    txn.set_schema_version(requested);
    connection.commit()
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use crate::config::{KelpConfig, RuntimeConfig};
    use crate::error::KelpError;
    use tempfile::tempdir;

    fn registry() -> std::sync::Arc<Registry> {
        Registry::with_file_engine(RuntimeConfig::single_worker()).expect("registry")
    }

    #[test]
    fn same_thread_open_shares_handle_and_counts() {
        let dir = tempdir().expect("temp");
        let reg = registry();
        let cfg = KelpConfig::new(dir.path().join("a.kelp"))
            .expect("config")
            .with_table("dogs");
        let a = reg.open(cfg.clone()).expect("open a");
        let b = reg.open(cfg.clone()).expect("open b");
        assert_eq!(reg.local_open_count(&cfg), 2);
        assert_eq!(reg.global_open_count(cfg.path()), 1);
        assert!(reg.is_schema_validated(cfg.path()));
        a.close().expect("close a");
        assert_eq!(reg.local_open_count(&cfg), 1);
        assert!(!b.is_closed());
        b.close().expect("close b");
        assert_eq!(reg.global_open_count(cfg.path()), 0);
        assert!(!reg.is_schema_validated(cfg.path()));
        assert!(reg.configurations_for(cfg.path()).is_empty());
    }

    #[test]
    fn delete_and_migrate_refuse_open_store() {
        let dir = tempdir().expect("temp");
        let reg = registry();
        let cfg = KelpConfig::new(dir.path().join("a.kelp")).expect("config");
        let handle = reg.open(cfg.clone()).expect("open");
        assert!(matches!(
            reg.delete_store(&cfg),
            Err(KelpError::StoreInUse { .. })
        ));
        assert!(matches!(reg.migrate(&cfg), Err(KelpError::StoreInUse { .. })));
        drop(handle);
        assert!(reg.delete_store(&cfg).expect("delete"));
    }
}
