pub mod config;
pub mod engine;
pub mod error;
pub mod live;
pub mod notifier;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod version;

pub use crate::config::{DurabilityMode, KelpConfig, MigrationHook, RuntimeConfig};
pub use crate::engine::Object;
pub use crate::error::{KelpError, KelpErrorCode};
pub use crate::live::{LiveQueryId, LiveResults};
pub use crate::notifier::{HandleMode, ListenerId};
pub use crate::query::{Order, Query};
pub use crate::registry::Registry;
pub use crate::version::{VersionId, VersionOrdering};

use crate::engine::StoreConnection;
use crate::live::LiveResultRegistry;
use crate::notifier::{
    Context, Effects, Mailbox, MailboxSender, Message, NotificationCoordinator, resync_loaded,
};
use crate::scheduler::TaskId;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};

type HandleListener = Arc<dyn Fn() + Send + Sync>;

/// Run on the owning thread after an async transaction committed.
pub type SuccessCallback = Box<dyn FnOnce() + Send + 'static>;
/// Run on the owning thread with the failure of an async transaction.
pub type ErrorCallback = Box<dyn FnOnce(KelpError) + Send + 'static>;

pub(crate) struct HandleInner {
    id: u64,
    owner: ThreadId,
    config: KelpConfig,
    registry: Arc<Registry>,
    state: Mutex<HandleState>,
    mailbox: Mutex<Mailbox>,
    sender: MailboxSender,
    /// References given up off the owning thread, released by the owner.
    orphaned: AtomicUsize,
}

struct HandleState {
    connection: Box<dyn StoreConnection>,
    closed: bool,
    live: LiveResultRegistry,
    coordinator: NotificationCoordinator,
    listeners: Vec<(ListenerId, HandleListener)>,
    next_listener: u64,
}

impl HandleInner {
    pub(crate) fn new(
        id: u64,
        config: KelpConfig,
        registry: Arc<Registry>,
        connection: Box<dyn StoreConnection>,
        mailbox: (MailboxSender, Mailbox),
    ) -> Self {
        let owner = thread::current().id();
        let (sender, mailbox) = mailbox;
        let version = connection.current_version();
        Self {
            id,
            owner,
            config,
            registry,
            state: Mutex::new(HandleState {
                connection,
                closed: false,
                live: LiveResultRegistry::new(owner),
                coordinator: NotificationCoordinator::new(version),
                listeners: Vec::new(),
                next_listener: 0,
            }),
            mailbox: Mutex::new(mailbox),
            sender,
            orphaned: AtomicUsize::new(0),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn config(&self) -> &KelpConfig {
        &self.config
    }

    fn orphan(&self) {
        self.orphaned.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn pending_orphans(&self) -> usize {
        self.orphaned.load(Ordering::Acquire)
    }

    pub(crate) fn take_orphans(&self) -> usize {
        self.orphaned.swap(0, Ordering::AcqRel)
    }

    /// Closes the connection and forgets all live queries. Idempotent.
    pub(crate) fn shutdown(&self) -> Result<(), KelpError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let cancelled = state.coordinator.cancel_all(self.registry.scheduler());
        state.live.clear();
        state.listeners.clear();
        let closed = state.connection.close();
        debug!(handle = self.id, cancelled, "handle shut down");
        closed
    }
}

/// A thread-confined handle to one store.
///
/// Obtained from [`Registry::open`]. Every value counts as one reference on
/// its thread; [`KelpHandle::close`] or dropping it gives the reference back.
/// The handle may be moved between threads, but every operation fails with
/// [`KelpError::WrongThread`] anywhere but on the thread that opened it.
pub struct KelpHandle {
    inner: Arc<HandleInner>,
    released: bool,
}

impl KelpHandle {
    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self {
            inner,
            released: false,
        }
    }

    pub fn config(&self) -> &KelpConfig {
        &self.inner.config
    }

    pub fn path(&self) -> &Path {
        self.inner.config.path()
    }

    pub fn is_closed(&self) -> bool {
        self.released || self.inner.state.lock().closed
    }

    /// Version of the snapshot this handle currently reads.
    pub fn version(&self) -> Result<VersionId, KelpError> {
        Ok(self.state()?.connection.current_version())
    }

    pub fn schema_version(&self) -> Result<Option<u64>, KelpError> {
        Ok(self.state()?.connection.snapshot().schema_version())
    }

    pub fn notification_mode(&self) -> Result<HandleMode, KelpError> {
        Ok(self.state()?.coordinator.mode())
    }

    /// Live queries whose results have not been dropped or cancelled.
    pub fn live_query_count(&self) -> Result<usize, KelpError> {
        self.with_coordinator(|coordinator, ctx| {
            coordinator.reclaim(ctx);
            Ok(ctx.live.len())
        })
    }

    /// Starts a write transaction, waiting for other writers on the same file.
    ///
    /// The handle moves to the latest version first; loaded live results are
    /// re-evaluated in place so none of them is older than the handle.
    pub fn begin_transaction(&self) -> Result<(), KelpError> {
        self.with_coordinator(|_, ctx| {
            let before = ctx.connection.current_version();
            ctx.connection.begin_write()?;
            let after = ctx.connection.current_version();
            if after != before {
                let resynced = resync_loaded(ctx, &[]);
                debug!(from = %before, to = %after, resynced = resynced.len(), "advanced for write");
            }
            Ok(())
        })
    }

    pub fn commit_transaction(&self) -> Result<VersionId, KelpError> {
        let (version, effects) = self.with_coordinator(|coordinator, ctx| {
            let version = ctx.connection.commit()?;
            let effects = coordinator.local_change(ctx)?;
            Ok((version, effects))
        })?;
        self.inner
            .registry
            .notify_commit(self.inner.config.path(), self.inner.id);
        debug!(handle = self.inner.id, %version, "transaction committed");
        self.fire(effects);
        Ok(version)
    }

    pub fn cancel_transaction(&self) -> Result<(), KelpError> {
        self.state()?.connection.cancel()
    }

    pub fn is_in_transaction(&self) -> Result<bool, KelpError> {
        Ok(self.state()?.connection.is_in_write())
    }

    pub fn insert(&self, table: &str, value: Value) -> Result<u64, KelpError> {
        self.state()?.connection.write_txn()?.insert(table, value)
    }

    pub fn update(&self, table: &str, id: u64, value: Value) -> Result<(), KelpError> {
        self.state()?.connection.write_txn()?.update(table, id, value)
    }

    pub fn remove(&self, table: &str, id: u64) -> Result<Value, KelpError> {
        self.state()?.connection.write_txn()?.remove(table, id)
    }

    pub fn clear(&self, table: &str) -> Result<usize, KelpError> {
        self.state()?.connection.write_txn()?.clear(table)
    }

    /// Runs `work` inside a write transaction.
    ///
    /// Commits if `work` succeeds. On failure the transaction is cancelled
    /// and the error comes back wrapped in [`KelpError::TransactionFailure`].
    /// A panic in `work` cancels the transaction and keeps unwinding.
    pub fn execute_transaction<T, F>(&self, work: F) -> Result<T, KelpError>
    where
        F: FnOnce(&KelpHandle) -> Result<T, KelpError>,
    {
        self.begin_transaction()?;
        match catch_unwind(AssertUnwindSafe(|| work(self))) {
            Ok(Ok(value)) => {
                if self.is_in_transaction()? {
                    self.commit_transaction()?;
                } else {
                    warn!(path = %self.path().display(), "transaction was closed inside execute_transaction");
                }
                Ok(value)
            }
            Ok(Err(error)) => {
                if self.is_in_transaction()? {
                    self.cancel_transaction()?;
                }
                Err(KelpError::transaction_failure(error))
            }
            Err(panic) => {
                if self.is_in_transaction().unwrap_or(false) {
                    let _ = self.cancel_transaction();
                }
                resume_unwind(panic)
            }
        }
    }

    /// Runs `work` in a write transaction on a background worker.
    ///
    /// The worker opens its own handle for the same configuration. Callbacks
    /// are posted back to this handle and run from [`KelpHandle::refresh`] or
    /// [`KelpHandle::wait_for_change`]. A cancelled request never calls back.
    pub fn execute_transaction_async<F>(
        &self,
        work: F,
        on_success: Option<SuccessCallback>,
        on_error: Option<ErrorCallback>,
    ) -> Result<CancellableRequest, KelpError>
    where
        F: FnOnce(&KelpHandle) -> Result<(), KelpError> + Send + 'static,
    {
        drop(self.state()?);
        let registry = Arc::clone(&self.inner.registry);
        let config = self.inner.config.clone();
        let reply = self.inner.sender.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let task = self
            .inner
            .registry
            .scheduler()
            .submit("async_transaction", move || {
                if flag.load(Ordering::Acquire) {
                    return;
                }
                let result = catch_unwind(AssertUnwindSafe(|| {
                    let handle = registry.open(config)?;
                    let result = handle.execute_transaction(work);
                    handle.close()?;
                    result
                }))
                .unwrap_or(Err(KelpError::WorkerPanicked));
                if flag.load(Ordering::Acquire) {
                    debug!("async transaction finished after cancellation; callbacks dropped");
                    return;
                }
                match result {
                    Ok(()) => {
                        if let Some(callback) = on_success {
                            reply.post(Message::Callback(callback));
                        }
                    }
                    Err(error) => match on_error {
                        Some(callback) => {
                            reply.post(Message::Callback(Box::new(move || callback(error))));
                        }
                        None => warn!(%error, "async transaction failed with no error callback"),
                    },
                }
            })?;
        Ok(CancellableRequest {
            task,
            cancelled,
            registry: Arc::clone(&self.inner.registry),
        })
    }

    /// Evaluates `query` now against this handle's snapshot, or against the
    /// open write transaction including its uncommitted writes.
    pub fn query(&self, query: &Query) -> Result<Vec<Object>, KelpError> {
        let mut state = self.state()?;
        if state.connection.is_in_write() {
            return query.evaluate(state.connection.write_txn()?.snapshot());
        }
        let snapshot = state.connection.snapshot();
        drop(state);
        query.evaluate(&snapshot)
    }

    /// Starts a background evaluation of `query` and returns its live results,
    /// empty and not loaded until the outcome is merged on this thread.
    pub fn query_async(&self, query: Query) -> Result<LiveResults, KelpError> {
        self.with_coordinator(|coordinator, ctx| {
            coordinator.reclaim(ctx);
            let results = ctx.live.register(query);
            coordinator.submit_query(ctx, &results)?;
            Ok(results)
        })
    }

    /// Cancels the async evaluation behind `results`.
    ///
    /// The results stop following the store and keep whatever rows they
    /// had. Returns whether a queued evaluation was removed before it
    /// started; a running one finishes and its outcome is discarded.
    pub fn cancel_query(&self, results: &LiveResults) -> Result<bool, KelpError> {
        self.with_coordinator(|coordinator, ctx| {
            if !ctx.live.owns(results) {
                if results.cancelled() {
                    return Ok(false);
                }
                return Err(KelpError::Validation(format!(
                    "{} is not a live query of this handle",
                    results.id()
                )));
            }
            Ok(coordinator.cancel_query(ctx, results))
        })
    }

    /// Loads `results` synchronously if they are not loaded yet. A background
    /// outcome arriving later is then discarded. Returns whether rows changed.
    pub fn load(&self, results: &LiveResults) -> Result<bool, KelpError> {
        if results.is_cancelled()? {
            return Err(KelpError::Cancelled);
        }
        if results.is_loaded()? {
            return Ok(false);
        }
        let snapshot = self.state()?.connection.snapshot();
        let rows = results.query().evaluate(&snapshot)?;
        results.swap(snapshot.version(), rows);
        Ok(true)
    }

    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerId, KelpError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.state()?;
        state.next_listener += 1;
        let id = ListenerId::new(state.next_listener);
        state.listeners.push((id, Arc::new(listener)));
        Ok(id)
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> Result<bool, KelpError> {
        let mut state = self.state()?;
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        Ok(state.listeners.len() != before)
    }

    /// Processes every message already in the mailbox. Returns how many.
    pub fn refresh(&self) -> Result<usize, KelpError> {
        self.catch_up()?;
        let mut processed = 0;
        while let Some(message) = self.next_message() {
            self.process(message)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Blocks until a message arrives or `timeout` passes, then drains the
    /// mailbox. Returns false on timeout.
    pub fn wait_for_change(&self, timeout: Duration) -> Result<bool, KelpError> {
        self.catch_up()?;
        let first = self.inner.mailbox.lock().next_timeout(timeout);
        let Some(message) = first else {
            return Ok(false);
        };
        self.process(message)?;
        self.refresh()?;
        Ok(true)
    }

    /// Gives this reference back to the registry.
    ///
    /// Off the owning thread this fails with [`KelpError::WrongThread`] and
    /// the reference is handed to the owner instead, which gives it up on
    /// its next open, close or pump of the same store.
    pub fn close(mut self) -> Result<(), KelpError> {
        self.released = true;
        if thread::current().id() != self.inner.owner {
            self.inner.orphan();
            return Err(KelpError::WrongThread);
        }
        let registry = Arc::clone(&self.inner.registry);
        registry.release(&self.inner)
    }

    /// Applies releases handed over from other threads and queues any
    /// deferred batch before the mailbox is pumped.
    fn catch_up(&self) -> Result<(), KelpError> {
        self.ensure_owner()?;
        if self.inner.pending_orphans() > 0 {
            self.inner.registry.reclaim_orphans(&self.inner)?;
        }
        let effects = self.with_coordinator(|coordinator, ctx| coordinator.retry(ctx))?;
        self.fire(effects);
        Ok(())
    }

    fn ensure_owner(&self) -> Result<(), KelpError> {
        if thread::current().id() != self.inner.owner {
            return Err(KelpError::WrongThread);
        }
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, HandleState>, KelpError> {
        self.ensure_owner()?;
        let state = self.inner.state.lock();
        if state.closed {
            return Err(KelpError::Closed);
        }
        Ok(state)
    }

    fn with_coordinator<R>(
        &self,
        f: impl FnOnce(&mut NotificationCoordinator, &mut Context<'_>) -> Result<R, KelpError>,
    ) -> Result<R, KelpError> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let mut ctx = Context {
            connection: state.connection.as_mut(),
            live: &mut state.live,
            scheduler: self.inner.registry.scheduler(),
            mailbox: &self.inner.sender,
        };
        f(&mut state.coordinator, &mut ctx)
    }

    fn next_message(&self) -> Option<Message> {
        self.inner.mailbox.lock().try_next()
    }

    fn process(&self, message: Message) -> Result<(), KelpError> {
        let kind = message.kind();
        let effects = self.with_coordinator(|coordinator, ctx| coordinator.handle(ctx, message))?;
        if !effects.is_empty() {
            debug!(handle = self.inner.id, kind, "message processed");
        }
        self.fire(effects);
        Ok(())
    }

    fn fire(&self, mut effects: Effects) {
        if effects.fire_results() {
            let listeners: Vec<HandleListener> = {
                let mut state = self.inner.state.lock();
                let version = state.connection.current_version();
                state.coordinator.mark_notified(version);
                state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
            };
            for listener in listeners {
                listener();
            }
        }
        effects.run_callbacks();
    }
}

impl Drop for KelpHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if thread::current().id() != self.inner.owner {
            self.inner.orphan();
            warn!(
                path = %self.inner.config.path().display(),
                "handle dropped off its owning thread; reference handed back to the owner"
            );
            return;
        }
        if let Err(error) = self.inner.registry.release(&self.inner) {
            warn!(%error, "release on drop failed");
        }
    }
}

impl fmt::Debug for KelpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KelpHandle")
            .field("id", &self.inner.id)
            .field("path", &self.inner.config.path())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// Token for an async transaction.
pub struct CancellableRequest {
    task: TaskId,
    cancelled: Arc<AtomicBool>,
    registry: Arc<Registry>,
}

impl CancellableRequest {
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Suppresses the callbacks and removes the task if it has not started.
    /// Returns whether the task was removed before running.
    pub fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::Release);
        self.registry.scheduler().cancel(self.task)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
