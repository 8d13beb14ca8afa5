use crate::engine::Object;
use crate::error::KelpError;
use crate::notifier::ListenerId;
use crate::query::Query;
use crate::version::VersionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self as std_mpsc, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LiveQueryId(u64);

impl fmt::Display for LiveQueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "live-{}", self.0)
    }
}

type ResultsListener = Arc<dyn Fn(&LiveResults) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&KelpError) + Send + Sync>;

struct LiveState {
    loaded: bool,
    cancelled: bool,
    version: Option<VersionId>,
    rows: Arc<Vec<Object>>,
    listeners: Vec<(ListenerId, ResultsListener)>,
    error_handler: Option<ErrorHandler>,
    next_listener: u64,
}

pub(crate) struct LiveInner {
    id: LiveQueryId,
    owner: ThreadId,
    query: Query,
    state: Mutex<LiveState>,
    reclaim: Sender<LiveQueryId>,
}

impl Drop for LiveInner {
    fn drop(&mut self) {
        // The registry may already be gone with its handle.
        let _ = self.reclaim.send(self.id);
    }
}

/// Result set of an asynchronous query, kept in sync with its handle.
///
/// Empty and not loaded until the first result is merged on the owning
/// thread. Once loaded it stays loaded. Dropping every clone unregisters the
/// query on the next prune.
#[derive(Clone)]
pub struct LiveResults {
    inner: Arc<LiveInner>,
}

impl LiveResults {
    pub fn id(&self) -> LiveQueryId {
        self.inner.id
    }

    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    pub fn is_loaded(&self) -> Result<bool, KelpError> {
        self.check_thread()?;
        Ok(self.inner.state.lock().loaded)
    }

    /// True once the query was cancelled through its handle. Cancelled
    /// results keep their last rows but no longer follow the store.
    pub fn is_cancelled(&self) -> Result<bool, KelpError> {
        self.check_thread()?;
        Ok(self.inner.state.lock().cancelled)
    }

    /// Version the current rows were computed against.
    pub fn version(&self) -> Result<Option<VersionId>, KelpError> {
        self.check_thread()?;
        Ok(self.inner.state.lock().version)
    }

    pub fn rows(&self) -> Result<Arc<Vec<Object>>, KelpError> {
        self.check_thread()?;
        Ok(Arc::clone(&self.inner.state.lock().rows))
    }

    pub fn len(&self) -> Result<usize, KelpError> {
        self.check_thread()?;
        Ok(self.inner.state.lock().rows.len())
    }

    pub fn is_empty(&self) -> Result<bool, KelpError> {
        Ok(self.len()? == 0)
    }

    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerId, KelpError>
    where
        F: Fn(&LiveResults) + Send + Sync + 'static,
    {
        self.check_thread()?;
        let mut state = self.inner.state.lock();
        state.next_listener += 1;
        let id = ListenerId::new(state.next_listener);
        state.listeners.push((id, Arc::new(listener)));
        Ok(id)
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> Result<bool, KelpError> {
        self.check_thread()?;
        let mut state = self.inner.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        Ok(state.listeners.len() != before)
    }

    /// Receives failures of the background evaluation on the owning thread.
    pub fn set_error_handler<F>(&self, handler: F) -> Result<(), KelpError>
    where
        F: Fn(&KelpError) + Send + Sync + 'static,
    {
        self.check_thread()?;
        self.inner.state.lock().error_handler = Some(Arc::new(handler));
        Ok(())
    }

    fn check_thread(&self) -> Result<(), KelpError> {
        if std::thread::current().id() != self.inner.owner {
            return Err(KelpError::WrongThread);
        }
        Ok(())
    }

    pub(crate) fn loaded(&self) -> bool {
        self.inner.state.lock().loaded
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    pub(crate) fn mark_cancelled(&self) {
        self.inner.state.lock().cancelled = true;
    }

    /// Replaces the rows and marks the results loaded. Does not notify.
    pub(crate) fn swap(&self, version: VersionId, rows: Vec<Object>) {
        let mut state = self.inner.state.lock();
        state.rows = Arc::new(rows);
        state.version = Some(version);
        state.loaded = true;
    }

    pub(crate) fn notify(&self) {
        let listeners: Vec<ResultsListener> = {
            let state = self.inner.state.lock();
            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(self);
        }
    }

    pub(crate) fn report_error(&self, error: &KelpError) {
        let handler = self.inner.state.lock().error_handler.clone();
        match handler {
            Some(handler) => handler(error),
            None => debug!(live = %self.inner.id, %error, "async query failed with no error handler"),
        }
    }
}

impl fmt::Debug for LiveResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveResults")
            .field("id", &self.inner.id)
            .field("query", &self.inner.query)
            .finish_non_exhaustive()
    }
}

struct LiveEntry {
    target: Weak<LiveInner>,
    query: Query,
}

/// Per-handle table of outstanding live queries.
///
/// Holds only weak references. Results that are dropped announce their id on
/// the reclamation channel and are removed by [`LiveResultRegistry::prune`].
pub(crate) struct LiveResultRegistry {
    owner: ThreadId,
    entries: HashMap<LiveQueryId, LiveEntry>,
    reclaimed_tx: Sender<LiveQueryId>,
    reclaimed_rx: Receiver<LiveQueryId>,
    /// Ids removed since the last `take_reclaimed`.
    removed: Vec<LiveQueryId>,
    next_id: u64,
}

impl LiveResultRegistry {
    pub(crate) fn new(owner: ThreadId) -> Self {
        let (reclaimed_tx, reclaimed_rx) = std_mpsc::channel();
        Self {
            owner,
            entries: HashMap::new(),
            reclaimed_tx,
            reclaimed_rx,
            removed: Vec::new(),
            next_id: 0,
        }
    }

    pub(crate) fn register(&mut self, query: Query) -> LiveResults {
        self.next_id += 1;
        let id = LiveQueryId(self.next_id);
        let inner = Arc::new(LiveInner {
            id,
            owner: self.owner,
            query: query.clone(),
            state: Mutex::new(LiveState {
                loaded: false,
                cancelled: false,
                version: None,
                rows: Arc::new(Vec::new()),
                listeners: Vec::new(),
                error_handler: None,
                next_listener: 0,
            }),
            reclaim: self.reclaimed_tx.clone(),
        });
        self.entries.insert(
            id,
            LiveEntry {
                target: Arc::downgrade(&inner),
                query,
            },
        );
        LiveResults { inner }
    }

    /// Removes entries whose results were dropped. Returns how many went.
    pub(crate) fn prune(&mut self) -> usize {
        let mut removed = 0;
        while let Ok(id) = self.reclaimed_rx.try_recv() {
            if self.entries.remove(&id).is_some() {
                self.removed.push(id);
                removed += 1;
            }
        }
        let dead: Vec<LiveQueryId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.target.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.entries.remove(&id);
            self.removed.push(id);
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "pruned dropped live results");
        }
        removed
    }

    pub(crate) fn is_empty(&mut self) -> bool {
        self.prune();
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// `None` if unknown or already dropped; dropped entries are removed.
    pub(crate) fn upgrade(&mut self, id: LiveQueryId) -> Option<LiveResults> {
        let inner = self.entries.get(&id)?.target.upgrade();
        match inner {
            Some(inner) => Some(LiveResults { inner }),
            None => {
                self.entries.remove(&id);
                self.removed.push(id);
                None
            }
        }
    }

    /// Drains the ids dropped by pruning so their queued work can be cancelled.
    pub(crate) fn take_reclaimed(&mut self) -> Vec<LiveQueryId> {
        std::mem::take(&mut self.removed)
    }

    /// Whether `results` were registered here, not on another handle.
    pub(crate) fn owns(&self, results: &LiveResults) -> bool {
        self.entries
            .get(&results.id())
            .is_some_and(|e| std::ptr::eq(e.target.as_ptr(), Arc::as_ptr(&results.inner)))
    }

    /// Stops following `id`. Returns false if it was not registered.
    pub(crate) fn unregister(&mut self, id: LiveQueryId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Snapshot of every live entry, pruned first.
    pub(crate) fn live_queries(&mut self) -> Vec<(LiveQueryId, Query)> {
        self.prune();
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|(id, e)| (*id, e.query.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Loaded results not listed in `except`, in registration order.
    pub(crate) fn loaded_results(&mut self, except: &[LiveQueryId]) -> Vec<LiveResults> {
        let ids: Vec<LiveQueryId> = self
            .live_queries()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !except.contains(id))
            .collect();
        ids.into_iter()
            .filter_map(|id| self.upgrade(id))
            .filter(LiveResults::loaded)
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.removed.clear();
        while self.reclaimed_rx.try_recv().is_ok() {}
    }
}
