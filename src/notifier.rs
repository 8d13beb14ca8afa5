//! Per-handle message processing.
//!
//! Every cross-thread event reaches a handle through its [`Mailbox`] and is
//! applied on the owning thread by the [`NotificationCoordinator`]. Processing
//! a message only mutates handle state; listener calls are returned as
//! [`Effects`] and fired by the handle after its state lock is released.

use crate::engine::{Handover, Object, Snapshot, StoreConnection};
use crate::error::KelpError;
use crate::live::{LiveQueryId, LiveResultRegistry, LiveResults};
use crate::query::Query;
use crate::scheduler::{AsyncQueryScheduler, TaskId};
use crate::version::{VersionId, VersionOrdering};
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self as std_mpsc, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Result of a single async query, stamped with the version it ran against.
pub(crate) struct QueryOutcome {
    pub(crate) live: LiveQueryId,
    pub(crate) rows: Handover<Result<Vec<Object>, KelpError>>,
}

/// Re-evaluation of every live query of a handle against one version.
pub(crate) struct BatchOutcome {
    pub(crate) ticket: u64,
    pub(crate) version: VersionId,
    /// Keeps the version retained until the owner has advanced to it.
    pub(crate) pin: Arc<Snapshot>,
    pub(crate) results: Vec<(LiveQueryId, Result<Vec<Object>, KelpError>)>,
}

pub(crate) enum Message {
    RemoteChange,
    AsyncQueryCompleted(QueryOutcome),
    AsyncBatchUpdated(BatchOutcome),
    Callback(Callback),
}

impl Message {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Message::RemoteChange => "remote_change",
            Message::AsyncQueryCompleted(_) => "async_query_completed",
            Message::AsyncBatchUpdated(_) => "async_batch_updated",
            Message::Callback(_) => "callback",
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Sending half of a handle's mailbox. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub(crate) struct MailboxSender {
    tx: Sender<Message>,
}

impl MailboxSender {
    /// Returns false if the owning handle is gone.
    pub(crate) fn post(&self, message: Message) -> bool {
        let kind = message.kind();
        let delivered = self.tx.send(message).is_ok();
        if !delivered {
            debug!(kind, "mailbox owner closed; message dropped");
        }
        delivered
    }
}

pub(crate) struct Mailbox {
    rx: Receiver<Message>,
}

impl Mailbox {
    pub(crate) fn try_next(&self) -> Option<Message> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub(crate) fn next_timeout(&self, timeout: Duration) -> Option<Message> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

pub(crate) fn mailbox() -> (MailboxSender, Mailbox) {
    let (tx, rx) = std_mpsc::channel();
    (MailboxSender { tx }, Mailbox { rx })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    /// No async work outstanding for this handle.
    Idle,
    /// At least one async query or batch update has not come back yet.
    AwaitingBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    Adopt,
    Rerun,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    /// The owner moved past the batch; compute a fresh one.
    Rerun,
    Apply { advance: bool },
}

/// What to do with a single query result. `owner` is the owner's version
/// compared against the version the result was computed at.
pub fn decide_completion(owner: VersionOrdering, loaded: bool) -> CompletionAction {
    match (owner, loaded) {
        (VersionOrdering::Same, false) => CompletionAction::Adopt,
        (VersionOrdering::Ahead, false) => CompletionAction::Rerun,
        (VersionOrdering::Same, true) | (VersionOrdering::Ahead, true) => {
            CompletionAction::Discard
        }
        // A pending remote change will bring the owner forward.
        (VersionOrdering::Behind, _) => CompletionAction::Discard,
    }
}

pub fn decide_batch(owner: VersionOrdering) -> BatchAction {
    match owner {
        VersionOrdering::Ahead => BatchAction::Rerun,
        VersionOrdering::Same => BatchAction::Apply { advance: false },
        VersionOrdering::Behind => BatchAction::Apply { advance: true },
    }
}

/// Listener work produced by processing one message.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) updated: Vec<LiveResults>,
    pub(crate) failed: Vec<(LiveResults, KelpError)>,
    pub(crate) handle_changed: bool,
    pub(crate) callbacks: Vec<Callback>,
}

impl Effects {
    pub(crate) fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.failed.is_empty()
            && !self.handle_changed
            && self.callbacks.is_empty()
    }

    /// Result listeners run after every swap; the handle listeners follow.
    /// Returns whether the handle listeners are due.
    pub(crate) fn fire_results(&mut self) -> bool {
        for results in self.updated.drain(..) {
            results.notify();
        }
        for (results, error) in self.failed.drain(..) {
            results.report_error(&error);
        }
        self.handle_changed
    }

    pub(crate) fn run_callbacks(&mut self) {
        for callback in self.callbacks.drain(..) {
            callback();
        }
    }
}

/// Borrowed handle state a coordinator step works on.
pub(crate) struct Context<'a> {
    pub(crate) connection: &'a mut dyn StoreConnection,
    pub(crate) live: &'a mut LiveResultRegistry,
    pub(crate) scheduler: &'a AsyncQueryScheduler,
    pub(crate) mailbox: &'a MailboxSender,
}

pub(crate) struct NotificationCoordinator {
    pending_batch: Option<(u64, TaskId)>,
    next_ticket: u64,
    in_flight: HashMap<LiveQueryId, TaskId>,
    notified_version: VersionId,
    /// A batch could not be queued; the next pump queues it.
    batch_retry: bool,
}

impl NotificationCoordinator {
    pub(crate) fn new(version: VersionId) -> Self {
        Self {
            pending_batch: None,
            next_ticket: 0,
            in_flight: HashMap::new(),
            notified_version: version,
            batch_retry: false,
        }
    }

    pub(crate) fn mode(&self) -> HandleMode {
        if self.pending_batch.is_some() || !self.in_flight.is_empty() || self.batch_retry {
            HandleMode::AwaitingBatch
        } else {
            HandleMode::Idle
        }
    }

    pub(crate) fn mark_notified(&mut self, version: VersionId) {
        self.notified_version = version;
    }

    /// Submits the first evaluation of a freshly registered live query
    /// against the latest committed version.
    pub(crate) fn submit_query(
        &mut self,
        ctx: &mut Context<'_>,
        results: &LiveResults,
    ) -> Result<(), KelpError> {
        let handover = ctx.connection.handover_latest()?;
        self.submit_single(ctx, results.id(), results.query().clone(), handover)
    }

    fn submit_single(
        &mut self,
        ctx: &mut Context<'_>,
        live: LiveQueryId,
        query: Query,
        handover: Handover<Arc<Snapshot>>,
    ) -> Result<(), KelpError> {
        let sender = ctx.mailbox.clone();
        let version = handover.version();
        let task = ctx.scheduler.submit("async_query", move || {
            let snapshot = handover.payload();
            let rows = evaluate_guarded(&query, snapshot);
            sender.post(Message::AsyncQueryCompleted(QueryOutcome {
                live,
                rows: Handover::new(version, rows),
            }));
        })?;
        debug!(%live, %task, %version, "async query submitted");
        self.in_flight.insert(live, task);
        Ok(())
    }

    fn submit_batch(&mut self, ctx: &mut Context<'_>) -> Result<(), KelpError> {
        let queries = ctx.live.live_queries();
        let handover = ctx.connection.handover_latest()?;
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let sender = ctx.mailbox.clone();
        let version = handover.version();
        let count = queries.len();
        let task = ctx.scheduler.submit("batch_update", move || {
            let pin = Arc::clone(handover.payload());
            let results = queries
                .into_iter()
                .map(|(id, query)| (id, evaluate_guarded(&query, &pin)))
                .collect();
            sender.post(Message::AsyncBatchUpdated(BatchOutcome {
                ticket,
                version,
                pin,
                results,
            }));
        })?;
        debug!(%task, %version, queries = count, "batch update submitted");
        self.pending_batch = Some((ticket, task));
        Ok(())
    }

    /// Cancels the queued work of live queries whose results were dropped.
    pub(crate) fn reclaim(&mut self, ctx: &mut Context<'_>) -> usize {
        ctx.live.prune();
        let mut cancelled = 0;
        for live in ctx.live.take_reclaimed() {
            if let Some(task) = self.in_flight.remove(&live)
                && ctx.scheduler.cancel(task)
            {
                debug!(%live, %task, "queued query of dropped live result cancelled");
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Stops `results` from following the store and removes its query from
    /// the queue if no worker picked it up yet.
    pub(crate) fn cancel_query(&mut self, ctx: &mut Context<'_>, results: &LiveResults) -> bool {
        let live = results.id();
        ctx.live.unregister(live);
        results.mark_cancelled();
        let removed = self
            .in_flight
            .remove(&live)
            .is_some_and(|task| ctx.scheduler.cancel(task));
        debug!(%live, removed, "live query cancelled");
        removed
    }

    /// Queues the batch that an earlier full queue deferred.
    pub(crate) fn retry(&mut self, ctx: &mut Context<'_>) -> Result<Effects, KelpError> {
        if !self.batch_retry {
            return Ok(Effects::default());
        }
        self.on_remote_change(ctx)
    }

    pub(crate) fn handle(
        &mut self,
        ctx: &mut Context<'_>,
        message: Message,
    ) -> Result<Effects, KelpError> {
        self.reclaim(ctx);
        match message {
            Message::RemoteChange => self.on_remote_change(ctx),
            Message::AsyncQueryCompleted(outcome) => self.on_query_completed(ctx, outcome),
            Message::AsyncBatchUpdated(outcome) => self.on_batch_updated(ctx, outcome),
            Message::Callback(callback) => Ok(Effects {
                callbacks: vec![callback],
                ..Effects::default()
            }),
        }
    }

    fn on_remote_change(&mut self, ctx: &mut Context<'_>) -> Result<Effects, KelpError> {
        if ctx.live.is_empty() {
            self.batch_retry = false;
            if !ctx.connection.is_in_write() {
                ctx.connection.begin_read()?;
            }
            let current = ctx.connection.current_version();
            let changed = current != self.notified_version;
            debug!(version = %current, changed, "remote change applied");
            return Ok(Effects {
                handle_changed: changed,
                ..Effects::default()
            });
        }
        self.supersede_batch(ctx)?;
        Ok(Effects::default())
    }

    /// Queues a fresh batch, then cancels the one it replaces. The old batch
    /// stays pending if the new one cannot be queued.
    fn supersede_batch(&mut self, ctx: &mut Context<'_>) -> Result<(), KelpError> {
        let previous = self.pending_batch;
        if let Err(error) = self.submit_batch(ctx) {
            return self.defer(error);
        }
        self.batch_retry = false;
        if let Some((ticket, task)) = previous
            && ctx.scheduler.cancel(task)
        {
            debug!(ticket, %task, "superseded batch cancelled before start");
        }
        Ok(())
    }

    /// Remembers that a full batch is owed. A full queue is not an error for
    /// the message being processed; anything else still is.
    fn defer(&mut self, error: KelpError) -> Result<(), KelpError> {
        self.batch_retry = true;
        match error {
            KelpError::QueueFull => {
                warn!("async queue full; batch update deferred to the next pump");
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Re-runs, at the owner's version, unloaded live queries that `covered`
    /// missed and that have nothing in flight. This catches queries
    /// registered after the batch was queued whose own result arrived ahead
    /// of the owner and was discarded.
    fn resubmit_uncovered(
        &mut self,
        ctx: &mut Context<'_>,
        covered: &[LiveQueryId],
    ) -> Result<(), KelpError> {
        for (live, query) in ctx.live.live_queries() {
            if covered.contains(&live) || self.in_flight.contains_key(&live) {
                continue;
            }
            let Some(results) = ctx.live.upgrade(live) else {
                continue;
            };
            if results.loaded() {
                continue;
            }
            debug!(%live, "uncovered live query re-run after batch");
            let handover = ctx.connection.handover_current();
            if let Err(error) = self.submit_single(ctx, live, query, handover) {
                return self.defer(error);
            }
        }
        Ok(())
    }

    fn on_query_completed(
        &mut self,
        ctx: &mut Context<'_>,
        outcome: QueryOutcome,
    ) -> Result<Effects, KelpError> {
        let QueryOutcome { live, rows } = outcome;
        self.in_flight.remove(&live);
        let Some(results) = ctx.live.upgrade(live) else {
            debug!(%live, "async result for dropped live query discarded");
            return Ok(Effects::default());
        };
        let current = ctx.connection.current_version();
        let computed_at = rows.version();
        let mut effects = Effects::default();
        match decide_completion(current.compare(&computed_at), results.loaded()) {
            CompletionAction::Adopt => match rows.import(current)? {
                Ok(rows) => {
                    results.swap(computed_at, rows);
                    effects.updated.push(results);
                }
                Err(error) => {
                    let error = KelpError::async_failure(&error);
                    effects.failed.push((results, error));
                }
            },
            CompletionAction::Rerun => {
                debug!(%live, stale = %computed_at, owner = %current, "async query re-run at owner version");
                let handover = ctx.connection.handover_current();
                if let Err(error) = self.submit_single(ctx, live, results.query().clone(), handover)
                {
                    self.defer(error)?;
                }
            }
            CompletionAction::Discard => {
                debug!(%live, stale = %computed_at, owner = %current, "async query result discarded");
            }
        }
        Ok(effects)
    }

    fn on_batch_updated(
        &mut self,
        ctx: &mut Context<'_>,
        outcome: BatchOutcome,
    ) -> Result<Effects, KelpError> {
        if self.pending_batch.map(|(ticket, _)| ticket) != Some(outcome.ticket) {
            debug!(ticket = outcome.ticket, "superseded batch result discarded");
            return Ok(Effects::default());
        }
        self.pending_batch = None;
        let current = ctx.connection.current_version();
        let advance = match decide_batch(current.compare(&outcome.version)) {
            BatchAction::Rerun => {
                debug!(batch = %outcome.version, owner = %current, "owner ahead of batch; re-running");
                return self.on_remote_change(ctx);
            }
            BatchAction::Apply { advance } => advance,
        };
        let BatchOutcome {
            version,
            pin,
            results,
            ..
        } = outcome;
        let mut effects = Effects::default();
        let mut covered = Vec::with_capacity(results.len());
        for (live, rows) in results {
            covered.push(live);
            let Some(target) = ctx.live.upgrade(live) else {
                debug!(%live, "batch result for dropped live query discarded");
                continue;
            };
            match rows {
                Ok(rows) => {
                    target.swap(version, rows);
                    effects.updated.push(target);
                }
                Err(error) => {
                    let error = KelpError::async_failure(&error);
                    effects.failed.push((target, error));
                }
            }
        }
        if advance {
            ctx.connection.advance_to(version)?;
            effects.updated.extend(resync_loaded(ctx, &covered));
        }
        drop(pin);
        debug!(%version, advance, updated = effects.updated.len(), "batch update applied");
        effects.handle_changed = advance;
        if self.batch_retry {
            self.supersede_batch(ctx)?;
        } else {
            self.resubmit_uncovered(ctx, &covered)?;
        }
        Ok(effects)
    }

    /// Applies a commit made through this handle. The connection has already
    /// moved to the committed version.
    pub(crate) fn local_change(&mut self, ctx: &mut Context<'_>) -> Result<Effects, KelpError> {
        let updated = resync_loaded(ctx, &[]);
        Ok(Effects {
            updated,
            handle_changed: true,
            ..Effects::default()
        })
    }

    /// Best-effort cancellation of everything still queued for this handle.
    pub(crate) fn cancel_all(&mut self, scheduler: &AsyncQueryScheduler) -> usize {
        self.batch_retry = false;
        let mut cancelled = 0;
        if let Some((_, task)) = self.pending_batch.take()
            && scheduler.cancel(task)
        {
            cancelled += 1;
        }
        for (_, task) in self.in_flight.drain() {
            if scheduler.cancel(task) {
                cancelled += 1;
            }
        }
        cancelled
    }
}

/// Re-evaluates loaded live results against the owner's current snapshot.
/// Rows are swapped in place; listeners are left to the caller.
pub(crate) fn resync_loaded(
    ctx: &mut Context<'_>,
    except: &[LiveQueryId],
) -> Vec<LiveResults> {
    let snapshot = ctx.connection.snapshot();
    let version = snapshot.version();
    let mut updated = Vec::new();
    for results in ctx.live.loaded_results(except) {
        match results.query().evaluate(&snapshot) {
            Ok(rows) => {
                results.swap(version, rows);
                updated.push(results);
            }
            Err(error) => {
                warn!(live = %results.id(), %error, "live query failed to re-evaluate");
                results.report_error(&error);
            }
        }
    }
    updated
}

fn evaluate_guarded(query: &Query, snapshot: &Snapshot) -> Result<Vec<Object>, KelpError> {
    catch_unwind(AssertUnwindSafe(|| query.evaluate(snapshot)))
        .unwrap_or(Err(KelpError::WorkerPanicked))
}

#[cfg(test)]
mod tests {
    use super::{
        BatchAction, CompletionAction, Effects, HandleMode, Message, NotificationCoordinator,
        decide_batch, decide_completion, mailbox,
    };
    use crate::version::{VersionId, VersionOrdering};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn completion_decision_table_is_exhaustive() {
        use CompletionAction::*;
        use VersionOrdering::*;
        let cases = [
            (Same, false, Adopt),
            (Same, true, Discard),
            (Ahead, false, Rerun),
            (Ahead, true, Discard),
            (Behind, false, Discard),
            (Behind, true, Discard),
        ];
        for (ordering, loaded, expected) in cases {
            assert_eq!(
                decide_completion(ordering, loaded),
                expected,
                "ordering={ordering:?} loaded={loaded}"
            );
        }
    }

    #[test]
    fn batch_decision_table_is_exhaustive() {
        assert_eq!(decide_batch(VersionOrdering::Ahead), BatchAction::Rerun);
        assert_eq!(
            decide_batch(VersionOrdering::Same),
            BatchAction::Apply { advance: false }
        );
        assert_eq!(
            decide_batch(VersionOrdering::Behind),
            BatchAction::Apply { advance: true }
        );
    }

    #[test]
    fn mailbox_is_fifo_and_survives_dropped_receiver() {
        let (tx, rx) = mailbox();
        assert!(tx.post(Message::RemoteChange));
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            tx.post(Message::Callback(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })));
        }
        assert_eq!(rx.try_next().map(|m| m.kind()), Some("remote_change"));
        let Some(Message::Callback(cb)) = rx.next_timeout(Duration::from_millis(10)) else {
            panic!("expected callback");
        };
        cb();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(rx.try_next().is_none());
        drop(rx);
        assert!(!tx.post(Message::RemoteChange));
    }

    #[test]
    fn new_coordinator_is_idle() {
        let coordinator = NotificationCoordinator::new(VersionId::new(0, 1));
        assert_eq!(coordinator.mode(), HandleMode::Idle);
        assert!(Effects::default().is_empty());
    }
}
