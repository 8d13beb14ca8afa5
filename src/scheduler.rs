use crate::error::KelpError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    id: TaskId,
    label: &'static str,
    job: Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerMetrics {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub panicked: u64,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    panicked: AtomicU64,
}

struct Shared {
    queue: Mutex<VecDeque<QueuedTask>>,
    cv: Condvar,
    shutdown: AtomicBool,
    counters: Counters,
    max_queued: usize,
}

/// Fixed-size worker pool with a removable FIFO queue.
///
/// Jobs are responsible for posting their own outcome; the pool only
/// guarantees that a job either runs once or is cancelled before starting.
pub struct AsyncQueryScheduler {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncQueryScheduler {
    pub fn new(worker_threads: usize, max_queued: usize) -> Result<Self, KelpError> {
        let worker_count = worker_threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
            max_queued: max_queued.max(1),
        });
        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("kelp-async-{idx}"))
                .spawn(move || run_worker(worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    shared.shutdown.store(true, Ordering::Release);
                    shared.cv.notify_all();
                    return Err(err.into());
                }
            }
        }
        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            worker_count,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueues `job` without blocking. Fails fast when the queue is full.
    pub fn submit<F>(&self, label: &'static str, job: F) -> Result<TaskId, KelpError>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.max_queued {
                return Err(KelpError::QueueFull);
            }
            queue.push_back(QueuedTask {
                id,
                label,
                job: Box::new(job),
            });
        }
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.cv.notify_one();
        debug!(task = %id, label, "async task submitted");
        Ok(id)
    }

    /// Removes `id` from the queue if no worker has picked it up yet.
    pub fn cancel(&self, id: TaskId) -> bool {
        let removed = {
            let mut queue = self.shared.queue.lock();
            queue
                .iter()
                .position(|t| t.id == id)
                .and_then(|pos| queue.remove(pos))
        };
        match removed {
            Some(task) => {
                self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(task = %id, label = task.label, "async task cancelled before start");
                true
            }
            None => false,
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let c = &self.shared.counters;
        SchedulerMetrics {
            submitted: c.submitted.load(Ordering::Relaxed),
            started: c.started.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            queued: self.queued(),
        }
    }
}

impl Drop for AsyncQueryScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let dropped = {
            let mut queue = self.shared.queue.lock();
            std::mem::take(&mut *queue)
        };
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "scheduler shut down with queued tasks");
        }
        self.shared.cv.notify_all();
        // Running jobs finish first. A job that drops the last owner of the
        // pool runs this on its own worker, which cannot join itself.
        let current = std::thread::current().id();
        for worker in std::mem::take(&mut *self.workers.lock()) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("async worker exited by panic");
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                shared.cv.wait(&mut queue);
            }
        };
        shared.counters.started.fetch_add(1, Ordering::Relaxed);
        let QueuedTask { id, label, job } = task;
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
            error!(task = %id, label, "async task panicked");
        } else {
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AsyncQueryScheduler;
    use crate::error::KelpError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Occupies the single worker until the returned sender is used.
    fn block_worker(scheduler: &AsyncQueryScheduler) -> mpsc::Sender<()> {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        scheduler
            .submit("gate", move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            })
            .expect("gate");
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("gate started");
        release_tx
    }

    #[test]
    fn cancel_removes_unstarted_task() {
        let scheduler = AsyncQueryScheduler::new(1, 16).expect("scheduler");
        let gate = block_worker(&scheduler);
        let ran = Arc::new(AtomicBool::new(false));
        let id = {
            let ran = Arc::clone(&ran);
            scheduler
                .submit("victim", move || ran.store(true, Ordering::SeqCst))
                .expect("submit")
        };
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id), "second cancel finds nothing");

        let (done_tx, done_rx) = mpsc::channel();
        scheduler
            .submit("marker", move || {
                let _ = done_tx.send(());
            })
            .expect("marker");
        gate.send(()).expect("release");
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("marker ran");
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.metrics().cancelled, 1);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let scheduler = AsyncQueryScheduler::new(1, 16).expect("scheduler");
        scheduler
            .submit("boom", || panic!("task failure"))
            .expect("submit");
        let (done_tx, done_rx) = mpsc::channel();
        scheduler
            .submit("after", move || {
                let _ = done_tx.send(());
            })
            .expect("submit");
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker survived");
        let metrics = scheduler.metrics();
        assert_eq!(metrics.panicked, 1);
        assert_eq!(metrics.started, 2);
    }

    #[test]
    fn drop_waits_for_running_task() {
        let scheduler = AsyncQueryScheduler::new(2, 16).expect("scheduler");
        let finished = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::channel();
        {
            let finished = Arc::clone(&finished);
            scheduler
                .submit("slow", move || {
                    let _ = started_tx.send(());
                    std::thread::sleep(Duration::from_millis(50));
                    finished.store(true, Ordering::SeqCst);
                })
                .expect("submit");
        }
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("task started");
        drop(scheduler);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn full_queue_fails_fast() {
        let scheduler = AsyncQueryScheduler::new(1, 1).expect("scheduler");
        let gate = block_worker(&scheduler);
        scheduler.submit("queued", || {}).expect("fits");
        let err = scheduler.submit("overflow", || {}).expect_err("full");
        assert!(matches!(err, KelpError::QueueFull));
        gate.send(()).expect("release");
    }
}
