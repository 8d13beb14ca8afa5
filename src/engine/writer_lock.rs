use crate::error::KelpError;
use parking_lot::{Condvar, Mutex};
use tracing::error;

/// Per-file writer exclusion. Held across calls, so it is tracked by
/// connection id instead of a scoped guard.
#[derive(Default)]
pub(super) struct WriterLock {
    holder: Mutex<Option<u64>>,
    cv: Condvar,
}

impl WriterLock {
    /// Blocks until no other connection holds the lock.
    pub(super) fn acquire(&self, connection_id: u64) -> Result<(), KelpError> {
        let mut holder = self.holder.lock();
        loop {
            match *holder {
                None => {
                    *holder = Some(connection_id);
                    return Ok(());
                }
                Some(current) if current == connection_id => {
                    return Err(KelpError::AlreadyInTransaction);
                }
                Some(_) => self.cv.wait(&mut holder),
            }
        }
    }

    pub(super) fn release(&self, connection_id: u64) {
        let mut holder = self.holder.lock();
        if *holder != Some(connection_id) {
            error!(
                connection_id,
                holder = ?*holder,
                "writer lock released by a connection that does not hold it"
            );
            return;
        }
        *holder = None;
        drop(holder);
        self.cv.notify_all();
    }

    #[cfg(test)]
    pub(super) fn holder(&self) -> Option<u64> {
        *self.holder.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::WriterLock;
    use crate::error::KelpError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn second_writer_waits_for_release() {
        let lock = Arc::new(WriterLock::default());
        lock.acquire(1).expect("first");
        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                lock.acquire(2).expect("second");
                acquired.store(true, Ordering::SeqCst);
                lock.release(2);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));
        lock.release(1);
        waiter.join().expect("join");
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn reentrant_acquire_is_rejected() {
        let lock = WriterLock::default();
        lock.acquire(5).expect("first");
        assert!(matches!(
            lock.acquire(5),
            Err(KelpError::AlreadyInTransaction)
        ));
        lock.release(9);
        assert_eq!(lock.holder(), Some(5));
    }
}
