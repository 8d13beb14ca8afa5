use kelpdb::{KelpConfig, KelpError, KelpHandle, Query, Registry, RuntimeConfig};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn config(dir: &Path) -> KelpConfig {
    KelpConfig::new(dir.join("kennel.kelp"))
        .expect("config")
        .with_table("dogs")
}

fn pump_until(handle: &KelpHandle, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for notifications"
        );
        handle
            .wait_for_change(Duration::from_millis(50))
            .expect("pump mailbox");
    }
}

/// Commits one dog from a short-lived handle on another thread.
fn commit_from_other_thread(registry: &Arc<Registry>, cfg: &KelpConfig, name: &'static str) {
    let registry = Arc::clone(registry);
    let cfg = cfg.clone();
    thread::spawn(move || {
        let writer = registry.open(cfg).expect("writer open");
        writer
            .execute_transaction(|h| h.insert("dogs", json!({ "name": name })))
            .expect("writer insert");
        writer.close().expect("writer close");
    })
    .join()
    .expect("writer thread");
}

#[test]
fn remote_commit_advances_idle_handle_and_fires_listener_once() {
    let dir = tempdir().expect("temp dir");
    let registry = Registry::with_file_engine(RuntimeConfig::single_worker()).expect("registry");
    let cfg = config(dir.path());
    let handle = registry.open(cfg.clone()).expect("open");
    let before = handle.version().expect("version");
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        handle
            .add_change_listener(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .expect("listener");
    }

    commit_from_other_thread(&registry, &cfg, "rex");
    assert_eq!(handle.version().expect("version"), before, "no implicit advance");
    assert!(handle.query(&Query::all("dogs")).expect("query").is_empty());

    assert!(handle
        .wait_for_change(Duration::from_secs(5))
        .expect("wait"));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(handle.query(&Query::all("dogs")).expect("query").len(), 1);
    assert!(handle.version().expect("version") > before);
    assert!(!handle
        .wait_for_change(Duration::from_millis(20))
        .expect("nothing pending"));
    handle.close().expect("close");
}

#[test]
fn live_results_follow_remote_commits() {
    let dir = tempdir().expect("temp dir");
    let registry = Registry::with_file_engine(RuntimeConfig::default()).expect("registry");
    let cfg = config(dir.path());
    let handle = registry.open(cfg.clone()).expect("open");
    let results = handle
        .query_async(Query::all("dogs").filter(|v| v["name"] != json!("cat")))
        .expect("query_async");
    pump_until(&handle, || results.is_loaded().expect("owner"));
    assert!(results.is_empty().expect("owner"));

    let handle_fired = Arc::new(AtomicUsize::new(0));
    {
        let handle_fired = Arc::clone(&handle_fired);
        handle
            .add_change_listener(move || {
                handle_fired.fetch_add(1, Ordering::SeqCst);
            })
            .expect("listener");
    }
    commit_from_other_thread(&registry, &cfg, "rex");
    commit_from_other_thread(&registry, &cfg, "cat");
    commit_from_other_thread(&registry, &cfg, "fido");

    pump_until(&handle, || results.len().expect("owner") == 2);
    let latest = handle.version().expect("version");
    pump_until(&handle, || {
        handle.notification_mode().expect("mode") == kelpdb::HandleMode::Idle
    });
    assert_eq!(results.version().expect("owner"), Some(latest));
    assert!(handle_fired.load(Ordering::SeqCst) >= 1);
    handle.close().expect("close");
}

#[test]
fn async_transaction_commits_then_calls_back_on_owner() {
    let dir = tempdir().expect("temp dir");
    let registry = Registry::with_file_engine(RuntimeConfig::single_worker()).expect("registry");
    let handle = registry.open(config(dir.path())).expect("open");
    let owner = thread::current().id();
    let callback_thread = Arc::new(Mutex::new(None));
    {
        let callback_thread = Arc::clone(&callback_thread);
        handle
            .execute_transaction_async(
                |h| {
                    h.insert("dogs", json!({ "name": "rex" }))?;
                    Ok(())
                },
                Some(Box::new(move || {
                    *callback_thread.lock().expect("callback mutex poisoned") =
                        Some(thread::current().id());
                })),
                None,
            )
            .expect("submit");
    }
    pump_until(&handle, || {
        callback_thread
            .lock()
            .expect("callback mutex poisoned")
            .is_some()
    });
    assert_eq!(
        *callback_thread.lock().expect("callback mutex poisoned"),
        Some(owner)
    );
    // The remote change is queued ahead of the callback.
    assert_eq!(handle.query(&Query::all("dogs")).expect("query").len(), 1);
    handle.close().expect("close");
}

#[test]
fn async_transaction_failure_reaches_error_callback() {
    let dir = tempdir().expect("temp dir");
    let registry = Registry::with_file_engine(RuntimeConfig::single_worker()).expect("registry");
    let handle = registry.open(config(dir.path())).expect("open");
    let failure = Arc::new(Mutex::new(None));
    {
        let failure = Arc::clone(&failure);
        handle
            .execute_transaction_async(
                |h| {
                    h.insert("dogs", json!({ "name": "ghost" }))?;
                    Err(KelpError::Validation("rejected".into()))
                },
                None,
                Some(Box::new(move |e: KelpError| {
                    *failure.lock().expect("failure mutex poisoned") = Some(e);
                })),
            )
            .expect("submit");
    }
    pump_until(&handle, || {
        failure.lock().expect("failure mutex poisoned").is_some()
    });
    let failure = failure
        .lock()
        .expect("failure mutex poisoned")
        .take()
        .expect("failure recorded");
    assert!(matches!(failure, KelpError::TransactionFailure { .. }));
    assert!(handle.query(&Query::all("dogs")).expect("query").is_empty());
    handle.close().expect("close");
}

#[test]
fn cancelled_async_transaction_never_runs_or_calls_back() {
    let dir = tempdir().expect("temp dir");
    let registry = Registry::with_file_engine(RuntimeConfig::single_worker()).expect("registry");
    let handle = registry.open(config(dir.path())).expect("open");

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    registry
        .scheduler()
        .submit("gate", move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        })
        .expect("gate");
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("gate started");

    let called = Arc::new(AtomicBool::new(false));
    let request = {
        let on_success = Arc::clone(&called);
        let on_error = Arc::clone(&called);
        handle
            .execute_transaction_async(
                |h| {
                    h.insert("dogs", json!({ "name": "rex" }))?;
                    Ok(())
                },
                Some(Box::new(move || on_success.store(true, Ordering::SeqCst))),
                Some(Box::new(move |_: KelpError| on_error.store(true, Ordering::SeqCst))),
            )
            .expect("submit")
    };
    assert!(request.cancel(), "removed before it started");
    assert!(request.is_cancelled());
    release_tx.send(()).expect("release gate");

    let (done_tx, done_rx) = mpsc::channel::<()>();
    registry
        .scheduler()
        .submit("marker", move || {
            let _ = done_tx.send(());
        })
        .expect("marker");
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("marker ran");
    assert!(!handle
        .wait_for_change(Duration::from_millis(50))
        .expect("pump"));
    assert!(!called.load(Ordering::SeqCst));
    assert!(handle.query(&Query::all("dogs")).expect("query").is_empty());
    assert_eq!(registry.scheduler().metrics().cancelled, 1);
    handle.close().expect("close");
}

#[test]
fn query_registered_behind_a_pending_batch_still_loads() {
    let dir = tempdir().expect("temp dir");
    let registry = Registry::with_file_engine(RuntimeConfig {
        async_worker_threads: 2,
        ..RuntimeConfig::single_worker()
    })
    .expect("registry");
    let cfg = config(dir.path());
    let handle = registry.open(cfg.clone()).expect("open");
    handle
        .execute_transaction(|h| h.insert("dogs", json!({ "name": "rex" })))
        .expect("insert");

    // Holds the batch inside the filter until `released` is set.
    let armed = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicBool::new(false));
    let released = Arc::new(AtomicBool::new(false));
    let watched = {
        let (armed, entered, released) =
            (Arc::clone(&armed), Arc::clone(&entered), Arc::clone(&released));
        handle
            .query_async(Query::all("dogs").filter(move |_| {
                if armed.load(Ordering::SeqCst) {
                    entered.store(true, Ordering::SeqCst);
                    while !released.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                true
            }))
            .expect("watched")
    };
    pump_until(&handle, || watched.is_loaded().expect("owner"));

    armed.store(true, Ordering::SeqCst);
    commit_from_other_thread(&registry, &cfg, "bo");
    assert_eq!(handle.refresh().expect("refresh"), 1);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !entered.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "batch never started");
        thread::sleep(Duration::from_millis(1));
    }

    // Evaluated at the committed version while the handle still reads the
    // previous one, so its own result is dropped.
    let late = handle.query_async(Query::all("dogs")).expect("late");
    let deadline = Instant::now() + Duration::from_secs(5);
    while registry.scheduler().metrics().completed < 2 {
        assert!(Instant::now() < deadline, "late query never finished");
        thread::sleep(Duration::from_millis(1));
    }
    handle.refresh().expect("refresh");
    assert!(!late.is_loaded().expect("owner"));
    assert_eq!(
        handle.notification_mode().expect("mode"),
        kelpdb::HandleMode::AwaitingBatch
    );

    released.store(true, Ordering::SeqCst);
    pump_until(&handle, || late.is_loaded().expect("owner"));
    let latest = handle.version().expect("version");
    assert_eq!(late.version().expect("owner"), Some(latest));
    assert_eq!(watched.version().expect("owner"), Some(latest));
    assert_eq!(late.len().expect("owner"), 2);
    // watched + batch + late + its re-run
    assert_eq!(registry.scheduler().metrics().submitted, 4);
    pump_until(&handle, || {
        handle.notification_mode().expect("mode") == kelpdb::HandleMode::Idle
    });
    handle.close().expect("close");
}
