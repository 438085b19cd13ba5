/*!
 * Worker Pool Integration Tests
 */

use anykernel::{WorkerError, WorkerPool};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_burst_runs_every_job() {
    let pool = WorkerPool::new(4, 64, "burst");
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..500 {
        let done = Arc::clone(&done);
        pool.enqueue(move || {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    wait_until(|| done.load(Ordering::SeqCst) == 500);
    wait_until(|| pool.stats().live == pool.stats().idle);
    assert!(pool.stats().idle <= 4);
}

#[test]
fn test_concurrent_jobs_get_distinct_threads() {
    const JOBS: usize = 6;
    let pool = WorkerPool::new(2, 2, "overflow");
    let barrier = Arc::new(Barrier::new(JOBS + 1));

    // Every job blocks until all are running, so the pool must exceed its cap
    for _ in 0..JOBS {
        let barrier = Arc::clone(&barrier);
        pool.enqueue(move || {
            barrier.wait();
        })
        .unwrap();
    }
    barrier.wait();

    assert!(pool.stats().spawned >= JOBS as u64);
    wait_until(|| pool.stats().live <= 2);
}

#[test]
fn test_sequential_jobs_reuse_one_worker() {
    let pool = WorkerPool::new(1, 4, "reuse");
    let (tx, rx) = mpsc::channel();

    for i in 0..10 {
        let tx = tx.clone();
        wait_until(|| pool.stats().live == pool.stats().idle);
        pool.enqueue(move || tx.send((i, thread::current().id())).unwrap())
            .unwrap();
        let (seen, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, i);
    }

    let stats = pool.stats();
    assert_eq!(stats.spawned, 1);
    assert_eq!(stats.reused, 9);
}

#[test]
fn test_shutdown_rejects_new_jobs() {
    let pool = WorkerPool::new(2, 4, "closing");
    pool.enqueue(|| {}).unwrap();
    pool.shutdown();

    assert!(pool.is_shut_down());
    assert!(matches!(pool.enqueue(|| {}), Err(WorkerError::ShutDown)));
    wait_until(|| pool.stats().live == 0);
}
