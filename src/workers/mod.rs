/*!
 * Worker Thread Pool
 *
 * Reusable host threads for short dispatched callbacks (proxied syscalls,
 * client-side copyin service).
 *
 * # Design
 *
 * Each worker owns a one-job slot with its own condvar; the pool keeps only
 * a bounded list of idle workers behind a single mutex. Enqueueing hands the
 * job to an idle worker if there is one and spawns a new thread otherwise.
 * The soft cap on live workers is advisory: going over it only logs.
 *
 * After each job a worker rejoins the idle list, or exits if the list is
 * already full.
 */

use crate::core::errors::WorkerError;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Slot {
    Empty,
    Job(Job),
    Exit,
}

struct Worker {
    slot: Mutex<Slot>,
    cv: Condvar,
}

struct Shared {
    idle: Mutex<Vec<Arc<Worker>>>,
    max_idle: usize,
    soft_cap: usize,
    name: String,
    live: AtomicUsize,
    spawned: AtomicU64,
    reused: AtomicU64,
    shutdown: AtomicBool,
}

/// Worker pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub live: usize,
    pub idle: usize,
    pub spawned: u64,
    pub reused: u64,
}

/// Pool of reusable worker threads
///
/// Dropping the pool shuts it down: idle workers exit at once, busy ones
/// after their current job.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(max_idle: usize, soft_cap: usize, name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(Vec::with_capacity(max_idle)),
                max_idle,
                soft_cap,
                name: name.into(),
                live: AtomicUsize::new(0),
                spawned: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Run `job` on a worker thread
    pub fn enqueue<F>(&self, job: F) -> Result<(), WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(WorkerError::ShutDown);
        }
        let job: Job = Box::new(job);

        let idle = self.shared.idle.lock().pop();
        if let Some(worker) = idle {
            self.shared.reused.fetch_add(1, Ordering::Relaxed);
            *worker.slot.lock() = Slot::Job(job);
            worker.cv.notify_one();
            return Ok(());
        }

        self.spawn(job)
    }

    fn spawn(&self, job: Job) -> Result<(), WorkerError> {
        let live = self.shared.live.fetch_add(1, Ordering::AcqRel) + 1;
        if live > self.shared.soft_cap {
            warn!(
                live,
                soft_cap = self.shared.soft_cap,
                "worker pool over soft cap"
            );
        }

        let worker = Arc::new(Worker {
            slot: Mutex::new(Slot::Empty),
            cv: Condvar::new(),
        });
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || worker_loop(shared, worker, job));

        match spawned {
            Ok(_) => {
                self.shared.spawned.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                Err(WorkerError::Spawn(e))
            }
        }
    }

    /// Stop accepting work and dismiss idle workers
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle = mem::take(&mut *self.shared.idle.lock());
        debug!(idle = idle.len(), "worker pool shutting down");
        for worker in idle {
            *worker.slot.lock() = Slot::Exit;
            worker.cv.notify_one();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            live: self.shared.live.load(Ordering::Acquire),
            idle: self.shared.idle.lock().len(),
            spawned: self.shared.spawned.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, worker: Arc<Worker>, mut job: Job) {
    loop {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker = %shared.name, "worker job panicked");
        }

        {
            let mut idle = shared.idle.lock();
            if shared.shutdown.load(Ordering::Acquire) || idle.len() >= shared.max_idle {
                break;
            }
            idle.push(Arc::clone(&worker));
        }

        let mut slot = worker.slot.lock();
        loop {
            match mem::replace(&mut *slot, Slot::Empty) {
                Slot::Job(next) => {
                    job = next;
                    break;
                }
                Slot::Exit => {
                    drop(slot);
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                Slot::Empty => worker.cv.wait(&mut slot),
            }
        }
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
}
