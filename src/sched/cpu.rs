/*!
 * Virtual CPU Pool
 *
 * Fixed set of admission slots. An LWP must own a slot before it may run
 * kernel-context code; at most one LWP owns a slot at a time.
 *
 * # Design
 *
 * One mutex guards the free list and the slot bindings; a condvar wakes a
 * single waiter per freed slot. Grant order is whatever the host scheduler
 * makes of `notify_one`, so there is no FIFO guarantee.
 *
 * `suspend` is the only sanctioned way to block on another lock while
 * holding a slot: it gives the slot up, waits, and takes a slot back with
 * the interlock released, so no call site can get the order wrong.
 */

use crate::core::types::CpuId;
use crate::lwp::{Lwp, LwpId, LwpState};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::trace;

struct CpuState {
    free: Vec<CpuId>,
    bound: Vec<Option<LwpId>>,
    running: usize,
}

/// vCPU pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuPoolStats {
    pub ncpu: usize,
    pub running: usize,
    pub peak_running: usize,
    pub schedules: u64,
    pub contended: u64,
}

/// Pool of virtual CPUs
///
/// # Performance
/// - Counters are relaxed atomics kept outside the state mutex
pub struct CpuPool {
    state: Mutex<CpuState>,
    freed: Condvar,
    ncpu: usize,
    schedules: AtomicU64,
    contended: AtomicU64,
    peak_running: AtomicUsize,
}

impl CpuPool {
    /// Create `ncpu` free slots; slots are never destroyed
    pub fn new(ncpu: usize) -> Self {
        let ncpu = ncpu.max(1);
        Self {
            state: Mutex::new(CpuState {
                // Popped from the back, so cpu0 is handed out first
                free: (0..ncpu as CpuId).rev().collect(),
                bound: vec![None; ncpu],
                running: 0,
            }),
            freed: Condvar::new(),
            ncpu,
            schedules: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            peak_running: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn ncpu(&self) -> usize {
        self.ncpu
    }

    /// Block until `lwp` owns a slot
    ///
    /// Returns the existing slot if `lwp` already has one.
    pub fn schedule(&self, lwp: &Lwp) -> CpuId {
        if let Some(cpu) = lwp.cpu() {
            return cpu;
        }

        let mut state = self.state.lock();
        if state.free.is_empty() && lwp.cpu().is_none() {
            self.contended.fetch_add(1, Ordering::Relaxed);
            while state.free.is_empty() && lwp.cpu().is_none() {
                self.freed.wait(&mut state);
            }
        }
        self.bind_locked(&mut state, lwp)
    }

    /// Take a slot only if one is free right now
    pub fn try_schedule(&self, lwp: &Lwp) -> Option<CpuId> {
        if let Some(cpu) = lwp.cpu() {
            return Some(cpu);
        }
        let mut state = self.state.lock();
        if state.free.is_empty() && lwp.cpu().is_none() {
            return None;
        }
        Some(self.bind_locked(&mut state, lwp))
    }

    /// Slots are only bound under the state lock, so this recheck is final
    /// and an LWP never ends up owning two slots.
    fn bind_locked(&self, state: &mut CpuState, lwp: &Lwp) -> CpuId {
        if let Some(cpu) = lwp.cpu() {
            return cpu;
        }
        let Some(cpu) = state.free.pop() else {
            unreachable!("caller checked the free list under the same lock");
        };
        state.bound[cpu as usize] = Some(lwp.id());
        state.running += 1;
        lwp.bind_cpu(cpu);

        self.schedules.fetch_add(1, Ordering::Relaxed);
        self.peak_running.fetch_max(state.running, Ordering::Relaxed);
        trace!(cpu, lwp = %lwp.id(), "scheduled");
        cpu
    }

    /// Return `lwp`'s slot to the free list and wake one waiter
    pub fn unschedule(&self, lwp: &Lwp) -> Option<CpuId> {
        let cpu = lwp.unbind_cpu()?;
        lwp.transition(LwpState::Blocked);

        let mut state = self.state.lock();
        state.bound[cpu as usize] = None;
        state.free.push(cpu);
        state.running -= 1;
        drop(state);

        self.freed.notify_one();
        trace!(cpu, lwp = %lwp.id(), "unscheduled");
        Some(cpu)
    }

    /// Hand `from`'s slot directly to `to` without freeing it
    ///
    /// Returns `None` when `from` holds no slot.
    pub fn rebind(&self, from: &Lwp, to: &Lwp) -> Option<CpuId> {
        let cpu = from.unbind_cpu()?;
        from.transition(LwpState::Blocked);

        let mut state = self.state.lock();
        state.bound[cpu as usize] = Some(to.id());
        to.bind_cpu(cpu);
        drop(state);
        trace!(cpu, from = %from.id(), to = %to.id(), "rebound");
        Some(cpu)
    }

    /// Give up the slot while the caller holds `interlock`
    ///
    /// The guard parameter only proves the interlock is held, so a wakeup
    /// sent under that lock cannot slip in between.
    pub fn unschedule_interlocked<T>(&self, lwp: &Lwp, _interlock: &MutexGuard<'_, T>) -> bool {
        self.unschedule(lwp).is_some()
    }

    /// Take a slot back, dropping `interlock` while waiting for one
    pub fn schedule_interlocked<T>(&self, lwp: &Lwp, interlock: &mut MutexGuard<'_, T>) -> CpuId {
        if let Some(cpu) = self.try_schedule(lwp) {
            return cpu;
        }
        MutexGuard::unlocked(interlock, || self.schedule(lwp))
    }

    /// Wait on `cv` with the slot released
    ///
    /// On return the interlock is held again and, if `lwp` owned a slot on
    /// entry, it owns one again.
    pub fn suspend<T>(&self, lwp: &Lwp, interlock: &mut MutexGuard<'_, T>, cv: &Condvar) {
        let had_cpu = self.unschedule_interlocked(lwp, interlock);
        cv.wait(interlock);
        if had_cpu {
            self.schedule_interlocked(lwp, interlock);
        }
    }

    /// `suspend` with a timeout; returns true if the wait timed out
    pub fn suspend_for<T>(
        &self,
        lwp: &Lwp,
        interlock: &mut MutexGuard<'_, T>,
        cv: &Condvar,
        timeout: Duration,
    ) -> bool {
        let had_cpu = self.unschedule_interlocked(lwp, interlock);
        let timed_out = cv.wait_for(interlock, timeout).timed_out();
        if had_cpu {
            self.schedule_interlocked(lwp, interlock);
        }
        timed_out
    }

    /// LWP bound to `cpu`
    pub fn bound(&self, cpu: CpuId) -> Option<LwpId> {
        self.state.lock().bound.get(cpu as usize).copied().flatten()
    }

    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    pub fn stats(&self) -> CpuPoolStats {
        CpuPoolStats {
            ncpu: self.ncpu,
            running: self.running(),
            peak_running: self.peak_running.load(Ordering::Relaxed),
            schedules: self.schedules.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lwp::{LwpFlags, Registry};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_schedule_binds_and_unschedule_frees() {
        let reg = Registry::new();
        let pool = CpuPool::new(2);
        let lwp = reg.new_lwp(None, LwpFlags::empty()).unwrap();

        let cpu = pool.schedule(&lwp);
        assert_eq!(cpu, 0);
        assert_eq!(pool.bound(cpu), Some(lwp.id()));
        assert_eq!(pool.schedule(&lwp), cpu);
        assert_eq!(pool.running(), 1);

        assert_eq!(pool.unschedule(&lwp), Some(cpu));
        assert_eq!(pool.unschedule(&lwp), None);
        assert_eq!(pool.bound(cpu), None);
        assert_eq!(lwp.state(), LwpState::Blocked);
    }

    #[test]
    fn test_try_schedule_when_full() {
        let reg = Registry::new();
        let pool = CpuPool::new(1);
        let a = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        let b = reg.new_lwp(None, LwpFlags::empty()).unwrap();

        pool.schedule(&a);
        assert_eq!(pool.try_schedule(&b), None);
        pool.unschedule(&a);
        assert_eq!(pool.try_schedule(&b), Some(0));
    }

    #[test]
    fn test_rebind_keeps_slot_busy() {
        let reg = Registry::new();
        let pool = CpuPool::new(1);
        let a = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        let b = reg.new_lwp(None, LwpFlags::empty()).unwrap();

        let cpu = pool.schedule(&a);
        assert_eq!(pool.rebind(&a, &b), Some(cpu));
        assert!(!a.is_running());
        assert_eq!(b.cpu(), Some(cpu));
        assert_eq!(pool.bound(cpu), Some(b.id()));
        assert_eq!(pool.running(), 1);
    }

    #[test]
    fn test_concurrent_schedule_of_one_lwp_takes_one_slot() {
        let reg = Registry::new();
        let pool = Arc::new(CpuPool::new(2));

        for _ in 0..50 {
            let lwp = reg.new_lwp(None, LwpFlags::empty()).unwrap();
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let racers: Vec<_> = (0..2)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    let lwp = Arc::clone(&lwp);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        pool.schedule(&lwp)
                    })
                })
                .collect();
            let cpus: Vec<_> = racers.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(cpus[0], cpus[1]);
            assert_eq!(pool.running(), 1);
            pool.unschedule(&lwp);
            assert_eq!(pool.running(), 0);
        }
    }

    #[test]
    fn test_suspend_releases_slot_while_waiting() {
        let reg = Registry::new();
        let pool = Arc::new(CpuPool::new(1));
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let a = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        let b = reg.new_lwp(None, LwpFlags::empty()).unwrap();

        pool.schedule(&a);
        let waiter = {
            let pool = Arc::clone(&pool);
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                let (lock, cv) = &*pair;
                let mut ready = lock.lock();
                while !*ready {
                    pool.suspend(&a, &mut ready, cv);
                }
                assert!(a.is_running());
                pool.unschedule(&a);
            })
        };

        // Only reachable if the waiter gave up the single slot
        pool.schedule(&b);
        *pair.0.lock() = true;
        pair.1.notify_all();
        pool.unschedule(&b);

        waiter.join().unwrap();
        assert_eq!(pool.running(), 0);
    }
}
