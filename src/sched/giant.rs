/*!
 * Giant Lock
 *
 * One recursive lock serializing kernel-context execution.
 *
 * # Design
 *
 * Ownership lives under a small mutex; the recursion depth is an atomic that
 * only the owning thread writes, so depth queries never touch the mutex.
 *
 * Contention goes through a caller-supplied blocking function. The runtime
 * passes one that gives up the caller's vCPU before waiting, which keeps a
 * vCPU holder from blocking forever behind an owner that cannot get a vCPU.
 *
 * `lend` hides the depth (reads as zero) while keeping ownership, so the lock
 * can serve as the interlock of a generic sleep. The sleeper then yields
 * ownership once it is queued and reclaims it on wake before `relend`.
 */

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tracing::trace;

pub(crate) struct GiantState {
    owner: Option<ThreadId>,
}

/// How much of the caller's depth `release` drops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Every level
    All,
    /// The single remaining level; the depth must be exactly one
    ExactlyOne,
    /// `n` levels, clamped to the current depth
    Count(u32),
}

/// Depth saved by `lend`, restored by `relend`
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a lent lock must be restored with relend"]
pub struct Lent {
    saved: u32,
}

impl Lent {
    #[inline]
    pub fn depth(&self) -> u32 {
        self.saved
    }
}

/// Giant lock statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiantStats {
    pub acquisitions: u64,
    pub contended: u64,
    pub depth: u32,
    pub held: bool,
}

/// Recursive single-owner kernel lock
pub struct GiantLock {
    state: Mutex<GiantState>,
    released: Condvar,
    count: AtomicU32,
    acquisitions: AtomicU64,
    contended: AtomicU64,
}

impl GiantLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GiantState { owner: None }),
            released: Condvar::new(),
            count: AtomicU32::new(0),
            acquisitions: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        }
    }

    /// Take the lock `n` times, blocking the host thread on contention
    pub fn acquire(&self, n: u32) {
        self.acquire_with(n, |state, cv| cv.wait(state));
    }

    /// Take the lock `n` times, calling `block` to wait on contention
    ///
    /// `block` must wait on the condvar with the given guard and return with
    /// the guard held again.
    pub(crate) fn acquire_with<F>(&self, n: u32, mut block: F)
    where
        F: FnMut(&mut MutexGuard<'_, GiantState>, &Condvar),
    {
        if n == 0 {
            return;
        }
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner == Some(me) {
            self.count.fetch_add(n, Ordering::Relaxed);
            return;
        }

        if state.owner.is_some() {
            self.contended.fetch_add(1, Ordering::Relaxed);
            while state.owner.is_some() {
                block(&mut state, &self.released);
            }
        }

        state.owner = Some(me);
        self.count.store(n, Ordering::Relaxed);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        trace!(depth = n, "giant lock acquired");
    }

    /// Take the lock once if it is free or already ours
    pub fn try_acquire(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner == me => {
                self.count.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(_) => false,
            None => {
                state.owner = Some(me);
                self.count.store(1, Ordering::Relaxed);
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Drop levels of the caller's depth
    ///
    /// Returns the depth before the call, for later restoration with
    /// `acquire`. A thread that does not own the lock gets 0 and changes
    /// nothing.
    pub fn release(&self, how: Release) -> u32 {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return 0;
        }

        let depth = self.count.load(Ordering::Relaxed);
        let drop_levels = match how {
            Release::All => depth,
            Release::ExactlyOne => {
                debug_assert_eq!(depth, 1, "giant lock released exactly once at depth {depth}");
                depth.min(1)
            }
            Release::Count(n) => n.min(depth),
        };

        let remaining = depth - drop_levels;
        self.count.store(remaining, Ordering::Relaxed);
        if remaining == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
            trace!("giant lock released");
        }
        depth
    }

    /// Hide the caller's depth while keeping ownership
    ///
    /// Returns `None` if the caller does not own the lock.
    pub fn lend(&self) -> Option<Lent> {
        if !self.owned_by_current() {
            return None;
        }
        let saved = self.count.swap(0, Ordering::Relaxed);
        if saved == 0 {
            return None;
        }
        Some(Lent { saved })
    }

    /// Restore the depth captured by `lend`
    pub fn relend(&self, lent: Lent) {
        debug_assert!(self.owned_by_current(), "relend by a non-owner");
        self.count.store(lent.saved, Ordering::Relaxed);
    }

    /// Give up ownership of a lent lock
    pub(crate) fn yield_lent(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) && self.count.load(Ordering::Relaxed) == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
    }

    /// Take back ownership after `yield_lent`, leaving the depth hidden
    pub(crate) fn reclaim_lent<F>(&self, mut block: F)
    where
        F: FnMut(&mut MutexGuard<'_, GiantState>, &Condvar),
    {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.owner.is_some_and(|owner| owner != me) {
            block(&mut state, &self.released);
        }
        state.owner = Some(me);
    }

    /// Visible depth: zero when unlocked or lent
    #[inline]
    pub fn depth(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn owned_by_current(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Depth held by the calling thread (zero if another thread owns it)
    pub fn held_depth(&self) -> u32 {
        if self.owned_by_current() {
            self.depth()
        } else {
            0
        }
    }

    pub fn stats(&self) -> GiantStats {
        let held = self.state.lock().owner.is_some();
        GiantStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            depth: self.depth(),
            held,
        }
    }
}

impl Default for GiantLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recursive_depth() {
        let giant = GiantLock::new();
        giant.acquire(2);
        giant.acquire(1);
        assert_eq!(giant.held_depth(), 3);

        assert_eq!(giant.release(Release::Count(1)), 3);
        assert_eq!(giant.release(Release::All), 2);
        assert_eq!(giant.held_depth(), 0);
        assert!(!giant.owned_by_current());
    }

    #[test]
    fn test_release_by_non_owner_is_noop() {
        let giant = Arc::new(GiantLock::new());
        giant.acquire(1);

        let other = Arc::clone(&giant);
        let prior = thread::spawn(move || other.release(Release::All))
            .join()
            .unwrap();
        assert_eq!(prior, 0);
        assert_eq!(giant.held_depth(), 1);
        giant.release(Release::ExactlyOne);
    }

    #[test]
    fn test_lend_relend() {
        let giant = GiantLock::new();
        assert!(giant.lend().is_none());

        giant.acquire(4);
        let lent = giant.lend().unwrap();
        assert_eq!(lent.depth(), 4);
        assert_eq!(giant.depth(), 0);
        assert!(giant.owned_by_current());

        giant.relend(lent);
        assert_eq!(giant.held_depth(), 4);
        giant.release(Release::All);
    }

    #[test]
    fn test_try_acquire_contended() {
        let giant = Arc::new(GiantLock::new());
        giant.acquire(1);

        let other = Arc::clone(&giant);
        assert!(!thread::spawn(move || other.try_acquire()).join().unwrap());
        assert!(giant.try_acquire());
        assert_eq!(giant.release(Release::All), 2);
    }

    #[test]
    fn test_yield_and_reclaim_lent() {
        let giant = Arc::new(GiantLock::new());
        giant.acquire(2);
        let lent = giant.lend().unwrap();
        giant.yield_lent();
        assert!(!giant.owned_by_current());

        let other = Arc::clone(&giant);
        thread::spawn(move || {
            other.acquire(1);
            other.release(Release::All);
        })
        .join()
        .unwrap();

        giant.reclaim_lent(|state, cv| cv.wait(state));
        giant.relend(lent);
        assert_eq!(giant.held_depth(), 2);
        assert_eq!(giant.stats().acquisitions, 2);
        giant.release(Release::All);
    }
}
