/*!
 * LWP Types
 * Lightweight process identity, flags, and state machine
 */

use super::arena::Handle;
use crate::core::limits::NO_CPU;
use crate::core::types::{CpuId, Pid, Signal, WaitChannel};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// LWP identifier: a generation-tagged registry handle
pub type LwpId = Handle;

bitflags! {
    /// Per-LWP flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LwpFlags: u32 {
        /// Quit requested by `lwpexit_all`; observed at the next sleep
        const QUIT = 1 << 0;
        /// Concurrency-safe: kernel entry does not take the giant lock
        const MPSAFE = 1 << 1;
        /// Created on demand for a thread without identity; released at unschedule
        const IMPLICIT = 1 << 2;
        /// Stop being the thread's identity at the next unschedule
        const CLEAR = 1 << 3;
        /// Signals are pending for this LWP or its process
        const PENDSIG = 1 << 4;
    }
}

/// LWP lifecycle state
///
/// Created -> Running <-> Blocked -> ... -> Zombie. Zombie is irreversible;
/// the LWP is freed once it is off its vCPU and unreferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LwpState {
    Created = 0,
    Running = 1,
    Blocked = 2,
    Zombie = 3,
}

impl LwpState {
    #[inline]
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Blocked,
            _ => Self::Zombie,
        }
    }
}

const NO_WCHAN: u64 = u64::MAX;

/// Lightweight process: the unit of kernel execution identity
///
/// Owned by the registry and by exactly one process. A vCPU only records a
/// transient binding to it.
///
/// # Performance
/// - Cache-line aligned; every field is an atomic so the owning thread never
///   takes the registry lock on the scheduling hot path
#[repr(C, align(64))]
pub struct Lwp {
    id: LwpId,
    pid: Pid,
    refs: AtomicU32,
    state: AtomicU8,
    cpu: AtomicU32,
    flags: AtomicU32,
    wchan: AtomicU64,
    sigpend: AtomicU64,
    /// Set while some host thread carries this LWP as its identity
    onthread: AtomicBool,
}

impl Lwp {
    /// New LWP holding a single reference owned by its creator
    pub(crate) fn new(id: LwpId, pid: Pid, flags: LwpFlags) -> Self {
        Self {
            id,
            pid,
            refs: AtomicU32::new(1),
            state: AtomicU8::new(LwpState::Created as u8),
            cpu: AtomicU32::new(NO_CPU),
            flags: AtomicU32::new(flags.bits()),
            wchan: AtomicU64::new(NO_WCHAN),
            sigpend: AtomicU64::new(0),
            onthread: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> LwpId {
        self.id
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn state(&self) -> LwpState {
        LwpState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Move to `to` unless already a zombie
    pub(crate) fn transition(&self, to: LwpState) -> LwpState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == LwpState::Zombie as u8 {
                return LwpState::Zombie;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return to,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn is_zombie(&self) -> bool {
        self.state() == LwpState::Zombie
    }

    /// Bound vCPU, if any
    #[inline]
    pub fn cpu(&self) -> Option<CpuId> {
        match self.cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            id => Some(id),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.cpu().is_some()
    }

    pub(crate) fn bind_cpu(&self, id: CpuId) {
        self.cpu.store(id, Ordering::Release);
        self.transition(LwpState::Running);
    }

    pub(crate) fn unbind_cpu(&self) -> Option<CpuId> {
        match self.cpu.swap(NO_CPU, Ordering::AcqRel) {
            NO_CPU => None,
            id => Some(id),
        }
    }

    /// Whether a host thread currently carries this LWP as its identity
    #[inline]
    pub fn is_current(&self) -> bool {
        self.onthread.load(Ordering::Acquire)
    }

    /// Claim the LWP for one host thread; fails if another thread has it
    pub(crate) fn claim_thread(&self) -> bool {
        self.onthread
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_thread(&self) {
        self.onthread.store(false, Ordering::Release);
    }

    #[inline]
    pub fn flags(&self) -> LwpFlags {
        LwpFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_flags(&self, flags: LwpFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub fn clear_flags(&self, flags: LwpFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub fn quit_requested(&self) -> bool {
        self.flags().contains(LwpFlags::QUIT)
    }

    #[inline]
    pub fn is_mpsafe(&self) -> bool {
        self.flags().contains(LwpFlags::MPSAFE)
    }

    #[inline]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Take an additional reference
    #[inline]
    pub fn hold(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference; saturates at zero instead of wrapping
    pub(crate) fn unhold(&self) -> u32 {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                debug_assert!(false, "LWP {} reference count underflow", self.id);
                return 0;
            }
            match self.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Wait channel the LWP is sleeping on
    #[inline]
    pub fn wchan(&self) -> Option<WaitChannel> {
        match self.wchan.load(Ordering::Acquire) {
            NO_WCHAN => None,
            chan => Some(WaitChannel(chan)),
        }
    }

    pub(crate) fn set_wchan(&self, chan: Option<WaitChannel>) {
        let raw = chan.map(|c| c.0).unwrap_or(NO_WCHAN);
        self.wchan.store(raw, Ordering::Release);
    }

    /// Pending signal mask (bit `n` = signal `n`)
    #[inline]
    pub fn pending_signals(&self) -> u64 {
        self.sigpend.load(Ordering::Acquire)
    }

    pub(crate) fn post_signal(&self, sig: Signal) {
        self.sigpend.fetch_or(signal_bit(sig), Ordering::AcqRel);
        self.set_flags(LwpFlags::PENDSIG);
    }

    pub(crate) fn take_signals(&self) -> u64 {
        let pending = self.sigpend.swap(0, Ordering::AcqRel);
        self.clear_flags(LwpFlags::PENDSIG);
        pending
    }
}

/// Signal number to mask bit; out-of-range numbers map to no bit
#[inline]
pub(crate) fn signal_bit(sig: Signal) -> u64 {
    1u64.checked_shl(sig).unwrap_or(0)
}

impl fmt::Debug for Lwp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lwp")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("cpu", &self.cpu())
            .field("refs", &self.refs())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Serializable LWP snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwpInfo {
    pub id: LwpId,
    pub pid: Pid,
    pub state: LwpState,
    pub cpu: Option<CpuId>,
    pub refs: u32,
}

impl From<&Lwp> for LwpInfo {
    fn from(lwp: &Lwp) -> Self {
        Self {
            id: lwp.id(),
            pid: lwp.pid(),
            state: lwp.state(),
            cpu: lwp.cpu(),
            refs: lwp.refs(),
        }
    }
}
