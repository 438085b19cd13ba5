/*!
 * LWP & Process Registry
 *
 * Global process and LWP lists behind one short-critical-section mutex.
 *
 * # Lifetimes
 *
 * - An LWP is freed only when it is a zombie, unreferenced, and off its vCPU.
 *   `release` frees immediately when those already hold; otherwise the free
 *   happens at the next `reap` (called after unschedule or switch).
 * - A process is marked dead when it no longer has a live LWP (or on explicit
 *   exit) and is freed when its LWP set becomes empty. proc0 is never freed.
 */

use super::arena::Arena;
use super::files::DescriptorTable;
use super::process::{Credentials, ForkMode, Process, ProcessContext, ProcessInfo, ResourceLimits};
use super::types::{signal_bit, Lwp, LwpFlags, LwpId, LwpInfo, LwpState};
use super::vmspace::VmSpace;
use crate::core::errors::LwpError;
use crate::core::id::{IdGenerator, PidGenerator};
use crate::core::limits::{FIRST_USER_PID, PROC0_PID};
use crate::core::types::{Pid, Signal};
use ahash::RandomState;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

struct RegistryInner {
    lwps: Arena<Arc<Lwp>>,
    procs: HashMap<Pid, Process, RandomState>,
}

/// Process and LWP registry
pub struct Registry {
    inner: Mutex<RegistryInner>,
    lwp_freed: Condvar,
    pids: PidGenerator,
}

impl Registry {
    /// Create a registry holding only proc0
    pub fn new() -> Self {
        let limits = ResourceLimits::default();
        let proc0 = Process {
            pid: PROC0_PID,
            ppid: PROC0_PID,
            lwps: HashSet::default(),
            fds: Arc::new(DescriptorTable::new(limits.max_descriptors)),
            vmspace: VmSpace::local(),
            cred: Arc::new(Credentials::root()),
            limits: Arc::new(limits),
            sigpend: 0,
            dead: false,
        };

        let mut procs = HashMap::default();
        procs.insert(PROC0_PID, proc0);

        Self {
            inner: Mutex::new(RegistryInner {
                lwps: Arena::new(),
                procs,
            }),
            lwp_freed: Condvar::new(),
            pids: PidGenerator::new(FIRST_USER_PID),
        }
    }

    /// Create a process derived from `parent`
    ///
    /// `vmspace` of `None` shares the parent's address space.
    pub fn new_process(
        &self,
        parent: Pid,
        mode: ForkMode,
        vmspace: Option<VmSpace>,
    ) -> Result<Pid, LwpError> {
        let mut inner = self.inner.lock();
        let parent_proc = inner
            .procs
            .get(&parent)
            .ok_or(LwpError::NoSuchProcess(parent))?;

        let pid = self.pids.next();
        let process = Process::fork(pid, parent_proc, mode, vmspace);
        inner.procs.insert(pid, process);
        debug!(pid, ppid = parent, ?mode, "process created");
        Ok(pid)
    }

    /// Create an LWP in `pid`, or in a new child of proc0 when `pid` is `None`
    ///
    /// The LWP starts with one reference owned by the caller and no vCPU.
    pub fn new_lwp(&self, pid: Option<Pid>, flags: LwpFlags) -> Result<Arc<Lwp>, LwpError> {
        let pid = match pid {
            Some(pid) => pid,
            None => self.new_process(PROC0_PID, ForkMode::CleanFds, None)?,
        };

        let mut inner = self.inner.lock();
        match inner.procs.get(&pid) {
            None => return Err(LwpError::NoSuchProcess(pid)),
            Some(p) if p.dead => return Err(LwpError::ProcessExiting(pid)),
            Some(_) => {}
        }
        Ok(Self::attach_lwp(&mut inner, pid, flags))
    }

    /// LWP in proc0, which always exists
    pub(crate) fn new_kernel_lwp(&self, flags: LwpFlags) -> Arc<Lwp> {
        let mut inner = self.inner.lock();
        Self::attach_lwp(&mut inner, PROC0_PID, flags)
    }

    fn attach_lwp(inner: &mut RegistryInner, pid: Pid, flags: LwpFlags) -> Arc<Lwp> {
        let mut created = None;
        let id = inner.lwps.insert_with(|id| {
            let lwp = Arc::new(Lwp::new(id, pid, flags));
            created = Some(Arc::clone(&lwp));
            lwp
        });
        if let Some(p) = inner.procs.get_mut(&pid) {
            p.lwps.insert(id);
        }
        trace!(lwp = %id, pid, "lwp created");
        match created {
            Some(lwp) => lwp,
            None => unreachable!("arena insert always runs its constructor"),
        }
    }

    pub fn lookup(&self, id: LwpId) -> Option<Arc<Lwp>> {
        self.inner.lock().lwps.get(id).cloned()
    }

    /// Take an extra reference on `lwp`
    pub fn hold(&self, lwp: &Lwp) {
        lwp.hold();
    }

    /// Drop an extra reference, freeing the LWP if it was the last one
    pub fn unhold(&self, lwp: &Arc<Lwp>) -> bool {
        lwp.unhold();
        self.reap(lwp)
    }

    /// Drop the owner's reference and mark the LWP exiting
    ///
    /// Returns true if the LWP was freed right away (it held no vCPU and no
    /// other references); otherwise the free is deferred to `reap`.
    pub fn release(&self, lwp: &Arc<Lwp>) -> bool {
        lwp.unhold();
        lwp.transition(LwpState::Zombie);

        let mut inner = self.inner.lock();
        let pid = lwp.pid();
        if pid != PROC0_PID {
            let live = inner.procs.get(&pid).map(|p| {
                p.lwps
                    .iter()
                    .filter_map(|id| inner.lwps.get(*id))
                    .any(|l| !l.is_zombie())
            });
            if live == Some(false) {
                if let Some(p) = inner.procs.get_mut(&pid) {
                    p.dead = true;
                }
            }
        }
        self.reap_locked(&mut inner, lwp)
    }

    /// Free `lwp` if it is an unreferenced zombie off its vCPU
    pub fn reap(&self, lwp: &Arc<Lwp>) -> bool {
        let mut inner = self.inner.lock();
        self.reap_locked(&mut inner, lwp)
    }

    fn reap_locked(&self, inner: &mut RegistryInner, lwp: &Lwp) -> bool {
        if !lwp.is_zombie() || lwp.refs() != 0 || lwp.is_running() {
            return false;
        }
        let id = lwp.id();
        if inner.lwps.remove(id).is_none() {
            return false;
        }

        let pid = lwp.pid();
        let mut proc_freed = false;
        if let Some(p) = inner.procs.get_mut(&pid) {
            p.lwps.remove(&id);
            proc_freed = p.lwps.is_empty() && p.dead;
        }
        if proc_freed {
            inner.procs.remove(&pid);
            debug!(pid, "process freed");
        }
        trace!(lwp = %id, pid, "lwp freed");
        self.lwp_freed.notify_all();
        true
    }

    /// Mark a process dead; it is freed once its last LWP is
    pub fn exit_process(&self, pid: Pid) -> Result<(), LwpError> {
        if pid == PROC0_PID {
            return Err(LwpError::Proc0Exit);
        }
        let mut inner = self.inner.lock();
        let p = inner
            .procs
            .get_mut(&pid)
            .ok_or(LwpError::NoSuchProcess(pid))?;
        p.dead = true;
        if p.lwps.is_empty() {
            inner.procs.remove(&pid);
            debug!(pid, "process freed");
            self.lwp_freed.notify_all();
        }
        Ok(())
    }

    /// Block until `pid` has at most `remaining` LWPs or is gone
    ///
    /// The caller must hold no vCPU or giant lock.
    pub(crate) fn wait_for_lwps(&self, pid: Pid, remaining: usize) {
        let mut inner = self.inner.lock();
        while let Some(p) = inner.procs.get(&pid) {
            if p.lwps.len() <= remaining {
                break;
            }
            self.lwp_freed.wait(&mut inner);
        }
    }

    pub fn context(&self, pid: Pid) -> Option<ProcessContext> {
        self.inner.lock().procs.get(&pid).map(Process::context)
    }

    pub fn process_info(&self, pid: Pid) -> Option<ProcessInfo> {
        self.inner.lock().procs.get(&pid).map(ProcessInfo::from)
    }

    pub fn contains_process(&self, pid: Pid) -> bool {
        self.inner.lock().procs.contains_key(&pid)
    }

    pub fn process_lwps(&self, pid: Pid) -> Result<Vec<Arc<Lwp>>, LwpError> {
        let inner = self.inner.lock();
        let p = inner.procs.get(&pid).ok_or(LwpError::NoSuchProcess(pid))?;
        Ok(p.lwps
            .iter()
            .filter_map(|id| inner.lwps.get(*id).cloned())
            .collect())
    }

    pub fn lwp_count(&self, pid: Pid) -> Option<usize> {
        self.inner.lock().procs.get(&pid).map(|p| p.lwps.len())
    }

    pub fn list_lwps(&self) -> Vec<LwpInfo> {
        self.inner
            .lock()
            .lwps
            .iter()
            .map(|(_, l)| LwpInfo::from(l.as_ref()))
            .collect()
    }

    pub fn nprocs(&self) -> usize {
        self.inner.lock().procs.len()
    }

    pub fn nlwps(&self) -> usize {
        self.inner.lock().lwps.len()
    }

    pub fn set_credentials(&self, pid: Pid, cred: Credentials) -> Result<(), LwpError> {
        let mut inner = self.inner.lock();
        let p = inner
            .procs
            .get_mut(&pid)
            .ok_or(LwpError::NoSuchProcess(pid))?;
        p.cred = Arc::new(cred);
        Ok(())
    }

    /// Post a signal to the process-wide pending set
    pub fn signal_process(&self, pid: Pid, sig: Signal) -> Result<(), LwpError> {
        let mut inner = self.inner.lock();
        let p = inner
            .procs
            .get_mut(&pid)
            .ok_or(LwpError::NoSuchProcess(pid))?;
        p.sigpend |= signal_bit(sig);
        Ok(())
    }

    pub fn process_signals(&self, pid: Pid) -> u64 {
        self.inner
            .lock()
            .procs
            .get(&pid)
            .map(|p| p.sigpend)
            .unwrap_or(0)
    }

    /// Move an exiting LWP's undelivered signals to its process
    pub(crate) fn transfer_signals(&self, lwp: &Lwp) {
        let pending = lwp.take_signals();
        if pending == 0 {
            return;
        }
        if let Some(p) = self.inner.lock().procs.get_mut(&lwp.pid()) {
            p.sigpend |= pending;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proc0_exists() {
        let reg = Registry::new();
        assert!(reg.contains_process(PROC0_PID));
        assert_eq!(reg.nprocs(), 1);
        assert!(reg.exit_process(PROC0_PID).is_err());
    }

    #[test]
    fn test_new_lwp_without_process_creates_one() {
        let reg = Registry::new();
        let lwp = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        assert_ne!(lwp.pid(), PROC0_PID);
        assert_eq!(reg.lwp_count(lwp.pid()), Some(1));
        assert_eq!(reg.process_info(lwp.pid()).unwrap().ppid, PROC0_PID);
    }

    #[test]
    fn test_release_unscheduled_lwp_frees_process() {
        let reg = Registry::new();
        let lwp = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        let pid = lwp.pid();

        assert!(reg.release(&lwp));
        assert!(reg.lookup(lwp.id()).is_none());
        assert!(!reg.contains_process(pid));
    }

    #[test]
    fn test_release_running_lwp_defers_free() {
        let reg = Registry::new();
        let lwp = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        lwp.bind_cpu(0);

        assert!(!reg.release(&lwp));
        assert!(lwp.is_zombie());
        assert!(reg.lookup(lwp.id()).is_some());

        lwp.unbind_cpu();
        assert!(reg.reap(&lwp));
        assert!(reg.lookup(lwp.id()).is_none());
    }

    #[test]
    fn test_held_lwp_outlives_release() {
        let reg = Registry::new();
        let lwp = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        reg.hold(&lwp);

        assert!(!reg.release(&lwp));
        assert!(reg.unhold(&lwp));
    }

    #[test]
    fn test_process_survives_while_any_lwp_lives() {
        let reg = Registry::new();
        let a = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        let pid = a.pid();
        let b = reg.new_lwp(Some(pid), LwpFlags::empty()).unwrap();

        reg.release(&a);
        assert!(reg.contains_process(pid));
        assert!(!reg.process_info(pid).unwrap().dead);

        reg.release(&b);
        assert!(!reg.contains_process(pid));
    }

    #[test]
    fn test_dead_process_refuses_lwps() {
        let reg = Registry::new();
        let pid = reg
            .new_process(PROC0_PID, ForkMode::CleanFds, None)
            .unwrap();
        let lwp = reg.new_lwp(Some(pid), LwpFlags::empty()).unwrap();
        reg.hold(&lwp);
        reg.release(&lwp);

        assert_eq!(
            reg.new_lwp(Some(pid), LwpFlags::empty()).unwrap_err(),
            LwpError::ProcessExiting(pid)
        );
        reg.unhold(&lwp);
        assert!(!reg.contains_process(pid));
    }

    #[test]
    fn test_fork_modes() {
        use crate::lwp::files::MemFile;

        let reg = Registry::new();
        let parent = reg.new_process(PROC0_PID, ForkMode::CleanFds, None).unwrap();
        let ctx = reg.context(parent).unwrap();
        ctx.fds.install(Arc::new(MemFile::new())).unwrap();

        let shared = reg.new_process(parent, ForkMode::ShareFds, None).unwrap();
        let copied = reg.new_process(parent, ForkMode::CopyFds, None).unwrap();
        let clean = reg.new_process(parent, ForkMode::CleanFds, None).unwrap();

        assert!(Arc::ptr_eq(&reg.context(shared).unwrap().fds, &ctx.fds));
        let copy_fds = reg.context(copied).unwrap().fds;
        assert!(!Arc::ptr_eq(&copy_fds, &ctx.fds));
        assert_eq!(copy_fds.len(), 1);
        assert!(reg.context(clean).unwrap().fds.is_empty());

        // Address space and credentials are inherited
        assert_eq!(
            reg.context(clean).unwrap().vmspace.id(),
            ctx.vmspace.id()
        );
        assert!(Arc::ptr_eq(&reg.context(clean).unwrap().cred, &ctx.cred));
    }

    #[test]
    fn test_signal_transfer() {
        let reg = Registry::new();
        let lwp = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        lwp.post_signal(9);

        reg.transfer_signals(&lwp);
        assert_eq!(lwp.pending_signals(), 0);
        assert_eq!(reg.process_signals(lwp.pid()), 1 << 9);
    }
}
