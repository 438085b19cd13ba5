/*!
 * Runtime
 *
 * Ties the vCPU pool, giant lock, sleep queue, registry, and worker pool
 * into one instance and gives each host thread its kernel identity.
 *
 * # Instances
 *
 * `Runtime::new` builds an isolated instance; `Runtime::init_global` and
 * `Runtime::global` manage a process-wide one that is created once and
 * never torn down. A `Runtime` is a cheap handle and clones share state.
 *
 * # Kernel context
 *
 * Kernel context is a vCPU plus the giant lock (the lock is skipped for
 * MPSAFE LWPs). Every wait a kernel-context thread performs drops the vCPU
 * first, through `CpuPool::suspend` or `Runtime::unscheduled`.
 */

mod context;
mod guard;

pub use guard::KernelGuard;

use crate::core::config::RuntimeConfig;
use crate::core::errors::{LwpError, RuntimeError, RuntimeResult, WorkerError};
use crate::core::limits::PROC0_PID;
use crate::core::types::{Pid, RemoteAddr, Signal, WaitChannel};
use crate::lwp::{ForkMode, Lwp, LwpFlags, ProcessContext, Registry, VmSpace};
use crate::sched::{CpuPool, CpuPoolStats, GiantLock, GiantStats, Release, SleepQueue, SleepResult};
use crate::workers::{WorkerPool, WorkerStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{self, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_RUNTIME: AtomicU64 = AtomicU64::new(1);
static GLOBAL: OnceLock<Runtime> = OnceLock::new();

struct RuntimeInner {
    id: u64,
    config: RuntimeConfig,
    cpus: CpuPool,
    giant: GiantLock,
    sleepq: SleepQueue,
    registry: Registry,
    workers: WorkerPool,
    /// Reserved identity used only to bootstrap implicit LWPs
    lwp0: Arc<Lwp>,
    lwp0_lock: Mutex<()>,
}

/// Handle to a runtime instance
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Non-owning runtime handle, for objects the runtime itself owns
#[derive(Clone)]
pub struct WeakRuntime {
    inner: Weak<RuntimeInner>,
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

/// Runtime-wide statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub cpus: CpuPoolStats,
    pub giant: GiantStats,
    pub workers: WorkerStats,
    pub processes: usize,
    pub lwps: usize,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let registry = Registry::new();
        let lwp0 = registry.new_kernel_lwp(LwpFlags::empty());
        let workers = WorkerPool::new(
            config.max_idle_workers,
            config.worker_soft_cap,
            format!("{}-worker", config.thread_name),
        );

        let inner = RuntimeInner {
            id: NEXT_RUNTIME.fetch_add(1, Ordering::Relaxed),
            cpus: CpuPool::new(config.ncpu),
            giant: GiantLock::new(),
            sleepq: SleepQueue::new(),
            registry,
            workers,
            lwp0,
            lwp0_lock: Mutex::new(()),
            config,
        };
        info!(
            runtime = inner.id,
            ncpu = inner.cpus.ncpu(),
            "runtime initialized"
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Initialize the process-wide runtime
    ///
    /// Only the first call's configuration takes effect.
    pub fn init_global(config: RuntimeConfig) -> &'static Runtime {
        let mut created = false;
        let runtime = GLOBAL.get_or_init(|| {
            created = true;
            Runtime::new(config)
        });
        if !created {
            warn!("global runtime already initialized; configuration ignored");
        }
        runtime
    }

    /// Process-wide runtime, initialized from the environment on first use
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(|| Runtime::new(RuntimeConfig::from_env()))
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[inline]
    pub fn cpus(&self) -> &CpuPool {
        &self.inner.cpus
    }

    #[inline]
    pub fn giant(&self) -> &GiantLock {
        &self.inner.giant
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    #[inline]
    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            cpus: self.inner.cpus.stats(),
            giant: self.inner.giant.stats(),
            workers: self.inner.workers.stats(),
            processes: self.inner.registry.nprocs(),
            lwps: self.inner.registry.nlwps(),
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// This thread's current LWP in this runtime
    pub fn current_lwp(&self) -> Option<Arc<Lwp>> {
        context::get(self.inner.id)
    }

    /// Current LWP, which must hold a vCPU
    pub fn curlwp(&self) -> Result<Arc<Lwp>, LwpError> {
        self.current_lwp()
            .filter(|lwp| lwp.is_running())
            .ok_or(LwpError::NotScheduled)
    }

    fn set_current(&self, lwp: Option<Arc<Lwp>>) -> Option<Arc<Lwp>> {
        context::replace(self.inner.id, lwp)
    }

    /// Stop `lwp` being this thread's identity and drop its thread claim
    fn clear_current(&self, lwp: &Lwp) {
        self.set_current(None);
        lwp.release_thread();
    }

    /// Obtain a vCPU for the calling thread
    ///
    /// A thread without an identity gets an implicit LWP in proc0, which is
    /// released again at its `unschedule`.
    pub fn schedule(&self) -> Arc<Lwp> {
        if let Some(lwp) = self.current_lwp() {
            self.inner.cpus.schedule(&lwp);
            return lwp;
        }

        // lwp0 holds the vCPU only until the real LWP exists
        let lwp = {
            let _lwp0 = self.inner.lwp0_lock.lock();
            let lwp0 = &self.inner.lwp0;
            self.inner.cpus.schedule(lwp0);
            let lwp = self.inner.registry.new_kernel_lwp(LwpFlags::IMPLICIT);
            lwp.claim_thread();
            self.inner.cpus.rebind(lwp0, &lwp);
            lwp
        };
        self.set_current(Some(Arc::clone(&lwp)));
        lwp
    }

    /// Give up the calling thread's vCPU
    ///
    /// This is where exited LWPs are freed: an implicit LWP is released here,
    /// and a zombie with no references left is reaped and stops being the
    /// thread's identity.
    pub fn unschedule(&self) {
        let Some(lwp) = self.current_lwp() else {
            return;
        };

        let flags = lwp.flags();
        if flags.contains(LwpFlags::IMPLICIT) && !lwp.is_zombie() {
            self.inner.registry.release(&lwp);
        }
        self.inner.cpus.unschedule(&lwp);

        if lwp.is_zombie() || flags.contains(LwpFlags::CLEAR) {
            lwp.clear_flags(LwpFlags::CLEAR);
            self.clear_current(&lwp);
        }
        self.inner.registry.reap(&lwp);
    }

    /// Enter kernel context: schedule, then take the giant lock
    ///
    /// MPSAFE LWPs skip the lock. Nested entries only add lock depth.
    pub fn enter(&self) -> KernelGuard {
        let scheduled = !self.current_lwp().is_some_and(|lwp| lwp.is_running());
        let lwp = self.schedule();
        let locked = !lwp.is_mpsafe();
        if locked {
            self.kernel_lock(1);
        }
        KernelGuard::new(self.clone(), lwp, locked, scheduled)
    }

    // =========================================================================
    // Giant lock
    // =========================================================================

    /// Take the giant lock `n` times
    ///
    /// A scheduled caller gives up its vCPU while the lock is contended.
    pub fn kernel_lock(&self, n: u32) {
        let cpus = &self.inner.cpus;
        match self.current_lwp().filter(|lwp| lwp.is_running()) {
            Some(lwp) => self
                .inner
                .giant
                .acquire_with(n, |state, cv| cpus.suspend(&lwp, state, cv)),
            None => self.inner.giant.acquire(n),
        }
    }

    /// Drop giant lock levels; returns the prior depth
    pub fn kernel_unlock(&self, how: Release) -> u32 {
        self.inner.giant.release(how)
    }

    /// Run `f` outside kernel context
    ///
    /// Releases the giant lock and the vCPU around a host blocking call and
    /// takes both back afterwards, in that order.
    pub fn unscheduled<R>(&self, f: impl FnOnce() -> R) -> R {
        let depth = self.inner.giant.release(Release::All);
        let lwp = self.current_lwp();
        let had_cpu = lwp
            .as_ref()
            .is_some_and(|lwp| self.inner.cpus.unschedule(lwp).is_some());

        let result = f();

        if let (Some(lwp), true) = (&lwp, had_cpu) {
            self.inner.cpus.schedule(lwp);
        }
        if depth > 0 {
            self.kernel_lock(depth);
        }
        result
    }

    // =========================================================================
    // Sleep / wakeup
    // =========================================================================

    /// Sleep on `chan` until woken or asked to quit
    pub fn sleep(&self, chan: WaitChannel) -> Result<SleepResult, LwpError> {
        self.sleep_until(chan, None)
    }

    /// Sleep on `chan` for at most `timeout`
    pub fn sleep_timeout(
        &self,
        chan: WaitChannel,
        timeout: Duration,
    ) -> Result<SleepResult, LwpError> {
        self.sleep_until(chan, Some(Instant::now() + timeout))
    }

    fn sleep_until(
        &self,
        chan: WaitChannel,
        deadline: Option<Instant>,
    ) -> Result<SleepResult, LwpError> {
        let lwp = self.curlwp()?;
        let giant = &self.inner.giant;
        let cpus = &self.inner.cpus;
        let sleepq = &self.inner.sleepq;

        let lent = giant.lend();
        let mut queue = sleepq.lock();
        let ticket = queue.enqueue(chan);
        lwp.set_wchan(Some(chan));
        if lent.is_some() {
            giant.yield_lent();
        }

        let result = loop {
            if lwp.quit_requested() {
                break SleepResult::Interrupted;
            }
            if queue.woken(chan, ticket) {
                break SleepResult::Woken;
            }
            match deadline {
                None => cpus.suspend(&lwp, &mut queue, sleepq.condvar()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break SleepResult::TimedOut;
                    }
                    cpus.suspend_for(&lwp, &mut queue, sleepq.condvar(), deadline - now);
                }
            }
        };

        queue.dequeue(chan);
        drop(queue);
        lwp.set_wchan(None);

        if let Some(lent) = lent {
            giant.reclaim_lent(|state, cv| cpus.suspend(&lwp, state, cv));
            giant.relend(lent);
        }
        Ok(result)
    }

    /// Wake every LWP sleeping on `chan`
    pub fn wakeup(&self, chan: WaitChannel) -> usize {
        self.inner.sleepq.wakeup(chan)
    }

    // =========================================================================
    // LWPs and processes
    // =========================================================================

    pub fn new_process(&self, parent: Pid, mode: ForkMode) -> Result<Pid, LwpError> {
        self.inner.registry.new_process(parent, mode, None)
    }

    /// New process with its own address space
    pub fn new_process_with_vmspace(
        &self,
        parent: Pid,
        mode: ForkMode,
        vmspace: VmSpace,
    ) -> Result<Pid, LwpError> {
        self.inner.registry.new_process(parent, mode, Some(vmspace))
    }

    pub fn new_lwp(&self, pid: Option<Pid>, flags: LwpFlags) -> Result<Arc<Lwp>, LwpError> {
        self.inner.registry.new_lwp(pid, flags)
    }

    /// Drop the owner's reference; a running LWP is freed at its unschedule
    ///
    /// Releasing this thread's unscheduled identity also clears it.
    pub fn release_lwp(&self, lwp: &Arc<Lwp>) -> bool {
        if !lwp.is_running()
            && self
                .current_lwp()
                .is_some_and(|current| current.id() == lwp.id())
        {
            self.clear_current(lwp);
        }
        self.inner.registry.release(lwp)
    }

    /// Make `to` this thread's identity, or clear it with `None`
    ///
    /// A vCPU held by the old identity passes straight to the new one. An
    /// old identity that has exited hands its pending signals to its process
    /// and is freed once it is no longer current. Clearing a scheduled
    /// identity takes effect at its next `unschedule`.
    pub fn switch(&self, to: Option<Arc<Lwp>>) -> Result<(), LwpError> {
        let current = self.current_lwp();
        let Some(new) = to else {
            if let Some(old) = current {
                if old.is_running() {
                    old.set_flags(LwpFlags::CLEAR);
                } else {
                    self.clear_current(&old);
                    self.inner.registry.reap(&old);
                }
            }
            return Ok(());
        };

        if current.as_ref().is_some_and(|old| old.id() == new.id()) {
            return Ok(());
        }
        self.claim(&new)?;
        self.install(current, &new);
        Ok(())
    }

    /// Reserve `lwp` as the identity of the calling thread
    ///
    /// An LWP is current on at most one thread; the claim is dropped when it
    /// stops being current.
    fn claim(&self, lwp: &Lwp) -> Result<(), LwpError> {
        if lwp.is_running() {
            return Err(LwpError::AlreadyRunning(lwp.id()));
        }
        if lwp.is_zombie() || self.inner.registry.lookup(lwp.id()).is_none() {
            return Err(LwpError::NoSuchLwp(lwp.id()));
        }
        if !lwp.claim_thread() {
            return Err(LwpError::AlreadyCurrent(lwp.id()));
        }
        Ok(())
    }

    /// Replace `current` with the already claimed `new`
    fn install(&self, current: Option<Arc<Lwp>>, new: &Arc<Lwp>) {
        if let Some(old) = current {
            if old.flags().contains(LwpFlags::IMPLICIT) && !old.is_zombie() {
                self.inner.registry.release(&old);
            }
            if old.is_zombie() {
                self.inner.registry.transfer_signals(&old);
            }
            self.inner.cpus.rebind(&old, new);
            old.clear_flags(LwpFlags::CLEAR);
            self.set_current(Some(Arc::clone(new)));
            old.release_thread();
            self.inner.registry.reap(&old);
        } else {
            self.set_current(Some(Arc::clone(new)));
        }

        if new.pending_signals() != 0 || self.inner.registry.process_signals(new.pid()) != 0 {
            new.set_flags(LwpFlags::PENDSIG);
        }
    }

    /// Run `f` in kernel context as a throwaway LWP of `pid`
    ///
    /// The calling thread's own identity steps aside (giving up its vCPU and
    /// giant lock) for the duration and is restored afterwards, so the two
    /// are never current together.
    pub fn run_ephemeral<R>(
        &self,
        pid: Pid,
        flags: LwpFlags,
        f: impl FnOnce(&Arc<Lwp>) -> R,
    ) -> Result<R, LwpError> {
        let lwp = self.new_lwp(Some(pid), flags)?;
        lwp.claim_thread();

        let previous = self.current_lwp();
        let was_running = previous.as_ref().is_some_and(|p| p.is_running());
        let depth = if was_running {
            self.inner.giant.release(Release::All)
        } else {
            0
        };
        if let (Some(prev), true) = (&previous, was_running) {
            self.inner.cpus.unschedule(prev);
        }
        self.set_current(Some(Arc::clone(&lwp)));

        let result = {
            let _guard = self.enter();
            let result = f(&lwp);
            self.inner.registry.release(&lwp);
            result
        };

        self.set_current(previous.clone());
        lwp.release_thread();
        if let (Some(prev), true) = (&previous, was_running) {
            self.inner.cpus.schedule(prev);
            if depth > 0 {
                self.kernel_lock(depth);
            }
        }
        Ok(result)
    }

    /// Post a signal to an LWP
    pub fn signal_lwp(&self, lwp: &Lwp, sig: Signal) {
        lwp.post_signal(sig);
    }

    /// Terminate every other LWP of `pid`
    ///
    /// The process is marked dead, its LWPs are flagged to quit, and sleepers
    /// are woken so each sees the flag. Returns once only the caller (if it
    /// belongs to `pid`) is left. The LWPs' owners must react to
    /// `SleepResult::Interrupted` by releasing them.
    pub fn lwpexit_all(&self, pid: Pid) -> Result<(), LwpError> {
        if pid == PROC0_PID {
            return Err(LwpError::Proc0Exit);
        }
        let me = self.current_lwp().filter(|lwp| lwp.pid() == pid);
        let lwps = self.inner.registry.process_lwps(pid)?;
        self.inner.registry.exit_process(pid)?;

        for lwp in lwps.iter().filter(|l| me.as_ref().map_or(true, |m| m.id() != l.id())) {
            lwp.set_flags(LwpFlags::QUIT);
        }
        atomic::fence(Ordering::SeqCst);
        self.inner.sleepq.interrupt_all();

        let remaining = usize::from(me.is_some());
        debug!(pid, lwps = lwps.len(), remaining, "waiting for lwps to exit");
        drop(lwps);
        self.unscheduled(|| self.inner.registry.wait_for_lwps(pid, remaining));
        Ok(())
    }

    pub fn process_context(&self, pid: Pid) -> Result<ProcessContext, LwpError> {
        self.inner
            .registry
            .context(pid)
            .ok_or(LwpError::NoSuchProcess(pid))
    }

    /// Context of the current LWP's process
    pub fn curproc(&self) -> Result<ProcessContext, LwpError> {
        let lwp = self.current_lwp().ok_or(LwpError::NotScheduled)?;
        self.process_context(lwp.pid())
    }

    /// Start a host thread running `f` in kernel context as a new LWP of `pid`
    ///
    /// The LWP is released when `f` returns.
    pub fn spawn_lwp<F, R>(&self, pid: Pid, f: F) -> RuntimeResult<JoinHandle<R>>
    where
        F: FnOnce(&Runtime) -> R + Send + 'static,
        R: Send + 'static,
    {
        let lwp = self.new_lwp(Some(pid), LwpFlags::empty())?;
        // Claimed here so a failure reaches the caller instead of the thread
        if let Err(e) = self.claim(&lwp) {
            self.inner.registry.release(&lwp);
            return Err(e.into());
        }
        let runtime = self.clone();
        let name = format!("{}-lwp-{}", self.inner.config.thread_name, lwp.id());

        let spawned = thread::Builder::new().name(name).spawn({
            let lwp = Arc::clone(&lwp);
            move || {
                runtime.install(None, &lwp);
                let guard = runtime.enter();
                let result = f(&runtime);
                runtime.release_lwp(&lwp);
                drop(guard);
                result
            }
        });

        spawned.map_err(|e| {
            lwp.release_thread();
            self.inner.registry.release(&lwp);
            RuntimeError::Worker(WorkerError::Spawn(e))
        })
    }

    // =========================================================================
    // Copy operations
    // =========================================================================

    /// Read `len` bytes from the current process's address space
    pub fn copyin(&self, addr: RemoteAddr, len: usize) -> RuntimeResult<Vec<u8>> {
        let proc = self.curproc()?;
        Ok(proc.vmspace.copyin(addr, len)?)
    }

    /// Write `data` into the current process's address space
    pub fn copyout(&self, addr: RemoteAddr, data: &[u8]) -> RuntimeResult<()> {
        let proc = self.curproc()?;
        Ok(proc.vmspace.copyout(addr, data)?)
    }
}
