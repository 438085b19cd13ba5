/*!
 * Kernel Entry Guard
 * RAII kernel context: vCPU plus giant lock for the guard's lifetime
 */

use super::Runtime;
use crate::lwp::Lwp;
use crate::sched::Release;
use std::marker::PhantomData;
use std::sync::Arc;

/// Held kernel context
///
/// Returned by [`Runtime::enter`]. Dropping it gives back the giant lock
/// level it took and, if entering scheduled the thread, the vCPU as well.
/// Bound to the entering thread.
#[must_use = "kernel context is left as soon as the guard is dropped"]
pub struct KernelGuard {
    runtime: Runtime,
    lwp: Arc<Lwp>,
    locked: bool,
    scheduled: bool,
    _not_send: PhantomData<*const ()>,
}

impl KernelGuard {
    pub(super) fn new(runtime: Runtime, lwp: Arc<Lwp>, locked: bool, scheduled: bool) -> Self {
        Self {
            runtime,
            lwp,
            locked,
            scheduled,
            _not_send: PhantomData,
        }
    }

    /// LWP the guard runs as
    #[inline]
    pub fn lwp(&self) -> &Arc<Lwp> {
        &self.lwp
    }

    #[inline]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

impl Drop for KernelGuard {
    fn drop(&mut self) {
        if self.locked {
            self.runtime.kernel_unlock(Release::Count(1));
        }
        if self.scheduled {
            self.runtime.unschedule();
        }
    }
}
