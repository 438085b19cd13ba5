/*!
 * Current Identity
 *
 * Thread-local record of the LWP each runtime considers "current" on this
 * host thread. A thread may carry one identity per runtime instance. Each
 * LWP carries a thread claim that is taken before it is installed here and
 * dropped when it is removed, so no LWP is current on two threads.
 */

use crate::lwp::Lwp;
use std::cell::RefCell;
use std::sync::Arc;

struct Current {
    runtime: u64,
    lwp: Arc<Lwp>,
}

thread_local! {
    static CURRENT: RefCell<Vec<Current>> = const { RefCell::new(Vec::new()) };
}

/// Current LWP of `runtime` on this thread
pub(crate) fn get(runtime: u64) -> Option<Arc<Lwp>> {
    CURRENT.with(|slots| {
        slots
            .borrow()
            .iter()
            .find(|c| c.runtime == runtime)
            .map(|c| Arc::clone(&c.lwp))
    })
}

/// Replace the current LWP of `runtime`, returning the previous one
pub(crate) fn replace(runtime: u64, lwp: Option<Arc<Lwp>>) -> Option<Arc<Lwp>> {
    CURRENT.with(|slots| {
        let mut slots = slots.borrow_mut();
        let pos = slots.iter().position(|c| c.runtime == runtime);
        match (pos, lwp) {
            (Some(i), Some(lwp)) => Some(std::mem::replace(&mut slots[i].lwp, lwp)),
            (Some(i), None) => Some(slots.swap_remove(i).lwp),
            (None, Some(lwp)) => {
                slots.push(Current { runtime, lwp });
                None
            }
            (None, None) => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lwp::{LwpFlags, Registry};

    #[test]
    fn test_identities_are_per_runtime() {
        let reg = Registry::new();
        let a = reg.new_lwp(None, LwpFlags::empty()).unwrap();
        let b = reg.new_lwp(None, LwpFlags::empty()).unwrap();

        assert!(replace(u64::MAX - 1, Some(Arc::clone(&a))).is_none());
        assert!(replace(u64::MAX - 2, Some(Arc::clone(&b))).is_none());
        assert_eq!(get(u64::MAX - 1).map(|l| l.id()), Some(a.id()));
        assert_eq!(get(u64::MAX - 2).map(|l| l.id()), Some(b.id()));

        let old = replace(u64::MAX - 1, None).unwrap();
        assert_eq!(old.id(), a.id());
        assert!(get(u64::MAX - 1).is_none());
        replace(u64::MAX - 2, None);
    }
}
