/*!
 * ID Generation
 * Monotonic atomic counters for pids and request numbers
 */

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Generic ID generator interface
pub trait IdGenerator<T> {
    /// Generate next ID
    fn next(&self) -> T;

    /// Get current counter value (for debugging)
    fn current(&self) -> T;
}

/// Lock-free monotonically increasing counter
///
/// IDs are never recycled, so an ID is unique for the lifetime of the
/// generator as long as the counter does not wrap.
#[repr(C, align(64))]
pub struct AtomicGenerator<A> {
    counter: A,
}

/// Process ID generator
pub type PidGenerator = AtomicGenerator<AtomicI32>;

/// RPC request number generator
///
/// Request numbers are 32 bits on the wire. They increase until the counter
/// wraps after 2^32 requests; from then on 0 is never handed out and
/// `next_unused` skips numbers that are still outstanding.
pub type ReqNoGenerator = AtomicGenerator<AtomicU32>;

impl PidGenerator {
    #[inline]
    pub const fn new(start: i32) -> Self {
        Self {
            counter: AtomicI32::new(start),
        }
    }
}

impl ReqNoGenerator {
    #[inline]
    pub const fn new(start: u32) -> Self {
        Self {
            counter: AtomicU32::new(start),
        }
    }

    /// Next number for which `in_use` is false
    pub fn next_unused(&self, mut in_use: impl FnMut(u32) -> bool) -> u32 {
        loop {
            let reqno = self.next();
            if !in_use(reqno) {
                return reqno;
            }
        }
    }
}

impl IdGenerator<i32> for PidGenerator {
    #[inline]
    fn next(&self) -> i32 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    fn current(&self) -> i32 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl IdGenerator<u32> for ReqNoGenerator {
    /// Wrapping increment that never yields 0
    #[inline]
    fn next(&self) -> u32 {
        loop {
            let reqno = self.counter.fetch_add(1, Ordering::SeqCst);
            if reqno != 0 {
                return reqno;
            }
        }
    }

    #[inline]
    fn current(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }
}
