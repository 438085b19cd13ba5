/*!
 * Core Types
 * Common types used across the runtime
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID type (signed, matching the kernel's `pid_t`)
pub type Pid = i32;

/// Virtual CPU slot index
pub type CpuId = u32;

/// RPC request number
pub type ReqNo = u32;

/// Remote (client-side) address carried by copy requests
pub type RemoteAddr = u64;

/// Signal number
pub type Signal = u32;

/// Raw errno value as carried on the wire
pub type RawErrno = i32;

/// Opaque identifier for a generic sleep
///
/// Any value may be used; sleepers on the same channel are woken together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaitChannel(pub u64);

impl WaitChannel {
    /// Derive a channel from the address of a kernel object
    #[inline]
    pub fn of<T>(obj: &T) -> Self {
        Self(obj as *const T as usize as u64)
    }
}

impl fmt::Display for WaitChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wchan:{:#x}", self.0)
    }
}

/// Outcome of a proxied or local syscall: return value or errno
pub type SyscallOutcome = Result<i64, nix::errno::Errno>;

/// Convert an errno into its wire representation
#[inline]
pub fn errno_raw(errno: nix::errno::Errno) -> RawErrno {
    errno as RawErrno
}
