/*!
 * Runtime Limits and Constants
 *
 * Centralized location for runtime-wide limits, thresholds, and reserved values.
 * Organized by domain for maintainability and discoverability.
 */

use crate::core::types::{CpuId, Pid};
use std::time::Duration;

// =============================================================================
// SCHEDULER
// =============================================================================

/// Marker stored in an LWP that holds no virtual CPU
pub const NO_CPU: CpuId = CpuId::MAX;

/// Lower bound for the virtual CPU pool size
pub const MIN_VCPUS: usize = 1;

/// Upper bound for the virtual CPU pool size
pub const MAX_VCPUS: usize = 1024;

// =============================================================================
// PROCESSES
// =============================================================================

/// Pid of the kernel's own process (owns implicit LWPs, never freed)
pub const PROC0_PID: Pid = 0;

/// First pid handed out to a new process
pub const FIRST_USER_PID: Pid = 1;

/// Descriptor table size limit for new processes
pub const DEFAULT_MAX_DESCRIPTORS: usize = 1024;

// =============================================================================
// WORKER POOL
// =============================================================================

/// Idle workers kept parked for reuse
pub const DEFAULT_MAX_IDLE_WORKERS: usize = 8;

/// Live worker count above which spawning logs a warning
/// Advisory only: work is never refused
pub const DEFAULT_WORKER_SOFT_CAP: usize = 512;

// =============================================================================
// SYSCALL PROXY
// =============================================================================

/// Size of the fixed message header: u64 length, u32 reqno, i32 type
pub const RPC_HEADER_LEN: usize = 16;

/// Largest accepted frame (64MB)
/// [SECURITY] Bounds the allocation a peer can force with a forged length
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Proxied calls slower than this are logged at warn level
pub const SLOW_RPC_THRESHOLD: Duration = Duration::from_millis(10);

/// Default unix socket path for the server binary
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/anykernel.sock";
