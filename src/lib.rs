/*!
 * Anykernel Runtime Library
 *
 * Concurrency runtime for running kernel-level code as an ordinary library:
 * virtual CPUs, a giant lock, lightweight processes, a worker pool, and a
 * syscall proxy for remote clients.
 */

pub mod core;
pub mod lwp;
pub mod monitoring;
pub mod runtime;
pub mod sched;
pub mod sysproxy;
pub mod workers;

// Re-exports
pub use crate::core::{
    CopyError, LwpError, ProtocolError, ProxyError, RuntimeConfig, RuntimeError, RuntimeResult,
    WorkerError,
};
pub use crate::core::types::{Pid, ReqNo, SyscallOutcome, WaitChannel};
pub use lwp::{
    AddressSpace, Credentials, DescriptorTable, ForkMode, GuestMemory, KernelFile, Lwp, LwpFlags,
    LwpId, LwpState, MemFile, ProcessContext, Registry, VmSpace,
};
pub use monitoring::{init_tracing, RpcSpan};
pub use runtime::{KernelGuard, Runtime, RuntimeStats, WeakRuntime};
pub use sched::{CpuPool, GiantLock, Lent, Release, SleepResult};
pub use sysproxy::{
    BuiltinSyscalls, Message, MessageType, ProxyClient, ProxyServer, SyscallArgs, SyscallContext,
    SyscallReturn, SyscallTable,
};
pub use workers::WorkerPool;
