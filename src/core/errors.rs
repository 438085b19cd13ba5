/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use super::types::{Pid, RemoteAddr, ReqNo};
use crate::lwp::LwpId;
use miette::Diagnostic;
use thiserror::Error;

/// LWP and process registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum LwpError {
    #[error("Process {0} not found")]
    #[diagnostic(
        code(lwp::no_such_process),
        help("The process may have exited and been reaped.")
    )]
    NoSuchProcess(Pid),

    #[error("LWP {0} not found")]
    #[diagnostic(code(lwp::no_such_lwp), help("Stale LWP handle: the LWP was freed."))]
    NoSuchLwp(LwpId),

    #[error("LWP {0} is already running on another thread")]
    #[diagnostic(
        code(lwp::already_running),
        help("An LWP may be the current identity of at most one host thread.")
    )]
    AlreadyRunning(LwpId),

    #[error("LWP {0} is already the identity of another thread")]
    #[diagnostic(
        code(lwp::already_current),
        help("Switch the LWP out on its current thread before switching it in elsewhere.")
    )]
    AlreadyCurrent(LwpId),

    #[error("Process {0} is exiting")]
    #[diagnostic(code(lwp::process_exiting))]
    ProcessExiting(Pid),

    #[error("proc0 cannot exit")]
    #[diagnostic(code(lwp::proc0_exit), help("proc0 owns the implicit LWPs and lives as long as the runtime."))]
    Proc0Exit,

    #[error("Calling thread has no scheduled LWP")]
    #[diagnostic(
        code(lwp::not_scheduled),
        help("Call Runtime::schedule() or Runtime::enter() first.")
    )]
    NotScheduled,
}

/// Wire protocol violations
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ProtocolError {
    #[error("Unknown message type {0}")]
    #[diagnostic(code(sysproxy::unknown_type))]
    UnknownType(i32),

    #[error("Frame length {len} is smaller than the header")]
    #[diagnostic(code(sysproxy::bad_length))]
    BadLength { len: u64 },

    #[error("Frame length {len} exceeds limit {max}")]
    #[diagnostic(
        code(sysproxy::frame_too_large),
        help("Raise max_frame_len if the peer legitimately sends large copies.")
    )]
    FrameTooLarge { len: u64, max: usize },

    #[error("Truncated {what}: need {expected} bytes, have {actual}")]
    #[diagnostic(code(sysproxy::truncated))]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{extra} trailing bytes after {what}")]
    #[diagnostic(code(sysproxy::trailing_bytes))]
    TrailingBytes { what: &'static str, extra: usize },

    #[error("Peer sent {kind}, which this side does not serve")]
    #[diagnostic(
        code(sysproxy::unexpected_request),
        help("Check that client and server roles are not swapped.")
    )]
    UnexpectedRequest { kind: &'static str },

    #[error("Unexpected {kind} in response to request {reqno}")]
    #[diagnostic(code(sysproxy::unexpected_response))]
    UnexpectedResponse { reqno: ReqNo, kind: &'static str },
}

/// Syscall proxy errors
///
/// Any of these tears down the connection; errors of the proxied syscall
/// itself travel inside SYSCALL_RESP instead.
#[derive(Error, Debug, Diagnostic)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    #[diagnostic(
        code(sysproxy::io),
        help("The connection is unusable; reconnect to start a new session.")
    )]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    #[diagnostic(code(sysproxy::disconnected))]
    Disconnected,

    #[error("Worker error: {0}")]
    #[diagnostic(transparent)]
    Worker(#[from] WorkerError),
}

/// Copy between kernel and an address space failed
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum CopyError {
    #[error("Bad address {addr:#x} (+{len})")]
    #[diagnostic(code(copy::fault))]
    Fault { addr: RemoteAddr, len: usize },

    #[error("Remote copy failed: {0}")]
    #[diagnostic(code(copy::remote))]
    Remote(String),
}

impl CopyError {
    /// Errno reported to the syscall that attempted the copy
    #[inline]
    pub fn errno(&self) -> nix::errno::Errno {
        nix::errno::Errno::EFAULT
    }
}

/// Worker pool errors
#[derive(Error, Debug, Diagnostic)]
pub enum WorkerError {
    #[error("Failed to spawn worker thread: {0}")]
    #[diagnostic(
        code(workers::spawn_failed),
        help("The host is out of threads or memory.")
    )]
    Spawn(#[source] std::io::Error),

    #[error("Worker pool is shut down")]
    #[diagnostic(code(workers::shut_down))]
    ShutDown,
}

/// Unified runtime error type with miette diagnostics
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    #[error("LWP error: {0}")]
    #[diagnostic(transparent)]
    Lwp(#[from] LwpError),

    #[error("Proxy error: {0}")]
    #[diagnostic(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Copy error: {0}")]
    #[diagnostic(transparent)]
    Copy(#[from] CopyError),

    #[error("Worker error: {0}")]
    #[diagnostic(transparent)]
    Worker(#[from] WorkerError),
}

/// Common result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_error_maps_to_efault() {
        let err = CopyError::Fault { addr: 0x1000, len: 8 };
        assert_eq!(err.errno(), nix::errno::Errno::EFAULT);
        assert_eq!(err.to_string(), "Bad address 0x1000 (+8)");
    }

    #[test]
    fn test_runtime_error_from_lwp() {
        let err: RuntimeError = LwpError::NoSuchProcess(7).into();
        assert!(matches!(err, RuntimeError::Lwp(LwpError::NoSuchProcess(7))));
    }
}
