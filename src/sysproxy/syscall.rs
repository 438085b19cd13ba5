/*!
 * Proxied Syscalls
 *
 * Typed syscall arguments with explicit per-call encoding, the dispatch
 * table trait a server executes them through, and a built-in table for the
 * descriptor and identity calls.
 *
 * Argument encodings use host byte order and fixed-width fields; both ends
 * must agree on them. Numbers without a typed variant travel as `Raw`.
 */

use super::protocol::Message;
use crate::core::errors::ProtocolError;
use crate::core::types::{errno_raw, Pid, RawErrno, RemoteAddr, SyscallOutcome};
use crate::lwp::{Lwp, ProcessContext};
use crate::runtime::Runtime;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// Syscall numbers with typed arguments
pub mod nr {
    pub const READ: i32 = 3;
    pub const WRITE: i32 = 4;
    pub const CLOSE: i32 = 6;
    pub const GETPID: i32 = 20;
    pub const GETPPID: i32 = 39;
    pub const DUP: i32 = 41;
}

/// Arguments of a proxied syscall
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallArgs {
    Getpid,
    Getppid,
    Read { fd: i32, buf: RemoteAddr, len: u64 },
    Write { fd: i32, buf: RemoteAddr, len: u64 },
    Close { fd: i32 },
    Dup { fd: i32 },
    /// Any other number with its argument bytes as given
    Raw { number: i32, args: Bytes },
}

impl SyscallArgs {
    pub fn number(&self) -> i32 {
        match self {
            Self::Getpid => nr::GETPID,
            Self::Getppid => nr::GETPPID,
            Self::Read { .. } => nr::READ,
            Self::Write { .. } => nr::WRITE,
            Self::Close { .. } => nr::CLOSE,
            Self::Dup { .. } => nr::DUP,
            Self::Raw { number, .. } => *number,
        }
    }

    /// Argument bytes carried in the SYSCALL body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Getpid | Self::Getppid => {}
            Self::Read { fd, buf: addr, len } | Self::Write { fd, buf: addr, len } => {
                buf.put_i32_ne(*fd);
                buf.put_u64_ne(*addr);
                buf.put_u64_ne(*len);
            }
            Self::Close { fd } | Self::Dup { fd } => buf.put_i32_ne(*fd),
            Self::Raw { args, .. } => return args.clone(),
        }
        buf.freeze()
    }

    pub fn decode(number: i32, args: &Bytes) -> Result<Self, ProtocolError> {
        let mut body = args.clone();
        let what = "syscall arguments";
        let expect = |body: &Bytes, expected: usize| {
            if body.remaining() == expected {
                Ok(())
            } else if body.remaining() < expected {
                Err(ProtocolError::Truncated {
                    what,
                    expected,
                    actual: body.remaining(),
                })
            } else {
                Err(ProtocolError::TrailingBytes {
                    what,
                    extra: body.remaining() - expected,
                })
            }
        };

        Ok(match number {
            nr::GETPID | nr::GETPPID => {
                expect(&body, 0)?;
                if number == nr::GETPID {
                    Self::Getpid
                } else {
                    Self::Getppid
                }
            }
            nr::READ | nr::WRITE => {
                expect(&body, 20)?;
                let fd = body.get_i32_ne();
                let buf = body.get_u64_ne();
                let len = body.get_u64_ne();
                if number == nr::READ {
                    Self::Read { fd, buf, len }
                } else {
                    Self::Write { fd, buf, len }
                }
            }
            nr::CLOSE | nr::DUP => {
                expect(&body, 4)?;
                let fd = body.get_i32_ne();
                if number == nr::CLOSE {
                    Self::Close { fd }
                } else {
                    Self::Dup { fd }
                }
            }
            number => Self::Raw {
                number,
                args: body,
            },
        })
    }

    pub fn to_message(&self) -> Message {
        Message::Syscall {
            number: self.number(),
            args: self.encode(),
        }
    }
}

/// Result of a proxied syscall as carried in SYSCALL_RESP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallReturn {
    pub error: RawErrno,
    pub retval: i64,
}

impl SyscallReturn {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    pub fn into_result(self) -> SyscallOutcome {
        if self.error == 0 {
            Ok(self.retval)
        } else {
            Err(Errno::from_raw(self.error))
        }
    }
}

impl From<SyscallOutcome> for SyscallReturn {
    fn from(outcome: SyscallOutcome) -> Self {
        match outcome {
            Ok(retval) => Self { error: 0, retval },
            Err(errno) => Self {
                error: errno_raw(errno),
                retval: -1,
            },
        }
    }
}

/// Execution context of one proxied syscall
///
/// Built by the server after the ephemeral LWP is scheduled.
pub struct SyscallContext<'a> {
    pub runtime: &'a Runtime,
    pub lwp: &'a Arc<Lwp>,
    pub proc: ProcessContext,
}

impl SyscallContext<'_> {
    #[inline]
    pub fn pid(&self) -> Pid {
        self.proc.pid
    }

    /// Copy from the caller's memory, faulting with EFAULT
    pub fn copyin(&self, addr: RemoteAddr, len: usize) -> Result<Vec<u8>, Errno> {
        self.proc.vmspace.copyin(addr, len).map_err(|e| e.errno())
    }

    /// Copy to the caller's memory, faulting with EFAULT
    pub fn copyout(&self, addr: RemoteAddr, data: &[u8]) -> Result<(), Errno> {
        self.proc.vmspace.copyout(addr, data).map_err(|e| e.errno())
    }
}

/// Server-side syscall dispatch
pub trait SyscallTable: Send + Sync + 'static {
    /// Execute syscall `number` in kernel context
    fn dispatch(&self, ctx: &SyscallContext<'_>, number: i32, args: &Bytes) -> SyscallOutcome;

    /// Whether `number` may run without the giant lock
    fn is_mpsafe(&self, _number: i32) -> bool {
        false
    }
}

/// Identity and descriptor syscalls against the caller's process
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinSyscalls;

impl BuiltinSyscalls {
    fn execute(&self, ctx: &SyscallContext<'_>, args: SyscallArgs) -> SyscallOutcome {
        let fds = &ctx.proc.fds;
        match args {
            SyscallArgs::Getpid => Ok(i64::from(ctx.proc.pid)),
            SyscallArgs::Getppid => Ok(i64::from(ctx.proc.ppid)),
            SyscallArgs::Read { fd, buf, len } => {
                let file = fds.get(fd)?;
                let len = usize::try_from(len).map_err(|_| Errno::EINVAL)?;
                let data = file.read(len)?;
                ctx.copyout(buf, &data)?;
                Ok(data.len() as i64)
            }
            SyscallArgs::Write { fd, buf, len } => {
                let file = fds.get(fd)?;
                let len = usize::try_from(len).map_err(|_| Errno::EINVAL)?;
                let data = ctx.copyin(buf, len)?;
                Ok(file.write(&data)? as i64)
            }
            SyscallArgs::Close { fd } => fds.close(fd).map(|()| 0),
            SyscallArgs::Dup { fd } => fds.dup(fd).map(i64::from),
            SyscallArgs::Raw { .. } => Err(Errno::ENOSYS),
        }
    }
}

impl SyscallTable for BuiltinSyscalls {
    fn dispatch(&self, ctx: &SyscallContext<'_>, number: i32, args: &Bytes) -> SyscallOutcome {
        let args = SyscallArgs::decode(number, args).map_err(|e| {
            trace!(number, error = %e, "malformed syscall arguments");
            Errno::EINVAL
        })?;
        self.execute(ctx, args)
    }

    fn is_mpsafe(&self, number: i32) -> bool {
        matches!(number, nr::GETPID | nr::GETPPID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_args_decode() {
        let read = SyscallArgs::Read {
            fd: 3,
            buf: 0x7000,
            len: 64,
        };
        let bytes = read.encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(SyscallArgs::decode(nr::READ, &bytes).unwrap(), read);
        assert_eq!(
            SyscallArgs::decode(nr::CLOSE, &bytes),
            Err(ProtocolError::TrailingBytes {
                what: "syscall arguments",
                extra: 16
            })
        );
    }

    #[test]
    fn test_unknown_number_is_raw() {
        let args = Bytes::from_static(&[1, 2, 3]);
        assert_eq!(
            SyscallArgs::decode(5, &args).unwrap(),
            SyscallArgs::Raw {
                number: 5,
                args: args.clone()
            }
        );
    }

    #[test]
    fn test_return_conversion() {
        let ok = SyscallReturn::from(Ok(42));
        assert_eq!((ok.error, ok.retval), (0, 42));
        assert_eq!(ok.into_result(), Ok(42));

        let err = SyscallReturn::from(Err(Errno::EBADF));
        assert_eq!(err.error, Errno::EBADF as i32);
        assert_eq!(err.into_result(), Err(Errno::EBADF));
    }
}
