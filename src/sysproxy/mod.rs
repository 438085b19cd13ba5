/*!
 * Syscall Proxy
 *
 * RPC layer letting a separate client process execute syscalls inside a
 * runtime instance, with memory copies travelling back over the same stream.
 */

pub mod channel;
pub mod client;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod syscall;

pub use channel::Channel;
pub use client::ProxyClient;
pub use protocol::{decode_frame, read_frame, write_frame, Frame, Header, Message, MessageType};
pub use remote::RemoteSpace;
pub use server::{ProxyServer, SessionInfo};
pub use syscall::{nr, BuiltinSyscalls, SyscallArgs, SyscallContext, SyscallReturn, SyscallTable};
