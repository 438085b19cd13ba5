/*!
 * Proxy Client
 *
 * Drives a remote runtime instance: issues syscalls and serves the server's
 * copy requests against local client memory.
 *
 * COPYIN requests are answered from the worker pool; COPYOUT is applied
 * directly in the receiver thread and gets no response.
 */

use super::channel::Channel;
use super::protocol::Message;
use super::syscall::{SyscallArgs, SyscallReturn};
use crate::core::errors::{ProtocolError, ProxyError, ProxyResult};
use crate::core::types::{RemoteAddr, ReqNo};
use crate::core::limits::{DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_IDLE_WORKERS, DEFAULT_WORKER_SOFT_CAP};
use crate::lwp::AddressSpace;
use crate::workers::WorkerPool;
use bytes::Bytes;
use parking_lot::Mutex;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Connection to a proxy server
pub struct ProxyClient {
    channel: Arc<Channel>,
    receiver: Mutex<Option<JoinHandle<ProxyResult<()>>>>,
}

impl ProxyClient {
    /// Connect to a server listening on a unix socket
    pub fn connect(path: impl AsRef<Path>, memory: Arc<dyn AddressSpace>) -> ProxyResult<Self> {
        let stream = UnixStream::connect(path)?;
        Self::from_stream(stream, memory)
    }

    /// Run the client protocol over an already connected stream
    pub fn from_stream(stream: UnixStream, memory: Arc<dyn AddressSpace>) -> ProxyResult<Self> {
        let (channel, reader) = Channel::over_unix(stream, DEFAULT_MAX_FRAME_LEN)?;
        let workers = Arc::new(WorkerPool::new(
            DEFAULT_MAX_IDLE_WORKERS,
            DEFAULT_WORKER_SOFT_CAP,
            "anykernel-client-worker",
        ));

        let receiver = {
            let channel = Arc::clone(&channel);
            thread::Builder::new()
                .name("anykernel-client-recv".to_string())
                .spawn(move || {
                    let serving = Arc::clone(&channel);
                    channel.run_receiver(reader, move |frame| {
                        let reqno = frame.reqno;
                        match frame.message {
                            Message::Copyin { addr, len } => {
                                let channel = Arc::clone(&serving);
                                let memory = Arc::clone(&memory);
                                workers.enqueue(move || {
                                    serve_copyin(&channel, memory.as_ref(), reqno, addr, len)
                                })?;
                                Ok(())
                            }
                            Message::Copyout { addr, data } => {
                                if let Err(e) = memory.copyout(addr, &data) {
                                    warn!(addr, len = data.len(), error = %e, "copyout from server faulted");
                                }
                                Ok(())
                            }
                            other => Err(ProtocolError::UnexpectedRequest { kind: other.kind() }.into()),
                        }
                    })
                })?
        };

        Ok(Self {
            channel,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Execute syscall `number` on the server
    pub fn syscall(&self, number: i32, args: Bytes) -> ProxyResult<SyscallReturn> {
        let response = self.channel.call(&Message::Syscall { number, args })?;
        match response.message {
            Message::SyscallResp { error, retval } => Ok(SyscallReturn { error, retval }),
            other => Err(ProtocolError::UnexpectedResponse {
                reqno: response.reqno,
                kind: other.kind(),
            }
            .into()),
        }
    }

    /// Execute a typed syscall on the server
    pub fn call(&self, args: &SyscallArgs) -> ProxyResult<SyscallReturn> {
        self.syscall(args.number(), args.encode())
    }

    /// Announce a new client thread
    pub fn lwp_create(&self, lwpid: i32) -> ProxyResult<()> {
        self.channel.post(&Message::LwpCreate { lwpid }).map(|_| ())
    }

    /// Announce the exit of a client thread
    pub fn lwp_exit(&self, lwpid: i32) -> ProxyResult<()> {
        self.channel.post(&Message::LwpExit { lwpid }).map(|_| ())
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        !self.channel.is_dead()
    }

    /// Disconnect and wait for the receiver to stop
    pub fn close(&self) -> ProxyResult<()> {
        self.channel.close();
        let Some(receiver) = self.receiver.lock().take() else {
            return Ok(());
        };
        match receiver.join() {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Disconnected),
        }
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "client receiver ended with error");
        }
    }
}

fn serve_copyin(channel: &Channel, memory: &dyn AddressSpace, reqno: ReqNo, addr: RemoteAddr, len: u64) {
    // An empty reply tells the server the range was unreadable
    let data = usize::try_from(len)
        .ok()
        .and_then(|len| memory.copyin(addr, len).ok())
        .map(Bytes::from)
        .unwrap_or_default();
    trace!(reqno, addr, len, served = data.len(), "copyin");

    if let Err(e) = channel.reply(reqno, &Message::CopyinResp { addr, data }) {
        debug!(reqno, error = %e, "copyin response not sent");
    }
}
