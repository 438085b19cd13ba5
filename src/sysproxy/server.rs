/*!
 * Proxy Server
 *
 * Serves remote clients over unix-socket connections. Each connection is a
 * session with its own client process, whose address space is the
 * connection itself.
 *
 * # Dispatch
 *
 * - SYSCALL runs on the worker pool as a fresh ephemeral LWP of the client
 *   process and is answered with SYSCALL_RESP under the same reqno
 * - LWP_CREATE / LWP_EXIT create and release persistent LWPs mirroring
 *   client threads
 * - COPYIN / COPYOUT are client-side requests and kill the session
 *
 * # Teardown
 *
 * When the stream ends or fails, pending copies fail, the mirror LWPs and
 * the session's main LWP are released, and `lwpexit_all` waits out any
 * syscall still executing before the process is freed.
 */

use super::channel::Channel;
use super::protocol::{Frame, Message};
use super::remote::RemoteSpace;
use super::syscall::{SyscallContext, SyscallReturn, SyscallTable};
use crate::core::errors::{LwpError, ProtocolError, ProxyError, ProxyResult, RuntimeResult};
use crate::core::limits::PROC0_PID;
use crate::core::types::{Pid, ReqNo};
use crate::lwp::{ForkMode, Lwp, LwpFlags, VmSpace};
use crate::monitoring::RpcSpan;
use crate::runtime::Runtime;
use ahash::RandomState;
use bytes::Bytes;
use dashmap::DashMap;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// One client connection
struct Session {
    id: u64,
    pid: Pid,
    channel: Arc<Channel>,
    /// Keeps the process alive between syscalls
    main: Arc<Lwp>,
    mirrors: Mutex<HashMap<i32, Arc<Lwp>, RandomState>>,
}

/// Session summary for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub pid: Pid,
    pub mirrored_lwps: usize,
    pub pending_calls: usize,
}

/// Syscall proxy server
pub struct ProxyServer {
    runtime: Runtime,
    table: Arc<dyn SyscallTable>,
    sessions: DashMap<u64, Arc<Session>>,
    next_session: AtomicU64,
}

impl ProxyServer {
    pub fn new(runtime: Runtime, table: Arc<dyn SyscallTable>) -> Self {
        Self {
            runtime,
            table,
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let s = entry.value();
                SessionInfo {
                    id: s.id,
                    pid: s.pid,
                    mirrored_lwps: s.mirrors.lock().len(),
                    pending_calls: s.channel.pending(),
                }
            })
            .collect()
    }

    /// Accept connections forever, one host thread per connection
    pub fn serve(self: &Arc<Self>, listener: UnixListener) -> io::Result<()> {
        info!(addr = ?listener.local_addr().ok(), "proxy server listening");
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let server = Arc::clone(self);
            thread::Builder::new()
                .name(format!("{}-conn", self.runtime.config().thread_name))
                .spawn(move || {
                    if let Err(e) = server.serve_connection(stream) {
                        warn!(error = %e, "session ended with error");
                    }
                })?;
        }
        Ok(())
    }

    /// Run one session to completion on the calling thread
    pub fn serve_connection(&self, stream: UnixStream) -> RuntimeResult<()> {
        let max_frame_len = self.runtime.config().max_frame_len;
        let (channel, reader) =
            Channel::over_unix(stream, max_frame_len).map_err(ProxyError::Io)?;

        let space = RemoteSpace::new(Arc::clone(&channel), self.runtime.downgrade());
        let pid = self.runtime.new_process_with_vmspace(
            PROC0_PID,
            ForkMode::CleanFds,
            VmSpace::new(Arc::new(space)),
        )?;
        let main = self.runtime.new_lwp(Some(pid), LwpFlags::empty())?;

        let session = Arc::new(Session {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            pid,
            channel: Arc::clone(&channel),
            main,
            mirrors: Mutex::new(HashMap::default()),
        });
        self.sessions.insert(session.id, Arc::clone(&session));
        info!(session = session.id, pid, "client connected");

        let result = channel.run_receiver(reader, |frame| self.dispatch(&session, frame));

        self.teardown(&session);
        result.map_err(Into::into)
    }

    fn dispatch(&self, session: &Arc<Session>, frame: Frame) -> ProxyResult<()> {
        match frame.message {
            Message::Syscall { number, args } => {
                self.enqueue_syscall(session, frame.reqno, number, args);
                Ok(())
            }
            Message::LwpCreate { lwpid } => {
                match self.runtime.new_lwp(Some(session.pid), LwpFlags::empty()) {
                    Ok(lwp) => {
                        debug!(session = session.id, lwpid, lwp = %lwp.id(), "mirroring client lwp");
                        if let Some(stale) = session.mirrors.lock().insert(lwpid, lwp) {
                            self.runtime.release_lwp(&stale);
                        }
                    }
                    Err(e) => warn!(session = session.id, lwpid, error = %e, "cannot mirror client lwp"),
                }
                Ok(())
            }
            Message::LwpExit { lwpid } => {
                let mirror = session.mirrors.lock().remove(&lwpid);
                match mirror {
                    Some(lwp) => {
                        self.runtime.release_lwp(&lwp);
                    }
                    None => debug!(session = session.id, lwpid, "exit for unknown client lwp"),
                }
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedRequest { kind: other.kind() }.into()),
        }
    }

    fn enqueue_syscall(&self, session: &Arc<Session>, reqno: ReqNo, number: i32, args: Bytes) {
        let runtime = self.runtime.clone();
        let table = Arc::clone(&self.table);
        let job_session = Arc::clone(session);

        let queued = self.runtime.workers().enqueue(move || {
            let ret = execute_syscall(&runtime, table.as_ref(), &job_session, reqno, number, &args);
            let reply = Message::SyscallResp {
                error: ret.error,
                retval: ret.retval,
            };
            if let Err(e) = job_session.channel.reply(reqno, &reply) {
                debug!(reqno, error = %e, "syscall response not sent");
            }
        });

        if let Err(e) = queued {
            error!(reqno, error = %e, "cannot dispatch syscall");
            let reply = Message::SyscallResp {
                error: Errno::EAGAIN as i32,
                retval: -1,
            };
            if let Err(e) = session.channel.reply(reqno, &reply) {
                warn!(session = session.id, reqno, error = %e, "syscall error response not sent");
            }
        }
    }

    fn teardown(&self, session: &Session) {
        self.sessions.remove(&session.id);

        let mirrors: Vec<_> = session.mirrors.lock().drain().map(|(_, l)| l).collect();
        for lwp in &mirrors {
            self.runtime.release_lwp(lwp);
        }
        self.runtime.release_lwp(&session.main);

        match self.runtime.lwpexit_all(session.pid) {
            Ok(()) | Err(LwpError::NoSuchProcess(_)) => {}
            Err(e) => warn!(session = session.id, error = %e, "process teardown failed"),
        }
        info!(session = session.id, pid = session.pid, "client disconnected");
    }
}

/// Execute one proxied syscall as an ephemeral LWP of the session process
fn execute_syscall(
    runtime: &Runtime,
    table: &dyn SyscallTable,
    session: &Session,
    reqno: ReqNo,
    number: i32,
    args: &Bytes,
) -> SyscallReturn {
    let mut span = RpcSpan::new(reqno, session.pid, number);
    let flags = if table.is_mpsafe(number) {
        LwpFlags::MPSAFE
    } else {
        LwpFlags::empty()
    };

    let outcome = {
        let _entered = span.enter();
        runtime.run_ephemeral(session.pid, flags, |lwp| {
            let proc = runtime.process_context(session.pid)?;
            let ctx = SyscallContext {
                runtime,
                lwp,
                proc,
            };
            Ok::<_, LwpError>(table.dispatch(&ctx, number, args))
        })
    };

    let ret = match outcome {
        Ok(Ok(outcome)) => SyscallReturn::from(outcome),
        // The process is exiting or gone
        Ok(Err(_)) | Err(_) => SyscallReturn::from(Err(Errno::ESRCH)),
    };
    span.record_result(ret.error, ret.retval);
    ret
}
