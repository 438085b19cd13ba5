/*!
 * Syscall Proxy Integration Tests
 *
 * Client against a scripted peer, client against a real server, remote
 * copies in both directions, and session teardown
 */

use anykernel::core::types::{RemoteAddr, SyscallOutcome};
use anykernel::lwp::AddressSpace;
use anykernel::sysproxy::{decode_frame, read_frame, write_frame, Channel, Frame};
use anykernel::{
    BuiltinSyscalls, GuestMemory, MemFile, Message, ProxyClient, ProxyServer, Runtime,
    RuntimeConfig, SyscallArgs, SyscallContext, SyscallTable,
};
use bytes::{BufMut, Bytes, BytesMut};
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serial_test::serial;
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_FRAME: usize = 1 << 20;

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Syscalls exercising the context handed to a table
struct TestTable;

const SYS_ARGLEN: i32 = 5;
const SYS_PEEK32: i32 = 200;
const SYS_WHOAMI: i32 = 201;

impl SyscallTable for TestTable {
    fn dispatch(&self, ctx: &SyscallContext<'_>, number: i32, args: &Bytes) -> SyscallOutcome {
        match number {
            SYS_ARGLEN => Ok(args.len() as i64),
            SYS_PEEK32 => {
                let raw: [u8; 8] = args.as_ref().try_into().map_err(|_| Errno::EINVAL)?;
                let addr = RemoteAddr::from_ne_bytes(raw);
                let word = ctx.copyin(addr, 4)?;
                let word: [u8; 4] = word.as_slice().try_into().map_err(|_| Errno::EFAULT)?;
                Ok(i64::from(u32::from_ne_bytes(word)))
            }
            SYS_WHOAMI => {
                let held = ctx.runtime.giant().held_depth();
                Ok(i64::from(ctx.lwp.pid()) << 8 | i64::from(held))
            }
            _ => Err(Errno::ENOSYS),
        }
    }

    fn is_mpsafe(&self, number: i32) -> bool {
        number == SYS_ARGLEN
    }
}

struct Served {
    client: ProxyClient,
    server: Arc<ProxyServer>,
    memory: Arc<GuestMemory>,
    session: JoinHandle<()>,
}

fn serve_pair(table: Arc<dyn SyscallTable>) -> Served {
    let runtime = Runtime::new(RuntimeConfig::default().with_ncpu(2));
    let server = Arc::new(ProxyServer::new(runtime, table));
    let (client_end, server_end) = UnixStream::pair().unwrap();

    let session = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            let _ = server.serve_connection(server_end);
        })
    };

    let memory = Arc::new(GuestMemory::new());
    let client = ProxyClient::from_stream(client_end, Arc::clone(&memory) as Arc<dyn AddressSpace>)
        .unwrap();
    wait_until(|| server.sessions().len() == 1);

    Served {
        client,
        server,
        memory,
        session,
    }
}

#[test]
fn test_client_matches_response_by_reqno() {
    let (client_end, mut peer) = UnixStream::pair().unwrap();

    let script = thread::spawn(move || {
        let mut seen = Vec::new();
        while let Some(frame) = read_frame(&mut peer, MAX_FRAME).unwrap() {
            let (number, args) = match frame.message {
                Message::Syscall { number, args } => (number, args),
                other => panic!("unexpected {:?}", other),
            };
            seen.push((frame.reqno, number, args.len()));
            let retval = if frame.reqno == 7 { 42 } else { -1 };
            let reply = Frame::new(frame.reqno, Message::SyscallResp { error: 0, retval });
            write_frame(&mut peer, &reply).unwrap();
        }
        seen
    });

    let client =
        ProxyClient::from_stream(client_end, Arc::new(GuestMemory::new())).unwrap();
    for _ in 0..6 {
        client.syscall(1, Bytes::new()).unwrap();
    }
    let ret = client
        .syscall(SYS_ARGLEN, Bytes::from_static(&[0xab; 16]))
        .unwrap();
    assert_eq!((ret.error, ret.retval), (0, 42));

    client.close().unwrap();
    let seen = script.join().unwrap();
    assert_eq!(seen.len(), 7);
    assert_eq!(seen[6], (7, SYS_ARGLEN, 16));
}

#[test]
fn test_custom_table_over_real_server() {
    let served = serve_pair(Arc::new(TestTable));

    let ret = served
        .client
        .syscall(SYS_ARGLEN, Bytes::from_static(&[0; 16]))
        .unwrap();
    assert!(ret.is_ok());
    assert_eq!(ret.retval, 16);

    let ret = served.client.syscall(999, Bytes::new()).unwrap();
    assert_eq!(ret.error, Errno::ENOSYS as i32);

    // Non-mpsafe syscalls run with the giant lock held once
    let pid = served.server.sessions()[0].pid;
    let ret = served.client.syscall(SYS_WHOAMI, Bytes::new()).unwrap();
    assert_eq!(ret.retval, i64::from(pid) << 8 | 1);
}

#[test]
fn test_undispatchable_syscall_fails_with_eagain() {
    let served = serve_pair(Arc::new(TestTable));
    served.server.runtime().workers().shutdown();

    let ret = served
        .client
        .syscall(SYS_ARGLEN, Bytes::from_static(&[0; 4]))
        .unwrap();
    assert_eq!(ret.error, Errno::EAGAIN as i32);
    assert_eq!(ret.retval, -1);
}

#[test]
fn test_server_copyin_reads_client_memory() {
    let served = serve_pair(Arc::new(TestTable));
    assert!(served.memory.map(0x4000, 64));
    served
        .memory
        .copyout(0x4010, &0xdead_beef_u32.to_ne_bytes())
        .unwrap();

    let mut args = BytesMut::new();
    args.put_u64_ne(0x4010);
    let ret = served.client.syscall(SYS_PEEK32, args.freeze()).unwrap();
    assert_eq!(ret.retval, 0xdead_beef);

    // Unmapped client memory faults on the server side
    let mut args = BytesMut::new();
    args.put_u64_ne(0x9000);
    let ret = served.client.syscall(SYS_PEEK32, args.freeze()).unwrap();
    assert_eq!(ret.error, Errno::EFAULT as i32);
}

#[test]
fn test_write_then_read_moves_bytes_through_server() {
    let served = serve_pair(Arc::new(BuiltinSyscalls));
    let pid = served.server.sessions()[0].pid;
    let fd = served
        .server
        .runtime()
        .process_context(pid)
        .unwrap()
        .fds
        .install(Arc::new(MemFile::new()))
        .unwrap();

    assert!(served.memory.map(0x1000, 32));
    assert!(served.memory.map(0x2000, 32));
    served.memory.copyout(0x1000, b"anykernel").unwrap();

    let wrote = served
        .client
        .call(&SyscallArgs::Write { fd, buf: 0x1000, len: 9 })
        .unwrap();
    assert_eq!(wrote.into_result(), Ok(9));

    let read = served
        .client
        .call(&SyscallArgs::Read { fd, buf: 0x2000, len: 32 })
        .unwrap();
    assert_eq!(read.into_result(), Ok(9));
    assert_eq!(served.memory.copyin(0x2000, 9).unwrap(), b"anykernel".to_vec());

    let pid_ret = served.client.call(&SyscallArgs::Getpid).unwrap();
    assert_eq!(pid_ret.retval, i64::from(pid));
    let ppid_ret = served.client.call(&SyscallArgs::Getppid).unwrap();
    assert_eq!(ppid_ret.retval, 0);
}

#[test]
fn test_lwp_mirrors_follow_client_threads() {
    let served = serve_pair(Arc::new(BuiltinSyscalls));
    let pid = served.server.sessions()[0].pid;
    let registry = served.server.runtime().registry();

    served.client.lwp_create(11).unwrap();
    served.client.lwp_create(12).unwrap();
    wait_until(|| served.server.sessions()[0].mirrored_lwps == 2);
    assert_eq!(registry.lwp_count(pid), Some(3));

    served.client.lwp_exit(11).unwrap();
    wait_until(|| served.server.sessions()[0].mirrored_lwps == 1);
    assert_eq!(registry.lwp_count(pid), Some(2));
}

#[test]
fn test_disconnect_frees_session_process() {
    let served = serve_pair(Arc::new(BuiltinSyscalls));
    let pid = served.server.sessions()[0].pid;
    let runtime = served.server.runtime().clone();
    served.client.lwp_create(1).unwrap();

    served.client.close().unwrap();
    served.session.join().unwrap();

    assert!(served.server.sessions().is_empty());
    assert!(!runtime.registry().contains_process(pid));
    assert_eq!(runtime.cpus().running(), 0);
}

#[test]
fn test_calls_fail_after_close() {
    let served = serve_pair(Arc::new(BuiltinSyscalls));
    served.client.close().unwrap();
    assert!(!served.client.is_connected());
    assert!(served.client.call(&SyscallArgs::Getpid).is_err());
}

#[test]
fn test_concurrent_callers_share_one_connection() {
    let served = Arc::new(serve_pair(Arc::new(TestTable)));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let served = Arc::clone(&served);
            thread::spawn(move || {
                for n in 0..20 {
                    let args = Bytes::from(vec![0u8; i * 20 + n]);
                    let ret = served.client.syscall(SYS_ARGLEN, args).unwrap();
                    assert_eq!(ret.retval, (i * 20 + n) as i64);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Writer that accepts a few bytes per call, to provoke interleaving
#[derive(Clone, Default)]
struct Trickle(Arc<Mutex<Vec<u8>>>);

impl Write for Trickle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(3);
        self.0.lock().extend_from_slice(&buf[..n]);
        thread::yield_now();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_concurrent_sends_never_interleave() {
    let sink = Trickle::default();
    let channel = Arc::new(Channel::new(Box::new(sink.clone()), None, MAX_FRAME));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                for i in 0..25 {
                    let data = Bytes::from(vec![t as u8; 10 + i]);
                    channel.post(&Message::Copyout { addr: t, data }).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let bytes = sink.0.lock().clone();
    let mut reader = io::Cursor::new(bytes);
    let mut count = 0;
    while let Some(frame) = read_frame(&mut reader, MAX_FRAME).unwrap() {
        let (addr, data) = match frame.message {
            Message::Copyout { addr, data } => (addr, data),
            other => panic!("unexpected {:?}", other),
        };
        assert!(data.iter().all(|b| u64::from(*b) == addr));
        count += 1;
    }
    assert_eq!(count, 100);
}

/// Writer that blocks every write until the gate opens
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicUsize,
    out: Mutex<Vec<u8>>,
}

impl Gate {
    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

struct GateWriter(Arc<Gate>);

impl Write for GateWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.0.open.lock();
        while !*open {
            self.0.opened.wait(&mut open);
        }
        drop(open);
        self.0.out.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_send_turn_is_granted_in_arrival_order() {
    const QUEUED: u64 = 4;
    let gate = Arc::new(Gate::default());
    let channel = Arc::new(Channel::new(
        Box::new(GateWriter(Arc::clone(&gate))),
        None,
        MAX_FRAME,
    ));

    let post = |tag: RemoteAddr| {
        let channel = Arc::clone(&channel);
        thread::spawn(move || {
            let data = Bytes::from_static(b"x");
            channel.post(&Message::Copyout { addr: tag, data }).unwrap();
        })
    };

    // Sender 0 owns the turn and is stuck inside the writer
    let mut senders = vec![post(0)];
    wait_until(|| gate.entered.load(Ordering::SeqCst) >= 1);

    for tag in 1..=QUEUED {
        senders.push(post(tag));
        wait_until(|| channel.waiting_senders() == tag as usize);
    }

    gate.open();
    for sender in senders {
        sender.join().unwrap();
    }
    assert_eq!(channel.waiting_senders(), 0);

    let bytes = gate.out.lock().clone();
    let mut reader = io::Cursor::new(bytes);
    let mut order = Vec::new();
    while let Some(frame) = read_frame(&mut reader, MAX_FRAME).unwrap() {
        match frame.message {
            Message::Copyout { addr, .. } => order.push(addr),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(order, (0..=QUEUED).collect::<Vec<_>>());
}

#[test]
#[serial]
fn test_global_runtime_serves_socket() {
    let runtime = Runtime::init_global(RuntimeConfig::default()).clone();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anykernel.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let server = Arc::new(ProxyServer::new(runtime, Arc::new(BuiltinSyscalls)));
    {
        let server = Arc::clone(&server);
        thread::spawn(move || server.serve(listener));
    }

    let client = ProxyClient::connect(&path, Arc::new(GuestMemory::new())).unwrap();
    let ret = client.call(&SyscallArgs::Getppid).unwrap();
    assert_eq!(ret.into_result(), Ok(0));
    client.close().unwrap();
}

#[test]
#[serial]
fn test_global_runtime_is_shared() {
    let first = Runtime::init_global(RuntimeConfig::default()).clone();
    let second = Runtime::global().clone();
    assert_eq!(first.config().ncpu, second.config().ncpu);
    assert_eq!(first.registry().nprocs(), second.registry().nprocs());
}

proptest! {
    #[test]
    fn decode_frame_never_panics(buf in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_frame(&buf, 1024);
    }
}
