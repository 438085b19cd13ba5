/*!
 * RPC Channel
 *
 * One connected byte stream shared by many callers.
 *
 * # Send discipline
 *
 * Exactly one sender owns the write turn. Others queue FIFO, each on its
 * own condvar, and the finishing sender hands the turn straight to the head
 * of the queue. Frames are therefore never interleaved and go out in the
 * order their senders queued.
 *
 * # Call matching
 *
 * A caller registers its request number in the receive queue before
 * sending, so a fast response cannot arrive unmatched. The receiver removes
 * the entry when it delivers, which makes delivery at-most-once; responses
 * with no entry are dropped.
 *
 * # Failure
 *
 * Any I/O or protocol error kills the channel: the stream is shut down and
 * every pending call fails with `ProxyError::Disconnected`.
 */

use super::protocol::{read_frame, Frame, Message};
use crate::core::errors::{ProxyError, ProxyResult};
use crate::core::id::{IdGenerator, ReqNoGenerator};
use crate::core::types::ReqNo;
use ahash::RandomState;
use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

struct TurnWaiter {
    granted: Mutex<bool>,
    cv: Condvar,
}

#[derive(Default)]
struct TurnState {
    busy: bool,
    queue: VecDeque<Arc<TurnWaiter>>,
}

enum Reply {
    Waiting,
    Done(Message),
    Aborted,
}

struct Pending {
    reply: Mutex<Reply>,
    cv: Condvar,
}

type Closer = Box<dyn Fn() + Send + Sync>;

/// Request/response channel over one byte stream
pub struct Channel {
    writer: Mutex<Box<dyn Write + Send>>,
    closer: Option<Closer>,
    turn: Mutex<TurnState>,
    recvq: Mutex<HashMap<ReqNo, Arc<Pending>, RandomState>>,
    reqnos: ReqNoGenerator,
    dead: AtomicBool,
    max_frame_len: usize,
}

impl Channel {
    /// Channel writing to `writer`; `closer` shuts the stream down on failure
    pub fn new(writer: Box<dyn Write + Send>, closer: Option<Closer>, max_frame_len: usize) -> Self {
        Self {
            writer: Mutex::new(writer),
            closer,
            turn: Mutex::new(TurnState::default()),
            recvq: Mutex::new(HashMap::default()),
            reqnos: ReqNoGenerator::new(1),
            dead: AtomicBool::new(false),
            max_frame_len,
        }
    }

    /// Channel over a unix stream, plus the read half for the receiver
    pub fn over_unix(stream: UnixStream, max_frame_len: usize) -> io::Result<(Arc<Self>, UnixStream)> {
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        let channel = Self::new(
            Box::new(stream),
            Some(Box::new(move || {
                let _ = closer.shutdown(Shutdown::Both);
            })),
            max_frame_len,
        );
        Ok((Arc::new(channel), reader))
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Number of calls waiting for a response
    pub fn pending(&self) -> usize {
        self.recvq.lock().len()
    }

    /// Senders queued behind the one holding the write turn
    pub fn waiting_senders(&self) -> usize {
        self.turn.lock().queue.len()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    fn acquire_turn(&self) {
        let waiter = {
            let mut turn = self.turn.lock();
            if !turn.busy {
                turn.busy = true;
                return;
            }
            let waiter = Arc::new(TurnWaiter {
                granted: Mutex::new(false),
                cv: Condvar::new(),
            });
            turn.queue.push_back(Arc::clone(&waiter));
            waiter
        };

        let mut granted = waiter.granted.lock();
        while !*granted {
            waiter.cv.wait(&mut granted);
        }
    }

    fn release_turn(&self) {
        let mut turn = self.turn.lock();
        match turn.queue.pop_front() {
            // busy stays set: the turn passes without going idle
            Some(next) => {
                *next.granted.lock() = true;
                next.cv.notify_one();
            }
            None => turn.busy = false,
        }
    }

    /// Write one frame when this sender's turn comes
    pub fn send(&self, reqno: ReqNo, message: &Message) -> ProxyResult<()> {
        if self.is_dead() {
            return Err(ProxyError::Disconnected);
        }
        let mut buf = BytesMut::new();
        message.encode(reqno, &mut buf);

        self.acquire_turn();
        let written = {
            let mut writer = self.writer.lock();
            writer.write_all(&buf).and_then(|()| writer.flush())
        };
        self.release_turn();

        written.map_err(|e| {
            warn!(error = %e, "send failed; closing channel");
            self.kill();
            ProxyError::Io(e)
        })
    }

    /// Send a request and block until its response arrives
    pub fn call(&self, message: &Message) -> ProxyResult<Frame> {
        let pending = Arc::new(Pending {
            reply: Mutex::new(Reply::Waiting),
            cv: Condvar::new(),
        });
        let reqno = {
            let mut recvq = self.recvq.lock();
            let reqno = self.reqnos.next_unused(|n| recvq.contains_key(&n));
            recvq.insert(reqno, Arc::clone(&pending));
            reqno
        };

        // kill() marks the channel dead before draining the queue
        if self.is_dead() {
            self.recvq.lock().remove(&reqno);
            return Err(ProxyError::Disconnected);
        }
        if let Err(e) = self.send(reqno, message) {
            self.recvq.lock().remove(&reqno);
            return Err(e);
        }

        let mut reply = pending.reply.lock();
        loop {
            match std::mem::replace(&mut *reply, Reply::Waiting) {
                Reply::Done(message) => return Ok(Frame::new(reqno, message)),
                Reply::Aborted => return Err(ProxyError::Disconnected),
                Reply::Waiting => pending.cv.wait(&mut reply),
            }
        }
    }

    /// Send a request that gets no response
    pub fn post(&self, message: &Message) -> ProxyResult<ReqNo> {
        let reqno = {
            let recvq = self.recvq.lock();
            self.reqnos.next_unused(|n| recvq.contains_key(&n))
        };
        self.send(reqno, message)?;
        Ok(reqno)
    }

    /// Answer request `reqno`
    pub fn reply(&self, reqno: ReqNo, message: &Message) -> ProxyResult<()> {
        self.send(reqno, message)
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Hand a response to its caller; false if nobody is waiting for it
    pub fn deliver(&self, reqno: ReqNo, message: Message) -> bool {
        let Some(pending) = self.recvq.lock().remove(&reqno) else {
            trace!(reqno, kind = message.kind(), "dropping unmatched response");
            return false;
        };
        *pending.reply.lock() = Reply::Done(message);
        pending.cv.notify_one();
        true
    }

    /// Read frames until the stream ends or fails
    ///
    /// Responses are delivered to their callers; requests go to `handler`.
    /// A handler error kills the channel like an I/O error does. Returns
    /// `Ok` on a clean end of stream or after a local `close`.
    pub fn run_receiver<R, H>(&self, mut reader: R, mut handler: H) -> ProxyResult<()>
    where
        R: Read,
        H: FnMut(Frame) -> ProxyResult<()>,
    {
        let result = loop {
            let frame = match read_frame(&mut reader, self.max_frame_len) {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(_) if self.is_dead() => break Ok(()),
                Err(e) => break Err(e),
            };

            if frame.message.message_type().is_response() {
                self.deliver(frame.reqno, frame.message);
                continue;
            }
            if let Err(e) = handler(frame) {
                break Err(e);
            }
        };

        match &result {
            Ok(()) => debug!("channel closed"),
            Err(e) => warn!(error = %e, "channel failed"),
        }
        self.kill();
        result
    }

    /// Shut the stream down and abort every pending call
    pub fn close(&self) {
        self.kill();
    }

    fn kill(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(closer) = &self.closer {
            closer();
        }

        let aborted: Vec<_> = self.recvq.lock().drain().map(|(_, p)| p).collect();
        if !aborted.is_empty() {
            debug!(calls = aborted.len(), "aborting pending calls");
        }
        for pending in aborted {
            *pending.reply.lock() = Reply::Aborted;
            pending.cv.notify_one();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.kill();
    }
}
