/*!
 * Wire Protocol
 *
 * Every frame is a fixed 16-byte header followed by a type-specific body:
 *
 * ```text
 * Header:       { u64 total_length; u32 reqno; i32 type }
 * LWP_CREATE:   { i32 lwpid }
 * LWP_EXIT:     { i32 lwpid }
 * SYSCALL:      { i32 number; bytes args }
 * SYSCALL_RESP: { i32 error; i64 retval }
 * COPYIN:       { u64 addr; u64 len }
 * COPYIN_RESP:  { u64 addr; u64 len; bytes[len] data }
 * COPYOUT:      { u64 addr; u64 len; bytes[len] data }
 * COPYOUT_RESP: { u64 addr; u64 len }
 * ```
 *
 * `total_length` includes the header. Integers use host byte order, so both
 * ends must share one ABI.
 */

use crate::core::errors::{ProtocolError, ProxyError};
use crate::core::limits::RPC_HEADER_LEN;
use crate::core::types::{RawErrno, RemoteAddr, ReqNo};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read, Write};

/// Message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    LwpCreate = 0,
    LwpExit = 1,
    Syscall = 2,
    SyscallResp = 3,
    Copyin = 4,
    CopyinResp = 5,
    Copyout = 6,
    CopyoutResp = 7,
}

impl MessageType {
    /// Responses are matched to pending calls by request number
    #[inline]
    pub const fn is_response(self) -> bool {
        matches!(
            self,
            Self::SyscallResp | Self::CopyinResp | Self::CopyoutResp
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::LwpCreate => "LWP_CREATE",
            Self::LwpExit => "LWP_EXIT",
            Self::Syscall => "SYSCALL",
            Self::SyscallResp => "SYSCALL_RESP",
            Self::Copyin => "COPYIN",
            Self::CopyinResp => "COPYIN_RESP",
            Self::Copyout => "COPYOUT",
            Self::CopyoutResp => "COPYOUT_RESP",
        }
    }
}

impl TryFrom<i32> for MessageType {
    type Error = ProtocolError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::LwpCreate,
            1 => Self::LwpExit,
            2 => Self::Syscall,
            3 => Self::SyscallResp,
            4 => Self::Copyin,
            5 => Self::CopyinResp,
            6 => Self::Copyout,
            7 => Self::CopyoutResp,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    LwpCreate { lwpid: i32 },
    LwpExit { lwpid: i32 },
    Syscall { number: i32, args: Bytes },
    SyscallResp { error: RawErrno, retval: i64 },
    Copyin { addr: RemoteAddr, len: u64 },
    CopyinResp { addr: RemoteAddr, data: Bytes },
    Copyout { addr: RemoteAddr, data: Bytes },
    CopyoutResp { addr: RemoteAddr, len: u64 },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::LwpCreate { .. } => MessageType::LwpCreate,
            Self::LwpExit { .. } => MessageType::LwpExit,
            Self::Syscall { .. } => MessageType::Syscall,
            Self::SyscallResp { .. } => MessageType::SyscallResp,
            Self::Copyin { .. } => MessageType::Copyin,
            Self::CopyinResp { .. } => MessageType::CopyinResp,
            Self::Copyout { .. } => MessageType::Copyout,
            Self::CopyoutResp { .. } => MessageType::CopyoutResp,
        }
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        self.message_type().name()
    }

    fn body_len(&self) -> usize {
        match self {
            Self::LwpCreate { .. } | Self::LwpExit { .. } => 4,
            Self::Syscall { args, .. } => 4 + args.len(),
            Self::SyscallResp { .. } => 12,
            Self::Copyin { .. } | Self::CopyoutResp { .. } => 16,
            Self::CopyinResp { data, .. } | Self::Copyout { data, .. } => 16 + data.len(),
        }
    }

    /// Append header and body to `buf`
    pub fn encode(&self, reqno: ReqNo, buf: &mut BytesMut) {
        let total = RPC_HEADER_LEN + self.body_len();
        buf.reserve(total);
        buf.put_u64_ne(total as u64);
        buf.put_u32_ne(reqno);
        buf.put_i32_ne(self.message_type() as i32);

        match self {
            Self::LwpCreate { lwpid } | Self::LwpExit { lwpid } => buf.put_i32_ne(*lwpid),
            Self::Syscall { number, args } => {
                buf.put_i32_ne(*number);
                buf.put_slice(args);
            }
            Self::SyscallResp { error, retval } => {
                buf.put_i32_ne(*error);
                buf.put_i64_ne(*retval);
            }
            Self::Copyin { addr, len } | Self::CopyoutResp { addr, len } => {
                buf.put_u64_ne(*addr);
                buf.put_u64_ne(*len);
            }
            Self::CopyinResp { addr, data } | Self::Copyout { addr, data } => {
                buf.put_u64_ne(*addr);
                buf.put_u64_ne(data.len() as u64);
                buf.put_slice(data);
            }
        }
    }

    /// Decode a body of the given type
    pub fn decode(kind: MessageType, mut body: Bytes) -> Result<Self, ProtocolError> {
        let what = kind.name();
        let message = match kind {
            MessageType::LwpCreate => {
                need(&body, what, 4)?;
                Self::LwpCreate {
                    lwpid: body.get_i32_ne(),
                }
            }
            MessageType::LwpExit => {
                need(&body, what, 4)?;
                Self::LwpExit {
                    lwpid: body.get_i32_ne(),
                }
            }
            MessageType::Syscall => {
                need(&body, what, 4)?;
                let number = body.get_i32_ne();
                return Ok(Self::Syscall { number, args: body });
            }
            MessageType::SyscallResp => {
                need(&body, what, 12)?;
                Self::SyscallResp {
                    error: body.get_i32_ne(),
                    retval: body.get_i64_ne(),
                }
            }
            MessageType::Copyin | MessageType::CopyoutResp => {
                need(&body, what, 16)?;
                let addr = body.get_u64_ne();
                let len = body.get_u64_ne();
                if kind == MessageType::Copyin {
                    Self::Copyin { addr, len }
                } else {
                    Self::CopyoutResp { addr, len }
                }
            }
            MessageType::CopyinResp | MessageType::Copyout => {
                need(&body, what, 16)?;
                let addr = body.get_u64_ne();
                let len = usize::try_from(body.get_u64_ne()).unwrap_or(usize::MAX);
                need(&body, what, len)?;
                let data = body.split_to(len);
                if kind == MessageType::CopyinResp {
                    Self::CopyinResp { addr, data }
                } else {
                    Self::Copyout { addr, data }
                }
            }
        };

        if body.has_remaining() {
            return Err(ProtocolError::TrailingBytes {
                what,
                extra: body.remaining(),
            });
        }
        Ok(message)
    }
}

fn need(body: &Bytes, what: &'static str, expected: usize) -> Result<(), ProtocolError> {
    if body.remaining() < expected {
        return Err(ProtocolError::Truncated {
            what,
            expected,
            actual: body.remaining(),
        });
    }
    Ok(())
}

/// A message with its request number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reqno: ReqNo,
    pub message: Message,
}

impl Frame {
    pub fn new(reqno: ReqNo, message: Message) -> Self {
        Self { reqno, message }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.message.encode(self.reqno, &mut buf);
        buf.freeze()
    }
}

/// Parsed fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub total_len: u64,
    pub reqno: ReqNo,
    pub kind: MessageType,
}

impl Header {
    /// Parse and validate a header against the frame size limit
    pub fn decode(raw: &[u8; RPC_HEADER_LEN], max_frame_len: usize) -> Result<Self, ProtocolError> {
        let mut buf = &raw[..];
        let total_len = buf.get_u64_ne();
        let reqno = buf.get_u32_ne();
        let kind = MessageType::try_from(buf.get_i32_ne())?;

        if total_len < RPC_HEADER_LEN as u64 {
            return Err(ProtocolError::BadLength { len: total_len });
        }
        if total_len - RPC_HEADER_LEN as u64 > max_frame_len as u64 {
            return Err(ProtocolError::FrameTooLarge {
                len: total_len,
                max: max_frame_len,
            });
        }
        Ok(Self {
            total_len,
            reqno,
            kind,
        })
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        (self.total_len - RPC_HEADER_LEN as u64) as usize
    }
}

/// Decode one frame from a complete buffer
pub fn decode_frame(buf: &[u8], max_frame_len: usize) -> Result<Frame, ProtocolError> {
    let Some(raw) = buf.get(..RPC_HEADER_LEN) else {
        return Err(ProtocolError::Truncated {
            what: "header",
            expected: RPC_HEADER_LEN,
            actual: buf.len(),
        });
    };
    let mut header_bytes = [0u8; RPC_HEADER_LEN];
    header_bytes.copy_from_slice(raw);
    let header = Header::decode(&header_bytes, max_frame_len)?;

    let body = &buf[RPC_HEADER_LEN..];
    if body.len() < header.body_len() {
        return Err(ProtocolError::Truncated {
            what: "frame",
            expected: header.body_len(),
            actual: body.len(),
        });
    }
    if body.len() > header.body_len() {
        return Err(ProtocolError::TrailingBytes {
            what: "frame",
            extra: body.len() - header.body_len(),
        });
    }
    let message = Message::decode(header.kind, Bytes::copy_from_slice(body))?;
    Ok(Frame::new(header.reqno, message))
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut off = 0usize;
    while off < buf.len() {
        let n = match reader.read(&mut buf[off..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            if off == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ));
        }
        off += n;
    }
    Ok(true)
}

/// Read one frame; `None` on a clean end of stream between frames
pub fn read_frame(reader: &mut impl Read, max_frame_len: usize) -> Result<Option<Frame>, ProxyError> {
    let mut raw = [0u8; RPC_HEADER_LEN];
    if !read_exact_or_eof(reader, &mut raw)? {
        return Ok(None);
    }
    let header = Header::decode(&raw, max_frame_len)?;

    let mut body = vec![0u8; header.body_len()];
    reader.read_exact(&mut body)?;
    let message = Message::decode(header.kind, Bytes::from(body))?;
    Ok(Some(Frame::new(header.reqno, message)))
}

/// Write one complete frame
pub fn write_frame(writer: &mut impl Write, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.to_bytes())?;
    writer.flush()
}
