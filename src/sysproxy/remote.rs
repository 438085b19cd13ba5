/*!
 * Remote Address Space
 * Client memory reached through COPYIN/COPYOUT requests on the proxy channel
 */

use super::channel::Channel;
use super::protocol::Message;
use crate::core::errors::{CopyError, ProxyResult};
use crate::core::types::RemoteAddr;
use crate::lwp::AddressSpace;
use crate::runtime::WeakRuntime;
use bytes::Bytes;
use std::sync::Arc;

/// Address space of a proxy client
///
/// Copies block on the network, so they run outside kernel context: the
/// calling thread's giant lock and vCPU are dropped for the round trip.
pub struct RemoteSpace {
    channel: Arc<Channel>,
    runtime: WeakRuntime,
}

impl RemoteSpace {
    pub fn new(channel: Arc<Channel>, runtime: WeakRuntime) -> Self {
        Self { channel, runtime }
    }

    fn blocking<R>(&self, f: impl FnOnce() -> ProxyResult<R>) -> ProxyResult<R> {
        match self.runtime.upgrade() {
            Some(runtime) => runtime.unscheduled(f),
            None => f(),
        }
    }
}

impl AddressSpace for RemoteSpace {
    fn copyin(&self, addr: RemoteAddr, len: usize) -> Result<Vec<u8>, CopyError> {
        let request = Message::Copyin {
            addr,
            len: len as u64,
        };
        let response = self
            .blocking(|| self.channel.call(&request))
            .map_err(|e| CopyError::Remote(e.to_string()))?;

        match response.message {
            // A short reply means the client could not read the range
            Message::CopyinResp { data, .. } if data.len() == len => Ok(data.to_vec()),
            Message::CopyinResp { .. } => Err(CopyError::Fault { addr, len }),
            other => Err(CopyError::Remote(format!(
                "{} in response to COPYIN",
                other.kind()
            ))),
        }
    }

    fn copyout(&self, addr: RemoteAddr, data: &[u8]) -> Result<(), CopyError> {
        let request = Message::Copyout {
            addr,
            data: Bytes::copy_from_slice(data),
        };
        self.blocking(|| self.channel.post(&request))
            .map(|_| ())
            .map_err(|e| CopyError::Remote(e.to_string()))
    }

    fn kind(&self) -> &'static str {
        "remote"
    }
}
