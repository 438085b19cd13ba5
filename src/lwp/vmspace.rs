/*!
 * Address Spaces
 *
 * A process's address-space token. Copy operations go through the
 * `AddressSpace` trait so a process may live in local memory or in a remote
 * syscall-proxy client.
 */

use crate::core::errors::CopyError;
use crate::core::types::RemoteAddr;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Memory that kernel code can copy into and out of
pub trait AddressSpace: Send + Sync {
    /// Read `len` bytes at `addr`
    fn copyin(&self, addr: RemoteAddr, len: usize) -> Result<Vec<u8>, CopyError>;

    /// Write `data` at `addr`
    fn copyout(&self, addr: RemoteAddr, data: &[u8]) -> Result<(), CopyError>;

    /// Short name for logs
    fn kind(&self) -> &'static str;
}

static NEXT_VMSPACE: AtomicU64 = AtomicU64::new(1);

/// Address-space token held by a process
#[derive(Clone)]
pub struct VmSpace {
    id: u64,
    space: Arc<dyn AddressSpace>,
}

impl VmSpace {
    pub fn new(space: Arc<dyn AddressSpace>) -> Self {
        Self {
            id: NEXT_VMSPACE.fetch_add(1, Ordering::Relaxed),
            space,
        }
    }

    /// Fresh, empty local guest memory
    pub fn local() -> Self {
        Self::new(Arc::new(GuestMemory::new()))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    pub fn copyin(&self, addr: RemoteAddr, len: usize) -> Result<Vec<u8>, CopyError> {
        self.space.copyin(addr, len)
    }

    pub fn copyout(&self, addr: RemoteAddr, data: &[u8]) -> Result<(), CopyError> {
        self.space.copyout(addr, data)
    }
}

impl fmt::Debug for VmSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmSpace")
            .field("id", &self.id)
            .field("kind", &self.space.kind())
            .finish()
    }
}

struct Region {
    base: RemoteAddr,
    bytes: Vec<u8>,
}

impl Region {
    fn end(&self) -> RemoteAddr {
        self.base + self.bytes.len() as RemoteAddr
    }
}

/// Region-mapped memory
///
/// Accesses must fall entirely inside one mapped region; anything else is a
/// fault. Used for client processes talking to a proxy server, and as the
/// default space of local processes.
#[derive(Default)]
pub struct GuestMemory {
    regions: RwLock<Vec<Region>>,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `len` zeroed bytes at `base`
    ///
    /// Returns false when the range overlaps an existing region or wraps.
    pub fn map(&self, base: RemoteAddr, len: usize) -> bool {
        let Some(end) = base.checked_add(len as RemoteAddr) else {
            return false;
        };
        let mut regions = self.regions.write();
        if regions.iter().any(|r| base < r.end() && r.base < end) {
            return false;
        }
        regions.push(Region {
            base,
            bytes: vec![0; len],
        });
        true
    }

    /// Unmap the region starting at `base`
    pub fn unmap(&self, base: RemoteAddr) -> bool {
        let mut regions = self.regions.write();
        let before = regions.len();
        regions.retain(|r| r.base != base);
        regions.len() != before
    }

    fn locate(regions: &[Region], addr: RemoteAddr, len: usize) -> Option<(usize, usize)> {
        let end = addr.checked_add(len as RemoteAddr)?;
        regions.iter().enumerate().find_map(|(i, r)| {
            (r.base <= addr && end <= r.end()).then(|| (i, (addr - r.base) as usize))
        })
    }
}

impl AddressSpace for GuestMemory {
    fn copyin(&self, addr: RemoteAddr, len: usize) -> Result<Vec<u8>, CopyError> {
        let regions = self.regions.read();
        let (i, off) = Self::locate(&regions, addr, len).ok_or(CopyError::Fault { addr, len })?;
        Ok(regions[i].bytes[off..off + len].to_vec())
    }

    fn copyout(&self, addr: RemoteAddr, data: &[u8]) -> Result<(), CopyError> {
        let len = data.len();
        let mut regions = self.regions.write();
        let (i, off) = Self::locate(&regions, addr, len).ok_or(CopyError::Fault { addr, len })?;
        regions[i].bytes[off..off + len].copy_from_slice(data);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "guest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copyout_then_copyin() {
        let mem = GuestMemory::new();
        assert!(mem.map(0x1000, 0x100));

        mem.copyout(0x1010, b"abcdef").unwrap();
        assert_eq!(mem.copyin(0x1010, 6).unwrap(), b"abcdef");
        assert_eq!(mem.copyin(0x1000, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_faults_outside_regions() {
        let mem = GuestMemory::new();
        assert!(mem.map(0x1000, 0x10));

        assert_eq!(
            mem.copyin(0x100f, 2),
            Err(CopyError::Fault {
                addr: 0x100f,
                len: 2
            })
        );
        assert!(mem.copyout(0x2000, b"x").is_err());
        assert!(mem.copyin(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_overlapping_map_rejected() {
        let mem = GuestMemory::new();
        assert!(mem.map(0x1000, 0x100));
        assert!(!mem.map(0x10ff, 0x10));
        assert!(mem.map(0x1100, 0x10));
        assert!(mem.unmap(0x1000));
        assert!(mem.map(0x1000, 0x10));
    }

    #[test]
    fn test_vmspace_ids_unique() {
        assert_ne!(VmSpace::local().id(), VmSpace::local().id());
    }
}
