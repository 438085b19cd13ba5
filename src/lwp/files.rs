/*!
 * Descriptor Tables
 * Per-process file descriptor tables over opaque kernel file objects
 */

use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Kernel-side object behind a descriptor
pub trait KernelFile: Send + Sync + fmt::Debug {
    /// Read up to `len` bytes
    fn read(&self, len: usize) -> Result<Vec<u8>, Errno>;

    /// Write `data`, returning bytes accepted
    fn write(&self, data: &[u8]) -> Result<usize, Errno>;
}

/// In-memory byte stream: writes append, reads drain from the front
#[derive(Debug, Default)]
pub struct MemFile {
    data: Mutex<VecDeque<u8>>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: &[u8]) -> Self {
        Self {
            data: Mutex::new(contents.iter().copied().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl KernelFile for MemFile {
    fn read(&self, len: usize) -> Result<Vec<u8>, Errno> {
        let mut data = self.data.lock();
        let n = len.min(data.len());
        Ok(data.drain(..n).collect())
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, Errno> {
        self.data.lock().extend(bytes.iter().copied());
        Ok(bytes.len())
    }
}

/// File descriptor table
///
/// Descriptors are allocated lowest-free-first, like the host kernel does.
pub struct DescriptorTable {
    files: Mutex<BTreeMap<i32, Arc<dyn KernelFile>>>,
    max: usize,
}

impl DescriptorTable {
    pub fn new(max: usize) -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            max,
        }
    }

    /// Copy of this table sharing the underlying file objects
    pub fn duplicate(&self) -> Self {
        Self {
            files: Mutex::new(self.files.lock().clone()),
            max: self.max,
        }
    }

    /// Install a file at the lowest free descriptor
    pub fn install(&self, file: Arc<dyn KernelFile>) -> Result<i32, Errno> {
        let mut files = self.files.lock();
        if files.len() >= self.max {
            return Err(Errno::EMFILE);
        }
        let fd = lowest_free(&files);
        files.insert(fd, file);
        Ok(fd)
    }

    pub fn get(&self, fd: i32) -> Result<Arc<dyn KernelFile>, Errno> {
        self.files.lock().get(&fd).cloned().ok_or(Errno::EBADF)
    }

    pub fn close(&self, fd: i32) -> Result<(), Errno> {
        self.files
            .lock()
            .remove(&fd)
            .map(|_| ())
            .ok_or(Errno::EBADF)
    }

    /// Duplicate `fd` onto the lowest free descriptor
    pub fn dup(&self, fd: i32) -> Result<i32, Errno> {
        let file = self.get(fd)?;
        self.install(file)
    }

    /// Drop every descriptor
    pub fn clear(&self) -> usize {
        let mut files = self.files.lock();
        let n = files.len();
        files.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorTable")
            .field("open", &self.len())
            .field("max", &self.max)
            .finish()
    }
}

fn lowest_free(files: &BTreeMap<i32, Arc<dyn KernelFile>>) -> i32 {
    let mut fd = 0;
    for &used in files.keys() {
        if used != fd {
            break;
        }
        fd += 1;
    }
    fd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_descriptor() {
        let table = DescriptorTable::new(8);
        let a = table.install(Arc::new(MemFile::new())).unwrap();
        let b = table.install(Arc::new(MemFile::new())).unwrap();
        assert_eq!((a, b), (0, 1));

        table.close(0).unwrap();
        assert_eq!(table.install(Arc::new(MemFile::new())).unwrap(), 0);
        assert_eq!(table.close(7), Err(Errno::EBADF));
    }

    #[test]
    fn test_table_limit() {
        let table = DescriptorTable::new(1);
        table.install(Arc::new(MemFile::new())).unwrap();
        assert_eq!(table.install(Arc::new(MemFile::new())), Err(Errno::EMFILE));
    }

    #[test]
    fn test_duplicate_shares_files() {
        let table = DescriptorTable::new(8);
        let fd = table.install(Arc::new(MemFile::new())).unwrap();
        let copy = table.duplicate();

        copy.get(fd).unwrap().write(b"shared").unwrap();
        assert_eq!(table.get(fd).unwrap().read(16).unwrap(), b"shared");

        copy.close(fd).unwrap();
        assert!(table.get(fd).is_ok());
    }

    #[test]
    fn test_memfile_drains() {
        let file = MemFile::with_contents(b"hello world");
        assert_eq!(file.read(5).unwrap(), b"hello");
        assert_eq!(file.len(), 6);
        assert_eq!(file.read(100).unwrap(), b" world");
        assert!(file.is_empty());
    }
}
