//! Backing files for file-backed pages

use alloc::sync::Arc;
use spin::Mutex;

use nos_vm_api::{Fd, FileSystem, Result, VmError};

/// An open file that file-backed pages read from and write back to.
///
/// The descriptor is owned: it is closed exactly once, by [`close`] or on
/// drop. `seek` followed by `read`/`write` is not atomic in the file-system
/// interface, so positional I/O holds the handle's lock across both calls.
///
/// [`close`]: BackingFile::close
pub struct BackingFile {
    fs: Arc<dyn FileSystem>,
    fd: Fd,
    length: usize,
    /// true once the descriptor has been closed
    closed: Mutex<bool>,
}

impl BackingFile {
    /// Opens an independent handle on the file behind `fd`.
    ///
    /// Fails on descriptors the file system does not know and on empty files.
    pub fn reopen(fs: Arc<dyn FileSystem>, fd: Fd) -> Result<Arc<Self>> {
        let length = match fs.file_length(fd) {
            Some(0) => return Err(VmError::InvalidArgument("empty file")),
            Some(length) => length,
            None => return Err(VmError::InvalidArgument("unreadable file")),
        };
        let fd = fs.reopen(fd).ok_or(VmError::IoError("reopen failed"))?;
        Ok(Arc::new(Self {
            fs,
            fd,
            length,
            closed: Mutex::new(false),
        }))
    }

    /// The descriptor this handle owns.
    pub fn fd(&self) -> Fd {
        self.fd
    }

    /// File length when the handle was opened.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the file was empty when opened.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Reads into `buf` from `offset`, returning the bytes read.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let closed = self.closed.lock();
        if *closed {
            return 0;
        }
        self.fs.seek(self.fd, offset);
        self.fs.read(self.fd, buf)
    }

    /// Writes `data` at `offset`, returning the bytes written.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> usize {
        let closed = self.closed.lock();
        if *closed {
            return 0;
        }
        self.fs.seek(self.fd, offset);
        self.fs.write(self.fd, data)
    }

    /// Closes the descriptor. Later reads and writes transfer nothing.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if !*closed {
            self.fs.close(self.fd);
            *closed = true;
        }
    }
}

impl Drop for BackingFile {
    fn drop(&mut self) {
        self.close();
    }
}
