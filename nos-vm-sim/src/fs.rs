//! In-memory file system

use hashbrown::HashMap;
use spin::Mutex;

use nos_vm_api::{Fd, FileSystem};

struct OpenFile {
    inode: usize,
    pos: usize,
}

struct FsState {
    files: Vec<Vec<u8>>,
    open: HashMap<i32, OpenFile>,
    next_fd: i32,
}

/// Flat file system: files are byte vectors, descriptors are per-open
/// cursors. Writes never grow a file.
pub struct MemFs {
    state: Mutex<FsState>,
}

impl MemFs {
    /// Descriptors 0 and 1 belong to the console.
    const FIRST_FD: i32 = 2;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(FsState {
                files: Vec::new(),
                open: HashMap::new(),
                next_fd: Self::FIRST_FD,
            }),
        }
    }

    /// Creates a file holding `data` and opens it.
    pub fn create(&self, data: &[u8]) -> Fd {
        let mut state = self.state.lock();
        state.files.push(data.to_vec());
        let inode = state.files.len() - 1;
        Self::open_locked(&mut state, inode)
    }

    /// Current contents of the file behind `fd`.
    pub fn contents(&self, fd: Fd) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let inode = state.open.get(&fd.0)?.inode;
        Some(state.files[inode].clone())
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    fn open_locked(state: &mut FsState, inode: usize) -> Fd {
        let fd = state.next_fd;
        state.next_fd += 1;
        state.open.insert(fd, OpenFile { inode, pos: 0 });
        Fd(fd)
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemFs {
    fn file_length(&self, fd: Fd) -> Option<usize> {
        let state = self.state.lock();
        let inode = state.open.get(&fd.0)?.inode;
        Some(state.files[inode].len())
    }

    fn seek(&self, fd: Fd, offset: usize) {
        if let Some(file) = self.state.lock().open.get_mut(&fd.0) {
            file.pos = offset;
        }
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        let FsState { files, open, .. } = &mut *state;
        let Some(file) = open.get_mut(&fd.0) else {
            return 0;
        };
        let data = &files[file.inode];
        let start = file.pos.min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        file.pos += count;
        count
    }

    fn write(&self, fd: Fd, buf: &[u8]) -> usize {
        let mut state = self.state.lock();
        let FsState { files, open, .. } = &mut *state;
        let Some(file) = open.get_mut(&fd.0) else {
            return 0;
        };
        let data = &mut files[file.inode];
        let start = file.pos.min(data.len());
        let count = buf.len().min(data.len() - start);
        data[start..start + count].copy_from_slice(&buf[..count]);
        file.pos += count;
        count
    }

    fn reopen(&self, fd: Fd) -> Option<Fd> {
        let mut state = self.state.lock();
        let inode = state.open.get(&fd.0)?.inode;
        Some(Self::open_locked(&mut state, inode))
    }

    fn close(&self, fd: Fd) {
        self.state.lock().open.remove(&fd.0);
    }
}
