//! Physical frame pool

use spin::Mutex;

use nos_vm_api::{AllocFlags, FrameAllocator, PhysFrame, PAGE_SIZE};

struct FramePool {
    memory: Vec<[u8; PAGE_SIZE]>,
    /// Free frame numbers; the lowest is handed out first
    free: Vec<usize>,
    allocated: Vec<bool>,
}

/// A fixed number of page frames in host memory.
///
/// Misuse panics: freeing a free frame, or touching the contents of a frame
/// that is not allocated, means the caller lost track of ownership.
pub struct RamFrames {
    pool: Mutex<FramePool>,
}

impl RamFrames {
    pub fn new(count: usize) -> Self {
        Self {
            pool: Mutex::new(FramePool {
                memory: vec![[0; PAGE_SIZE]; count],
                free: (0..count).rev().collect(),
                allocated: vec![false; count],
            }),
        }
    }

    /// Total number of frames.
    pub fn capacity(&self) -> usize {
        self.pool.lock().memory.len()
    }

    /// Frames not currently allocated.
    pub fn free_count(&self) -> usize {
        self.pool.lock().free.len()
    }

    /// Whether `frame` is currently allocated.
    pub fn is_allocated(&self, frame: PhysFrame) -> bool {
        self.pool.lock().allocated.get(frame.number()).copied().unwrap_or(false)
    }
}

impl FrameAllocator for RamFrames {
    fn alloc_frame(&self, flags: AllocFlags) -> Option<PhysFrame> {
        let mut pool = self.pool.lock();
        let number = pool.free.pop()?;
        pool.allocated[number] = true;
        if flags.contains(AllocFlags::ZERO) {
            pool.memory[number].fill(0);
        }
        Some(PhysFrame::new(number))
    }

    fn free_frame(&self, frame: PhysFrame) {
        let mut pool = self.pool.lock();
        let number = frame.number();
        assert!(pool.allocated[number], "double free of {}", frame);
        pool.allocated[number] = false;
        // Poison so a stale reader sees garbage rather than old data.
        pool.memory[number].fill(0xDD);
        pool.free.push(number);
    }

    fn read_frame(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]) {
        let pool = self.pool.lock();
        assert!(pool.allocated[frame.number()], "read of free {}", frame);
        buf.copy_from_slice(&pool.memory[frame.number()][offset..offset + buf.len()]);
    }

    fn write_frame(&self, frame: PhysFrame, offset: usize, data: &[u8]) {
        let mut pool = self.pool.lock();
        assert!(pool.allocated[frame.number()], "write to free {}", frame);
        pool.memory[frame.number()][offset..offset + data.len()].copy_from_slice(data);
    }
}
