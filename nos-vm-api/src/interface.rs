//! Collaborator interfaces
//!
//! The virtual-memory subsystem consumes these services and never
//! reimplements them. Every method takes `&self`: implementations do their
//! own locking, because the subsystem calls them from many threads.

use crate::addr::{Fd, PhysFrame, SpaceId, VirtAddr, SECTOR_SIZE};
use crate::flags::AllocFlags;

/// Trait for the physical page allocator
///
/// The kernel reaches every frame through its direct map, so frame contents
/// are read and written through the allocator as well.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame, or `None` when the pool is empty
    fn alloc_frame(&self, flags: AllocFlags) -> Option<PhysFrame>;

    /// Returns a frame to the pool
    fn free_frame(&self, frame: PhysFrame);

    /// Copies `buf.len()` bytes out of `frame` starting at `offset`
    fn read_frame(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]);

    /// Copies `data` into `frame` starting at `offset`
    fn write_frame(&self, frame: PhysFrame, offset: usize, data: &[u8]);
}

/// Trait for the hardware address-space mapping layer
pub trait HardwareMapper: Send + Sync {
    /// Maps `vaddr` to `frame` in `space`; false if the mapping could not be created
    fn install_mapping(&self, space: SpaceId, vaddr: VirtAddr, frame: PhysFrame, writable: bool) -> bool;

    /// Removes the mapping for `vaddr`, if any
    ///
    /// Like a cleared present bit, this leaves the accessed and dirty bits
    /// readable until the address is mapped again.
    fn clear_mapping(&self, space: SpaceId, vaddr: VirtAddr);

    /// Returns the frame `vaddr` is mapped to
    fn query_mapping(&self, space: SpaceId, vaddr: VirtAddr) -> Option<PhysFrame>;

    /// Returns and clears the dirty bit of the mapping for `vaddr`
    fn get_and_clear_dirty(&self, space: SpaceId, vaddr: VirtAddr) -> bool;

    /// Returns and clears the accessed bit of the mapping for `vaddr`
    fn get_and_clear_accessed(&self, space: SpaceId, vaddr: VirtAddr) -> bool;
}

/// Trait for the block device holding the swap partition
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device
    fn sector_count(&self) -> usize;

    /// Reads one sector
    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]);

    /// Writes one sector
    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]);
}

/// Trait for the file system backing memory-mapped files
pub trait FileSystem: Send + Sync {
    /// Length of the open file, or `None` if `fd` is not a readable file
    fn file_length(&self, fd: Fd) -> Option<usize>;

    /// Moves the file position of `fd`
    fn seek(&self, fd: Fd, offset: usize);

    /// Reads at the current position, returning the bytes read
    fn read(&self, fd: Fd, buf: &mut [u8]) -> usize;

    /// Writes at the current position, returning the bytes written
    fn write(&self, fd: Fd, buf: &[u8]) -> usize;

    /// Opens an independent descriptor on the same file
    fn reopen(&self, fd: Fd) -> Option<Fd>;

    /// Closes the descriptor
    fn close(&self, fd: Fd);
}
