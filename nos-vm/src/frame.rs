//! Frame table
//!
//! Tracks every physical frame currently lent to a user page and picks
//! eviction victims with the second-chance (clock) policy.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use bitflags::bitflags;
use nos_vm_api::{AllocFlags, FrameAllocator, HardwareMapper, PhysFrame, Result, SpaceId, VirtAddr, VmError};

use crate::page::PageEntry;
use crate::swap::SwapStore;

bitflags! {
    /// Per-frame bookkeeping bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Must not be evicted
        const PINNED = 1 << 0;
        /// Used since the clock hand last passed
        const REFERENCED = 1 << 1;
        /// Handed out but not yet filled and mapped
        const LOADING = 1 << 2;
    }
}

struct FrameEntry {
    frame: PhysFrame,
    page: Weak<PageEntry>,
    space: SpaceId,
    vaddr: VirtAddr,
    flags: FrameFlags,
}

/// Frame entries plus the clock hand
struct FrameList {
    entries: Vec<FrameEntry>,
    hand: usize,
}

impl FrameList {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            hand: 0,
        }
    }

    fn position(&self, frame: PhysFrame) -> Option<usize> {
        self.entries.iter().position(|entry| entry.frame == frame)
    }

    fn find_mut(&mut self, frame: PhysFrame) -> Option<&mut FrameEntry> {
        self.entries.iter_mut().find(|entry| entry.frame == frame)
    }

    /// Removes the entry at `index`, keeping the hand on the same successor.
    fn remove(&mut self, index: usize) -> FrameEntry {
        let entry = self.entries.remove(index);
        if index < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
        entry
    }

    fn advance(&mut self) {
        self.hand = (self.hand + 1) % self.entries.len();
    }
}

/// One resident frame as seen by [`FrameTable::snapshot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame: PhysFrame,
    pub space: SpaceId,
    pub vaddr: VirtAddr,
    pub flags: FrameFlags,
}

/// Frame table statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames currently lent to user pages
    pub resident: usize,
    /// Resident frames that are pinned
    pub pinned: usize,
    /// Evictions since boot
    pub evictions: u64,
}

/// System-wide table of frames backing user pages
pub struct FrameTable {
    allocator: Arc<dyn FrameAllocator>,
    mapper: Arc<dyn HardwareMapper>,
    frames: Mutex<FrameList>,
    evictions: AtomicU64,
}

impl FrameTable {
    /// Creates an empty frame table.
    pub fn new(allocator: Arc<dyn FrameAllocator>, mapper: Arc<dyn HardwareMapper>) -> Self {
        Self {
            allocator,
            mapper,
            frames: Mutex::new(FrameList::new()),
            evictions: AtomicU64::new(0),
        }
    }

    /// The physical allocator frames come from.
    pub fn allocator(&self) -> &dyn FrameAllocator {
        self.allocator.as_ref()
    }

    /// The hardware mapping layer.
    pub fn mapper(&self) -> &dyn HardwareMapper {
        self.mapper.as_ref()
    }

    /// Number of frames currently tracked.
    pub fn len(&self) -> usize {
        self.frames.lock().entries.len()
    }

    /// Whether no frame is tracked.
    pub fn is_empty(&self) -> bool {
        self.frames.lock().entries.is_empty()
    }

    /// Gets a frame for `page`, evicting another page if memory is full.
    ///
    /// The frame comes back marked loading, so eviction leaves it alone
    /// until [`finish_loading`](Self::finish_loading). The caller must hold
    /// `page`'s lock and `page` must not already own a frame.
    pub fn acquire_frame(&self, flags: AllocFlags, page: &Arc<PageEntry>, swap: &SwapStore) -> Result<PhysFrame> {
        loop {
            if let Some(frame) = self.allocator.alloc_frame(flags) {
                self.frames.lock().entries.push(FrameEntry {
                    frame,
                    page: Arc::downgrade(page),
                    space: page.space(),
                    vaddr: page.vaddr(),
                    flags: FrameFlags::LOADING | FrameFlags::REFERENCED,
                });
                log::trace!("frame: {} -> {} {}", frame, page.space(), page.vaddr());
                return Ok(frame);
            }
            // Another thread may take the frame we free; just go round again.
            self.evict_one(swap)?;
        }
    }

    /// Stops tracking `frame` and returns it to the allocator.
    pub fn release_frame(&self, frame: PhysFrame) {
        let removed = {
            let mut list = self.frames.lock();
            list.position(frame).map(|index| list.remove(index))
        };
        if removed.is_none() {
            log::warn!("frame: releasing untracked {}", frame);
        }
        self.allocator.free_frame(frame);
    }

    /// Marks the frame filled and mapped, making it evictable.
    pub fn finish_loading(&self, frame: PhysFrame) {
        self.update(frame, |flags| flags.remove(FrameFlags::LOADING));
    }

    /// Pins or unpins `frame`.
    pub fn set_pinned(&self, frame: PhysFrame, pinned: bool) {
        self.update(frame, |flags| flags.set(FrameFlags::PINNED, pinned));
    }

    /// Records a use of `frame`.
    pub fn touch(&self, frame: PhysFrame) {
        self.update(frame, |flags| flags.insert(FrameFlags::REFERENCED));
    }

    fn update(&self, frame: PhysFrame, f: impl FnOnce(&mut FrameFlags)) {
        match self.frames.lock().find_mut(frame) {
            Some(entry) => f(&mut entry.flags),
            None => log::warn!("frame: {} is not tracked", frame),
        }
    }

    /// Evicts one page and frees its frame.
    ///
    /// The clock hand sweeps twice around the table per pass: the first
    /// sweep clears reference bits, the second finds any frame that was not
    /// used in between. Frames whose page is locked by another thread or
    /// still loading are skipped for now. While any frame is unpinned the
    /// pass is repeated; the hardware accessed bit is set outside the table
    /// lock, so a busy working set can outlast any fixed number of sweeps.
    /// Only a table holding nothing but pinned frames fails with
    /// [`VmError::OutOfMemory`].
    ///
    /// Everybody else takes a page lock before the table lock, so here the
    /// page lock is only ever tried, never waited for. A frame whose page
    /// was dropped without being destroyed is reclaimed on sight.
    fn evict_one(&self, swap: &SwapStore) -> Result<()> {
        loop {
            let mut list = self.frames.lock();
            let sweep = 2 * list.entries.len();
            let mut unpinned = false;

            for _ in 0..sweep {
                let hand = list.hand;
                let entry = &mut list.entries[hand];
                if entry.flags.contains(FrameFlags::PINNED) {
                    list.advance();
                    continue;
                }
                unpinned = true;
                if entry.flags.contains(FrameFlags::LOADING) {
                    list.advance();
                    continue;
                }
                let accessed = self.mapper.get_and_clear_accessed(entry.space, entry.vaddr);
                if accessed || entry.flags.contains(FrameFlags::REFERENCED) {
                    entry.flags.remove(FrameFlags::REFERENCED);
                    list.advance();
                    continue;
                }
                let Some(page) = entry.page.upgrade() else {
                    // The page was dropped without being destroyed.
                    let orphan = list.remove(hand);
                    drop(list);
                    log::warn!("frame: reclaiming orphaned {} of {} {}", orphan.frame, orphan.space, orphan.vaddr);
                    self.mapper.clear_mapping(orphan.space, orphan.vaddr);
                    self.allocator.free_frame(orphan.frame);
                    return Ok(());
                };
                // A locked page is in the middle of a transition.
                let Some(mut slot) = page.try_lock_slot() else {
                    list.advance();
                    continue;
                };

                let victim = list.remove(hand);
                drop(list);
                log::debug!("frame: evicting {} {} from {}", victim.space, victim.vaddr, victim.frame);

                return match page.evict_locked(&mut slot, victim.frame, self, swap) {
                    Ok(()) => {
                        self.allocator.free_frame(victim.frame);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(err) => {
                        log::error!("frame: cannot evict {} {}: {}", victim.space, victim.vaddr, err);
                        self.frames.lock().entries.push(victim);
                        Err(err)
                    }
                };
            }

            if !unpinned {
                log::error!("frame: all {} resident frames are pinned", list.entries.len());
                return Err(VmError::OutOfMemory);
            }
            drop(list);
            core::hint::spin_loop();
        }
    }

    /// Copies out every tracked frame.
    pub fn snapshot(&self) -> Vec<FrameInfo> {
        self.frames
            .lock()
            .entries
            .iter()
            .map(|entry| FrameInfo {
                frame: entry.frame,
                space: entry.space,
                vaddr: entry.vaddr,
                flags: entry.flags,
            })
            .collect()
    }

    /// Current statistics.
    pub fn stats(&self) -> FrameStats {
        let list = self.frames.lock();
        FrameStats {
            resident: list.entries.len(),
            pinned: list
                .entries
                .iter()
                .filter(|entry| entry.flags.contains(FrameFlags::PINNED))
                .count(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
