//! Supplemental page table
//!
//! One [`PageTable`] per address space records every virtual page the
//! address space knows about, whether or not it is currently backed by a
//! frame. Resolving a page fault is [`PageTable::lookup`] followed by
//! [`PageTable::activate`].
//!
//! Each [`PageEntry`] moves through a small state machine:
//!
//! ```text
//! Unbacked --activate--> Resident --evict--> Swapped --activate--> Resident
//!                           |   \--evict (shared file page)--> Unbacked
//!     any state --destroy--> (gone)
//! ```
//!
//! Transitions happen under the entry's own lock. Eviction only ever
//! *tries* that lock (it already holds the frame-table lock), so a page that
//! is being activated, pinned or destroyed is never chosen as a victim.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

use nos_vm_api::{AllocFlags, PhysFrame, Result, SpaceId, VirtAddr, VmError, PAGE_SIZE};

use crate::file::BackingFile;
use crate::frame::FrameTable;
use crate::swap::{SlotIndex, SwapStore};
use crate::vm::VirtualMemory;

/// Where the contents of a page currently live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Reserved but never populated, or a clean file page dropped from memory
    Unbacked,
    /// Backed by a physical frame
    Resident(PhysFrame),
    /// Contents parked in a swap slot
    Swapped(SlotIndex),
}

/// What eviction does with a dirty file-backed page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Written back to the file (memory-mapped files)
    Shared,
    /// Sent to swap; the file is never modified (executable segments)
    Private,
}

/// File range that populates a page on first activation.
///
/// Covers `[offset, offset + len)` of the file; the rest of the page is
/// zero-filled.
#[derive(Clone)]
pub struct FileBacking {
    file: Arc<BackingFile>,
    offset: usize,
    len: usize,
    sharing: Sharing,
}

impl FileBacking {
    /// Describes `len` bytes of `file` starting at `offset`.
    pub fn new(file: Arc<BackingFile>, offset: usize, len: usize, sharing: Sharing) -> Result<Self> {
        if len == 0 || len > PAGE_SIZE {
            return Err(VmError::InvalidArgument("file backing must cover 1..=PAGE_SIZE bytes"));
        }
        Ok(Self {
            file,
            offset,
            len,
            sharing,
        })
    }

    /// The backing file.
    pub fn file(&self) -> &Arc<BackingFile> {
        &self.file
    }

    /// First file byte backing the page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// One past the last file byte backing the page.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Number of file bytes backing the page.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; a backing covers at least one byte.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sharing mode.
    pub fn sharing(&self) -> Sharing {
        self.sharing
    }

    /// Copies the backed range of `frame` out to the file.
    fn write_back(&self, frame: PhysFrame, frames: &FrameTable) {
        let mut buf = [0u8; PAGE_SIZE];
        let data = &mut buf[..self.len];
        frames.allocator().read_frame(frame, 0, data);
        let written = self.file.write_at(self.offset, data);
        if written != self.len {
            log::warn!(
                "vm: short write-back to {} at {}: {} of {} bytes",
                self.file.fd(),
                self.offset,
                written,
                self.len
            );
        }
    }
}

/// Lock-protected part of a page entry
pub(crate) struct PageSlot {
    status: PageStatus,
    /// false once the entry has been destroyed
    live: bool,
}

/// Metadata for one virtual page of one address space
pub struct PageEntry {
    space: SpaceId,
    vaddr: VirtAddr,
    writable: bool,
    flags: AllocFlags,
    backing: Option<FileBacking>,
    slot: Mutex<PageSlot>,
}

impl PageEntry {
    fn new(space: SpaceId, vaddr: VirtAddr, flags: AllocFlags, writable: bool, backing: Option<FileBacking>) -> Self {
        Self {
            space,
            vaddr,
            writable,
            flags,
            backing,
            slot: Mutex::new(PageSlot {
                status: PageStatus::Unbacked,
                live: true,
            }),
        }
    }

    /// Owning address space.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Page-aligned virtual address.
    pub fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    /// Whether user code may write the page.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// File range backing the page, if any.
    pub fn backing(&self) -> Option<&FileBacking> {
        self.backing.as_ref()
    }

    /// Current status. Blocks while another thread is transitioning the page.
    pub fn status(&self) -> PageStatus {
        self.slot.lock().status
    }

    /// False once the entry has been destroyed.
    pub fn is_live(&self) -> bool {
        self.slot.lock().live
    }

    pub(crate) fn try_lock_slot(&self) -> Option<MutexGuard<'_, PageSlot>> {
        self.slot.try_lock()
    }

    fn shared_backing(&self) -> Option<&FileBacking> {
        self.backing.as_ref().filter(|b| b.sharing == Sharing::Shared)
    }

    /// Moves a resident page out of `frame`.
    ///
    /// The frame table has already dropped its entry for `frame`; the caller
    /// frees the frame once this returns. A swap slot is claimed before the
    /// hardware mapping is touched, so a failure leaves the page resident
    /// and no slot allocated.
    pub(crate) fn evict_locked(
        &self,
        slot: &mut PageSlot,
        frame: PhysFrame,
        frames: &FrameTable,
        swap: &SwapStore,
    ) -> Result<()> {
        let mapper = frames.mapper();
        if let Some(backing) = self.shared_backing() {
            // Unmap first so no user write can slip in after the dirty bit is sampled.
            mapper.clear_mapping(self.space, self.vaddr);
            let dirty = mapper.get_and_clear_dirty(self.space, self.vaddr);
            if dirty {
                backing.write_back(frame, frames);
            }
            slot.status = PageStatus::Unbacked;
            log::trace!("vm: {} {} dropped to file (dirty={})", self.space, self.vaddr, dirty);
            return Ok(());
        }

        let index = swap.allocate_slot()?;
        mapper.clear_mapping(self.space, self.vaddr);
        let mut contents = [0u8; PAGE_SIZE];
        frames.allocator().read_frame(frame, 0, &mut contents);
        if let Err(err) = swap.write_slot(index, &contents) {
            // Still resident; the next fault maps it again.
            if let Err(discard_err) = swap.discard(index) {
                log::warn!("vm: {} {} leaves {} allocated: {}", self.space, self.vaddr, index, discard_err);
            }
            return Err(err);
        }
        slot.status = PageStatus::Swapped(index);
        log::trace!("vm: {} {} swapped to {}", self.space, self.vaddr, index);
        Ok(())
    }
}

/// Supplemental page table of one address space
pub struct PageTable {
    space: SpaceId,
    vm: Arc<VirtualMemory>,
    entries: Mutex<HashMap<VirtAddr, Arc<PageEntry>>>,
}

impl PageTable {
    /// Creates an empty table for `space`.
    pub fn new(space: SpaceId, vm: Arc<VirtualMemory>) -> Self {
        Self {
            space,
            vm,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Owning address space.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Number of page entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Finds the entry covering `vaddr` without touching recency.
    pub fn get(&self, vaddr: VirtAddr) -> Option<Arc<PageEntry>> {
        self.entries.lock().get(&vaddr.page_round_down()).cloned()
    }

    /// Finds the entry covering `vaddr`.
    ///
    /// Lookup touches recency: a resident match has its frame marked
    /// recently used, which gives it a second chance against eviction.
    pub fn lookup(&self, vaddr: VirtAddr) -> Option<Arc<PageEntry>> {
        let page = self.get(vaddr)?;
        let slot = page.slot.lock();
        // Held so the frame cannot be evicted and reused before the touch.
        if let PageStatus::Resident(frame) = slot.status {
            self.vm.frames().touch(frame);
        }
        drop(slot);
        Some(page)
    }

    /// Snapshot of every entry.
    pub fn pages(&self) -> Vec<Arc<PageEntry>> {
        self.entries.lock().values().cloned().collect()
    }

    /// Number of entries currently in `Swapped` state.
    pub fn swapped_count(&self) -> usize {
        self.pages()
            .iter()
            .filter(|page| matches!(page.status(), PageStatus::Swapped(_)))
            .count()
    }

    /// Reserves an anonymous page at `vaddr`.
    pub fn create(&self, vaddr: VirtAddr, flags: AllocFlags, writable: bool) -> Result<Arc<PageEntry>> {
        self.insert(vaddr, flags, writable, None)
    }

    /// Reserves a page populated from `backing` on first activation.
    pub fn create_file_backed(
        &self,
        vaddr: VirtAddr,
        flags: AllocFlags,
        writable: bool,
        backing: FileBacking,
    ) -> Result<Arc<PageEntry>> {
        self.insert(vaddr, flags, writable, Some(backing))
    }

    fn insert(
        &self,
        vaddr: VirtAddr,
        flags: AllocFlags,
        writable: bool,
        backing: Option<FileBacking>,
    ) -> Result<Arc<PageEntry>> {
        if vaddr.is_null() || !vaddr.is_page_aligned() {
            return Err(VmError::InvalidArgument("page address must be non-null and page-aligned"));
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&vaddr) {
            return Err(VmError::AlreadyMapped(vaddr));
        }
        let page = Arc::new(PageEntry::new(self.space, vaddr, flags, writable, backing));
        entries.insert(vaddr, page.clone());
        log::debug!("vm: {} reserved {} (writable={})", self.space, vaddr, writable);
        Ok(page)
    }

    /// Faults `page` in.
    ///
    /// Returns `Ok(false)` if the page is already mapped in hardware.
    /// Otherwise acquires a frame (possibly evicting another page), fills it
    /// from swap, from the backing file, or with zeroes, installs the
    /// mapping and marks the page resident.
    pub fn activate(&self, page: &Arc<PageEntry>) -> Result<bool> {
        let mut slot = page.slot.lock();
        self.activate_locked(page, &mut slot)
    }

    fn activate_locked(&self, page: &Arc<PageEntry>, slot: &mut PageSlot) -> Result<bool> {
        if !slot.live {
            return Err(VmError::PageDestroyed(page.vaddr));
        }
        let frames = self.vm.frames();
        let mapper = frames.mapper();
        if mapper.query_mapping(page.space, page.vaddr).is_some() {
            return Ok(false);
        }

        if let PageStatus::Resident(frame) = slot.status {
            // Resident but unmapped: the hardware mapping was dropped underneath us.
            if !mapper.install_mapping(page.space, page.vaddr, frame, page.writable) {
                return Err(VmError::MapFailed(page.vaddr));
            }
            return Ok(true);
        }

        let swap = self.vm.swap();
        let frame = frames.acquire_frame(page.flags, page, swap)?;
        let mut contents = [0u8; PAGE_SIZE];
        let from_swap = match slot.status {
            PageStatus::Swapped(index) => {
                if let Err(err) = swap.read_slot(index, Some(&mut contents)) {
                    frames.release_frame(frame);
                    return Err(err);
                }
                true
            }
            _ => {
                if let Some(backing) = &page.backing {
                    let read = backing.file.read_at(backing.offset, &mut contents[..backing.len]);
                    if read < backing.len {
                        log::warn!(
                            "vm: short read for {} from {}: {} of {} bytes",
                            page.vaddr,
                            backing.file.fd(),
                            read,
                            backing.len
                        );
                    }
                }
                false
            }
        };
        frames.allocator().write_frame(frame, 0, &contents);

        if !mapper.install_mapping(page.space, page.vaddr, frame, page.writable) {
            log::warn!("vm: {} failed to map {} to {}", page.space, page.vaddr, frame);
            frames.release_frame(frame);
            slot.status = PageStatus::Unbacked;
            if from_swap {
                // The frame held the only copy; park it in a fresh slot.
                slot.status = PageStatus::Swapped(swap.swap_out(&contents)?);
            }
            return Err(VmError::MapFailed(page.vaddr));
        }
        // Freshly loaded contents are clean.
        mapper.get_and_clear_dirty(page.space, page.vaddr);

        slot.status = PageStatus::Resident(frame);
        frames.finish_loading(frame);
        log::debug!("vm: {} {} resident in {} (from_swap={})", page.space, page.vaddr, frame, from_swap);
        Ok(true)
    }

    /// Removes `page` and releases whatever backs it.
    ///
    /// A resident page has its mapping cleared and its frame released; a
    /// swapped page has its slot discarded unread. Destroying an entry that
    /// is already gone is a no-op.
    pub fn destroy(&self, page: &Arc<PageEntry>) -> Result<()> {
        self.remove(page, false)
    }

    /// Like [`destroy`](Self::destroy), but first writes a dirty shared
    /// file-backed page back to its file.
    pub fn destroy_and_write_back(&self, page: &Arc<PageEntry>) -> Result<()> {
        self.remove(page, true)
    }

    fn remove(&self, page: &Arc<PageEntry>, write_back: bool) -> Result<()> {
        {
            let mut entries = self.entries.lock();
            if entries.get(&page.vaddr).is_some_and(|entry| Arc::ptr_eq(entry, page)) {
                entries.remove(&page.vaddr);
            }
        }

        let mut slot = page.slot.lock();
        if !slot.live {
            return Ok(());
        }
        slot.live = false;
        match mem::replace(&mut slot.status, PageStatus::Unbacked) {
            PageStatus::Resident(frame) => {
                let frames = self.vm.frames();
                let mapper = frames.mapper();
                mapper.clear_mapping(page.space, page.vaddr);
                let dirty = mapper.get_and_clear_dirty(page.space, page.vaddr);
                if write_back && dirty {
                    if let Some(backing) = page.shared_backing() {
                        backing.write_back(frame, frames);
                    }
                }
                frames.release_frame(frame);
            }
            PageStatus::Swapped(index) => self.vm.swap().discard(index)?,
            PageStatus::Unbacked => {}
        }
        log::debug!("vm: {} destroyed {}", page.space, page.vaddr);
        Ok(())
    }

    /// Pins (`false`) or unpins (`true`) the frame behind `page`.
    ///
    /// A page that is not resident is faulted in first, so after pinning
    /// the page is guaranteed resident and will not be evicted until
    /// unpinned. Kernel code pins user buffers this way before touching them.
    pub fn set_swappable(&self, page: &Arc<PageEntry>, swappable: bool) -> Result<()> {
        let mut slot = page.slot.lock();
        if !matches!(slot.status, PageStatus::Resident(_)) {
            self.activate_locked(page, &mut slot)?;
        }
        match slot.status {
            PageStatus::Resident(frame) => {
                self.vm.frames().set_pinned(frame, !swappable);
                Ok(())
            }
            _ => Err(VmError::NotMapped(page.vaddr)),
        }
    }

    /// Destroys every entry.
    pub fn clear(&self) {
        let pages: Vec<Arc<PageEntry>> = self.entries.lock().drain().map(|(_, page)| page).collect();
        for page in pages {
            if let Err(err) = self.destroy(&page) {
                log::warn!("vm: {} teardown of {} failed: {}", self.space, page.vaddr, err);
            }
        }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFlags;
    use nos_vm_api::{HardwareMapper, VmConfig};
    use nos_vm_sim::Machine;

    const BASE: VirtAddr = VirtAddr::new(0x1000_0000);

    fn setup(frames: usize, swap_slots: usize) -> (Machine, Arc<VirtualMemory>, PageTable) {
        let machine = Machine::new(frames, swap_slots);
        let vm = Arc::new(VirtualMemory::new(
            machine.frames.clone(),
            machine.mmu.clone(),
            machine.disk.clone(),
            VmConfig::new(),
        ));
        let table = PageTable::new(SpaceId(1), vm.clone());
        (machine, vm, table)
    }

    #[test]
    fn test_create_rejects_duplicates_and_unaligned() {
        let (_machine, _vm, table) = setup(2, 2);
        table.create(BASE, AllocFlags::USER, true).unwrap();
        assert_eq!(
            table.create(BASE, AllocFlags::USER, true).err(),
            Some(VmError::AlreadyMapped(BASE))
        );
        assert!(matches!(
            table.create(VirtAddr::new(0x1000_0010), AllocFlags::USER, true),
            Err(VmError::InvalidArgument(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lookup_is_page_granular() {
        let (_machine, _vm, table) = setup(2, 2);
        let page = table.create(BASE, AllocFlags::USER, true).unwrap();
        let found = table.lookup(VirtAddr::new(BASE.as_usize() + 0xFFF)).unwrap();
        assert!(Arc::ptr_eq(&page, &found));
        assert!(table.lookup(BASE.nth_page(1)).is_none());
    }

    #[test]
    fn test_lookup_touches_only_its_own_frame() {
        let (_machine, vm, table) = setup(2, 4);
        let pages: Vec<_> = (0..3)
            .map(|i| table.create(BASE.nth_page(i), AllocFlags::USER, true).unwrap())
            .collect();
        table.activate(&pages[0]).unwrap();
        table.activate(&pages[1]).unwrap();
        // The sweep clears page 1's bit and hands page 0's frame to page 2.
        table.activate(&pages[2]).unwrap();
        assert!(matches!(pages[0].status(), PageStatus::Swapped(_)));

        let referenced = |vaddr: VirtAddr| {
            vm.frames()
                .snapshot()
                .into_iter()
                .find(|info| info.vaddr == vaddr)
                .map(|info| info.flags.contains(FrameFlags::REFERENCED))
        };
        assert_eq!(referenced(BASE.nth_page(1)), Some(false));

        // A swapped page has no frame to touch.
        table.lookup(BASE).unwrap();
        assert_eq!(referenced(BASE.nth_page(1)), Some(false));
        assert_eq!(referenced(BASE), None);

        table.lookup(BASE.nth_page(1)).unwrap();
        assert_eq!(referenced(BASE.nth_page(1)), Some(true));
    }

    #[test]
    fn test_activate_zero_fills_anonymous_page() {
        let (machine, vm, table) = setup(2, 2);
        let page = table.create(BASE, AllocFlags::USER, true).unwrap();
        assert!(table.activate(&page).unwrap());
        assert!(!table.activate(&page).unwrap());

        let PageStatus::Resident(frame) = page.status() else {
            panic!("page not resident");
        };
        assert_eq!(machine.mmu.translate(SpaceId(1), BASE), Some(frame));
        let mut buf = [0xFFu8; 16];
        machine.mmu.read(SpaceId(1), BASE, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(vm.frames().len(), 1);
    }

    #[test]
    fn test_destroy_releases_frame_and_slot() {
        let (machine, vm, table) = setup(1, 4);
        let first = table.create(BASE, AllocFlags::USER, true).unwrap();
        let second = table.create(BASE.nth_page(1), AllocFlags::USER, true).unwrap();
        table.activate(&first).unwrap();
        table.activate(&second).unwrap();
        assert!(matches!(first.status(), PageStatus::Swapped(_)));
        assert_eq!(vm.swap().used_slots(), 1);

        table.destroy(&first).unwrap();
        assert_eq!(vm.swap().used_slots(), 0);
        table.destroy(&second).unwrap();
        assert_eq!(vm.frames().len(), 0);
        assert_eq!(machine.frames.free_count(), 1);
        assert!(machine.mmu.translate(SpaceId(1), BASE.nth_page(1)).is_none());
        assert!(table.is_empty());

        // Destroying twice is harmless.
        table.destroy(&second).unwrap();
        assert_eq!(table.activate(&second), Err(VmError::PageDestroyed(BASE.nth_page(1))));
    }

    #[test]
    fn test_destroy_unbacked_touches_nothing() {
        let (machine, vm, table) = setup(1, 1);
        let page = table.create(BASE, AllocFlags::USER, true).unwrap();
        table.destroy(&page).unwrap();
        assert!(table.get(BASE).is_none());
        assert_eq!(vm.frames().len(), 0);
        assert_eq!(vm.swap().used_slots(), 0);
        assert_eq!(machine.disk.writes(), 0);
        assert_eq!(machine.frames.free_count(), 1);
    }

    #[test]
    fn test_set_swappable_pins_and_faults_in() {
        let (_machine, vm, table) = setup(1, 4);
        let pinned = table.create(BASE, AllocFlags::USER, true).unwrap();
        let other = table.create(BASE.nth_page(1), AllocFlags::USER, true).unwrap();

        table.set_swappable(&pinned, false).unwrap();
        assert!(matches!(pinned.status(), PageStatus::Resident(_)));
        assert_eq!(vm.frames().stats().pinned, 1);

        // The only frame is pinned, so nothing can be evicted.
        assert_eq!(table.activate(&other), Err(VmError::OutOfMemory));

        table.set_swappable(&pinned, true).unwrap();
        assert!(table.activate(&other).unwrap());
        assert!(matches!(pinned.status(), PageStatus::Swapped(_)));
    }

    #[test]
    fn test_failed_install_keeps_swapped_contents() {
        let (machine, vm, table) = setup(1, 4);
        let first = table.create(BASE, AllocFlags::USER, true).unwrap();
        let second = table.create(BASE.nth_page(1), AllocFlags::USER, true).unwrap();
        table.activate(&first).unwrap();
        machine.mmu.write(SpaceId(1), BASE, b"keep me").unwrap();
        table.activate(&second).unwrap();
        table.destroy(&second).unwrap();

        machine.mmu.fail_installs(true);
        assert_eq!(table.activate(&first), Err(VmError::MapFailed(BASE)));
        assert!(matches!(first.status(), PageStatus::Swapped(_)));
        assert_eq!(vm.swap().used_slots(), 1);
        assert_eq!(vm.frames().len(), 0);

        machine.mmu.fail_installs(false);
        table.activate(&first).unwrap();
        let mut buf = [0u8; 7];
        machine.mmu.read(SpaceId(1), BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"keep me");
    }

    #[test]
    fn test_remap_resident_page() {
        let (machine, _vm, table) = setup(2, 2);
        let page = table.create(BASE, AllocFlags::USER, false).unwrap();
        table.activate(&page).unwrap();
        let status = page.status();
        machine.mmu.clear_mapping(SpaceId(1), BASE);
        assert!(table.activate(&page).unwrap());
        assert_eq!(page.status(), status);
        assert!(machine.mmu.write(SpaceId(1), BASE, b"x").is_err());
    }
}
