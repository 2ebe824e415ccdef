//! Software MMU

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use nos_vm_api::{FrameAllocator, HardwareMapper, PhysFrame, SpaceId, VirtAddr, PAGE_SIZE};

use crate::frames::RamFrames;

#[derive(Debug, Clone, Copy)]
struct Pte {
    frame: PhysFrame,
    present: bool,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A user-mode access the MMU refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// No present mapping for the page
    NotPresent(VirtAddr),
    /// Write to a read-only page
    ReadOnly(VirtAddr),
}

impl Fault {
    pub fn addr(self) -> VirtAddr {
        match self {
            Fault::NotPresent(addr) | Fault::ReadOnly(addr) => addr,
        }
    }
}

/// Page tables for every address space, backed by a [`RamFrames`] pool.
///
/// A cleared mapping keeps its accessed and dirty bits until the page is
/// mapped again, the way x86 keeps them in a non-present PTE. User accesses
/// hold the page-table lock for the whole copy, so an access either
/// completes before a mapping is cleared or faults.
pub struct SoftMmu {
    frames: Arc<RamFrames>,
    ptes: Mutex<HashMap<(SpaceId, usize), Pte>>,
    fail_installs: AtomicBool,
}

impl SoftMmu {
    pub fn new(frames: Arc<RamFrames>) -> Self {
        Self {
            frames,
            ptes: Mutex::new(HashMap::new()),
            fail_installs: AtomicBool::new(false),
        }
    }

    /// Makes every following `install_mapping` fail (or succeed again).
    pub fn fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::Relaxed);
    }

    /// Frame `vaddr` is mapped to, without touching the accessed bit.
    pub fn translate(&self, space: SpaceId, vaddr: VirtAddr) -> Option<PhysFrame> {
        self.query_mapping(space, vaddr)
    }

    /// Number of present mappings in `space`.
    pub fn mapped_count(&self, space: SpaceId) -> usize {
        self.ptes
            .lock()
            .iter()
            .filter(|((owner, _), pte)| *owner == space && pte.present)
            .count()
    }

    /// Reads user memory as the process would.
    pub fn read(&self, space: SpaceId, addr: VirtAddr, buf: &mut [u8]) -> Result<(), Fault> {
        let mut ptes = self.ptes.lock();
        let mut done = 0;
        while done < buf.len() {
            let at = VirtAddr::new(addr.as_usize() + done);
            let pte = ptes
                .get_mut(&(space, at.page_number()))
                .filter(|pte| pte.present)
                .ok_or(Fault::NotPresent(at))?;
            pte.accessed = true;
            let count = (buf.len() - done).min(PAGE_SIZE - at.page_offset());
            self.frames.read_frame(pte.frame, at.page_offset(), &mut buf[done..done + count]);
            done += count;
        }
        Ok(())
    }

    /// Writes user memory as the process would.
    ///
    /// Bytes before a faulting page are already written when the fault is
    /// returned, as on real hardware.
    pub fn write(&self, space: SpaceId, addr: VirtAddr, data: &[u8]) -> Result<(), Fault> {
        let mut ptes = self.ptes.lock();
        let mut done = 0;
        while done < data.len() {
            let at = VirtAddr::new(addr.as_usize() + done);
            let pte = ptes
                .get_mut(&(space, at.page_number()))
                .filter(|pte| pte.present)
                .ok_or(Fault::NotPresent(at))?;
            if !pte.writable {
                return Err(Fault::ReadOnly(at));
            }
            pte.accessed = true;
            pte.dirty = true;
            let count = (data.len() - done).min(PAGE_SIZE - at.page_offset());
            self.frames.write_frame(pte.frame, at.page_offset(), &data[done..done + count]);
            done += count;
        }
        Ok(())
    }
}

impl HardwareMapper for SoftMmu {
    fn install_mapping(&self, space: SpaceId, vaddr: VirtAddr, frame: PhysFrame, writable: bool) -> bool {
        if self.fail_installs.load(Ordering::Relaxed) {
            return false;
        }
        self.ptes.lock().insert(
            (space, vaddr.page_number()),
            Pte {
                frame,
                present: true,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn clear_mapping(&self, space: SpaceId, vaddr: VirtAddr) {
        if let Some(pte) = self.ptes.lock().get_mut(&(space, vaddr.page_number())) {
            pte.present = false;
        }
    }

    fn query_mapping(&self, space: SpaceId, vaddr: VirtAddr) -> Option<PhysFrame> {
        self.ptes
            .lock()
            .get(&(space, vaddr.page_number()))
            .filter(|pte| pte.present)
            .map(|pte| pte.frame)
    }

    fn get_and_clear_dirty(&self, space: SpaceId, vaddr: VirtAddr) -> bool {
        self.ptes
            .lock()
            .get_mut(&(space, vaddr.page_number()))
            .is_some_and(|pte| core::mem::take(&mut pte.dirty))
    }

    fn get_and_clear_accessed(&self, space: SpaceId, vaddr: VirtAddr) -> bool {
        self.ptes
            .lock()
            .get_mut(&(space, vaddr.page_number()))
            .is_some_and(|pte| core::mem::take(&mut pte.accessed))
    }
}
