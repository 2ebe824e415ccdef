//! Swap store
//!
//! The swap partition is divided into page-sized slots of
//! `SECTORS_PER_PAGE` contiguous sectors. A bitmap records which slots hold
//! an evicted page. Every operation runs under one store-wide lock; there is
//! no per-slot locking.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use nos_vm_api::{BlockDevice, Result, VmError, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

/// Index of one page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(usize);

impl SlotIndex {
    /// Returns the raw slot number.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Slot occupancy bitmap (1 = in use)
struct SlotBitmap {
    words: Vec<u64>,
    slots: usize,
    used: usize,
}

impl SlotBitmap {
    fn new(slots: usize) -> Self {
        Self {
            words: vec![0; slots.div_ceil(64)],
            slots,
            used: 0,
        }
    }

    /// Finds a clear bit and sets it.
    fn scan_and_set(&mut self) -> Option<usize> {
        for (idx, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = idx * 64 + bit;
            if slot >= self.slots {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(slot);
        }
        None
    }

    fn test(&self, slot: usize) -> bool {
        slot < self.slots && self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn clear(&mut self, slot: usize) {
        self.words[slot / 64] &= !(1 << (slot % 64));
        self.used -= 1;
    }
}

/// Page-granular store on a dedicated block device
pub struct SwapStore {
    device: Arc<dyn BlockDevice>,
    map: Mutex<SlotBitmap>,
}

impl SwapStore {
    /// Creates a store covering the whole device.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.sector_count() / SECTORS_PER_PAGE;
        log::info!("swap: {} slots of {} sectors", slots, SECTORS_PER_PAGE);
        Self {
            device,
            map: Mutex::new(SlotBitmap::new(slots)),
        }
    }

    /// Total number of slots on the device.
    pub fn capacity(&self) -> usize {
        self.map.lock().slots
    }

    /// Number of slots currently holding a page.
    pub fn used_slots(&self) -> usize {
        self.map.lock().used
    }

    /// Whether `slot` is currently allocated.
    pub fn is_allocated(&self, slot: SlotIndex) -> bool {
        self.map.lock().test(slot.0)
    }

    /// Claims a free slot.
    ///
    /// An exhausted device is a resource-exhaustion failure; the caller
    /// decides whether that halts the kernel or kills the process.
    pub fn allocate_slot(&self) -> Result<SlotIndex> {
        let mut map = self.map.lock();
        Self::allocate_locked(&mut map)
    }

    /// Writes one page into an allocated slot.
    pub fn write_slot(&self, slot: SlotIndex, page: &[u8; PAGE_SIZE]) -> Result<()> {
        let map = self.map.lock();
        if !map.test(slot.0) {
            return Err(VmError::SlotNotInUse(slot.0));
        }
        self.write_locked(slot, page);
        Ok(())
    }

    /// Reads a slot into `dest` and frees it.
    ///
    /// With `dest` of `None` the slot is discarded without any device I/O,
    /// which is how a swapped page is destroyed.
    pub fn read_slot(&self, slot: SlotIndex, dest: Option<&mut [u8; PAGE_SIZE]>) -> Result<()> {
        let mut map = self.map.lock();
        if !map.test(slot.0) {
            return Err(VmError::SlotNotInUse(slot.0));
        }
        if let Some(dest) = dest {
            let mut sector = [0u8; SECTOR_SIZE];
            for (i, chunk) in dest.chunks_exact_mut(SECTOR_SIZE).enumerate() {
                self.device.read_sector(slot.first_sector() + i, &mut sector);
                chunk.copy_from_slice(&sector);
            }
            log::trace!("swap: read {}", slot);
        }
        map.clear(slot.0);
        Ok(())
    }

    /// Frees a slot without reading it.
    pub fn discard(&self, slot: SlotIndex) -> Result<()> {
        self.read_slot(slot, None)
    }

    /// Allocates a slot and writes `page` into it under a single lock hold.
    pub fn swap_out(&self, page: &[u8; PAGE_SIZE]) -> Result<SlotIndex> {
        let mut map = self.map.lock();
        let slot = Self::allocate_locked(&mut map)?;
        self.write_locked(slot, page);
        Ok(slot)
    }

    fn allocate_locked(map: &mut SlotBitmap) -> Result<SlotIndex> {
        match map.scan_and_set() {
            Some(slot) => Ok(SlotIndex(slot)),
            None => {
                log::error!("swap: device exhausted ({} slots in use)", map.used);
                Err(VmError::SwapExhausted)
            }
        }
    }

    fn write_locked(&self, slot: SlotIndex, page: &[u8; PAGE_SIZE]) {
        let mut sector = [0u8; SECTOR_SIZE];
        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            sector.copy_from_slice(chunk);
            self.device.write_sector(slot.first_sector() + i, &sector);
        }
        log::trace!("swap: wrote {}", slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use mockall::predicate::eq;
    use nos_vm_sim::RamDisk;
    use proptest::prelude::*;

    mock! {
        Device {}
        impl BlockDevice for Device {
            fn sector_count(&self) -> usize;
            fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]);
            fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]);
        }
    }

    fn store_with_slots(slots: usize) -> SwapStore {
        SwapStore::new(Arc::new(RamDisk::new(slots * SECTORS_PER_PAGE)))
    }

    #[test]
    fn test_capacity_from_device_size() {
        let mut device = MockDevice::new();
        // A trailing partial slot is unusable.
        device.expect_sector_count().return_const(3 * SECTORS_PER_PAGE + 5);
        let store = SwapStore::new(Arc::new(device));
        assert_eq!(store.capacity(), 3);
        assert_eq!(store.used_slots(), 0);
    }

    #[test]
    fn test_write_touches_slot_sectors() {
        let mut device = MockDevice::new();
        device.expect_sector_count().return_const(4 * SECTORS_PER_PAGE);
        for i in 0..SECTORS_PER_PAGE {
            device
                .expect_write_sector()
                .with(eq(SECTORS_PER_PAGE + i), mockall::predicate::always())
                .times(1)
                .return_const(());
        }
        let store = SwapStore::new(Arc::new(device));

        let first = store.allocate_slot().unwrap();
        let second = store.allocate_slot().unwrap();
        assert_eq!(first.as_usize(), 0);
        assert_eq!(second.as_usize(), 1);
        store.write_slot(second, &[0xAB; PAGE_SIZE]).unwrap();
    }

    #[test]
    fn test_discard_does_no_io() {
        let mut device = MockDevice::new();
        device.expect_sector_count().return_const(SECTORS_PER_PAGE);
        device.expect_read_sector().never();
        let store = SwapStore::new(Arc::new(device));

        let slot = store.allocate_slot().unwrap();
        store.discard(slot).unwrap();
        assert_eq!(store.used_slots(), 0);
        assert!(!store.is_allocated(slot));
    }

    #[test]
    fn test_round_trip_frees_slot() {
        let store = store_with_slots(2);
        let mut page = [0u8; PAGE_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let slot = store.swap_out(&page).unwrap();
        assert!(store.is_allocated(slot));

        let mut back = [0u8; PAGE_SIZE];
        store.read_slot(slot, Some(&mut back)).unwrap();
        assert_eq!(back[..], page[..]);
        assert!(!store.is_allocated(slot));
        assert_eq!(store.read_slot(slot, None), Err(VmError::SlotNotInUse(0)));
    }

    #[test]
    fn test_exhaustion() {
        let store = store_with_slots(2);
        store.allocate_slot().unwrap();
        store.allocate_slot().unwrap();
        assert_eq!(store.allocate_slot(), Err(VmError::SwapExhausted));
        assert_eq!(store.swap_out(&[0; PAGE_SIZE]), Err(VmError::SwapExhausted));
    }

    #[test]
    fn test_write_unallocated_slot() {
        let store = store_with_slots(1);
        assert_eq!(
            store.write_slot(SlotIndex(0), &[0; PAGE_SIZE]),
            Err(VmError::SlotNotInUse(0))
        );
    }

    proptest! {
        #[test]
        fn prop_used_count_matches_live_slots(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let store = store_with_slots(70);
            let mut live: Vec<SlotIndex> = Vec::new();
            for allocate in ops {
                if allocate || live.is_empty() {
                    match store.allocate_slot() {
                        Ok(slot) => {
                            prop_assert!(!live.contains(&slot));
                            live.push(slot);
                        }
                        Err(err) => prop_assert_eq!(err, VmError::SwapExhausted),
                    }
                } else {
                    let slot = live.swap_remove(live.len() / 2);
                    store.discard(slot).unwrap();
                }
                prop_assert_eq!(store.used_slots(), live.len());
            }
        }
    }
}
