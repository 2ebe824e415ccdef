//! Swap disk

use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use nos_vm_api::{BlockDevice, SECTOR_SIZE};

/// Sector-addressed disk in host memory that counts its I/O
pub struct RamDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sectors]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Sectors read so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Sectors written so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> usize {
        self.sectors.lock().len()
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) {
        buf.copy_from_slice(&self.sectors.lock()[sector]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) {
        self.sectors.lock()[sector].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}
