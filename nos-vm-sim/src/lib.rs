//! NOS VM Sim - A simulated machine for exercising the VM subsystem
//!
//! Every collaborator the virtual-memory subsystem consumes has an
//! in-memory stand-in here:
//!
//! - [`RamFrames`]: a fixed pool of physical frames
//! - [`SoftMmu`]: per-address-space page tables with accessed and dirty
//!   bits, plus user-mode `read`/`write` that fault like real hardware
//! - [`RamDisk`]: a sector-addressed swap disk
//! - [`MemFs`]: a flat in-memory file system with descriptors
//!
//! [`Machine`] wires the first three together.

use std::sync::Arc;

pub mod disk;
pub mod frames;
pub mod fs;
pub mod mmu;

pub use disk::RamDisk;
pub use frames::RamFrames;
pub use fs::MemFs;
pub use mmu::{Fault, SoftMmu};

use nos_vm_api::SECTORS_PER_PAGE;

/// Physical memory, MMU and swap disk of one simulated machine
pub struct Machine {
    pub frames: Arc<RamFrames>,
    pub mmu: Arc<SoftMmu>,
    pub disk: Arc<RamDisk>,
}

impl Machine {
    /// Builds a machine with `frames` physical frames and room for
    /// `swap_slots` pages of swap.
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        let frames = Arc::new(RamFrames::new(frames));
        Self {
            mmu: Arc::new(SoftMmu::new(frames.clone())),
            disk: Arc::new(RamDisk::new(swap_slots * SECTORS_PER_PAGE)),
            frames,
        }
    }
}
