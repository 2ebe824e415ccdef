//! Virtual-memory context
//!
//! Owns the resources every address space shares: the frame table over the
//! physical pool and the swap store. The kernel creates one at boot and
//! hands an `Arc` of it to each new address space.

use alloc::sync::Arc;

use nos_vm_api::{BlockDevice, FrameAllocator, HardwareMapper, VmConfig};

use crate::frame::FrameTable;
use crate::swap::SwapStore;

/// Memory statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Frames backing user pages
    pub resident_frames: usize,
    /// Resident frames that are pinned
    pub pinned_frames: usize,
    /// Evictions since boot
    pub evictions: u64,
    /// Swap slots holding a page
    pub swap_used: usize,
    /// Total swap slots
    pub swap_total: usize,
}

/// Shared virtual-memory state
pub struct VirtualMemory {
    frames: FrameTable,
    swap: SwapStore,
    config: VmConfig,
}

impl VirtualMemory {
    /// Builds the context over the given collaborators.
    pub fn new(
        allocator: Arc<dyn FrameAllocator>,
        mapper: Arc<dyn HardwareMapper>,
        swap_device: Arc<dyn BlockDevice>,
        config: VmConfig,
    ) -> Self {
        log::info!(
            "vm: user space below {}, stack limit {}",
            config.user_top,
            config.stack_limit()
        );
        Self {
            frames: FrameTable::new(allocator, mapper),
            swap: SwapStore::new(swap_device),
            config,
        }
    }

    /// The frame table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// The swap store.
    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// The configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Current statistics.
    pub fn stats(&self) -> VmStats {
        let frames = self.frames.stats();
        VmStats {
            resident_frames: frames.resident,
            pinned_frames: frames.pinned,
            evictions: frames.evictions,
            swap_used: self.swap.used_slots(),
            swap_total: self.swap.capacity(),
        }
    }
}
