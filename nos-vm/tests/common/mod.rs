//! Common test utilities
//!
//! A simulated machine plus helpers that behave like a user process: every
//! access that faults goes through `resolve_fault` and is retried, exactly
//! as the trap handler would restart the instruction.

#![allow(dead_code)]

use std::sync::Arc;

use nos_vm::{AddressSpace, PageFault, PageStatus, SpaceId, VirtAddr, VirtualMemory, VmConfig};
use nos_vm_sim::{Fault, Machine, MemFs};

/// Machine, VM context and file system for one test
pub struct Harness {
    pub machine: Machine,
    pub vm: Arc<VirtualMemory>,
    pub fs: Arc<MemFs>,
}

impl Harness {
    /// Creates a harness with `frames` frames and `swap_slots` slots of swap.
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        Self::with_config(frames, swap_slots, VmConfig::new())
    }

    pub fn with_config(frames: usize, swap_slots: usize, config: VmConfig) -> Self {
        let machine = Machine::new(frames, swap_slots);
        let vm = Arc::new(VirtualMemory::new(
            machine.frames.clone(),
            machine.mmu.clone(),
            machine.disk.clone(),
            config,
        ));
        Self {
            machine,
            vm,
            fs: Arc::new(MemFs::new()),
        }
    }

    /// A fresh address space.
    pub fn space(&self, id: u32) -> AddressSpace {
        AddressSpace::new(SpaceId(id), self.vm.clone(), self.fs.clone())
    }

    /// Stack pointer far above any heap address, so no fault counts as stack growth.
    pub fn idle_sp(&self) -> VirtAddr {
        self.vm.config().user_top
    }

    /// Writes user memory, resolving faults as they come.
    pub fn user_write(&self, space: &AddressSpace, addr: VirtAddr, data: &[u8]) {
        loop {
            match self.machine.mmu.write(space.id(), addr, data) {
                Ok(()) => return,
                Err(Fault::NotPresent(at)) => self.fault(space, at, true),
                Err(fault) => panic!("unexpected {:?}", fault),
            }
        }
    }

    /// Reads user memory, resolving faults as they come.
    pub fn user_read(&self, space: &AddressSpace, addr: VirtAddr, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        loop {
            match self.machine.mmu.read(space.id(), addr, &mut buf) {
                Ok(()) => return buf,
                Err(Fault::NotPresent(at)) => self.fault(space, at, false),
                Err(fault) => panic!("unexpected {:?}", fault),
            }
        }
    }

    fn fault(&self, space: &AddressSpace, addr: VirtAddr, write: bool) {
        let fault = PageFault {
            addr,
            write,
            user_sp: self.idle_sp(),
        };
        if let Err(err) = space.try_resolve_fault(fault) {
            panic!("fault at {} not resolved: {}", addr, err);
        }
    }

    /// Checks the resident/frame bijection and the swap accounting.
    pub fn assert_invariants(&self, spaces: &[&AddressSpace]) {
        let snapshot = self.vm.frames().snapshot();
        let mut resident = 0;
        let mut swapped = 0;
        for space in spaces {
            for page in space.pages().pages() {
                match page.status() {
                    PageStatus::Resident(frame) => {
                        resident += 1;
                        let owners: Vec<_> = snapshot.iter().filter(|info| info.frame == frame).collect();
                        assert_eq!(owners.len(), 1, "{} tracked {} times", frame, owners.len());
                        assert_eq!((owners[0].space, owners[0].vaddr), (page.space(), page.vaddr()));
                    }
                    PageStatus::Swapped(slot) => {
                        swapped += 1;
                        assert!(self.vm.swap().is_allocated(slot));
                    }
                    PageStatus::Unbacked => {}
                }
            }
        }
        assert_eq!(snapshot.len(), resident);
        assert_eq!(self.vm.swap().used_slots(), swapped);
        assert_eq!(
            self.machine.frames.free_count() + resident,
            self.machine.frames.capacity()
        );
    }
}

/// A page-sized pattern derived from `seed`.
pub fn pattern(seed: u8) -> Vec<u8> {
    (0..nos_vm::PAGE_SIZE)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
