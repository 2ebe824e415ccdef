//! Per-process address space
//!
//! Ties one supplemental page table and one mapping table to the shared
//! [`VirtualMemory`] context. The page-fault handler calls
//! [`AddressSpace::resolve_fault`]; system calls use the rest.

use alloc::sync::Arc;
use alloc::vec::Vec;

use nos_vm_api::{AllocFlags, Fd, FileSystem, Result, SpaceId, VirtAddr, VmError};

use crate::mmap::{MappedFiles, MappingId};
use crate::page::{PageEntry, PageTable};
use crate::vm::VirtualMemory;

/// A user page fault as reported by the trap handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address
    pub addr: VirtAddr,
    /// Whether the access was a write
    pub write: bool,
    /// User stack pointer at the time of the fault
    pub user_sp: VirtAddr,
}

/// Virtual memory of one process
pub struct AddressSpace {
    id: SpaceId,
    vm: Arc<VirtualMemory>,
    pages: PageTable,
    mappings: MappedFiles,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new(id: SpaceId, vm: Arc<VirtualMemory>, fs: Arc<dyn FileSystem>) -> Self {
        let config = *vm.config();
        Self {
            id,
            pages: PageTable::new(id, vm.clone()),
            mappings: MappedFiles::new(fs, config),
            vm,
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// The supplemental page table.
    pub fn pages(&self) -> &PageTable {
        &self.pages
    }

    /// The mapped-file table.
    pub fn mappings(&self) -> &MappedFiles {
        &self.mappings
    }

    /// Resolves a user page fault.
    ///
    /// Returns false when the fault cannot be resolved and the process has
    /// to be killed.
    pub fn resolve_fault(&self, fault: PageFault) -> bool {
        match self.try_resolve_fault(fault) {
            Ok(()) => true,
            Err(err) => {
                if err.is_exhaustion() {
                    log::error!("vm: {} fault at {} failed: {}", self.id, fault.addr, err);
                } else {
                    log::debug!("vm: {} fault at {} rejected: {}", self.id, fault.addr, err);
                }
                false
            }
        }
    }

    /// Like [`resolve_fault`](Self::resolve_fault), but says why it failed.
    pub fn try_resolve_fault(&self, fault: PageFault) -> Result<()> {
        let config = self.vm.config();
        if !config.is_user_address(fault.addr) {
            return Err(VmError::InvalidArgument("fault outside user space"));
        }
        let page = match self.pages.lookup(fault.addr) {
            Some(page) => page,
            None if self.is_stack_access(fault) => self.grow_stack(fault.addr)?,
            None => return Err(VmError::NotMapped(fault.addr)),
        };
        if fault.write && !page.is_writable() {
            return Err(VmError::PermissionDenied(fault.addr));
        }
        self.pages.activate(&page)?;
        Ok(())
    }

    fn is_stack_access(&self, fault: PageFault) -> bool {
        let config = self.vm.config();
        fault.addr >= config.stack_limit()
            && fault.addr.as_usize().saturating_add(config.stack_slack) >= fault.user_sp.as_usize()
    }

    fn grow_stack(&self, addr: VirtAddr) -> Result<Arc<PageEntry>> {
        let vaddr = addr.page_round_down();
        match self.pages.create(vaddr, AllocFlags::USER | AllocFlags::ZERO, true) {
            Ok(page) => {
                log::trace!("vm: {} stack grew to {}", self.id, vaddr);
                Ok(page)
            }
            // Another thread of this process faulted on the same page first.
            Err(VmError::AlreadyMapped(_)) => self.pages.get(vaddr).ok_or(VmError::NotMapped(vaddr)),
            Err(err) => Err(err),
        }
    }

    /// Maps the file behind `fd` at `addr`.
    pub fn map(&self, fd: Fd, addr: VirtAddr) -> Result<MappingId> {
        self.mappings.map(&self.pages, fd, addr)
    }

    /// Removes a file mapping, writing back dirty pages.
    pub fn unmap(&self, id: MappingId) -> Result<()> {
        self.mappings.unmap(&self.pages, id)
    }

    /// Faults in and pins every page overlapping `[addr, addr + len)`.
    ///
    /// Fails with [`VmError::NotMapped`] on the first page the process has
    /// no entry for; pages pinned before the failure are unpinned again.
    pub fn pin(&self, addr: VirtAddr, len: usize) -> Result<()> {
        let mut pinned = Vec::new();
        let result = self.for_each_page(addr, len, |page| {
            self.pages.set_swappable(page, false)?;
            pinned.push(page.clone());
            Ok(())
        });
        if result.is_err() {
            for page in &pinned {
                if let Err(err) = self.pages.set_swappable(page, true) {
                    log::warn!("vm: {} unpin of {} failed: {}", self.id, page.vaddr(), err);
                }
            }
        }
        result
    }

    /// Makes every page overlapping `[addr, addr + len)` evictable again.
    pub fn unpin(&self, addr: VirtAddr, len: usize) -> Result<()> {
        self.for_each_page(addr, len, |page| self.pages.set_swappable(page, true))
    }

    fn for_each_page(
        &self,
        addr: VirtAddr,
        len: usize,
        mut f: impl FnMut(&Arc<PageEntry>) -> Result<()>,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let last = addr
            .checked_add(len - 1)
            .ok_or(VmError::InvalidArgument("buffer wraps around"))?;
        let first_page = addr.page_number();
        for number in first_page..=last.page_number() {
            let vaddr = addr.page_round_down().nth_page(number - first_page);
            let page = self.pages.get(vaddr).ok_or(VmError::NotMapped(vaddr))?;
            f(&page)?;
        }
        Ok(())
    }

    /// Releases everything the address space holds.
    ///
    /// Mappings are written back first; every other page then gives up its
    /// frame or swap slot. Runs again harmlessly from `Drop`.
    pub fn teardown(&self) {
        self.mappings.unmap_all(&self.pages);
        self.pages.clear();
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.teardown();
    }
}
