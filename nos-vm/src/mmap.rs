//! Memory-mapped files
//!
//! A mapping turns a whole file into a run of file-backed pages starting at
//! a page-aligned user address. Pages are populated lazily on fault and,
//! when dirty, written back to the file on unmap or eviction.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use nos_vm_api::{AllocFlags, Fd, FileSystem, Result, VirtAddr, VmConfig, VmError, PAGE_SIZE};

use crate::file::BackingFile;
use crate::page::{FileBacking, PageTable, Sharing};

/// Identifier of one mapping within an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(u32);

impl MappingId {
    /// Wraps a raw id as passed in by a system call.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map#{}", self.0)
    }
}

/// One live mapping
pub struct MappedRegion {
    id: MappingId,
    start: VirtAddr,
    page_count: usize,
    file: Arc<BackingFile>,
}

impl MappedRegion {
    pub fn id(&self) -> MappingId {
        self.id
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// One past the last mapped byte, rounded up to a page.
    pub fn end(&self) -> VirtAddr {
        self.start.nth_page(self.page_count)
    }

    pub fn file(&self) -> &Arc<BackingFile> {
        &self.file
    }

    fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.end()
    }
}

/// Mapping table of one address space
pub struct MappedFiles {
    fs: Arc<dyn FileSystem>,
    config: VmConfig,
    regions: Mutex<Vec<MappedRegion>>,
    next_id: AtomicU32,
}

impl MappedFiles {
    pub fn new(fs: Arc<dyn FileSystem>, config: VmConfig) -> Self {
        Self {
            fs,
            config,
            regions: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }

    /// Ids of the live mappings, oldest first.
    pub fn ids(&self) -> Vec<MappingId> {
        self.regions.lock().iter().map(|region| region.id).collect()
    }

    /// Maps the whole file behind `fd` at `addr`.
    ///
    /// The mapping holds its own descriptor, so `fd` may be closed right
    /// after this returns. Nothing is read until the pages fault in.
    pub fn map(&self, pages: &PageTable, fd: Fd, addr: VirtAddr) -> Result<MappingId> {
        if addr.is_null() {
            return Err(VmError::InvalidArgument("cannot map at the null address"));
        }
        if fd.0 < self.config.first_user_fd {
            return Err(VmError::InvalidArgument("cannot map a console descriptor"));
        }
        if !addr.is_page_aligned() {
            return Err(VmError::InvalidArgument("mapping address must be page-aligned"));
        }
        let length = match self.fs.file_length(fd) {
            Some(0) | None => return Err(VmError::InvalidArgument("file is empty or unreadable")),
            Some(length) => length,
        };
        let page_count = length.div_ceil(PAGE_SIZE);
        let end = addr
            .checked_add(page_count * PAGE_SIZE)
            .filter(|end| *end <= self.config.user_top)
            .ok_or(VmError::InvalidArgument("mapping extends beyond user space"))?;

        let mut regions = self.regions.lock();
        if let Some(region) = regions.iter().find(|region| region.overlaps(addr, end)) {
            return Err(VmError::AlreadyMapped(region.start));
        }
        if let Some(taken) = (0..page_count).map(|i| addr.nth_page(i)).find(|vaddr| pages.get(*vaddr).is_some()) {
            return Err(VmError::AlreadyMapped(taken));
        }

        let file = BackingFile::reopen(self.fs.clone(), fd)?;
        let mut created = Vec::with_capacity(page_count);
        for index in 0..page_count {
            let offset = index * PAGE_SIZE;
            let created_page = FileBacking::new(file.clone(), offset, (length - offset).min(PAGE_SIZE), Sharing::Shared)
                .and_then(|backing| {
                    pages.create_file_backed(addr.nth_page(index), AllocFlags::USER | AllocFlags::ZERO, true, backing)
                });
            match created_page {
                Ok(page) => created.push(page),
                Err(err) => {
                    for page in &created {
                        // Never activated, so destroy has nothing to release.
                        if let Err(undo_err) = pages.destroy(page) {
                            log::warn!("mmap: rollback of {} at {} failed: {}", fd, page.vaddr(), undo_err);
                        }
                    }
                    file.close();
                    return Err(err);
                }
            }
        }

        let id = MappingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        regions.push(MappedRegion {
            id,
            start: addr,
            page_count,
            file,
        });
        log::debug!(
            "mmap: {} {} bytes of {} at {}..{}",
            id,
            length,
            fd,
            addr,
            end
        );
        Ok(id)
    }

    /// Removes a mapping, writing dirty pages back to the file.
    pub fn unmap(&self, pages: &PageTable, id: MappingId) -> Result<()> {
        let region = {
            let mut regions = self.regions.lock();
            let index = regions
                .iter()
                .position(|region| region.id == id)
                .ok_or(VmError::UnknownMapping(id.0))?;
            regions.remove(index)
        };
        self.release(pages, region);
        Ok(())
    }

    /// Removes every mapping.
    pub fn unmap_all(&self, pages: &PageTable) {
        let regions: Vec<MappedRegion> = self.regions.lock().drain(..).collect();
        for region in regions {
            self.release(pages, region);
        }
    }

    fn release(&self, pages: &PageTable, region: MappedRegion) {
        for index in 0..region.page_count {
            let vaddr = region.start.nth_page(index);
            let Some(page) = pages.get(vaddr) else {
                log::warn!("mmap: {} lost page {}", region.id, vaddr);
                continue;
            };
            if let Err(err) = pages.destroy_and_write_back(&page) {
                log::warn!("mmap: {} failed to release {}: {}", region.id, vaddr, err);
            }
        }
        region.file.close();
        log::debug!("mmap: {} unmapped from {}", region.id, region.start);
    }
}
