//! Address and handle types

use core::fmt;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;
/// Block device sector size
pub const SECTOR_SIZE: usize = 512;
/// Sectors needed to hold one page
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

static_assertions::const_assert_eq!(1 << PAGE_SHIFT, PAGE_SIZE);
static_assertions::const_assert_eq!(PAGE_SIZE % SECTOR_SIZE, 0);

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A user virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns true for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the page number for this virtual address.
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Checks if the virtual address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds down the virtual address to the previous page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Adds a byte offset, returning `None` on overflow.
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Address of the `index`th page after this one.
    pub const fn nth_page(self, index: usize) -> Self {
        Self(self.0 + index * PAGE_SIZE)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque handle to one physical frame, as issued by the physical allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysFrame(usize);

impl PhysFrame {
    /// Wraps an allocator-specific frame number.
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    /// Returns the allocator-specific frame number.
    pub const fn number(self) -> usize {
        self.0
    }
}

impl fmt::Display for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// Identifier of an address space, as understood by the hardware mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub u32);

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// File descriptor understood by the file-system collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fd(pub i32);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_up(0x1234), 0x2000);
        assert_eq!(page_round_up(0x2000), 0x2000);
        assert_eq!(SECTORS_PER_PAGE, 8);
    }

    #[test]
    fn test_virt_addr() {
        let addr = VirtAddr::new(0x8048_123);
        assert_eq!(addr.page_offset(), 0x123);
        assert_eq!(addr.page_round_down(), VirtAddr::new(0x8048_000));
        assert!(!addr.is_page_aligned());
        assert_eq!(VirtAddr::new(0x1000).nth_page(2), VirtAddr::new(0x3000));
        assert_eq!(VirtAddr::new(usize::MAX).checked_add(1), None);
        assert!(VirtAddr::default().is_null());
    }
}
