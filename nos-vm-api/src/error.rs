//! Error handling for the virtual-memory subsystem

use core::fmt;

use crate::addr::VirtAddr;

/// Errors reported by the virtual-memory subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Caller passed an argument the operation rejects
    InvalidArgument(&'static str),
    /// A page entry already exists for this address
    AlreadyMapped(VirtAddr),
    /// No page entry exists for this address
    NotMapped(VirtAddr),
    /// The page entry was destroyed while the caller still held it
    PageDestroyed(VirtAddr),
    /// Write access to a read-only page
    PermissionDenied(VirtAddr),
    /// The hardware mapper refused to install a mapping
    MapFailed(VirtAddr),
    /// No free frame and no frame eligible for eviction
    OutOfMemory,
    /// Every swap slot is occupied
    SwapExhausted,
    /// Swap slot was read or written without being allocated
    SlotNotInUse(usize),
    /// No mapped-file region with this id
    UnknownMapping(u32),
    /// The file-system collaborator failed
    IoError(&'static str),
}

impl VmError {
    /// Whether memory or swap ran out, as opposed to a caller error.
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, VmError::OutOfMemory | VmError::SwapExhausted)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            VmError::AlreadyMapped(addr) => write!(f, "Page already mapped at {}", addr),
            VmError::NotMapped(addr) => write!(f, "No page mapped at {}", addr),
            VmError::PageDestroyed(addr) => write!(f, "Page at {} was destroyed", addr),
            VmError::PermissionDenied(addr) => write!(f, "Write to read-only page at {}", addr),
            VmError::MapFailed(addr) => write!(f, "Hardware mapping failed at {}", addr),
            VmError::OutOfMemory => write!(f, "Out of memory: no evictable frame"),
            VmError::SwapExhausted => write!(f, "Swap device exhausted"),
            VmError::SlotNotInUse(slot) => write!(f, "Swap slot {} is not in use", slot),
            VmError::UnknownMapping(id) => write!(f, "Unknown mapping id {}", id),
            VmError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for VmError {}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, VmError>;
