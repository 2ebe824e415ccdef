//! NOS Virtual Memory
//!
//! Demand paging for user processes: a supplemental page table per address
//! space, a system-wide frame table with second-chance eviction, a swap
//! store on a dedicated block device, and memory-mapped files.
//!
//! The crate owns no hardware. Physical frames, page-table entries, the swap
//! disk and files are reached through the traits in `nos_vm_api`, so the
//! same code runs in the kernel and against the `nos-vm-sim` machine in
//! tests.
//!
//! Lock order is page entry, then frame table, then swap store. The frame
//! table only ever *tries* a page lock while holding its own.

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]

extern crate alloc;

pub use nos_vm_api::*;

pub mod file;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod space;
pub mod swap;
pub mod vm;

pub use file::BackingFile;
pub use frame::{FrameFlags, FrameInfo, FrameStats, FrameTable};
pub use mmap::{MappedFiles, MappedRegion, MappingId};
pub use page::{FileBacking, PageEntry, PageStatus, PageTable, Sharing};
pub use space::{AddressSpace, PageFault};
pub use swap::{SlotIndex, SwapStore};
pub use vm::{VirtualMemory, VmStats};
