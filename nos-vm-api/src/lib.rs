//! NOS VM API - Interfaces and types for the virtual-memory subsystem
//!
//! This crate holds everything the virtual-memory subsystem shares with the
//! rest of the kernel: address and handle types, the error type, tunable
//! configuration, and the traits implemented by the collaborators the
//! subsystem consumes but does not own.
//!
//! # Architecture
//!
//! - **Addr**: virtual addresses, physical frame handles, descriptors
//! - **Error**: `VmError` and the `Result` alias
//! - **Config**: `VmConfig`, the per-kernel layout and policy knobs
//! - **Flags**: frame allocation flags
//! - **Interface**: physical allocator, hardware mapper, block device and
//!   file system traits
//!
//! The implementation in `nos-vm` depends only on these abstractions, so
//! the same code runs against real hardware or a simulated machine.

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "std")]
extern crate std;

pub mod addr;
pub mod config;
pub mod error;
pub mod flags;
pub mod interface;

pub use addr::{
    page_round_down, page_round_up, Fd, PhysFrame, SpaceId, VirtAddr, PAGE_SHIFT, PAGE_SIZE,
    SECTORS_PER_PAGE, SECTOR_SIZE,
};
pub use config::VmConfig;
pub use error::{Result, VmError};
pub use flags::AllocFlags;
pub use interface::{BlockDevice, FileSystem, FrameAllocator, HardwareMapper};
