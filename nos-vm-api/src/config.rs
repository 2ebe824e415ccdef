//! Tunable layout and policy for the virtual-memory subsystem

use crate::addr::VirtAddr;

/// Virtual-memory configuration shared by every address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// First address above user space; the stack grows down from here
    pub user_top: VirtAddr,

    /// Maximum stack size in bytes
    pub max_stack_size: usize,

    /// How far below the user stack pointer an access may fault and still
    /// count as stack growth (PUSHA writes 32 bytes below `esp`)
    pub stack_slack: usize,

    /// Lowest descriptor a user process can own; 0 and 1 are the console
    pub first_user_fd: i32,
}

impl VmConfig {
    /// Default configuration: 3GB user space, 8MB stack.
    pub const fn new() -> Self {
        Self {
            user_top: VirtAddr::new(0xC000_0000),
            max_stack_size: 8 * 1024 * 1024,
            stack_slack: 32,
            first_user_fd: 2,
        }
    }

    /// Overrides the top of user space.
    pub const fn with_user_top(mut self, user_top: VirtAddr) -> Self {
        self.user_top = user_top;
        self
    }

    /// Overrides the maximum stack size.
    pub const fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    /// Overrides the stack-pointer slack.
    pub const fn with_stack_slack(mut self, bytes: usize) -> Self {
        self.stack_slack = bytes;
        self
    }

    /// Lowest address the stack may grow down to.
    pub const fn stack_limit(&self) -> VirtAddr {
        VirtAddr::new(self.user_top.as_usize().saturating_sub(self.max_stack_size))
    }

    /// Whether `addr` lies in user space.
    pub const fn is_user_address(&self, addr: VirtAddr) -> bool {
        !addr.is_null() && addr.as_usize() < self.user_top.as_usize()
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_limit() {
        let config = VmConfig::new().with_max_stack_size(0x10000);
        assert_eq!(config.stack_limit(), VirtAddr::new(0xBFFF_0000));
        assert!(config.is_user_address(VirtAddr::new(0xBFFF_FFFF)));
        assert!(!config.is_user_address(VirtAddr::new(0xC000_0000)));
        assert!(!config.is_user_address(VirtAddr::new(0)));
    }
}
