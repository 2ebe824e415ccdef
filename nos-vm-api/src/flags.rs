//! Frame allocation flags

bitflags::bitflags! {
    /// Flags passed through to the physical allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u8 {
        /// Frame will back a user page
        const USER = 0b0000_0001;
        /// Frame must be zero-filled before it is handed out
        const ZERO = 0b0000_0010;
    }
}

impl Default for AllocFlags {
    fn default() -> Self {
        AllocFlags::USER
    }
}
