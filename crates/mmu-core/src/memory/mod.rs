//! Guest memory model: permissioned regions, access checks, and fault dispatch.

/// Permission checker for guest accesses.
pub mod access;
/// Access gateway composing checks, fault dispatch, and byte transfer.
pub mod gateway;
/// Fault hook registrations and dispatch.
pub mod hooks;
/// Address-ordered region table.
pub mod map;
/// Public mutation handle over the region table.
pub mod mutator;
/// Single mapped region with its backing bytes.
pub mod region;

use bitflags::bitflags;

pub use access::{check, AccessKind, Violation};
pub use gateway::AddressSpace;
pub use hooks::{
    DispatchOutcome, FaultContext, FaultDecision, FaultHandler, FaultRecord, HookId, HookTable,
};
pub use map::{RegionTable, Segment};
pub use mutator::RegionMutator;
pub use region::{Region, RegionInfo};

/// Address in the flat 32-bit guest address space.
pub type GuestAddr = u32;

/// Granularity of region bases and sizes.
pub const PAGE_SIZE: u32 = 0x1000;

const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Exclusive upper bound of the guest address space.
pub const ADDRESS_SPACE_END: u64 = 1 << 32;

/// Returns `true` when `value` is a multiple of [`PAGE_SIZE`].
#[must_use]
pub const fn is_page_aligned(value: u32) -> bool {
    value & PAGE_MASK == 0
}

/// Rounds `addr` down to its page boundary.
#[must_use]
pub const fn page_align_down(addr: GuestAddr) -> GuestAddr {
    addr & !PAGE_MASK
}

/// Rounds `addr` up to the next page boundary, or `None` past the top of the space.
#[must_use]
pub const fn page_align_up(addr: GuestAddr) -> Option<GuestAddr> {
    match addr.checked_add(PAGE_MASK) {
        Some(sum) => Some(sum & !PAGE_MASK),
        None => None,
    }
}

/// Exclusive end of `[start, start + len)` if it fits in the address space.
#[must_use]
pub fn range_end(start: GuestAddr, len: u64) -> Option<u64> {
    let end = u64::from(start).checked_add(len)?;
    (end <= ADDRESS_SPACE_END).then_some(end)
}

bitflags! {
    /// Access rights granted by a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct Permissions: u8 {
        /// Loads are allowed.
        const READ = 1 << 0;
        /// Stores are allowed.
        const WRITE = 1 << 1;
        /// Instruction fetches are allowed.
        const EXEC = 1 << 2;
        /// Read and write.
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute.
        const RX = Self::READ.bits() | Self::EXEC.bits();
        /// Read, write, and execute.
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}
