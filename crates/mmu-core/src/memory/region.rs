//! Mapped guest regions and their backing storage.

use super::{GuestAddr, Permissions};

/// Host-visible description of a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegionInfo {
    /// Inclusive start address.
    pub base: GuestAddr,
    /// Size in bytes.
    pub size: u32,
    /// Access rights.
    pub perms: Permissions,
}

impl RegionInfo {
    /// Exclusive end address.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }
}

/// A contiguous, permissioned span of guest memory owned by the region table.
///
/// Backing bytes are zero-filled on creation and move with the region when
/// it is split.
#[derive(Clone, PartialEq, Eq)]
pub struct Region {
    base: GuestAddr,
    perms: Permissions,
    data: Vec<u8>,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#010x}", self.base))
            .field("size", &format_args!("{:#x}", self.data.len()))
            .field("perms", &self.perms)
            .finish()
    }
}

impl Region {
    /// Creates a zero-filled region. Callers validate alignment and overlap.
    pub(crate) fn new(base: GuestAddr, size: u32, perms: Permissions) -> Self {
        Self {
            base,
            perms,
            data: vec![0; size as usize],
        }
    }

    /// Inclusive start address.
    #[must_use]
    pub const fn base(&self) -> GuestAddr {
        self.base
    }

    /// Size in bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn size(&self) -> u32 {
        // Sizes come from a u32 map request and only shrink on split.
        self.data.len() as u32
    }

    /// Exclusive end address.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size())
    }

    /// Access rights.
    #[must_use]
    pub const fn perms(&self) -> Permissions {
        self.perms
    }

    pub(crate) const fn set_perms(&mut self, perms: Permissions) {
        self.perms = perms;
    }

    /// Returns `true` when `addr` lies inside this region.
    #[must_use]
    pub fn contains(&self, addr: GuestAddr) -> bool {
        addr >= self.base && u64::from(addr) < self.end()
    }

    /// Returns the host-visible description of this region.
    #[must_use]
    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            base: self.base,
            size: self.size(),
            perms: self.perms,
        }
    }

    /// Backing bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Byte offset of `addr` within this region.
    pub(crate) fn offset(&self, addr: GuestAddr) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.base) as usize
    }

    /// Splits off `[at, end)` as a new region with the same permissions.
    pub(crate) fn split_off(&mut self, at: GuestAddr) -> Self {
        let offset = self.offset(at);
        Self {
            base: at,
            perms: self.perms,
            data: self.data.split_off(offset),
        }
    }
}
