//! Public handle for changing the region table.

use super::{GuestAddr, Permissions, RegionInfo, RegionTable};
use crate::MapError;

/// Mutation handle over one emulator's region table.
///
/// Obtained from [`Emulator::memory`](crate::Emulator::memory) by the host and
/// from [`FaultContext::memory`](super::FaultContext::memory) inside fault
/// hooks. Every change is visible to the next access check.
#[derive(Debug)]
pub struct RegionMutator<'a> {
    table: &'a mut RegionTable,
}

impl<'a> RegionMutator<'a> {
    pub(crate) fn new(table: &'a mut RegionTable) -> Self {
        Self { table }
    }

    /// Maps `[base, base + size)` as a new zero-filled region.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::Alignment`], [`MapError::EmptyRange`] or
    /// [`MapError::RangeOverflow`] for bad parameters and
    /// [`MapError::Overlap`] when any byte is already mapped.
    pub fn map(&mut self, base: GuestAddr, size: u32, perms: Permissions) -> Result<(), MapError> {
        self.table.map(base, size, perms)
    }

    /// Unmaps `[base, base + size)`, splitting regions at the boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NotMapped`] at the first gap, leaving the table
    /// unchanged, or a parameter error as for [`Self::map`].
    pub fn unmap(&mut self, base: GuestAddr, size: u32) -> Result<(), MapError> {
        self.table.unmap(base, size)
    }

    /// Replaces the permissions of `[base, base + size)`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::unmap`].
    pub fn protect(
        &mut self,
        base: GuestAddr,
        size: u32,
        perms: Permissions,
    ) -> Result<(), MapError> {
        self.table.protect(base, size, perms)
    }

    /// Reads guest bytes, ignoring permissions.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NotMapped`] when any byte is unmapped.
    pub fn read(&self, address: GuestAddr, buf: &mut [u8]) -> Result<(), MapError> {
        self.table.read_bytes(address, buf)
    }

    /// Reads a little-endian `u32`, ignoring permissions.
    ///
    /// # Errors
    ///
    /// Same as [`Self::read`].
    pub fn read_u32(&self, address: GuestAddr) -> Result<u32, MapError> {
        let mut buf = [0; 4];
        self.table.read_bytes(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes guest bytes, ignoring permissions. Nothing is written on error.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NotMapped`] when any byte is unmapped.
    pub fn write(&mut self, address: GuestAddr, data: &[u8]) -> Result<(), MapError> {
        self.table.write_bytes(address, data)
    }

    /// Region containing `address`, if any.
    #[must_use]
    pub fn lookup(&self, address: GuestAddr) -> Option<RegionInfo> {
        self.table.lookup(address).map(super::Region::info)
    }

    /// All regions in ascending address order.
    #[must_use]
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.table.infos()
    }
}
