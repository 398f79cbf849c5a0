//! Access gateway: permission check, fault dispatch with bounded retry, then
//! byte transfer.

use log::warn;

use super::{
    check, range_end, AccessKind, DispatchOutcome, FaultRecord, GuestAddr, HookTable,
    RegionMutator, RegionTable,
};
use crate::state::RegisterFile;
use crate::{AccessError, AccessFault, FaultKind, MapError};

/// Guest address space: region table, fault hooks and the retry budget.
#[derive(Debug, Default)]
pub struct AddressSpace {
    regions: RegionTable,
    hooks: HookTable,
    retry_budget: u32,
}

impl AddressSpace {
    /// Creates an empty address space allowing `retry_budget` retries per access.
    #[must_use]
    pub const fn new(retry_budget: u32) -> Self {
        Self {
            regions: RegionTable::new(),
            hooks: HookTable::new(),
            retry_budget,
        }
    }

    /// Read-only view of the region table.
    #[must_use]
    pub const fn regions(&self) -> &RegionTable {
        &self.regions
    }

    /// Host mutation handle over the region table.
    pub fn mutator(&mut self) -> RegionMutator<'_> {
        RegionMutator::new(&mut self.regions)
    }

    /// Fault hook registrations.
    pub fn hooks_mut(&mut self) -> &mut HookTable {
        &mut self.hooks
    }

    /// Retries allowed per access.
    #[must_use]
    pub const fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Reads `length` bytes for a guest load.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] when the access cannot be completed.
    pub fn read(
        &mut self,
        regs: &mut RegisterFile,
        address: GuestAddr,
        length: usize,
    ) -> Result<Vec<u8>, AccessError> {
        let mut buf = vec![0; length];
        self.read_into(regs, address, &mut buf)?;
        Ok(buf)
    }

    /// Fills `buf` for a guest load.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] when the access cannot be completed; `buf` is
    /// left untouched.
    pub fn read_into(
        &mut self,
        regs: &mut RegisterFile,
        address: GuestAddr,
        buf: &mut [u8],
    ) -> Result<(), AccessError> {
        self.transfer_out(regs, AccessKind::Read, address, buf)
    }

    /// Reads `length` bytes for an instruction fetch.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] when the access cannot be completed.
    pub fn fetch(
        &mut self,
        regs: &mut RegisterFile,
        address: GuestAddr,
        length: usize,
    ) -> Result<Vec<u8>, AccessError> {
        let mut buf = vec![0; length];
        self.fetch_into(regs, address, &mut buf)?;
        Ok(buf)
    }

    /// Fills `buf` for an instruction fetch.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] when the access cannot be completed; `buf` is
    /// left untouched.
    pub fn fetch_into(
        &mut self,
        regs: &mut RegisterFile,
        address: GuestAddr,
        buf: &mut [u8],
    ) -> Result<(), AccessError> {
        self.transfer_out(regs, AccessKind::Fetch, address, buf)
    }

    /// Stores `data` for a guest write. Nothing is written unless every byte
    /// passes the check.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] when the access cannot be completed.
    pub fn write(
        &mut self,
        regs: &mut RegisterFile,
        address: GuestAddr,
        data: &[u8],
    ) -> Result<(), AccessError> {
        let value = store_value(data);
        self.resolve(regs, AccessKind::Write, address, data.len(), value)?;
        self.regions
            .write_bytes(address, data)
            .map_err(|err| transfer_error(AccessKind::Write, address, data.len(), err))
    }

    fn transfer_out(
        &mut self,
        regs: &mut RegisterFile,
        access: AccessKind,
        address: GuestAddr,
        buf: &mut [u8],
    ) -> Result<(), AccessError> {
        self.resolve(regs, access, address, buf.len(), None)?;
        self.regions
            .read_bytes(address, buf)
            .map_err(|err| transfer_error(access, address, buf.len(), err))
    }

    /// Checks the access, dispatching violations until it passes, a hook
    /// stops it, or the retry budget runs out.
    fn resolve(
        &mut self,
        regs: &mut RegisterFile,
        access: AccessKind,
        address: GuestAddr,
        length: usize,
        value: Option<u64>,
    ) -> Result<(), AccessError> {
        if range_end(address, length as u64).is_none() {
            return Err(AccessError::AddressOverflow {
                access,
                address,
                length,
            });
        }

        let Self {
            regions,
            hooks,
            retry_budget,
        } = self;

        let mut attempt = 0;
        loop {
            let Err(violation) = check(regions, address, length, access) else {
                return Ok(());
            };

            let fault = AccessFault {
                kind: violation.kind,
                access,
                address,
                length,
                fault_address: violation.address,
            };
            let record = FaultRecord {
                kind: violation.kind,
                access,
                address,
                length,
                fault_address: violation.address,
                value,
                attempt,
            };

            match hooks.dispatch(regions, regs, &record) {
                DispatchOutcome::Abort => return Err(AccessError::Unresolved(fault)),
                DispatchOutcome::Retry if attempt == *retry_budget => {
                    warn!("retry budget of {retry_budget} exhausted: {fault}");
                    return Err(AccessError::RetryBudgetExceeded {
                        fault,
                        budget: *retry_budget,
                    });
                }
                DispatchOutcome::Retry => attempt += 1,
            }
        }
    }
}

/// Little-endian value of a store of at most eight bytes.
fn store_value(data: &[u8]) -> Option<u64> {
    (!data.is_empty() && data.len() <= 8).then(|| {
        let mut raw = [0; 8];
        raw[..data.len()].copy_from_slice(data);
        u64::from_le_bytes(raw)
    })
}

/// Maps a host copy failure after a passed check onto the access taxonomy.
fn transfer_error(
    access: AccessKind,
    address: GuestAddr,
    length: usize,
    err: MapError,
) -> AccessError {
    match err {
        MapError::RangeOverflow { .. } => AccessError::AddressOverflow {
            access,
            address,
            length,
        },
        MapError::NotMapped {
            address: fault_address,
        } => AccessError::Unresolved(AccessFault {
            kind: FaultKind::Unmapped,
            access,
            address,
            length,
            fault_address,
        }),
        MapError::Alignment { .. } | MapError::Overlap { .. } | MapError::EmptyRange { .. } => {
            AccessError::Unresolved(AccessFault {
                kind: FaultKind::Unmapped,
                access,
                address,
                length,
                fault_address: address,
            })
        }
    }
}
