//! Permission checks for guest accesses against the region table.

use log::trace;

use super::{GuestAddr, Permissions, RegionTable, Segment};
use crate::FaultKind;

/// Kind of guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessKind {
    /// Data load, including the read half of a read-modify-write.
    Read,
    /// Data store.
    Write,
    /// Instruction fetch.
    Fetch,
}

impl AccessKind {
    /// Permission bit every touched region must carry.
    #[must_use]
    pub const fn required(self) -> Permissions {
        match self {
            Self::Read => Permissions::READ,
            Self::Write => Permissions::WRITE,
            Self::Fetch => Permissions::EXEC,
        }
    }

    /// Violation raised when a mapped region lacks [`Self::required`].
    #[must_use]
    pub const fn denied(self) -> FaultKind {
        match self {
            Self::Read => FaultKind::ReadProtected,
            Self::Write => FaultKind::WriteProtected,
            Self::Fetch => FaultKind::ExecProtected,
        }
    }
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Fetch => "fetch",
        })
    }
}

/// First failing byte of a checked access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Violation {
    /// What went wrong.
    pub kind: FaultKind,
    /// Lowest address inside the access at which it went wrong.
    pub address: GuestAddr,
}

/// Checks `[address, address + length)` for `kind` against `table`.
///
/// Pieces are examined in ascending address order, so the reported violation
/// is the one a byte-at-a-time access would reach first. Zero-length accesses
/// always pass. Callers reject ranges that wrap the address space before
/// checking.
///
/// # Errors
///
/// Returns a [`Violation`] naming the first unmapped byte or the first byte
/// in a region lacking the permission `kind` requires.
pub fn check(
    table: &RegionTable,
    address: GuestAddr,
    length: usize,
    kind: AccessKind,
) -> Result<(), Violation> {
    if length == 0 {
        return Ok(());
    }
    trace!("check {kind} {address:#010x}+{length:#x}");

    let required = kind.required();
    for segment in table.lookup_range(address, length as u64) {
        match segment {
            Segment::Gap { start, .. } => {
                return Err(Violation {
                    kind: FaultKind::Unmapped,
                    address: start,
                });
            }
            Segment::Mapped { start, perms, .. } if !perms.contains(required) => {
                return Err(Violation {
                    kind: kind.denied(),
                    address: start,
                });
            }
            Segment::Mapped { .. } => {}
        }
    }
    Ok(())
}
