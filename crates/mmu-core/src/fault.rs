use bitflags::bitflags;
use thiserror::Error;

use crate::memory::{AccessKind, GuestAddr};

/// Fault classes used for diagnostics aggregation and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FaultClass {
    /// Host or callback passed bad parameters to a region mutation.
    Mapping,
    /// Guest access hit unmapped or insufficiently permissioned memory.
    Access,
    /// Fault dispatch could not settle an access.
    Dispatch,
    /// Instruction bytes could not be decoded.
    Decode,
}

/// Stable status taxonomy surfaced to hosts after a failed call or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum FaultCode {
    /// Region base or size is not page aligned.
    #[error("region is not page aligned")]
    Alignment = 0x01,
    /// Region overlaps an existing mapping.
    #[error("region overlaps an existing mapping")]
    Overlap = 0x02,
    /// Requested range is not fully mapped.
    #[error("range is not mapped")]
    NotMapped = 0x03,
    /// Region size is zero.
    #[error("region is empty")]
    EmptyRange = 0x04,
    /// Region end runs past the top of the address space.
    #[error("region wraps past the end of the address space")]
    RangeOverflow = 0x05,
    /// Guest access touched unmapped memory.
    #[error("unmapped memory access")]
    UnmappedAccess = 0x10,
    /// Guest store touched memory without write permission.
    #[error("write to read-only memory")]
    ReadOnlyViolation = 0x11,
    /// Guest fetch touched memory without execute permission.
    #[error("fetch from non-executable memory")]
    ExecViolation = 0x12,
    /// Guest load touched memory without read permission.
    #[error("read from non-readable memory")]
    ReadViolation = 0x13,
    /// Fault callbacks kept asking for retries without resolving the fault.
    #[error("fault retry budget exceeded")]
    RetryBudgetExceeded = 0x14,
    /// Access range wraps past the top of the address space.
    #[error("access wraps past the end of the address space")]
    AddressOverflow = 0x15,
    /// Fetched bytes do not form a supported instruction.
    #[error("invalid instruction")]
    InvalidInstruction = 0x20,
}

impl FaultCode {
    /// Converts a fault code to its stable byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a stable byte value back into a fault code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Alignment),
            0x02 => Some(Self::Overlap),
            0x03 => Some(Self::NotMapped),
            0x04 => Some(Self::EmptyRange),
            0x05 => Some(Self::RangeOverflow),
            0x10 => Some(Self::UnmappedAccess),
            0x11 => Some(Self::ReadOnlyViolation),
            0x12 => Some(Self::ExecViolation),
            0x13 => Some(Self::ReadViolation),
            0x14 => Some(Self::RetryBudgetExceeded),
            0x15 => Some(Self::AddressOverflow),
            0x20 => Some(Self::InvalidInstruction),
            _ => None,
        }
    }

    /// Returns the diagnostics fault class for this fault code.
    #[must_use]
    pub const fn class(self) -> FaultClass {
        match self {
            Self::Alignment
            | Self::Overlap
            | Self::NotMapped
            | Self::EmptyRange
            | Self::RangeOverflow => FaultClass::Mapping,
            Self::UnmappedAccess
            | Self::ReadOnlyViolation
            | Self::ExecViolation
            | Self::ReadViolation
            | Self::AddressOverflow => FaultClass::Access,
            Self::RetryBudgetExceeded => FaultClass::Dispatch,
            Self::InvalidInstruction => FaultClass::Decode,
        }
    }
}

/// Violation kinds raised by the permission checker and routed to fault hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FaultKind {
    /// Some byte of the access is not covered by any region.
    Unmapped,
    /// A store hit a region without [`Permissions::WRITE`](crate::Permissions::WRITE).
    WriteProtected,
    /// A fetch hit a region without [`Permissions::EXEC`](crate::Permissions::EXEC).
    ExecProtected,
    /// A load hit a region without [`Permissions::READ`](crate::Permissions::READ).
    ReadProtected,
}

impl FaultKind {
    /// Returns the stable status code reported when this violation ends a run.
    #[must_use]
    pub const fn code(self) -> FaultCode {
        match self {
            Self::Unmapped => FaultCode::UnmappedAccess,
            Self::WriteProtected => FaultCode::ReadOnlyViolation,
            Self::ExecProtected => FaultCode::ExecViolation,
            Self::ReadProtected => FaultCode::ReadViolation,
        }
    }

    /// Returns the single-bit filter mask matching this kind.
    #[must_use]
    pub const fn mask(self) -> FaultKinds {
        match self {
            Self::Unmapped => FaultKinds::UNMAPPED,
            Self::WriteProtected => FaultKinds::WRITE_PROTECTED,
            Self::ExecProtected => FaultKinds::EXEC_PROTECTED,
            Self::ReadProtected => FaultKinds::READ_PROTECTED,
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.code(), f)
    }
}

bitflags! {
    /// Kind filter for fault hook registrations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FaultKinds: u8 {
        /// Matches [`FaultKind::Unmapped`].
        const UNMAPPED = 1 << 0;
        /// Matches [`FaultKind::WriteProtected`].
        const WRITE_PROTECTED = 1 << 1;
        /// Matches [`FaultKind::ExecProtected`].
        const EXEC_PROTECTED = 1 << 2;
        /// Matches [`FaultKind::ReadProtected`].
        const READ_PROTECTED = 1 << 3;
        /// Any permission violation on mapped memory.
        const PROTECTION = Self::WRITE_PROTECTED.bits()
            | Self::EXEC_PROTECTED.bits()
            | Self::READ_PROTECTED.bits();
        /// Wildcard filter.
        const ALL = Self::UNMAPPED.bits() | Self::PROTECTION.bits();
    }
}

impl FaultKinds {
    /// Returns `true` when the filter accepts `kind`.
    #[must_use]
    pub const fn matches(self, kind: FaultKind) -> bool {
        self.contains(kind.mask())
    }
}

/// Errors returned synchronously by region mutations and host memory copies.
///
/// These never end a run on their own; the caller decides what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MapError {
    /// Base or size is not a multiple of [`PAGE_SIZE`](crate::PAGE_SIZE).
    #[error("range {base:#010x}+{size:#x} is not page aligned")]
    Alignment {
        /// Requested base address.
        base: GuestAddr,
        /// Requested size in bytes.
        size: u32,
    },
    /// Requested range overlaps the region starting at `existing`.
    #[error("range {base:#010x}+{size:#x} overlaps region at {existing:#010x}")]
    Overlap {
        /// Requested base address.
        base: GuestAddr,
        /// Requested size in bytes.
        size: u32,
        /// Base of the first overlapping region.
        existing: GuestAddr,
    },
    /// Some byte of the requested range is not mapped.
    #[error("address {address:#010x} is not mapped")]
    NotMapped {
        /// First unmapped address inside the requested range.
        address: GuestAddr,
    },
    /// Requested size is zero.
    #[error("empty range at {base:#010x}")]
    EmptyRange {
        /// Requested base address.
        base: GuestAddr,
    },
    /// Requested range ends past the top of the 32-bit address space.
    #[error("range {base:#010x}+{size:#x} wraps past the end of the address space")]
    RangeOverflow {
        /// Requested base address.
        base: GuestAddr,
        /// Requested size in bytes.
        size: u64,
    },
}

impl MapError {
    /// Returns the stable status code for this error.
    #[must_use]
    pub const fn code(&self) -> FaultCode {
        match self {
            Self::Alignment { .. } => FaultCode::Alignment,
            Self::Overlap { .. } => FaultCode::Overlap,
            Self::NotMapped { .. } => FaultCode::NotMapped,
            Self::EmptyRange { .. } => FaultCode::EmptyRange,
            Self::RangeOverflow { .. } => FaultCode::RangeOverflow,
        }
    }
}

/// Description of a guest access that could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct AccessFault {
    /// Violation kind of the last failed check.
    pub kind: FaultKind,
    /// Kind of the guest access.
    pub access: AccessKind,
    /// First address of the access.
    pub address: GuestAddr,
    /// Length of the access in bytes.
    pub length: usize,
    /// First address at which the access failed.
    pub fault_address: GuestAddr,
}

impl std::fmt::Display for AccessFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} during {} of {:#x} bytes at {:#010x} (first failing byte {:#010x})",
            self.kind, self.access, self.length, self.address, self.fault_address
        )
    }
}

/// Terminal failure of a guest access issued through the access gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum AccessError {
    /// No callback resolved the violation, or one asked to stop.
    #[error("unresolved memory fault: {0}")]
    Unresolved(AccessFault),
    /// Callbacks kept requesting retries past the configured budget.
    #[error("retry budget of {budget} exhausted: {fault}")]
    RetryBudgetExceeded {
        /// Violation observed on the final check.
        fault: AccessFault,
        /// Budget in effect for the access.
        budget: u32,
    },
    /// Access range runs past the top of the address space.
    #[error("{access} of {length:#x} bytes at {address:#010x} wraps the address space")]
    AddressOverflow {
        /// Kind of the guest access.
        access: AccessKind,
        /// First address of the access.
        address: GuestAddr,
        /// Length of the access in bytes.
        length: usize,
    },
}

impl AccessError {
    /// Returns the stable status code for this error.
    #[must_use]
    pub const fn code(&self) -> FaultCode {
        match self {
            Self::Unresolved(fault) => fault.kind.code(),
            Self::RetryBudgetExceeded { .. } => FaultCode::RetryBudgetExceeded,
            Self::AddressOverflow { .. } => FaultCode::AddressOverflow,
        }
    }

    /// Returns the violation details when the failure came from a permission check.
    #[must_use]
    pub const fn fault(&self) -> Option<&AccessFault> {
        match self {
            Self::Unresolved(fault) | Self::RetryBudgetExceeded { fault, .. } => Some(fault),
            Self::AddressOverflow { .. } => None,
        }
    }
}
