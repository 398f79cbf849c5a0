//! EFLAGS update behaviors for different instruction classes.

use crate::state::{RegisterFile, EFLAGS_CF, EFLAGS_OF, EFLAGS_SF, EFLAGS_ZF};

/// Describes how EFLAGS should be updated after an instruction executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagsUpdate {
    /// No change to EFLAGS.
    #[default]
    None,
    /// Replace the arithmetic status flags.
    Arith {
        /// Carry or borrow out of bit 31.
        carry: bool,
        /// Result is zero.
        zero: bool,
        /// Bit 31 of the result.
        sign: bool,
        /// Signed overflow.
        overflow: bool,
    },
}

impl FlagsUpdate {
    /// Applies the update to `regs`.
    pub const fn apply(self, regs: &mut RegisterFile) {
        if let Self::Arith {
            carry,
            zero,
            sign,
            overflow,
        } = self
        {
            regs.set_flag(EFLAGS_CF, carry);
            regs.set_flag(EFLAGS_ZF, zero);
            regs.set_flag(EFLAGS_SF, sign);
            regs.set_flag(EFLAGS_OF, overflow);
        }
    }
}
