//! Helper functions for instruction execution.

use super::FlagsUpdate;
use crate::decoder::AluOp;

/// Computes `a op b` and the resulting arithmetic flags.
#[must_use]
pub const fn alu(op: AluOp, a: u32, b: u32) -> (u32, FlagsUpdate) {
    let (result, carry, overflow) = match op {
        AluOp::Add => {
            let result = a.wrapping_add(b);
            (result, result < a, ((a ^ result) & (b ^ result)) >> 31 != 0)
        }
        AluOp::Sub | AluOp::Cmp => {
            let result = a.wrapping_sub(b);
            (result, a < b, ((a ^ b) & (a ^ result)) >> 31 != 0)
        }
        AluOp::And => (a & b, false, false),
        AluOp::Or => (a | b, false, false),
        AluOp::Xor => (a ^ b, false, false),
    };

    (
        result,
        FlagsUpdate::Arith {
            carry,
            zero: result == 0,
            sign: result >> 31 != 0,
            overflow,
        },
    )
}

/// Converts a decoded length into an address offset.
#[allow(clippy::cast_possible_truncation)]
pub(super) const fn length_offset(length: usize) -> u32 {
    // Decoded lengths never exceed MAX_INSTRUCTION_LENGTH.
    length as u32
}
