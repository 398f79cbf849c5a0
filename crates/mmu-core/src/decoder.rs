//! Instruction decoder for the supported 32-bit x86 subset.
//!
//! Decoding is pure: it takes the bytes fetched so far and either produces a
//! complete instruction or reports how many bytes it needs, so the executor
//! can fetch exactly the instruction's extent through the access gateway.

use thiserror::Error;

use crate::encoding::{classify_opcode, ImmWidth, OpcodeEncoding};
use crate::state::{Register, RegisterFile};
use crate::FaultCode;

/// Architectural upper bound on x86 instruction length.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Two-operand ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    /// Subtract for flags only.
    Cmp,
}

impl AluOp {
    /// Decodes the ModRM `reg` extension of the `0x81`/`0x83` group.
    ///
    /// `ADC` (`/2`) and `SBB` (`/3`) are outside the supported subset.
    #[must_use]
    pub const fn from_group1(reg: u8) -> Option<Self> {
        match reg {
            0 => Some(Self::Add),
            1 => Some(Self::Or),
            4 => Some(Self::And),
            5 => Some(Self::Sub),
            6 => Some(Self::Xor),
            7 => Some(Self::Cmp),
            _ => None,
        }
    }
}

/// Memory operand `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    /// Base register, absent for absolute `disp32` forms.
    pub base: Option<Register>,
    /// Index register and scale factor (1, 2, 4 or 8).
    pub index: Option<(Register, u8)>,
    /// Two's-complement displacement.
    pub disp: u32,
}

impl MemOperand {
    /// Computes the effective address with 32-bit wraparound.
    #[must_use]
    pub fn effective_address(&self, regs: &RegisterFile) -> u32 {
        let base = self.base.map_or(0, |reg| regs.get(reg));
        let index = self
            .index
            .map_or(0, |(reg, scale)| regs.get(reg).wrapping_mul(u32::from(scale)));
        self.disp.wrapping_add(base).wrapping_add(index)
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// General-purpose register.
    Reg(Register),
    /// 32-bit memory location.
    Mem(MemOperand),
    /// Immediate, already sign-extended to 32 bits.
    Imm(u32),
}

/// Branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    /// Unconditional.
    Always,
    /// Taken when `ZF` is set.
    Zero,
    /// Taken when `ZF` is clear.
    NotZero,
}

/// Decoded operation with resolved operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `NOP`.
    Nop,
    /// `HLT`.
    Halt,
    /// `PUSH src`.
    Push(Operand),
    /// `POP reg`.
    Pop(Register),
    /// `MOV dst, src`.
    Mov {
        /// Destination.
        dst: Operand,
        /// Source.
        src: Operand,
    },
    /// `op dst, src`, writing `dst` unless `op` is [`AluOp::Cmp`].
    Alu {
        /// Operation.
        op: AluOp,
        /// Destination and left operand.
        dst: Operand,
        /// Right operand.
        src: Operand,
    },
    /// Relative jump; `rel` is added to the next instruction's address.
    Jump {
        /// Branch condition.
        cond: Condition,
        /// Two's-complement displacement.
        rel: u32,
    },
    /// Relative call.
    Call {
        /// Two's-complement displacement.
        rel: u32,
    },
    /// Near return.
    Ret,
}

/// Decoded instruction ready for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedInstruction {
    /// Opcode table row that matched.
    pub encoding: OpcodeEncoding,
    /// Operation and operands.
    pub operation: Operation,
    /// Encoded length in bytes.
    pub length: usize,
}

/// Decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DecodeError {
    /// Primary opcode outside the supported subset.
    #[error("unsupported opcode {opcode:#04x}")]
    Unsupported {
        /// Primary opcode byte.
        opcode: u8,
    },
    /// ModRM `reg` extension not supported for this opcode.
    #[error("unsupported extension /{reg} for opcode {opcode:#04x}")]
    InvalidExtension {
        /// Primary opcode byte.
        opcode: u8,
        /// ModRM `reg` field.
        reg: u8,
    },
    /// More bytes are needed; `needed` is the total known so far.
    #[error("instruction needs at least {needed} bytes")]
    Truncated {
        /// Minimum total length in bytes.
        needed: usize,
    },
}

impl DecodeError {
    /// Returns the stable status code reported when decoding ends a run.
    #[must_use]
    pub const fn code(self) -> FaultCode {
        FaultCode::InvalidInstruction
    }
}

// Field values are masked to three bits before the lookup.
const fn reg3(bits: u8) -> Register {
    match Register::from_u3(bits & 0x7) {
        Some(reg) => reg,
        None => Register::Eax,
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
const fn sign_extend8(byte: u8) -> u32 {
    byte as i8 as i32 as u32
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated { needed: end })?;
        let mut out = [0; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.take::<1>().map(|[byte]| byte)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn imm(&mut self, width: ImmWidth) -> Result<u32, DecodeError> {
        match width {
            ImmWidth::None => Ok(0),
            ImmWidth::Imm8 => self.u8().map(sign_extend8),
            ImmWidth::Imm32 => self.u32(),
        }
    }

    /// Reads ModRM plus any SIB and displacement; returns the `reg` field and
    /// the `r/m` operand.
    fn modrm(&mut self) -> Result<(u8, Operand), DecodeError> {
        let modrm = self.u8()?;
        let mode = modrm >> 6;
        let reg = (modrm >> 3) & 0x7;
        let rm = modrm & 0x7;

        if mode == 0b11 {
            return Ok((reg, Operand::Reg(reg3(rm))));
        }

        let (base, index) = if rm == 0b100 {
            let sib = self.u8()?;
            let scale = 1_u8 << (sib >> 6);
            let index_bits = (sib >> 3) & 0x7;
            let base_bits = sib & 0x7;
            let index = (index_bits != 0b100).then_some((reg3(index_bits), scale));
            let base = (!(base_bits == 0b101 && mode == 0)).then_some(reg3(base_bits));
            (base, index)
        } else if rm == 0b101 && mode == 0 {
            (None, None)
        } else {
            (Some(reg3(rm)), None)
        };

        let disp = match mode {
            0 if base.is_none() => self.u32()?,
            0 => 0,
            1 => sign_extend8(self.u8()?),
            _ => self.u32()?,
        };

        Ok((reg, Operand::Mem(MemOperand { base, index, disp })))
    }
}

/// Decoder for the supported x86 subset.
pub struct Decoder;

impl Decoder {
    /// Decodes one instruction from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] when `bytes` ends early, and
    /// [`DecodeError::Unsupported`] or [`DecodeError::InvalidExtension`] for
    /// encodings outside the subset.
    pub fn decode(bytes: &[u8]) -> Result<DecodedInstruction, DecodeError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let opcode = cursor.u8()?;
        let row = classify_opcode(opcode).ok_or(DecodeError::Unsupported { opcode })?;

        let modrm = if row.modrm {
            Some(cursor.modrm()?)
        } else {
            None
        };
        let imm = cursor.imm(row.imm)?;
        let embedded = reg3(opcode.wrapping_sub(row.opcode));

        let operation = match (row.encoding, modrm) {
            (OpcodeEncoding::Nop, _) => Operation::Nop,
            (OpcodeEncoding::Hlt, _) => Operation::Halt,
            (OpcodeEncoding::Ret, _) => Operation::Ret,
            (OpcodeEncoding::PushReg, _) => Operation::Push(Operand::Reg(embedded)),
            (OpcodeEncoding::PopReg, _) => Operation::Pop(embedded),
            (OpcodeEncoding::PushImm, _) => Operation::Push(Operand::Imm(imm)),
            (OpcodeEncoding::MovRegImm, _) => Operation::Mov {
                dst: Operand::Reg(embedded),
                src: Operand::Imm(imm),
            },
            (OpcodeEncoding::Jmp, _) => Operation::Jump {
                cond: Condition::Always,
                rel: imm,
            },
            (OpcodeEncoding::Jz, _) => Operation::Jump {
                cond: Condition::Zero,
                rel: imm,
            },
            (OpcodeEncoding::Jnz, _) => Operation::Jump {
                cond: Condition::NotZero,
                rel: imm,
            },
            (OpcodeEncoding::Call, _) => Operation::Call { rel: imm },
            (OpcodeEncoding::MovRmReg, Some((reg, rm))) => Operation::Mov {
                dst: rm,
                src: Operand::Reg(reg3(reg)),
            },
            (OpcodeEncoding::MovRegRm, Some((reg, rm))) => Operation::Mov {
                dst: Operand::Reg(reg3(reg)),
                src: rm,
            },
            (OpcodeEncoding::MovRmImm, Some((0, rm))) => Operation::Mov {
                dst: rm,
                src: Operand::Imm(imm),
            },
            (OpcodeEncoding::AluRmImm, Some((reg, rm))) => Operation::Alu {
                op: AluOp::from_group1(reg)
                    .ok_or(DecodeError::InvalidExtension { opcode, reg })?,
                dst: rm,
                src: Operand::Imm(imm),
            },
            (
                encoding @ (OpcodeEncoding::AddRmReg
                | OpcodeEncoding::SubRmReg
                | OpcodeEncoding::XorRmReg
                | OpcodeEncoding::CmpRmReg),
                Some((reg, rm)),
            ) => Operation::Alu {
                op: match encoding {
                    OpcodeEncoding::AddRmReg => AluOp::Add,
                    OpcodeEncoding::SubRmReg => AluOp::Sub,
                    OpcodeEncoding::XorRmReg => AluOp::Xor,
                    _ => AluOp::Cmp,
                },
                dst: rm,
                src: Operand::Reg(reg3(reg)),
            },
            (_, Some((reg, _))) => return Err(DecodeError::InvalidExtension { opcode, reg }),
            (_, None) => return Err(DecodeError::Unsupported { opcode }),
        };

        Ok(DecodedInstruction {
            encoding: row.encoding,
            operation,
            length: cursor.pos,
        })
    }
}
