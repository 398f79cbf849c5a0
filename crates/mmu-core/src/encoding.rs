/// Supported primary-opcode encodings of the 32-bit x86 subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum OpcodeEncoding {
    Nop,
    Hlt,
    PushReg,
    PopReg,
    PushImm,
    MovRegImm,
    MovRmReg,
    MovRegRm,
    MovRmImm,
    /// `0x81`/`0x83` group; ModRM `reg` selects the ALU operation.
    AluRmImm,
    AddRmReg,
    SubRmReg,
    XorRmReg,
    CmpRmReg,
    Jmp,
    Jz,
    Jnz,
    Call,
    Ret,
}

/// Width of the trailing immediate or displacement operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImmWidth {
    /// No immediate.
    None,
    /// One byte, sign-extended to 32 bits.
    Imm8,
    /// Four little-endian bytes.
    Imm32,
}

impl ImmWidth {
    /// Size in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::None => 0,
            Self::Imm8 => 1,
            Self::Imm32 => 4,
        }
    }
}

/// One row of the opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpcodeEntry {
    /// First opcode byte covered by this row.
    pub opcode: u8,
    /// Number of consecutive opcodes covered; `8` for `+r` forms.
    pub span: u8,
    /// Encoding produced for every covered opcode.
    pub encoding: OpcodeEncoding,
    /// Whether a ModRM byte follows the opcode.
    pub modrm: bool,
    /// Trailing immediate width.
    pub imm: ImmWidth,
}

const fn entry(
    opcode: u8,
    span: u8,
    encoding: OpcodeEncoding,
    modrm: bool,
    imm: ImmWidth,
) -> OpcodeEntry {
    OpcodeEntry {
        opcode,
        span,
        encoding,
        modrm,
        imm,
    }
}

/// Single source-of-truth opcode table.
///
/// Any primary opcode not covered here is invalid by definition.
pub const OPCODE_TABLE: &[OpcodeEntry] = &[
    entry(0x01, 1, OpcodeEncoding::AddRmReg, true, ImmWidth::None),
    entry(0x29, 1, OpcodeEncoding::SubRmReg, true, ImmWidth::None),
    entry(0x31, 1, OpcodeEncoding::XorRmReg, true, ImmWidth::None),
    entry(0x39, 1, OpcodeEncoding::CmpRmReg, true, ImmWidth::None),
    entry(0x50, 8, OpcodeEncoding::PushReg, false, ImmWidth::None),
    entry(0x58, 8, OpcodeEncoding::PopReg, false, ImmWidth::None),
    entry(0x68, 1, OpcodeEncoding::PushImm, false, ImmWidth::Imm32),
    entry(0x6A, 1, OpcodeEncoding::PushImm, false, ImmWidth::Imm8),
    entry(0x74, 1, OpcodeEncoding::Jz, false, ImmWidth::Imm8),
    entry(0x75, 1, OpcodeEncoding::Jnz, false, ImmWidth::Imm8),
    entry(0x81, 1, OpcodeEncoding::AluRmImm, true, ImmWidth::Imm32),
    entry(0x83, 1, OpcodeEncoding::AluRmImm, true, ImmWidth::Imm8),
    entry(0x89, 1, OpcodeEncoding::MovRmReg, true, ImmWidth::None),
    entry(0x8B, 1, OpcodeEncoding::MovRegRm, true, ImmWidth::None),
    entry(0x90, 1, OpcodeEncoding::Nop, false, ImmWidth::None),
    entry(0xB8, 8, OpcodeEncoding::MovRegImm, false, ImmWidth::Imm32),
    entry(0xC3, 1, OpcodeEncoding::Ret, false, ImmWidth::None),
    entry(0xC7, 1, OpcodeEncoding::MovRmImm, true, ImmWidth::Imm32),
    entry(0xE8, 1, OpcodeEncoding::Call, false, ImmWidth::Imm32),
    entry(0xE9, 1, OpcodeEncoding::Jmp, false, ImmWidth::Imm32),
    entry(0xEB, 1, OpcodeEncoding::Jmp, false, ImmWidth::Imm8),
    entry(0xF4, 1, OpcodeEncoding::Hlt, false, ImmWidth::None),
];

/// Returns the table row covering a primary opcode byte.
///
/// `None` means the opcode is outside the supported subset.
#[must_use]
pub fn classify_opcode(opcode: u8) -> Option<OpcodeEntry> {
    OPCODE_TABLE
        .iter()
        .find(|row| opcode.wrapping_sub(row.opcode) < row.span)
        .copied()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{classify_opcode, ImmWidth, OpcodeEncoding, OPCODE_TABLE};

    #[test]
    fn table_rows_do_not_overlap() {
        let mut seen = HashSet::new();
        for row in OPCODE_TABLE {
            for offset in 0..row.span {
                assert!(seen.insert(row.opcode + offset), "{:#04x}", row.opcode);
            }
        }
    }

    #[test]
    fn lookup_matches_known_encodings() {
        assert_eq!(
            classify_opcode(0x58).map(|row| row.encoding),
            Some(OpcodeEncoding::PopReg)
        );
        assert_eq!(
            classify_opcode(0x5F).map(|row| row.encoding),
            Some(OpcodeEncoding::PopReg)
        );
        assert_eq!(
            classify_opcode(0xBC).map(|row| row.encoding),
            Some(OpcodeEncoding::MovRegImm)
        );
        let group = classify_opcode(0x83).expect("group 1 imm8");
        assert_eq!(group.encoding, OpcodeEncoding::AluRmImm);
        assert!(group.modrm);
        assert_eq!(group.imm, ImmWidth::Imm8);
    }

    #[test]
    fn unsupported_opcodes_are_rejected() {
        for opcode in [0x00, 0x0F, 0x60, 0xCC, 0xFF] {
            assert_eq!(classify_opcode(opcode), None);
        }
    }
}
