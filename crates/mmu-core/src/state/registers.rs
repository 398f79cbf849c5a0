/// Number of 32-bit general-purpose registers (`EAX..EDI`).
pub const GENERAL_REGISTER_COUNT: usize = 8;
/// `EFLAGS` carry bit.
pub const EFLAGS_CF: u32 = 1 << 0;
/// `EFLAGS` reserved bit that always reads as one.
pub const EFLAGS_RESERVED: u32 = 1 << 1;
/// `EFLAGS` zero bit.
pub const EFLAGS_ZF: u32 = 1 << 6;
/// `EFLAGS` sign bit.
pub const EFLAGS_SF: u32 = 1 << 7;
/// `EFLAGS` signed overflow bit.
pub const EFLAGS_OF: u32 = 1 << 11;
/// Mask of `EFLAGS` bits the executor maintains.
pub const EFLAGS_ACTIVE_MASK: u32 = EFLAGS_CF | EFLAGS_ZF | EFLAGS_SF | EFLAGS_OF;

/// 32-bit general-purpose register in ModRM encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Register {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Register {
    /// All general-purpose registers in encoding order.
    pub const ALL: [Self; GENERAL_REGISTER_COUNT] = [
        Self::Eax,
        Self::Ecx,
        Self::Edx,
        Self::Ebx,
        Self::Esp,
        Self::Ebp,
        Self::Esi,
        Self::Edi,
    ];

    /// Returns the array index for this register (`0..=7`).
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decodes a 3-bit register field.
    #[must_use]
    pub const fn from_u3(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Eax),
            1 => Some(Self::Ecx),
            2 => Some(Self::Edx),
            3 => Some(Self::Ebx),
            4 => Some(Self::Esp),
            5 => Some(Self::Ebp),
            6 => Some(Self::Esi),
            7 => Some(Self::Edi),
            _ => None,
        }
    }

    /// Lowercase assembler name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Eax => "eax",
            Self::Ecx => "ecx",
            Self::Edx => "edx",
            Self::Ebx => "ebx",
            Self::Esp => "esp",
            Self::Ebp => "ebp",
            Self::Esi => "esi",
            Self::Edi => "edi",
        }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Guest CPU register state visible to the host and to fault hooks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegisterFile {
    gpr: [u32; GENERAL_REGISTER_COUNT],
    eip: u32,
    eflags: u32,
}

impl RegisterFile {
    /// Creates a zeroed register file.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gpr: [0; GENERAL_REGISTER_COUNT],
            eip: 0,
            eflags: 0,
        }
    }

    /// Reads a general-purpose register.
    #[must_use]
    pub const fn get(&self, reg: Register) -> u32 {
        self.gpr[reg.index()]
    }

    /// Writes a general-purpose register.
    pub const fn set(&mut self, reg: Register, value: u32) {
        self.gpr[reg.index()] = value;
    }

    /// Reads `EIP`.
    #[must_use]
    pub const fn eip(&self) -> u32 {
        self.eip
    }

    /// Writes `EIP`.
    pub const fn set_eip(&mut self, value: u32) {
        self.eip = value;
    }

    /// Reads `ESP`.
    #[must_use]
    pub const fn esp(&self) -> u32 {
        self.get(Register::Esp)
    }

    /// Writes `ESP`.
    pub const fn set_esp(&mut self, value: u32) {
        self.set(Register::Esp, value);
    }

    /// Reads `EFLAGS`; the reserved bit 1 always reads as one.
    #[must_use]
    pub const fn eflags(&self) -> u32 {
        self.eflags | EFLAGS_RESERVED
    }

    /// Writes `EFLAGS`, keeping only the maintained bits.
    pub const fn set_eflags(&mut self, value: u32) {
        self.eflags = value & EFLAGS_ACTIVE_MASK;
    }

    /// Returns `true` when a specific `EFLAGS` bit is set.
    #[must_use]
    pub const fn flag_is_set(&self, flag: u32) -> bool {
        (self.eflags() & flag) != 0
    }

    /// Sets or clears a specific maintained `EFLAGS` bit.
    pub const fn set_flag(&mut self, flag: u32, enabled: bool) {
        if enabled {
            self.eflags |= flag & EFLAGS_ACTIVE_MASK;
        } else {
            self.eflags &= !(flag & EFLAGS_ACTIVE_MASK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Register, RegisterFile, EFLAGS_ACTIVE_MASK, EFLAGS_CF, EFLAGS_OF, EFLAGS_RESERVED,
        EFLAGS_SF, EFLAGS_ZF, GENERAL_REGISTER_COUNT,
    };

    #[test]
    fn register_decode_matches_modrm_order() {
        for bits in 0_u8..8 {
            let reg = Register::from_u3(bits).expect("valid 3-bit register encoding");
            assert_eq!(reg.index(), usize::from(bits));
        }
        assert_eq!(Register::from_u3(4), Some(Register::Esp));
        assert!(Register::from_u3(8).is_none());
        assert_eq!(Register::ALL.len(), GENERAL_REGISTER_COUNT);
        assert_eq!(Register::Ebp.to_string(), "ebp");
    }

    #[test]
    fn general_registers_are_independent() {
        let mut regs = RegisterFile::new();
        for (offset, reg) in (0_u32..).zip(Register::ALL) {
            regs.set(reg, 0x1000 + offset);
        }
        for (offset, reg) in (0_u32..).zip(Register::ALL) {
            assert_eq!(regs.get(reg), 0x1000 + offset);
        }
        assert_eq!(regs.esp(), 0x1004);
    }

    #[test]
    fn eflags_keep_maintained_bits_and_report_reserved_bit() {
        let mut regs = RegisterFile::new();
        assert_eq!(regs.eflags(), EFLAGS_RESERVED);

        regs.set_eflags(u32::MAX);
        assert_eq!(regs.eflags(), EFLAGS_ACTIVE_MASK | EFLAGS_RESERVED);

        for flag in [EFLAGS_CF, EFLAGS_ZF, EFLAGS_SF, EFLAGS_OF] {
            regs.set_flag(flag, false);
            assert!(!regs.flag_is_set(flag));
        }
        assert_eq!(regs.eflags(), EFLAGS_RESERVED);
    }
}
