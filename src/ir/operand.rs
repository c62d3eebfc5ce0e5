//! Operand: register | immediate | memory(base, index, scale, displacement,
//! segment) | PC-relative | program-counter; width in bytes; size class.
//!
//! A C++ IR typically builds operands through a family of
//! `opnd_create_*` constructors over a virtual-inheritance operand
//! hierarchy; that collapses to one sum type here, dispatched once
//! instead of through a class hierarchy.

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SizeClass {
    Byte,
    Word,
    Dword,
    Qword,
    Xmm,
    Ymm,
    Zmm,
}

impl SizeClass {
    pub fn bytes(self) -> u32 {
        match self {
            SizeClass::Byte => 1,
            SizeClass::Word => 2,
            SizeClass::Dword => 4,
            SizeClass::Qword => 8,
            SizeClass::Xmm => 16,
            SizeClass::Ymm => 32,
            SizeClass::Zmm => 64,
        }
    }

    pub fn from_bytes(n: u32) -> SizeClass {
        match n {
            1 => SizeClass::Byte,
            2 => SizeClass::Word,
            4 => SizeClass::Dword,
            8 => SizeClass::Qword,
            16 => SizeClass::Xmm,
            32 => SizeClass::Ymm,
            64 => SizeClass::Zmm,
            _ => SizeClass::Qword,
        }
    }
}

/// `memory(base, index, scale, displacement, segment)`.
/// `base`/`index` are iced-x86 register numbers (`iced_x86::Register as u8`);
/// `None` is encoded as `iced_x86::Register::None` rather than as an
/// `Option` so the struct stays `Copy` and round-trips losslessly through
/// `crate::decoder`/`crate::encoder`, which hand iced-x86 operands directly.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MemoryOperand {
    pub base: iced_x86::Register,
    pub index: iced_x86::Register,
    pub scale: u8,
    pub displacement: i64,
    pub segment: iced_x86::Register,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Operand {
    Register(iced_x86::Register),
    Immediate(i64),
    Memory(MemoryOperand),
    /// An address computed as `translation_pc + offset` at decode time,
    /// e.g. a RIP-relative `lea`. Kept symbolic (not folded into `Memory`'s
    /// displacement) so the fragment builder's fix-up pass can recompute
    /// it relative to the instruction's new cache address.
    PcRelative { offset: i64 },
    /// The operand literally denotes the current program counter (e.g. a
    /// `call`/`jmp` target encoded as an absolute pc, or `$pc` read by some
    /// SIMD/VEX-encoded instructions).
    ProgramCounter,
}

impl Operand {
    pub fn is_memory(&self) -> bool {
        matches!(self, Operand::Memory(_))
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Operand::Register(_))
    }

    pub fn size_class(&self, width_bytes: u32) -> SizeClass {
        SizeClass::from_bytes(width_bytes)
    }
}
