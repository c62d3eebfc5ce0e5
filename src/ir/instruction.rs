//! `Instruction`, the core IR entity.
//!
//! Opcode tag is `iced_x86::Code` rather than a hand-rolled enum: per-ISA
//! tables supply operand shapes, sizes, and categories, and iced-x86
//! already is that per-ISA table for x86-64 — the same crate an inline
//! hooking tool would reach for to decode/encode instructions. Reinventing
//! an opcode enumeration over the same ISA would just be a worse copy of
//! iced's.

use crate::ir::{Category, Operand};

#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: iced_x86::Code,
    /// Ordered source (read) operands.
    pub sources: Vec<Operand>,
    /// Ordered destination (written) operands.
    pub destinations: Vec<Operand>,
    /// Original encoded bytes, if this instruction came from `decode()`
    /// rather than being synthesized by an instrumentation pass.
    pub raw_bytes: Option<Vec<u8>>,
    /// The PC this instruction occupied in the *application's* address
    /// space, i.e. where it will logically execute from the target's
    /// point of view.
    pub source_pc: u64,
    /// The PC this instruction is emitted at inside the code cache. Unset
    /// (`0`) until the fragment builder's emission pass assigns it.
    pub translation_pc: u64,
    pub category: Category,
}

impl Instruction {
    pub fn new(opcode: iced_x86::Code, source_pc: u64) -> Instruction {
        Instruction {
            opcode,
            sources: Vec::new(),
            destinations: Vec::new(),
            raw_bytes: None,
            source_pc,
            translation_pc: 0,
            category: Category::UNCATEGORIZED,
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.category.is_terminator()
    }

    pub fn len(&self) -> usize {
        self.raw_bytes.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_instruction_is_not_a_terminator() {
        let i = Instruction::new(iced_x86::Code::Nopd, 0x1000);
        assert!(!i.is_terminator());
        assert_eq!(i.source_pc, 0x1000);
        assert_eq!(i.translation_pc, 0);
    }

    #[test]
    fn branch_category_marks_terminator() {
        let mut i = Instruction::new(iced_x86::Code::Jmp_rel32_64, 0x1000);
        i.category = Category::BRANCH;
        assert!(i.is_terminator());
    }
}
