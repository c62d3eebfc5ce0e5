//! Decoder: translates raw bytes at an address into IR.
//!
//! Wraps `iced_x86::Decoder`, which never panics on malformed input and
//! reports `Code::INVALID` instead; we turn that into `DbiError::Decode`
//! at the boundary, so the decoder is total over legal instructions and
//! reports a well-defined failure on anything else.

use crate::error::{DbiError, DbiResult};
use crate::ir::{Category, Instruction, MemoryOperand, Operand};
use iced_x86::{Decoder, DecoderOptions, OpKind};

/// Decode exactly one instruction starting at `start_pc`.
///
/// `bytes` must contain at least the longest possible x86-64 instruction
/// (15 bytes) beyond `start_pc`, or be exactly as long as the mapped region
/// allows — the fragment builder is responsible for treating a short read
/// at the end of a page as crossing into a non-executable or unmapped page
/// rather than a decode error.
pub fn decode(bytes: &[u8], start_pc: u64) -> DbiResult<(Instruction, usize)> {
    let mut decoder = Decoder::with_ip(64, bytes, start_pc, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(DbiError::Decode {
            pc: start_pc,
            reason: "no bytes available to decode".into(),
        });
    }

    let insn = decoder.decode();
    if insn.is_invalid() {
        return Err(DbiError::Decode {
            pc: start_pc,
            reason: "invalid opcode encoding".into(),
        });
    }

    let len = insn.len();
    let mut ir = Instruction::new(insn.code(), start_pc);
    ir.raw_bytes = Some(bytes[..len].to_vec());
    ir.category = categorize(&insn);

    for i in 0..insn.op_count() {
        let operand = convert_operand(&insn, i);
        if is_write_op(&insn, i) {
            ir.destinations.push(operand);
        } else {
            ir.sources.push(operand);
        }
    }

    Ok((ir, len))
}

fn is_write_op(insn: &iced_x86::Instruction, index: u32) -> bool {
    use iced_x86::OpAccess::*;
    match insn.op_access(index) {
        Ok(access) => matches!(access, Write | ReadWrite | CondWrite | ReadCondWrite),
        Err(_) => false,
    }
}

fn convert_operand(insn: &iced_x86::Instruction, index: u32) -> Operand {
    match insn.op_kind(index) {
        OpKind::Register => Operand::Register(insn.op_register(index)),
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Operand::Immediate(insn.immediate(index) as i64),
        OpKind::Memory => Operand::Memory(MemoryOperand {
            base: insn.memory_base(),
            index: insn.memory_index(),
            scale: insn.memory_index_scale() as u8,
            displacement: insn.memory_displacement64() as i64,
            segment: insn.memory_segment(),
        }),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Operand::PcRelative {
                offset: insn.near_branch_target() as i64 - insn.ip() as i64,
            }
        }
        _ => Operand::ProgramCounter,
    }
}

fn categorize(insn: &iced_x86::Instruction) -> Category {
    let mut c = Category::UNCATEGORIZED;
    let info = iced_x86::InstructionInfoFactory::new().info(insn).clone();

    if insn.is_jcc_short_or_near()
        || insn.is_jcx_short()
        || insn.is_jmp_short_or_near()
        || insn.is_jmp_far()
        || insn.is_call_near()
        || insn.is_call_far()
        || insn.flow_control() != iced_x86::FlowControl::Next
    {
        c |= Category::BRANCH;
    }

    match insn.code() {
        iced_x86::Code::Cpuid | iced_x86::Code::Rdtsc | iced_x86::Code::Rdtscp => {
            c |= Category::SERIALIZING;
        }
        _ => {}
    }

    if is_simd_register_class(insn) {
        c |= Category::SIMD;
    }

    for used_mem in info.used_memory() {
        match used_mem.access() {
            iced_x86::OpAccess::Read | iced_x86::OpAccess::CondRead => c |= Category::LOAD,
            iced_x86::OpAccess::Write | iced_x86::OpAccess::CondWrite => c |= Category::STORE,
            iced_x86::OpAccess::ReadWrite | iced_x86::OpAccess::ReadCondWrite => {
                c |= Category::LOAD | Category::STORE
            }
            _ => {}
        }
    }

    if c.is_empty() {
        if is_fp_mnemonic(insn) {
            c |= Category::MATH_FLOAT;
        } else if is_int_math_mnemonic(insn) {
            c |= Category::MATH_INT;
        } else {
            c |= Category::OTHER;
        }
    }
    c
}

fn is_simd_register_class(insn: &iced_x86::Instruction) -> bool {
    for i in 0..insn.op_count() {
        if insn.op_kind(i) == OpKind::Register {
            let r = insn.op_register(i);
            if r.is_xmm() || r.is_ymm() || r.is_zmm() || r.is_mm() {
                return true;
            }
        }
    }
    false
}

fn is_fp_mnemonic(insn: &iced_x86::Instruction) -> bool {
    matches!(
        insn.mnemonic(),
        iced_x86::Mnemonic::Addsd
            | iced_x86::Mnemonic::Addss
            | iced_x86::Mnemonic::Mulsd
            | iced_x86::Mnemonic::Mulss
            | iced_x86::Mnemonic::Divsd
            | iced_x86::Mnemonic::Divss
            | iced_x86::Mnemonic::Fadd
            | iced_x86::Mnemonic::Fsub
            | iced_x86::Mnemonic::Fmul
            | iced_x86::Mnemonic::Fdiv
    )
}

fn is_int_math_mnemonic(insn: &iced_x86::Instruction) -> bool {
    matches!(
        insn.mnemonic(),
        iced_x86::Mnemonic::Add
            | iced_x86::Mnemonic::Sub
            | iced_x86::Mnemonic::Mul
            | iced_x86::Mnemonic::Imul
            | iced_x86::Mnemonic::Div
            | iced_x86::Mnemonic::Idiv
            | iced_x86::Mnemonic::Inc
            | iced_x86::Mnemonic::Dec
            | iced_x86::Mnemonic::And
            | iced_x86::Mnemonic::Or
            | iced_x86::Mnemonic::Xor
            | iced_x86::Mnemonic::Shl
            | iced_x86::Mnemonic::Shr
    )
}
