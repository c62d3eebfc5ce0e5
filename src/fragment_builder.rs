//! Walks the decoder forward from an entry PC until a control-flow
//! terminator, runs registered instrumentation callbacks over the
//! resulting instruction list, and emits the instrumented copy into the
//! code cache arena along with its exit stubs and translation table.

use crate::code_cache::CodeCache;
use crate::config::ConfigHandle;
use crate::decoder;
use crate::error::{DbiError, DbiResult};
use crate::fragment::{ExitKind, ExitStub, Fragment, FragmentState, LinkState, TranslationTable};
use crate::ir::Instruction;
use crate::module_map::ModuleMap;

/// Abstracts over how the builder reads bytes out of the target's address
/// space, so unit tests can hand it a plain slice instead of going through
/// `crate::syscalls`' remote-memory path.
pub trait CodeReader {
    fn read(&self, pc: u64, max_len: usize) -> Option<Vec<u8>>;
}

pub struct SliceReader<'a> {
    pub base: u64,
    pub bytes: &'a [u8],
}

impl<'a> CodeReader for SliceReader<'a> {
    fn read(&self, pc: u64, max_len: usize) -> Option<Vec<u8>> {
        if pc < self.base {
            return None;
        }
        let offset = (pc - self.base) as usize;
        if offset >= self.bytes.len() {
            return None;
        }
        let end = (offset + max_len).min(self.bytes.len());
        Some(self.bytes[offset..end].to_vec())
    }
}

/// One decoded instruction paired with the iced-x86 form the encoder needs
/// to re-emit it, so an instrumentation callback that only touches the IR
/// doesn't have to also hand-maintain the iced encoding.
#[derive(Clone)]
pub struct DecodedInsn {
    pub ir: Instruction,
    pub iced: iced_x86::Instruction,
}

pub type InstrumentationCallback = Box<dyn Fn(&mut Vec<DecodedInsn>) + Send + Sync>;

#[derive(Debug)]
enum StopReason {
    Terminator,
    DecodeFailure,
    MaxInstructionCount,
    UnexecutablePage,
}

pub struct FragmentBuilder {
    callbacks: Vec<InstrumentationCallback>,
}

impl Default for FragmentBuilder {
    fn default() -> Self {
        FragmentBuilder {
            callbacks: Vec::new(),
        }
    }
}

impl FragmentBuilder {
    pub fn new() -> FragmentBuilder {
        FragmentBuilder::default()
    }

    /// Callbacks run in registration order; each may insert, delete, or
    /// replace entries in the decoded instruction list.
    pub fn register_callback(&mut self, cb: InstrumentationCallback) {
        self.callbacks.push(cb);
    }

    const MAX_DECODE_WINDOW: usize = 15;

    fn decode_forward(
        &self,
        entry_pc: u64,
        reader: &dyn CodeReader,
        module_map: &ModuleMap,
    ) -> DbiResult<(Vec<DecodedInsn>, StopReason)> {
        let max_instructions = ConfigHandle::get().max_fragment_instructions;
        let mut insns = Vec::new();
        let mut pc = entry_pc;

        loop {
            if !module_map.is_executable_pc(pc) {
                if insns.is_empty() {
                    return Err(DbiError::Decode {
                        pc,
                        reason: "entry PC is not in an executable mapping".into(),
                    });
                }
                return Ok((insns, StopReason::UnexecutablePage));
            }

            let window = match reader.read(pc, Self::MAX_DECODE_WINDOW) {
                Some(b) if !b.is_empty() => b,
                _ => {
                    if insns.is_empty() {
                        return Err(DbiError::Decode {
                            pc,
                            reason: "no bytes available at entry PC".into(),
                        });
                    }
                    return Ok((insns, StopReason::UnexecutablePage));
                }
            };

            let mut iced_decoder =
                iced_x86::Decoder::with_ip(64, &window, pc, iced_x86::DecoderOptions::NONE);
            if !iced_decoder.can_decode() {
                if insns.is_empty() {
                    return Err(DbiError::Decode {
                        pc,
                        reason: "no bytes available to decode".into(),
                    });
                }
                return Ok((insns, StopReason::DecodeFailure));
            }
            let iced_insn = iced_decoder.decode();

            let (ir, len) = match decoder::decode(&window, pc) {
                Ok(pair) => pair,
                Err(e) => {
                    if insns.is_empty() {
                        return Err(e);
                    }
                    return Ok((insns, StopReason::DecodeFailure));
                }
            };

            insns.push(DecodedInsn { ir, iced: iced_insn });

            if insns.last().unwrap().ir.is_terminator() {
                return Ok((insns, StopReason::Terminator));
            }
            if insns.len() >= max_instructions {
                return Ok((insns, StopReason::MaxInstructionCount));
            }
            pc += len as u64;
        }
    }

    /// Builds one fragment starting at `entry_pc` and inserts it into
    /// `code_cache`. On out-of-memory, evicts a generation and retries
    /// exactly once before giving up.
    pub fn build(
        &self,
        entry_pc: u64,
        reader: &dyn CodeReader,
        module_map: &ModuleMap,
        code_cache: &CodeCache,
    ) -> DbiResult<Fragment> {
        let (mut insns, _stop_reason) = self.decode_forward(entry_pc, reader, module_map)?;

        for cb in &self.callbacks {
            cb(&mut insns);
        }
        self.reject_invalid_rewrite(&insns)?;

        let source_end = insns
            .last()
            .map(|d| d.ir.source_pc + d.ir.len() as u64)
            .unwrap_or(entry_pc);

        code_cache.enter_write_window();
        let result = self.assemble_and_insert(entry_pc, source_end, &insns, code_cache);
        code_cache.exit_write_window();
        result
    }

    /// Fix-up rule (c): a rewrite must not turn the block's terminator into
    /// a non-terminator without itself closing the block with a new one.
    fn reject_invalid_rewrite(&self, insns: &[DecodedInsn]) -> DbiResult<()> {
        match insns.last() {
            Some(last) if last.ir.is_terminator() => Ok(()),
            Some(last) => Err(DbiError::InvalidRewrite {
                pc: last.ir.source_pc,
                reason: "instrumentation left block without a terminator".into(),
            }),
            None => Err(DbiError::InvalidRewrite {
                pc: 0,
                reason: "instrumentation emptied the instruction list".into(),
            }),
        }
    }

    fn assemble_and_insert(
        &self,
        entry_pc: u64,
        source_end: u64,
        insns: &[DecodedInsn],
        code_cache: &CodeCache,
    ) -> DbiResult<Fragment> {
        let plan = self.plan_exits(insns);
        let body_len = self.measure_body(&insns[..insns.len() - 1])?;
        let terminator_len = if plan.keep_terminator_bytes {
            let mut scratch = Vec::new();
            crate::encoder::encode_one(&insns.last().unwrap().iced, 0, &mut scratch)?
        } else {
            0
        };
        let total_len = body_len + terminator_len + plan.stub_bytes;

        let offset = match code_cache.allocate(total_len) {
            Ok(o) => o,
            Err(DbiError::OutOfCacheMemory { .. }) => {
                code_cache.evict_generation();
                code_cache.allocate(total_len)?
            }
            Err(e) => return Err(e),
        };

        let base = code_cache.arena_base() + offset as u64;
        let (emitted, translation, exits) = self.emit(insns, base, &plan)?;

        Ok(Fragment {
            id: 0,
            start_application_pc: entry_pc,
            emitted_bytes: emitted,
            cache_offset: offset,
            translation,
            exits,
            incoming_links: Vec::new(),
            state: FragmentState::Live,
            source_module_base: entry_pc,
            source_byte_range: (entry_pc, source_end),
        })
    }

    /// Encoding length of every instruction except the terminator, measured
    /// at a throwaway base since plain (non-branch) instructions' lengths
    /// don't depend on the final address.
    fn measure_body(&self, insns: &[DecodedInsn]) -> DbiResult<usize> {
        let mut total = 0usize;
        for d in insns {
            let mut scratch = Vec::new();
            total += crate::encoder::encode_one(&d.iced, 0, &mut scratch)?;
        }
        Ok(total)
    }

    fn plan_exits(&self, insns: &[DecodedInsn]) -> ExitPlan {
        let last = insns.last().expect("reject_invalid_rewrite ran first");
        let next_pc = last.ir.source_pc + last.ir.len() as u64;

        if last.ir.category.contains(crate::ir::Category::SERIALIZING) {
            return ExitPlan {
                keep_terminator_bytes: true,
                stub_bytes: JMP_STUB_BYTES,
                kinds: vec![(ExitKind::SystemCall, next_pc)],
                is_call: false,
            };
        }

        match direct_branch_target(last) {
            Some(target) if last.ir.category.contains(crate::ir::Category::BRANCH) => {
                if is_conditional(last) {
                    ExitPlan {
                        keep_terminator_bytes: false,
                        stub_bytes: JCC_STUB_BYTES + JMP_STUB_BYTES,
                        kinds: vec![(ExitKind::Conditional, target), (ExitKind::Direct, next_pc)],
                        is_call: false,
                    }
                } else {
                    // A direct `call` must still push a return address, so
                    // its stub uses `call rel32` rather than `jmp rel32` —
                    // everything else about linking/patching is identical
                    // to an unconditional jump's exit stub.
                    ExitPlan {
                        keep_terminator_bytes: false,
                        stub_bytes: JMP_STUB_BYTES,
                        kinds: vec![(ExitKind::Direct, target)],
                        is_call: last.iced.is_call_near() || last.iced.is_call_far(),
                    }
                }
            }
            None if is_return(last) => ExitPlan {
                keep_terminator_bytes: false,
                stub_bytes: JMP_STUB_BYTES,
                kinds: vec![(ExitKind::Return, 0)],
                is_call: false,
            },
            _ => ExitPlan {
                keep_terminator_bytes: false,
                stub_bytes: JMP_STUB_BYTES,
                kinds: vec![(ExitKind::Indirect, 0)],
                is_call: false,
            },
        }
    }

    /// Emits the non-terminator instructions verbatim (re-encoded at their
    /// real cache address) followed by placeholder exit-stub jumps rather
    /// than the original terminator's bytes — a direct unconditional/
    /// conditional branch never jumps to the application address itself
    /// from inside the cache, it jumps through a stub the code cache can
    /// later patch to the target fragment (or leave pointing at the
    /// dispatcher). A serializing instruction (syscall-class) is the one
    /// exception: it must actually execute, so its real bytes are kept and
    /// a single stub back to the dispatcher follows it.
    fn emit(
        &self,
        insns: &[DecodedInsn],
        base: u64,
        plan: &ExitPlan,
    ) -> DbiResult<(Vec<u8>, TranslationTable, Vec<ExitStub>)> {
        let mut out = Vec::new();
        let mut translation = TranslationTable::default();
        let body = &insns[..insns.len() - 1];
        let last = insns.last().unwrap();

        for d in body {
            let cache_offset = out.len() as u32;
            translation.push(cache_offset, d.ir.source_pc);
            crate::encoder::encode_one(&d.iced, base + cache_offset as u64, &mut out)?;
        }

        translation.push(out.len() as u32, last.ir.source_pc);
        if plan.keep_terminator_bytes {
            let cache_offset = out.len() as u32;
            crate::encoder::encode_one(&last.iced, base + cache_offset as u64, &mut out)?;
        }

        let jcc_nibble = last.ir.raw_bytes.as_deref().and_then(jcc_condition_nibble);

        let mut exits = Vec::with_capacity(plan.kinds.len());
        for (kind, target) in &plan.kinds {
            let stub_offset = out.len();
            match kind {
                ExitKind::Conditional => {
                    let nibble = jcc_nibble.unwrap_or(0);
                    out.extend_from_slice(&[0x0f, 0x80 | nibble]);
                    out.extend_from_slice(&0i32.to_le_bytes());
                }
                ExitKind::Direct if plan.is_call => {
                    out.push(0xe8); // call rel32
                    out.extend_from_slice(&0i32.to_le_bytes());
                }
                _ => {
                    out.push(0xe9); // jmp rel32
                    out.extend_from_slice(&0i32.to_le_bytes());
                }
            }
            let disp_offset = stub_offset + if *kind == ExitKind::Conditional { 2 } else { 1 };
            exits.push(ExitStub {
                id: exits.len() as crate::fragment::ExitStubId,
                owning_fragment: 0,
                target_application_pc: *target,
                kind: *kind,
                link_state: LinkState::Unlinked,
                patch_offset: disp_offset,
            });
        }

        Ok((out, translation, exits))
    }
}

struct ExitPlan {
    keep_terminator_bytes: bool,
    stub_bytes: usize,
    kinds: Vec<(ExitKind, u64)>,
    /// When the sole exit is `Direct` and came from a `call`, the stub
    /// must itself be a `call` so a return address still gets pushed.
    is_call: bool,
}

const JMP_STUB_BYTES: usize = 5;
const JCC_STUB_BYTES: usize = 6;

fn direct_branch_target(d: &DecodedInsn) -> Option<u64> {
    d.ir.sources.iter().find_map(|op| match op {
        crate::ir::Operand::PcRelative { offset } => Some((d.ir.source_pc as i64 + offset) as u64),
        _ => None,
    })
}

fn is_conditional(d: &DecodedInsn) -> bool {
    d.iced.is_jcc_short_or_near()
}

/// Recovers the 4-bit condition code from a decoded Jcc's original
/// encoding (`0F 8x rel32` or `7x rel8`), so the stub placeholder tests the
/// same flags the original branch did rather than always taking one fixed
/// condition.
fn jcc_condition_nibble(raw: &[u8]) -> Option<u8> {
    match raw {
        [0x0f, second, ..] if (*second & 0xf0) == 0x80 => Some(second & 0x0f),
        [first, ..] if (*first & 0xf0) == 0x70 => Some(first & 0x0f),
        _ => None,
    }
}

fn is_return(d: &DecodedInsn) -> bool {
    d.iced.flow_control() == iced_x86::FlowControl::Return
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_map::{ModuleEntry, ModuleIdentity};
    use nix::sys::mman::ProtFlags;
    use std::path::PathBuf;

    fn executable_map(base: u64, size: u64) -> ModuleMap {
        let mut m = ModuleMap::new();
        m.on_load(ModuleEntry {
            base,
            size,
            protection: ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            identity: ModuleIdentity {
                path: PathBuf::from("/bin/test"),
                build_id: Vec::new(),
            },
            executed: false,
            loaded: true,
        });
        m
    }

    #[test]
    fn builds_a_single_instruction_fragment_ending_in_ret() {
        let reader = SliceReader {
            base: 0x1000,
            bytes: &[0xc3],
        };
        let map = executable_map(0x1000, 0x1000);
        let cache = CodeCache::new(0x7000_0000, 1 << 16);
        let builder = FragmentBuilder::new();

        let frag = builder.build(0x1000, &reader, &map, &cache).unwrap();
        assert_eq!(frag.start_application_pc, 0x1000);
        assert_eq!(frag.exits.len(), 1);
        assert_eq!(frag.exits[0].kind, ExitKind::Return);
        assert!(frag.translation.is_total_for(frag.emitted_bytes.len() as u32));
    }

    #[test]
    fn direct_jump_produces_one_direct_exit_with_resolved_target() {
        // jmp rel8 +0 (eb 00) at 0x2000, target == 0x2002
        let reader = SliceReader {
            base: 0x2000,
            bytes: &[0xeb, 0x00],
        };
        let map = executable_map(0x2000, 0x1000);
        let cache = CodeCache::new(0x7000_0000, 1 << 16);
        let builder = FragmentBuilder::new();

        let frag = builder.build(0x2000, &reader, &map, &cache).unwrap();
        assert_eq!(frag.exits.len(), 1);
        assert_eq!(frag.exits[0].kind, ExitKind::Direct);
        assert_eq!(frag.exits[0].target_application_pc, 0x2002);
    }

    #[test]
    fn syscall_terminates_block_with_unlinkable_exit() {
        // cpuid (0f a2) stands in as a serializing terminator at 0x3000
        let reader = SliceReader {
            base: 0x3000,
            bytes: &[0x0f, 0xa2],
        };
        let map = executable_map(0x3000, 0x1000);
        let cache = CodeCache::new(0x7000_0000, 1 << 16);
        let builder = FragmentBuilder::new();

        let frag = builder.build(0x3000, &reader, &map, &cache).unwrap();
        assert_eq!(frag.exits[0].kind, ExitKind::SystemCall);
    }

    #[test]
    fn multi_instruction_block_records_one_translation_entry_per_instruction() {
        // nop; nop; ret
        let reader = SliceReader {
            base: 0x4000,
            bytes: &[0x90, 0x90, 0xc3],
        };
        let map = executable_map(0x4000, 0x1000);
        let cache = CodeCache::new(0x7000_0000, 1 << 16);
        let builder = FragmentBuilder::new();

        let frag = builder.build(0x4000, &reader, &map, &cache).unwrap();
        assert_eq!(frag.translation.len(), 3);
        assert_eq!(frag.translation.translate(0), Some(0x4000));
        assert_eq!(frag.translation.translate(2), Some(0x4002));
    }

    #[test]
    fn entry_pc_outside_any_mapping_fails_cleanly() {
        let reader = SliceReader {
            base: 0x1000,
            bytes: &[0xc3],
        };
        let map = ModuleMap::new();
        let cache = CodeCache::new(0x7000_0000, 1 << 16);
        let builder = FragmentBuilder::new();

        assert!(builder.build(0x1000, &reader, &map, &cache).is_err());
    }
}
