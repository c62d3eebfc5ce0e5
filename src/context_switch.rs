//! Register-save area and the ISA-specific contract the cache-entry/cache-exit
//! trampolines have to honor across the boundary between application
//! register state and runtime register state.

use crate::arch::SupportedArch;
use crate::registers::Registers;

/// Slab a thread's machine context is saved into while the runtime itself
/// runs on that thread's stack (signal handling, dispatcher lookups,
/// fragment building). One per thread, owned by that thread's registry
/// entry.
pub struct ContextSwitchFrame {
    pub saved: Registers,
    /// Set by the cache-exit trampoline when a fragment exits through an
    /// unlinked stub, so the dispatcher knows which application PC to look
    /// up without having to recover it from the stub's encoded target.
    pub exit_application_pc: u64,
    /// True once `saved` holds a valid snapshot; cleared on resume so a
    /// stale frame can't be replayed twice.
    pub valid: bool,
}

impl ContextSwitchFrame {
    pub fn new(arch: SupportedArch) -> ContextSwitchFrame {
        ContextSwitchFrame {
            saved: Registers::new(arch),
            exit_application_pc: 0,
            valid: false,
        }
    }

    /// Cache-exit trampoline: record the application machine state and the
    /// PC the dispatcher should resolve next.
    pub fn save(&mut self, ctx: Registers, exit_application_pc: u64) {
        self.saved = ctx;
        self.exit_application_pc = exit_application_pc;
        self.valid = true;
    }

    /// Cache-entry trampoline: hand back the state to restore into
    /// machine registers immediately before jumping to `cache_pc`, and
    /// invalidate the frame so it can't be reused by accident.
    pub fn take(&mut self) -> Registers {
        self.valid = false;
        self.saved
    }
}

/// What the trampoline does on re-entry into the cache: restore the saved
/// context, point the stack at `cache_pc`, and fall through to machine
/// code. There's no Rust body for the actual register restore — the
/// per-ISA asm trampoline (`x86_64_enter_cache`/`aarch64_enter_cache`) lives
/// in `arch.rs` and loads this plan's fields into real registers — but the
/// plan itself is ordinary data so the dispatcher can build and log it.
#[derive(Copy, Clone, Debug)]
pub struct EntryPlan {
    pub cache_pc: u64,
    pub stack_pointer: u64,
}

impl EntryPlan {
    pub fn new(cache_pc: u64, stack_pointer: u64) -> EntryPlan {
        EntryPlan { cache_pc, stack_pointer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_take_round_trips_and_invalidates() {
        let mut frame = ContextSwitchFrame::new(SupportedArch::X64);
        let mut ctx = Registers::new(SupportedArch::X64);
        ctx.set_ip(0x4000);
        frame.save(ctx, 0x4000);
        assert!(frame.valid);

        let restored = frame.take();
        assert_eq!(restored.ip(), 0x4000);
        assert!(!frame.valid);
    }
}
