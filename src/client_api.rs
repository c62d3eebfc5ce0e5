//! The instrumentation-callback surface an analysis client registers
//! against: per-fragment build callbacks, per-thread/module/signal/syscall
//! lifecycle callbacks, and the query operations a callback runs inside
//! (decode one instruction, read the application register file/PC).
//!
//! Clients, per-ISA opcode tables beyond x86-64, and the launcher's shell
//! utilities are out of scope for the core; this module is only the
//! surface the core exposes for them, not an implementation of one.

use crate::fragment_builder::{DecodedInsn, InstrumentationCallback};
use crate::ir::Instruction;
use crate::module_map::ModuleEntry;
use crate::registers::Registers;
use libc::pid_t;

pub type ThreadLifecycleCallback = Box<dyn Fn(pid_t) + Send + Sync>;
pub type ModuleLifecycleCallback = Box<dyn Fn(&ModuleEntry) + Send + Sync>;
pub type SyscallCallback = Box<dyn Fn(&Registers) + Send + Sync>;

/// Registration surface a client links against. Held by the runtime for
/// the lifetime of the instrumented process; never cloned, since callback
/// ordering (registration order, per §4.2) must stay stable.
#[derive(Default)]
pub struct ClientCallbacks {
    pub fragment_callbacks: Vec<InstrumentationCallback>,
    pub thread_init: Vec<ThreadLifecycleCallback>,
    pub thread_exit: Vec<ThreadLifecycleCallback>,
    pub module_load: Vec<ModuleLifecycleCallback>,
    pub module_unload: Vec<ModuleLifecycleCallback>,
    pub syscall_pre: Vec<SyscallCallback>,
    pub syscall_post: Vec<SyscallCallback>,
}

impl ClientCallbacks {
    pub fn new() -> ClientCallbacks {
        ClientCallbacks::default()
    }

    pub fn register_fragment_callback(&mut self, cb: InstrumentationCallback) {
        self.fragment_callbacks.push(cb);
    }

    pub fn register_thread_init(&mut self, cb: ThreadLifecycleCallback) {
        self.thread_init.push(cb);
    }

    pub fn register_thread_exit(&mut self, cb: ThreadLifecycleCallback) {
        self.thread_exit.push(cb);
    }

    pub fn register_module_load(&mut self, cb: ModuleLifecycleCallback) {
        self.module_load.push(cb);
    }

    pub fn register_module_unload(&mut self, cb: ModuleLifecycleCallback) {
        self.module_unload.push(cb);
    }

    pub fn register_syscall_pre(&mut self, cb: SyscallCallback) {
        self.syscall_pre.push(cb);
    }

    pub fn register_syscall_post(&mut self, cb: SyscallCallback) {
        self.syscall_post.push(cb);
    }

    pub fn notify_module_load(&self, entry: &ModuleEntry) {
        for cb in &self.module_load {
            cb(entry);
        }
    }

    pub fn notify_module_unload(&self, entry: &ModuleEntry) {
        for cb in &self.module_unload {
            cb(entry);
        }
    }

    pub fn notify_thread_init(&self, tid: pid_t) {
        for cb in &self.thread_init {
            cb(tid);
        }
    }

    pub fn notify_thread_exit(&self, tid: pid_t) {
        for cb in &self.thread_exit {
            cb(tid);
        }
    }

    pub fn notify_syscall_pre(&self, regs: &Registers) {
        for cb in &self.syscall_pre {
            cb(regs);
        }
    }

    pub fn notify_syscall_post(&self, regs: &Registers) {
        for cb in &self.syscall_post {
            cb(regs);
        }
    }
}

/// Decode a single instruction at `pc` for a client that wants to inspect
/// code without going through the fragment builder (e.g. a disassembly
/// view). Reuses the same decoder the fragment builder uses, so a client's
/// idea of "what instruction is at this PC" never disagrees with the
/// runtime's own.
pub fn decode_one_for_client(bytes: &[u8], pc: u64) -> crate::error::DbiResult<(Instruction, usize)> {
    crate::decoder::decode(bytes, pc)
}

pub fn decoded_insn_operands(insn: &DecodedInsn) -> &[crate::ir::Operand] {
    &insn.ir.sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn thread_init_callbacks_run_in_registration_order() {
        let mut callbacks = ClientCallbacks::new();
        let order = Arc::new(AtomicUsize::new(0));

        let o1 = order.clone();
        callbacks.register_thread_init(Box::new(move |_tid| {
            assert_eq!(o1.fetch_add(1, Ordering::SeqCst), 0);
        }));
        let o2 = order.clone();
        callbacks.register_thread_init(Box::new(move |_tid| {
            assert_eq!(o2.fetch_add(1, Ordering::SeqCst), 1);
        }));

        callbacks.notify_thread_init(42);
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }
}
