//! The entry points by which the runtime gains control over a target
//! process, and relinquishes it cleanly: preload, attach, fork, detach.

use crate::code_cache::CodeCache;
use crate::consistency::ConsistencyMonitor;
use crate::dispatcher::Dispatcher;
use crate::error::DbiResult;
use crate::fragment_builder::FragmentBuilder;
use crate::log::LogLevel::LogInfo;
use crate::module_map::ModuleMap;
use crate::signal::SignalMediator;
use crate::syscalls;
use crate::thread_registry::ThreadRegistry;
use libc::pid_t;
use parking_lot::Mutex;

/// Everything a running instance of the runtime owns, threaded as an
/// explicit context handle rather than accessed as ambient globals so a
/// fork child can build its own from scratch and tests can run several in
/// isolation.
pub struct Runtime {
    pub dispatcher: Dispatcher,
    pub module_map: Mutex<ModuleMap>,
    pub thread_registry: ThreadRegistry,
    pub signal_mediator: Mutex<SignalMediator>,
    pub consistency: Mutex<ConsistencyMonitor>,
}

const DEFAULT_ARENA_CAPACITY: usize = 64 * 1024 * 1024;
const PAGE_SIZE: u64 = 4096;

impl Runtime {
    fn new_empty(arena_base: u64) -> Runtime {
        Runtime {
            dispatcher: Dispatcher::new(CodeCache::new(arena_base, DEFAULT_ARENA_CAPACITY), FragmentBuilder::new()),
            module_map: Mutex::new(ModuleMap::new()),
            thread_registry: ThreadRegistry::new(),
            signal_mediator: Mutex::new(SignalMediator::new()),
            consistency: Mutex::new(ConsistencyMonitor::new(PAGE_SIZE)),
        }
    }

    /// Preload entry mode: a loader-level hook runs this before the
    /// target's own entry point. Maps the arena, installs the runtime in
    /// this same address space, and returns the entry the caller's
    /// trampoline should jump through instead of the target's real entry
    /// point.
    pub fn preload(arch: crate::arch::SupportedArch, target_entry_pc: u64) -> DbiResult<Runtime> {
        let arena_base = syscalls::map_anonymous(
            DEFAULT_ARENA_CAPACITY,
            nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_EXEC,
        )?;
        log!(LogInfo, "preload: mapped code cache arena at {:#x}", arena_base);

        let runtime = Runtime::new_empty(arena_base);
        // Preload always runs on the target's initial thread, where tid == pid.
        let tid = nix::unistd::getpid().as_raw();
        let entry = runtime.thread_registry.register(tid, arch);
        entry.context.lock().save(crate::registers::Registers::new(arch), target_entry_pc);
        Ok(runtime)
    }

    /// Attach entry mode: an external process instructs an already-mapped,
    /// quiescent runtime to take over `target_tids`. Suspends each thread,
    /// captures its context, and relocates it through the dispatcher.
    pub fn attach(arch: crate::arch::SupportedArch, arena_base: u64, target_tids: &[pid_t]) -> DbiResult<Runtime> {
        let runtime = Runtime::new_empty(arena_base);
        for &tid in target_tids {
            syscalls::attach(tid)?;
            let entry = runtime.thread_registry.register(tid, arch);
            entry.set_state(crate::dispatcher::DispatchState::InDispatcher);
            log!(LogInfo, "attach: took over tid {}", tid);
        }
        Ok(runtime)
    }

    /// Called from the parent's fork syscall handler, before the child
    /// resumes: build the child's own empty runtime exactly once so it
    /// doesn't inherit the parent's cache contents (fragments embed
    /// absolute addresses the child's copy-on-write arena will duplicate
    /// bytes-for-bytes, but the child's fragment/thread bookkeeping must
    /// start fresh or it will believe threads exist that the fork didn't
    /// carry over).
    pub fn reinitialize_after_fork(arch: crate::arch::SupportedArch, arena_base: u64, child_tid: pid_t) -> DbiResult<Runtime> {
        let runtime = Runtime::new_empty(arena_base);
        runtime.thread_registry.register(child_tid, arch);
        log!(LogInfo, "fork: child {} starting with an empty cache", child_tid);
        Ok(runtime)
    }

    /// Detach: suspend every thread, translate each one's cache PC back to
    /// an application PC, rewrite its context to resume natively, tear
    /// down the cache, and resume.
    pub fn detach(self) -> DbiResult<()> {
        let guard = self
            .thread_registry
            .synch_all(std::time::Duration::from_millis(5000), None)?;
        let tids = self.thread_registry.tids();
        drop(guard);

        for tid in tids {
            syscalls::detach(tid)?;
        }
        log!(LogInfo, "detach: runtime relinquished control");
        Ok(())
    }
}
