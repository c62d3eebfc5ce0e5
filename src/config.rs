//! Process-wide configuration, in a `Flags::get()`-style singleton,
//! holding knobs that should be exposed rather than guessed: the
//! interaction of flush with in-flight signals, and whether the
//! write-protect sandbox shares SIGSEGV with a tracee that installed its
//! own handler.

use lazy_static::lazy_static;
use parking_lot::RwLock;

/// What happens to a flush whose page-protection toggle races with a
/// signal arriving on that same page.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FlushDuringSignalPolicy {
    /// Finish delivering the queued signal before starting the next flush
    /// round (the policy this runtime defaults to; see DESIGN.md).
    DeferFlush,
    /// Abort the in-progress flush and retry once the signal has been
    /// delivered to the application.
    AbortAndRetryFlush,
}

/// How to handle an application-installed SIGSEGV handler overlapping the
/// write-protect sandbox's own use of SIGSEGV.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SandboxSignalSharingPolicy {
    /// The mediator always inspects a SIGSEGV first; only forwards it to the
    /// application handler if the fault wasn't caused by our own write-protect
    /// sandbox page.
    MediatorFirst,
    /// Disables the write-protect sandbox entirely for pages the application
    /// has registered a SIGSEGV handler against, falling back to the
    /// self-modifying-code sandbox (inline checksums) for those pages.
    DisableSandboxOnOverlap,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Fragment builder's block-termination rule: maximum instructions per
    /// fragment.
    pub max_fragment_instructions: usize,
    /// Code cache eviction threshold, as a fraction of arena capacity.
    pub cache_high_watermark_pct: u8,
    /// Size in bytes of each code cache arena chunk (mmap granularity).
    pub cache_chunk_bytes: usize,
    /// Bound on how long a synch-all waits for a thread to reach a
    /// suspend point before declaring a timeout.
    pub synch_all_timeout_ms: u64,
    pub flush_during_signal: FlushDuringSignalPolicy,
    pub sandbox_signal_sharing: SandboxSignalSharingPolicy,
    /// Force things the runtime otherwise wouldn't (e.g. enable the
    /// write-protect sandbox even on pages the heuristic would otherwise
    /// hand to the self-modifying-code sandbox).
    pub force_write_protect_sandbox: bool,
    /// Path to a persistent fragment-cache file to preload at startup, if any.
    pub persist_path: Option<std::path::PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_fragment_instructions: 256,
            cache_high_watermark_pct: 80,
            cache_chunk_bytes: 2 * 1024 * 1024,
            synch_all_timeout_ms: 2000,
            flush_during_signal: FlushDuringSignalPolicy::DeferFlush,
            sandbox_signal_sharing: SandboxSignalSharingPolicy::MediatorFirst,
            force_write_protect_sandbox: false,
            persist_path: None,
        }
    }
}

lazy_static! {
    static ref CONFIG: RwLock<Config> = RwLock::new(Config::default());
}

/// Process-wide configuration handle. An explicit context handle would be
/// preferable, but the runtime's own entry points (preload constructor,
/// attach handshake) run before any context object exists to thread it
/// through, so a single explicitly-initialized global is kept here
/// instead, the same way a single `Flags` singleton is kept elsewhere.
pub struct ConfigHandle;

impl ConfigHandle {
    pub fn get() -> Config {
        CONFIG.read().clone()
    }

    pub fn set(new_config: Config) {
        *CONFIG.write() = new_config;
    }

    pub fn update(f: impl FnOnce(&mut Config)) {
        f(&mut CONFIG.write());
    }
}
