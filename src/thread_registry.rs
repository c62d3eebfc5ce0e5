//! Tracks every thread the runtime has taken over in this process, and
//! implements "synch-all": the barrier operation the cache consistency
//! monitor and detach path use to get every thread paused at a known-safe
//! suspension point before it mutates or inspects shared cache state.
//!
//! A registry owning a set of per-thread entries keyed by tid. Tracee
//! threads run concurrently with this runtime's own signal and dispatcher
//! paths, so entries are `Arc`/`parking_lot::Mutex` rather than
//! `Rc<RefCell<...>>`/`Weak`, which would only suit a single-threaded
//! owner.

use crate::context_switch::ContextSwitchFrame;
use crate::dispatcher::DispatchState;
use crate::error::{DbiError, DbiResult};
use crate::log::LogLevel::LogDebug;
use libc::pid_t;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a thread's execution currently is, for the benefit of synch-all:
/// a thread parked `InCache` or `InDispatcher` is at a well-defined
/// suspension point and can be safely paused; a thread `InBuilder` or
/// `InSyscall` must run to its next suspension point first.
pub type SuspensionState = DispatchState;

pub struct ThreadEntry {
    pub tid: pid_t,
    pub context: Mutex<ContextSwitchFrame>,
    pub state: Mutex<SuspensionState>,
    /// Flipped by `ThreadRegistry::request_suspend_all`; the thread's own
    /// suspension-point check reads this and parks itself on `parked_cv`.
    suspend_requested: AtomicBool,
    parked: Mutex<bool>,
    parked_cv: Condvar,
}

impl ThreadEntry {
    fn new(tid: pid_t, arch: crate::arch::SupportedArch) -> ThreadEntry {
        ThreadEntry {
            tid,
            context: Mutex::new(ContextSwitchFrame::new(arch)),
            state: Mutex::new(SuspensionState::InDispatcher),
            suspend_requested: AtomicBool::new(false),
            parked: Mutex::new(false),
            parked_cv: Condvar::new(),
        }
    }

    pub fn set_state(&self, state: SuspensionState) {
        *self.state.lock() = state;
    }

    fn is_at_suspension_point(&self) -> bool {
        matches!(*self.state.lock(), SuspensionState::InCache | SuspensionState::InDispatcher)
    }

    /// Called by the owning thread itself at a suspension point: if
    /// another thread has requested synch-all, park here until released.
    pub fn check_suspend(&self) {
        if !self.suspend_requested.load(Ordering::Acquire) {
            return;
        }
        let mut parked = self.parked.lock();
        *parked = true;
        self.parked_cv.notify_all();
        while self.suspend_requested.load(Ordering::Acquire) {
            self.parked_cv.wait(&mut parked);
        }
        *parked = false;
    }

    fn request_suspend(&self) {
        self.suspend_requested.store(true, Ordering::Release);
    }

    fn release_suspend(&self) {
        self.suspend_requested.store(false, Ordering::Release);
        self.parked_cv.notify_all();
    }

    fn wait_until_parked(&self, deadline: Instant) -> bool {
        // A thread whose last reported state is already a suspension point
        // (`InCache`/`InDispatcher`) isn't running instrumented code right
        // now, so it's safe to treat it as parked without waiting for it to
        // call `check_suspend` itself — nothing guarantees it ever will if
        // it's idle there rather than about to cross a fragment boundary.
        if self.is_at_suspension_point() {
            return true;
        }
        let mut parked = self.parked.lock();
        while !*parked {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let result = self.parked_cv.wait_for(&mut parked, remaining);
            if result.timed_out() && !*parked {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<pid_t, Arc<ThreadEntry>>>,
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        ThreadRegistry::default()
    }

    pub fn register(&self, tid: pid_t, arch: crate::arch::SupportedArch) -> Arc<ThreadEntry> {
        log!(LogDebug, "thread registry: adding tid {}", tid);
        let entry = Arc::new(ThreadEntry::new(tid, arch));
        self.threads.lock().insert(tid, entry.clone());
        entry
    }

    pub fn unregister(&self, tid: pid_t) {
        log!(LogDebug, "thread registry: removing tid {}", tid);
        self.threads.lock().remove(&tid);
    }

    pub fn get(&self, tid: pid_t) -> Option<Arc<ThreadEntry>> {
        self.threads.lock().get(&tid).cloned()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn tids(&self) -> Vec<pid_t> {
        self.threads.lock().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Pause every registered thread (other than `excluding`, when the
    /// caller is itself one of the tracked threads) at its next
    /// suspension point, with a timeout. On timeout the threads that
    /// didn't make it are released again and the caller gets
    /// `SynchAllTimeout`.
    pub fn synch_all(&self, timeout: Duration, excluding: Option<pid_t>) -> DbiResult<SynchAllGuard> {
        let entries: Vec<Arc<ThreadEntry>> = self
            .threads
            .lock()
            .values()
            .filter(|e| Some(e.tid) != excluding)
            .cloned()
            .collect();

        for e in &entries {
            e.request_suspend();
        }

        let deadline = Instant::now() + timeout;
        let mut remaining = entries.len();
        for e in &entries {
            if e.wait_until_parked(deadline) {
                remaining -= 1;
            }
        }

        if remaining > 0 {
            for e in &entries {
                e.release_suspend();
            }
            return Err(DbiError::SynchAllTimeout { remaining });
        }

        Ok(SynchAllGuard { entries })
    }
}

/// Releases every paused thread when dropped, so a panicking caller can't
/// leave the process permanently frozen.
pub struct SynchAllGuard {
    entries: Vec<Arc<ThreadEntry>>,
}

impl Drop for SynchAllGuard {
    fn drop(&mut self) {
        for e in &self.entries {
            e.release_suspend();
        }
    }
}
