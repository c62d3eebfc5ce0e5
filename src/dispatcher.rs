//! The per-thread state machine every control-flow transition that can't
//! stay inside the cache funnels through: cold misses, indirect-branch
//! misses, syscalls, signal returns, thread starts.

use crate::code_cache::CodeCache;
use crate::error::DbiResult;
use crate::fragment::FragmentId;
use crate::fragment_builder::{CodeReader, FragmentBuilder};
use crate::module_map::ModuleMap;
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DispatchState {
    InCache,
    InDispatcher,
    InBuilder,
    InSyscall,
}

/// What the dispatcher decided to do with one re-entry. The context-switch
/// trampoline uses this to know whether to resume in the cache or fall
/// back to native execution (e.g. a second consecutive out-of-memory
/// failure).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DispatchOutcome {
    EnterCache { cache_pc: u64 },
    Abort,
}

/// Serialises concurrent builds of the same application PC: "If two
/// threads race to build the same fragment, the loser observes the hit on
/// retry." Tracked separately from the code cache's own writer lock since
/// two threads building *different* PCs should not block each other.
#[derive(Default)]
struct InFlightBuilds {
    pcs: HashSet<u64>,
}

pub struct Dispatcher {
    code_cache: CodeCache,
    builder: FragmentBuilder,
    in_flight: Mutex<InFlightBuilds>,
}

impl Dispatcher {
    pub fn new(code_cache: CodeCache, builder: FragmentBuilder) -> Dispatcher {
        Dispatcher {
            code_cache,
            builder,
            in_flight: Mutex::new(InFlightBuilds::default()),
        }
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    /// `IN_DISPATCHER`: look up `application_pc`. A hit resolves directly;
    /// a miss is serialised through the builder for that PC so at most one
    /// thread builds a given fragment at a time.
    pub fn dispatch(
        &self,
        application_pc: u64,
        reader: &dyn CodeReader,
        module_map: &ModuleMap,
    ) -> DbiResult<DispatchOutcome> {
        if let Some(id) = self.code_cache.lookup_by_pc(application_pc) {
            return Ok(self.enter(id));
        }

        if !self.claim_build(application_pc) {
            // Another thread is already building this PC (`IN_BUILDER`
            // contention) — the loser just re-checks the index, which by
            // the time it gets the lock back should hold the winner's
            // fragment.
            return match self.code_cache.lookup_by_pc(application_pc) {
                Some(id) => Ok(self.enter(id)),
                None => Ok(DispatchOutcome::Abort),
            };
        }

        let result = self
            .builder
            .build(application_pc, reader, module_map, &self.code_cache);
        self.release_build(application_pc);

        match result {
            Ok(fragment) => {
                let start_pc = fragment.start_application_pc;
                // A fragment whose start PC lies on a page that became
                // unexecutable between decode and insert is discarded.
                if !module_map.is_executable_pc(start_pc) {
                    return Ok(DispatchOutcome::Abort);
                }
                let id = self.code_cache.insert_fragment(fragment);
                Ok(self.enter(id))
            }
            Err(_) => Ok(DispatchOutcome::Abort),
        }
    }

    fn enter(&self, id: FragmentId) -> DispatchOutcome {
        match self.code_cache.fragment_entry_point(id) {
            Some(pc) => DispatchOutcome::EnterCache { cache_pc: pc },
            None => DispatchOutcome::Abort,
        }
    }

    /// Indirect-branch or return miss: consult the indirect table first
    /// (populated independently of the direct fragment index), falling
    /// back to a normal dispatch on miss.
    pub fn dispatch_indirect(
        &self,
        application_pc: u64,
        reader: &dyn CodeReader,
        module_map: &ModuleMap,
    ) -> DbiResult<DispatchOutcome> {
        if let Some(id) = self.code_cache.lookup_indirect(application_pc) {
            return Ok(self.enter(id));
        }
        self.dispatch(application_pc, reader, module_map)
    }

    fn claim_build(&self, pc: u64) -> bool {
        self.in_flight.lock().pcs.insert(pc)
    }

    fn release_build(&self, pc: u64) {
        self.in_flight.lock().pcs.remove(&pc);
    }
}
