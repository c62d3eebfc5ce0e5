//! Classifies a delivered signal and routes it: repaired transparently,
//! translated and queued for the application, or consumed entirely inside
//! the runtime.

use crate::code_cache::CodeCache;
use crate::restart_region::RestartRegionTable;
use nix::sys::signal::Signal;
use std::collections::VecDeque;

/// Which of the four routes in the mediator a delivered signal takes.
#[derive(Clone, Debug)]
pub enum SignalDisposition {
    /// A fault caused by the runtime's own write-protect sandbox toggling
    /// a page's protection; repaired without ever surfacing to the
    /// application.
    RepairedInternally,
    /// The faulting/interrupted PC was inside the cache; carries the
    /// translated application PC and register state the application
    /// handler should observe.
    DeliverToApplication { application_pc: u64 },
    /// Same as above, but the interrupted PC fell inside a registered
    /// restart region — deliver with the PC rewritten to the region's
    /// restart point instead of the raw interrupted PC.
    DeliverWithRestart { restart_pc: u64 },
    /// Suspend-for-synchronisation, attach handshake, detach: consumed
    /// entirely by the runtime.
    RuntimeInternal,
}

/// One entry in the per-thread ordered queue of signals awaiting delivery
/// to the application at the next fragment boundary. Delivery never
/// reorders what the kernel presented.
#[derive(Clone, Debug)]
pub struct PendingSignal {
    pub signal: Signal,
    pub application_pc: u64,
    pub sequence: u64,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FaultOrigin {
    /// The page backing the faulting address is one the write-protect
    /// sandbox currently holds read-only.
    SandboxProtectedPage,
    /// The faulting/interrupted PC is an address inside the code cache
    /// arena.
    CachePc,
    /// Neither of the above: genuine application-visible signal.
    Application,
    /// A signal the runtime sends to itself for suspend/attach/detach
    /// coordination (see `crate::thread_registry`).
    Internal,
}

pub struct SignalMediator {
    restart_regions: RestartRegionTable,
    sequence_counter: u64,
    queue: VecDeque<PendingSignal>,
}

impl Default for SignalMediator {
    fn default() -> Self {
        SignalMediator {
            restart_regions: RestartRegionTable::new(),
            sequence_counter: 0,
            queue: VecDeque::new(),
        }
    }
}

impl SignalMediator {
    pub fn new() -> SignalMediator {
        SignalMediator::default()
    }

    pub fn restart_regions_mut(&mut self) -> &mut RestartRegionTable {
        &mut self.restart_regions
    }

    /// Classify and route a delivered signal. `fault_address` is the
    /// faulting address for synchronous faults (SIGSEGV/SIGBUS) and is
    /// ignored for asynchronous ones; `interrupted_pc` is the PC the
    /// kernel reported the thread at, which may be a cache PC.
    pub fn handle(
        &mut self,
        signal: Signal,
        origin: FaultOrigin,
        interrupted_pc: u64,
        code_cache: &CodeCache,
    ) -> SignalDisposition {
        match origin {
            FaultOrigin::Internal => SignalDisposition::RuntimeInternal,
            FaultOrigin::SandboxProtectedPage => SignalDisposition::RepairedInternally,
            FaultOrigin::CachePc => {
                let application_pc = code_cache
                    .translate_cache_pc(interrupted_pc)
                    .unwrap_or(interrupted_pc);
                self.route_application_pc(signal, application_pc)
            }
            FaultOrigin::Application => self.route_application_pc(signal, interrupted_pc),
        }
    }

    fn route_application_pc(&mut self, signal: Signal, application_pc: u64) -> SignalDisposition {
        self.sequence_counter += 1;
        self.queue.push_back(PendingSignal {
            signal,
            application_pc,
            sequence: self.sequence_counter,
        });

        match self.restart_regions.restart_point_for(application_pc) {
            Some(restart_pc) => SignalDisposition::DeliverWithRestart { restart_pc },
            None => SignalDisposition::DeliverToApplication { application_pc },
        }
    }

    /// Pop the next signal in kernel delivery order for the fragment
    /// boundary to hand to the application.
    pub fn pop_next(&mut self) -> Option<PendingSignal> {
        self.queue.pop_front()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_fault_is_repaired_without_touching_queue() {
        let cache = CodeCache::new(0x7000_0000, 1 << 16);
        let mut mediator = SignalMediator::new();
        let disposition = mediator.handle(Signal::SIGSEGV, FaultOrigin::SandboxProtectedPage, 0x7000_0010, &cache);
        assert!(matches!(disposition, SignalDisposition::RepairedInternally));
        assert_eq!(mediator.pending_count(), 0);
    }

    #[test]
    fn application_signal_without_restart_region_delivers_plain_pc() {
        let cache = CodeCache::new(0x7000_0000, 1 << 16);
        let mut mediator = SignalMediator::new();
        let disposition = mediator.handle(Signal::SIGALRM, FaultOrigin::Application, 0x4000, &cache);
        assert!(matches!(
            disposition,
            SignalDisposition::DeliverToApplication { application_pc: 0x4000 }
        ));
        assert_eq!(mediator.pop_next().unwrap().application_pc, 0x4000);
    }

    #[test]
    fn interruption_inside_restart_region_rewrites_to_restart_pc() {
        let cache = CodeCache::new(0x7000_0000, 1 << 16);
        let mut mediator = SignalMediator::new();
        mediator.restart_regions_mut().register(0x5000, 0x5010, 0x5000);

        let disposition = mediator.handle(Signal::SIGALRM, FaultOrigin::Application, 0x5008, &cache);
        assert!(matches!(disposition, SignalDisposition::DeliverWithRestart { restart_pc: 0x5000 }));
    }

    #[test]
    fn signals_are_dequeued_in_kernel_delivery_order() {
        let cache = CodeCache::new(0x7000_0000, 1 << 16);
        let mut mediator = SignalMediator::new();
        mediator.handle(Signal::SIGALRM, FaultOrigin::Application, 0x4000, &cache);
        mediator.handle(Signal::SIGUSR1, FaultOrigin::Application, 0x4010, &cache);

        assert_eq!(mediator.pop_next().unwrap().sequence, 1);
        assert_eq!(mediator.pop_next().unwrap().sequence, 2);
    }
}
