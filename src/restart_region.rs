//! Restartable-sequence table: registered (region, restart PC) pairs that
//! must either run to completion or be restarted from their declared entry
//! point if interrupted.
//!
//! The glossary leaves the exact per-ISA semantics open; this implements
//! the fixed small-registry reading rather than a general atomic-region
//! compiler pass, matching the policy-not-guess guidance for ambiguous
//! points — callers register known sequences (futex waits, TLS-variable
//! fast paths) explicitly rather than the runtime inferring them from the
//! instruction stream.

use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug)]
pub struct RestartRegion {
    pub start: u64,
    pub end: u64,
    pub restart_pc: u64,
}

impl RestartRegion {
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.start && pc < self.end
    }
}

/// Keyed by region start so lookup-by-interrupted-pc can walk backwards
/// from the nearest region whose start is `<= pc` and check containment.
#[derive(Default)]
pub struct RestartRegionTable {
    regions: BTreeMap<u64, RestartRegion>,
}

impl RestartRegionTable {
    pub fn new() -> RestartRegionTable {
        RestartRegionTable::default()
    }

    pub fn register(&mut self, start: u64, end: u64, restart_pc: u64) {
        self.regions.insert(start, RestartRegion { start, end, restart_pc });
    }

    pub fn unregister(&mut self, start: u64) {
        self.regions.remove(&start);
    }

    /// If `pc` lies inside a registered region, return the PC a signal
    /// mediator should rewrite the return address to instead.
    pub fn restart_point_for(&self, pc: u64) -> Option<u64> {
        self.regions
            .range(..=pc)
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| r.contains(pc))
            .map(|r| r.restart_pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruption_inside_region_resolves_to_restart_pc() {
        let mut table = RestartRegionTable::new();
        table.register(0x2000, 0x2010, 0x2000);

        assert_eq!(table.restart_point_for(0x2008), Some(0x2000));
        assert_eq!(table.restart_point_for(0x1fff), None);
        assert_eq!(table.restart_point_for(0x2010), None);
    }

    #[test]
    fn unregistering_a_region_stops_matching_it() {
        let mut table = RestartRegionTable::new();
        table.register(0x3000, 0x3020, 0x3000);
        table.unregister(0x3000);
        assert_eq!(table.restart_point_for(0x3010), None);
    }
}
