//! Invalidates cached fragments whenever the application bytes backing
//! them change: write-protect sandbox faults, self-modifying-code sandbox
//! checksum mismatches, and explicit syscall-observed protection/unmap
//! changes all funnel through here into the same flush protocol.

use crate::code_cache::CodeCache;
use crate::fragment::FragmentId;
use crate::log::LogLevel::LogDebug;
use std::collections::BTreeMap;

/// Per-page bookkeeping for the write-protect sandbox: which fragments
/// were built from bytes on this page, and the page's original protection
/// so it can be restored after replay.
struct ProtectedPage {
    fragments: Vec<FragmentId>,
}

/// A source-byte checksum for the self-modifying-code sandbox path, used
/// when whole-page write-protection is infeasible (stack-resident or
/// mixed code/data pages).
struct ChecksummedFragment {
    fragment: FragmentId,
    range: (u64, u64),
    checksum: u64,
}

pub struct ConsistencyMonitor {
    page_size: u64,
    protected_pages: BTreeMap<u64, ProtectedPage>,
    checksummed: Vec<ChecksummedFragment>,
}

impl ConsistencyMonitor {
    pub fn new(page_size: u64) -> ConsistencyMonitor {
        ConsistencyMonitor {
            page_size,
            protected_pages: BTreeMap::new(),
            checksummed: Vec::new(),
        }
    }

    fn page_base(&self, addr: u64) -> u64 {
        addr - (addr % self.page_size)
    }

    /// Record that `fragment` was built from bytes on `source_range`, under
    /// the write-protect sandbox (the page itself is protected elsewhere by
    /// the OS-boundary layer; this only tracks which fragments depend on
    /// it).
    pub fn track_write_protected(&mut self, fragment: FragmentId, source_range: (u64, u64)) {
        let mut page = self.page_base(source_range.0);
        let end = source_range.1;
        while page < end {
            self.protected_pages
                .entry(page)
                .or_insert_with(|| ProtectedPage { fragments: Vec::new() })
                .fragments
                .push(fragment);
            page += self.page_size;
        }
    }

    /// Record that `fragment` instead relies on an inline source-byte
    /// checksum check (self-modifying-code sandbox), for pages where
    /// whole-page protection is infeasible.
    pub fn track_checksummed(&mut self, fragment: FragmentId, source_range: (u64, u64), checksum: u64) {
        self.checksummed.push(ChecksummedFragment {
            fragment,
            range: source_range,
            checksum,
        });
    }

    /// Write-protect sandbox fault handler: `fault_addr` is on a page the
    /// sandbox write-protected. Returns the fragments to flush; the caller
    /// (signal mediator) is responsible for the single-step replay and
    /// re-protection around this call.
    pub fn on_write_protect_fault(&mut self, code_cache: &CodeCache, fault_addr: u64) -> Vec<FragmentId> {
        let page = self.page_base(fault_addr);
        match self.protected_pages.remove(&page) {
            Some(entry) => {
                for id in &entry.fragments {
                    log!(LogDebug, "consistency monitor: flushing fragment {} (write-protect fault on page {:#x})", id, page);
                    self.flush_one(code_cache, *id);
                }
                entry.fragments
            }
            None => Vec::new(),
        }
    }

    /// Self-modifying-code sandbox inline check: the fragment builder's
    /// emitted prologue calls out here (conceptually — the actual check is
    /// inlined machine code) whenever a recomputed checksum disagrees with
    /// the one recorded at build time.
    pub fn on_checksum_mismatch(&mut self, code_cache: &CodeCache, fragment: FragmentId) -> bool {
        let before = self.checksummed.len();
        self.checksummed.retain(|c| c.fragment != fragment);
        if self.checksummed.len() != before {
            log!(LogDebug, "consistency monitor: checksum mismatch, flushing fragment {}", fragment);
            self.flush_one(code_cache, fragment);
            true
        } else {
            false
        }
    }

    /// Explicit syscall observation: a protection/unmap syscall affected
    /// `[start, end)`. Flush every tracked fragment whose source range
    /// intersects it, from both tracking strategies.
    pub fn on_region_invalidated(&mut self, code_cache: &CodeCache, start: u64, end: u64) -> Vec<FragmentId> {
        let mut flushed = Vec::new();

        let pages: Vec<u64> = self
            .protected_pages
            .range(..)
            .map(|(p, _)| *p)
            .filter(|p| *p < end && *p + self.page_size > start)
            .collect();
        for page in pages {
            if let Some(entry) = self.protected_pages.remove(&page) {
                flushed.extend(entry.fragments.iter().copied());
            }
        }

        let mut remaining = Vec::new();
        for c in self.checksummed.drain(..) {
            if c.range.0 < end && c.range.1 > start {
                flushed.push(c.fragment);
            } else {
                remaining.push(c);
            }
        }
        self.checksummed = remaining;

        for id in &flushed {
            log!(LogDebug, "consistency monitor: flushing fragment {} (region {:#x}..{:#x} invalidated)", id, start, end);
            self.flush_one(code_cache, *id);
        }
        flushed
    }

    fn flush_one(&mut self, code_cache: &CodeCache, id: FragmentId) {
        code_cache.begin_flush(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{ExitKind, ExitStub, Fragment, FragmentState, LinkState, TranslationTable};

    fn fragment(id_hint: u64, start_pc: u64) -> Fragment {
        Fragment {
            id: 0,
            start_application_pc: start_pc,
            emitted_bytes: vec![0x90; 8],
            cache_offset: (id_hint * 16) as usize,
            translation: TranslationTable::default(),
            exits: vec![ExitStub {
                id: 0,
                owning_fragment: 0,
                target_application_pc: start_pc + 0x100,
                kind: ExitKind::Direct,
                link_state: LinkState::Unlinked,
                patch_offset: 4,
            }],
            incoming_links: Vec::new(),
            state: FragmentState::Live,
            source_module_base: start_pc,
            source_byte_range: (start_pc, start_pc + 4),
        }
    }

    #[test]
    fn write_protect_fault_flushes_every_fragment_on_that_page() {
        let code_cache = CodeCache::new(0x7000_0000, 1 << 16);
        let id = code_cache.insert_fragment(fragment(0, 0x1000));
        let mut monitor = ConsistencyMonitor::new(0x1000);
        monitor.track_write_protected(id, (0x1000, 0x1004));

        let flushed = monitor.on_write_protect_fault(&code_cache, 0x1002);
        assert_eq!(flushed, vec![id]);
        // Second fault on the same now-untracked page is a no-op.
        assert!(monitor.on_write_protect_fault(&code_cache, 0x1002).is_empty());
    }

    #[test]
    fn region_invalidation_catches_both_tracking_strategies() {
        let code_cache = CodeCache::new(0x7000_0000, 1 << 16);
        let a = code_cache.insert_fragment(fragment(0, 0x2000));
        let b = code_cache.insert_fragment(fragment(1, 0x3000));
        let mut monitor = ConsistencyMonitor::new(0x1000);
        monitor.track_write_protected(a, (0x2000, 0x2004));
        monitor.track_checksummed(b, (0x3000, 0x3004), 0xabc);

        let mut flushed = monitor.on_region_invalidated(&code_cache, 0x2000, 0x4000);
        flushed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(flushed, expected);
    }

    #[test]
    fn checksum_mismatch_on_untracked_fragment_is_a_no_op() {
        let code_cache = CodeCache::new(0x7000_0000, 1 << 16);
        let mut monitor = ConsistencyMonitor::new(0x1000);
        assert!(!monitor.on_checksum_mismatch(&code_cache, 999));
    }
}
