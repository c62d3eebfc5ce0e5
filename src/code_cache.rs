//! Code Cache: owns the executable arena fragments live in, the fragment
//! index, and the indirect-branch lookup table.
//!
//! A `parking_lot::RwLock` stands in for the cache-writer lock: writers
//! take it exclusively for insertion/removal, while cache-reader threads
//! executing inside the cache never take it at all — they'd read the
//! indirect-branch table from emitted stub code, which this struct models
//! as a plain lookup since actual JITted stub code lives in
//! `crate::context_switch` instead.

use crate::error::{DbiError, DbiResult};
use crate::fragment::{Fragment, FragmentId, FragmentIndex, FragmentState};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Insert/remove only happen under the writer lock; lookups never block.
/// Collisions use a `HashMap` plus an explicit tombstone marker rather
/// than hand-rolled open addressing — the no-torn-reads property comes
/// from taking the write lock around mutation, not from the particular
/// collision strategy, and `HashMap` already gives lock-free reads the
/// isolation needed once a write has completed and released the lock.
const TOMBSTONE: FragmentId = FragmentId::MAX;

pub struct IndirectBranchTable {
    entries: HashMap<u64, FragmentId>,
}

impl IndirectBranchTable {
    fn new() -> Self {
        IndirectBranchTable {
            entries: HashMap::new(),
        }
    }

    pub fn lookup(&self, application_pc: u64) -> Option<FragmentId> {
        match self.entries.get(&application_pc) {
            Some(&TOMBSTONE) | None => None,
            Some(&id) => Some(id),
        }
    }

    fn insert(&mut self, application_pc: u64, id: FragmentId) {
        self.entries.insert(application_pc, id);
    }

    fn remove(&mut self, application_pc: u64) {
        self.entries.insert(application_pc, TOMBSTONE);
    }
}

struct Inner {
    arena_base: u64,
    arena_capacity: usize,
    bump_offset: usize,
    fragments: HashMap<FragmentId, Fragment>,
    index: FragmentIndex,
    indirect: IndirectBranchTable,
    next_id: FragmentId,
    generation: u64,
    /// Address every unlinked exit stub's placeholder jump targets. Set
    /// once the dispatcher's entry trampoline has been emitted; until
    /// then, patching leaves stubs pointing at offset zero, which is fine
    /// since nothing executes out of the arena yet.
    dispatcher_entry: u64,
}

/// W-xor-X is the arena's job to uphold at the OS-mapping level; this
/// struct tracks whether the arena is currently in a write window so
/// callers can assert they never emit into it outside one.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WriteWindow {
    Closed,
    Open,
}

pub struct CodeCache {
    inner: RwLock<Inner>,
    write_window: parking_lot::Mutex<WriteWindow>,
}

impl CodeCache {
    pub fn new(arena_base: u64, arena_capacity: usize) -> CodeCache {
        CodeCache {
            inner: RwLock::new(Inner {
                arena_base,
                arena_capacity,
                bump_offset: 0,
                fragments: HashMap::new(),
                index: FragmentIndex::default(),
                indirect: IndirectBranchTable::new(),
                next_id: 1,
                generation: 0,
                dispatcher_entry: 0,
            }),
            write_window: parking_lot::Mutex::new(WriteWindow::Closed),
        }
    }

    pub fn arena_base(&self) -> u64 {
        self.inner.read().arena_base
    }

    pub fn set_dispatcher_entry(&self, pc: u64) {
        let mut inner = self.inner.write();
        inner.dispatcher_entry = pc;
        let ids: Vec<FragmentId> = inner.fragments.keys().copied().collect();
        for id in ids {
            Self::repatch_unlinked(&mut inner, id);
        }
    }

    pub fn utilization_pct(&self) -> u8 {
        let inner = self.inner.read();
        ((inner.bump_offset as u128 * 100) / inner.arena_capacity as u128) as u8
    }

    /// Cache-reader path: no lock contention with writers beyond the brief
    /// `RwLock::read` a lookup takes — as close to lock-free as safe Rust
    /// allows without literally inlining JIT code into a stub.
    pub fn lookup_by_pc(&self, application_pc: u64) -> Option<FragmentId> {
        self.inner.read().index.lookup(application_pc)
    }

    pub fn lookup_indirect(&self, application_pc: u64) -> Option<FragmentId> {
        self.inner.read().indirect.lookup(application_pc)
    }

    pub fn fragment_entry_point(&self, id: FragmentId) -> Option<u64> {
        let inner = self.inner.read();
        let base = inner.arena_base;
        inner.fragments.get(&id).map(|f| f.cache_entry_point(base))
    }

    /// Signal mediator path: given a PC the kernel reported a thread
    /// interrupted at, find the fragment whose emitted bytes contain it and
    /// translate back to the application PC it stands in for.
    pub fn translate_cache_pc(&self, cache_pc: u64) -> Option<u64> {
        let inner = self.inner.read();
        let base = inner.arena_base;
        inner
            .fragments
            .values()
            .find(|f| f.contains_cache_pc(base, cache_pc))
            .and_then(|f| f.translate_cache_pc(base, cache_pc))
    }

    /// Cache-builder path: bump-allocate space for a new fragment's bytes.
    /// Returns `OutOfCacheMemory` once on exhaustion; the fragment builder
    /// is responsible for calling `evict_generation` and retrying exactly
    /// once before giving up.
    pub fn allocate(&self, len: usize) -> DbiResult<usize> {
        let mut inner = self.inner.write();
        if inner.bump_offset + len > inner.arena_capacity {
            return Err(DbiError::OutOfCacheMemory { requested: len });
        }
        let offset = inner.bump_offset;
        inner.bump_offset += len;
        Ok(offset)
    }

    /// Inserts a freshly-built fragment, publishing it into the fragment
    /// index and indirect-branch table, then links every already-cached
    /// exit stub that targets this fragment's start PC. Must be called
    /// while holding the write window open.
    pub fn insert_fragment(&self, mut fragment: Fragment) -> FragmentId {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        let start_pc = fragment.start_application_pc;

        fragment.id = id;
        for e in fragment.exits.iter_mut() {
            e.owning_fragment = id;
        }

        inner.fragments.insert(id, fragment);
        // Insertion into the fragment index happens-before any stub linking
        // that points to it — the two operations share this single
        // writer-lock critical section, so there is no window where a
        // reader could observe the index entry without the corresponding
        // links also being in place.
        inner.index.insert(start_pc, id);
        inner.indirect.insert(start_pc, id);

        let incoming: Vec<(FragmentId, crate::fragment::ExitStubId)> = inner
            .fragments
            .iter()
            .filter(|(&fid, _)| fid != id)
            .flat_map(|(&fid, f)| {
                f.exits
                    .iter()
                    .filter(|e| {
                        e.kind != crate::fragment::ExitKind::SystemCall
                            && e.target_application_pc == start_pc
                            && !e.is_linked()
                    })
                    .map(move |e| (fid, e.id))
            })
            .collect();

        let arena_base = inner.arena_base;
        for (owner, stub_id) in incoming {
            let target_entry = inner
                .fragments
                .get(&id)
                .map(|f| f.cache_entry_point(arena_base))
                .unwrap();
            if let Some(owner_frag) = inner.fragments.get_mut(&owner) {
                let frag_base = owner_frag.cache_entry_point(arena_base);
                if let Some(stub) = owner_frag.exits.iter_mut().find(|e| e.id == stub_id) {
                    stub.link_state = crate::fragment::LinkState::Linked { target_fragment: id };
                    let patch_offset = stub.patch_offset;
                    patch_displacement(&mut owner_frag.emitted_bytes, patch_offset, frag_base, target_entry);
                }
                owner_frag.incoming_links.push((id, stub_id));
            }
        }

        // Link this fragment's own outgoing stubs to any target that
        // happens to already be cached.
        Self::repatch_unlinked(&mut inner, id);

        id
    }

    /// Re-examines every unlinked, non-syscall exit stub belonging to
    /// `id`: if its target PC now resolves in the fragment index, patches
    /// the placeholder jump straight to that fragment's entry; otherwise
    /// (re-)patches it to fall through to the dispatcher.
    fn repatch_unlinked(inner: &mut Inner, id: FragmentId) {
        let arena_base = inner.arena_base;
        let dispatcher_entry = inner.dispatcher_entry;

        let stub_plan: Vec<(crate::fragment::ExitStubId, u64, usize)> = match inner.fragments.get(&id) {
            Some(f) => f
                .exits
                .iter()
                .filter(|e| !e.is_linked() && e.kind != crate::fragment::ExitKind::SystemCall)
                .map(|e| (e.id, e.target_application_pc, e.patch_offset))
                .collect(),
            None => return,
        };
        let frag_base = match inner.fragments.get(&id) {
            Some(f) => f.cache_entry_point(arena_base),
            None => return,
        };

        for (stub_id, target_pc, patch_offset) in stub_plan {
            let resolved = inner.index.lookup(target_pc).and_then(|target_id| {
                inner
                    .fragments
                    .get(&target_id)
                    .map(|tf| (target_id, tf.cache_entry_point(arena_base)))
            });

            let f = inner.fragments.get_mut(&id).unwrap();
            match resolved {
                Some((target_id, target_entry)) => {
                    if let Some(stub) = f.exits.iter_mut().find(|e| e.id == stub_id) {
                        stub.link_state = crate::fragment::LinkState::Linked {
                            target_fragment: target_id,
                        };
                    }
                    patch_displacement(&mut f.emitted_bytes, patch_offset, frag_base, target_entry);
                }
                None => {
                    patch_displacement(&mut f.emitted_bytes, patch_offset, frag_base, dispatcher_entry);
                }
            }
        }
    }

    /// Mark a fragment pending-free, unlink every stub pointing at or from
    /// it back to the dispatcher, and remove it from the fragment index /
    /// indirect-branch table. Storage is *not* reclaimed here — that's the
    /// caller's responsibility once a synch-all confirms no thread's PC is
    /// inside it (see `crate::thread_registry::ThreadRegistry::synch_all`).
    pub fn begin_flush(&self, id: FragmentId) {
        let mut inner = self.inner.write();
        let start_pc = match inner.fragments.get(&id) {
            Some(f) => f.start_application_pc,
            None => return,
        };

        inner.index.remove(start_pc);
        inner.indirect.remove(start_pc);

        let arena_base = inner.arena_base;
        let dispatcher_entry = inner.dispatcher_entry;

        // Unlink every stub across the whole cache that points into this
        // fragment ("all stubs linking into it are likewise unlinked").
        for f in inner.fragments.values_mut() {
            let frag_base = f.cache_entry_point(arena_base);
            for e in f.exits.iter_mut() {
                if let crate::fragment::LinkState::Linked { target_fragment } = e.link_state {
                    if target_fragment == id {
                        e.link_state = crate::fragment::LinkState::Unlinked;
                        let patch_offset = e.patch_offset;
                        patch_displacement(&mut f.emitted_bytes, patch_offset, frag_base, dispatcher_entry);
                    }
                }
            }
        }

        if let Some(f) = inner.fragments.get_mut(&id) {
            // Unlink this fragment's own outgoing stubs back to the
            // dispatcher too.
            let frag_base = f.cache_entry_point(arena_base);
            for e in f.exits.iter_mut() {
                e.link_state = crate::fragment::LinkState::Unlinked;
                let patch_offset = e.patch_offset;
                if e.kind != crate::fragment::ExitKind::SystemCall {
                    patch_displacement(&mut f.emitted_bytes, patch_offset, frag_base, dispatcher_entry);
                }
            }
            f.state = FragmentState::PendingFree;
        }
    }

    /// Reclaim storage. Caller must have already confirmed (via
    /// synch-all) that no thread's cache PC lies within this fragment.
    pub fn finish_flush(&self, id: FragmentId) {
        self.inner.write().fragments.remove(&id);
    }

    /// Coarse, age-ordered eviction of every live fragment once
    /// utilisation crosses the configured high-watermark. Returns the ids
    /// that began flushing, which the caller must still run through
    /// `finish_flush` after a synch-all.
    pub fn evict_generation(&self) -> Vec<FragmentId> {
        let candidates: Vec<FragmentId> = {
            let inner = self.inner.read();
            inner
                .fragments
                .iter()
                .filter(|(_, f)| f.is_live())
                .map(|(&id, _)| id)
                .collect()
        };
        for &id in &candidates {
            self.begin_flush(id);
        }
        self.inner.write().generation += 1;
        candidates
    }

    pub fn flush_all(&self) -> Vec<FragmentId> {
        self.evict_generation()
    }

    pub fn fragment_count(&self) -> usize {
        self.inner.read().fragments.len()
    }

    pub fn with_fragment<R>(&self, id: FragmentId, f: impl FnOnce(&Fragment) -> R) -> Option<R> {
        self.inner.read().fragments.get(&id).map(f)
    }

    /// Entering/exiting a write window is where the arena's actual
    /// `mprotect` toggling would happen in a real mapping; this core
    /// tracks the window state so the invariant is checkable in tests even
    /// without a live mmap.
    pub fn enter_write_window(&self) {
        *self.write_window.lock() = WriteWindow::Open;
    }

    pub fn exit_write_window(&self) {
        *self.write_window.lock() = WriteWindow::Closed;
    }

    pub fn write_window_state(&self) -> WriteWindow {
        *self.write_window.lock()
    }
}

/// Rewrites the 4-byte little-endian rel32 displacement at
/// `frag_base + disp_offset` so the jump there lands on `target`. The
/// displacement is relative to the address immediately after the 4-byte
/// field, matching how the builder laid out every placeholder stub
/// (`opcode bytes, then a 4-byte rel32`).
fn patch_displacement(bytes: &mut [u8], disp_offset: usize, frag_base: u64, target: u64) {
    if disp_offset + 4 > bytes.len() {
        return;
    }
    let next_insn_addr = frag_base + disp_offset as u64 + 4;
    let disp = target.wrapping_sub(next_insn_addr) as i64 as i32;
    bytes[disp_offset..disp_offset + 4].copy_from_slice(&disp.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{ExitKind, ExitStub, LinkState, TranslationTable};

    fn fragment(id_hint: u64, start_pc: u64, target_pc: u64) -> Fragment {
        Fragment {
            id: 0,
            start_application_pc: start_pc,
            emitted_bytes: vec![0x90; 8],
            cache_offset: id_hint as usize * 8,
            translation: {
                let mut t = TranslationTable::default();
                t.push(0, start_pc);
                t
            },
            exits: vec![ExitStub {
                id: 0,
                owning_fragment: 0,
                target_application_pc: target_pc,
                kind: ExitKind::Direct,
                link_state: LinkState::Unlinked,
                patch_offset: 4,
            }],
            incoming_links: Vec::new(),
            state: FragmentState::Live,
            source_module_base: 0,
            source_byte_range: (start_pc, start_pc + 8),
        }
    }

    #[test]
    fn allocate_fails_once_capacity_exhausted() {
        let cache = CodeCache::new(0x7000_0000, 16);
        assert!(cache.allocate(10).is_ok());
        assert!(cache.allocate(10).is_err());
    }

    #[test]
    fn inserting_second_fragment_links_existing_exit_stub() {
        let cache = CodeCache::new(0x7000_0000, 1 << 20);
        let a = cache.insert_fragment(fragment(0, 0x1000, 0x2000));
        assert_eq!(
            cache.with_fragment(a, |f| f.exits[0].link_state).unwrap(),
            LinkState::Unlinked
        );

        let b = cache.insert_fragment(fragment(1, 0x2000, 0x3000));
        let linked = cache.with_fragment(a, |f| f.exits[0].link_state).unwrap();
        assert_eq!(linked, LinkState::Linked { target_fragment: b });
    }

    #[test]
    fn begin_flush_unlinks_incoming_stubs() {
        let cache = CodeCache::new(0x7000_0000, 1 << 20);
        let a = cache.insert_fragment(fragment(0, 0x1000, 0x2000));
        let b = cache.insert_fragment(fragment(1, 0x2000, 0x3000));
        assert_eq!(
            cache.with_fragment(a, |f| f.exits[0].link_state).unwrap(),
            LinkState::Linked { target_fragment: b }
        );

        cache.begin_flush(b);
        assert_eq!(
            cache.with_fragment(a, |f| f.exits[0].link_state).unwrap(),
            LinkState::Unlinked
        );
        assert_eq!(cache.lookup_by_pc(0x2000), None);
    }

    #[test]
    fn finish_flush_reclaims_storage() {
        let cache = CodeCache::new(0x7000_0000, 1 << 20);
        let a = cache.insert_fragment(fragment(0, 0x1000, 0x2000));
        cache.begin_flush(a);
        assert!(cache.with_fragment(a, |_| ()).is_some());
        cache.finish_flush(a);
        assert!(cache.with_fragment(a, |_| ()).is_none());
    }

    #[test]
    fn indirect_table_agrees_with_fragment_index() {
        let cache = CodeCache::new(0x7000_0000, 1 << 20);
        let a = cache.insert_fragment(fragment(0, 0x1000, 0x2000));
        assert_eq!(cache.lookup_indirect(0x1000), Some(a));
        assert_eq!(cache.lookup_by_pc(0x1000), Some(a));
    }
}
