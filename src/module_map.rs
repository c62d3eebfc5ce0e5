//! Module / Image Map.
//!
//! Tracks the executable memory regions of the target process: base, size,
//! protection, backing file identity, loaded/unloaded state. Follows the
//! same "one authoritative map keyed by base address" design as a kernel
//! mapping table, naming entries the way an `address_space`/
//! `kernel_mapping` pair would.
//!
//! File identity is computed from the ELF build-id (`goblin`) rather than
//! trusting mtimes, which can't distinguish a rebuilt binary with the same
//! path.

use nix::sys::mman::ProtFlags;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleIdentity {
    pub path: PathBuf,
    /// ELF build-id, when present; otherwise a zero-length vec and callers
    /// should fall back to path + size for identity (see
    /// `ModuleEntry::identity_is_strong`).
    pub build_id: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ModuleEntry {
    pub base: u64,
    pub size: u64,
    pub protection: ProtFlags,
    pub identity: ModuleIdentity,
    pub executed: bool,
    pub loaded: bool,
}

impl ModuleEntry {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.base && pc < self.end()
    }

    pub fn is_executable(&self) -> bool {
        self.protection.contains(ProtFlags::PROT_EXEC)
    }

    pub fn identity_is_strong(&self) -> bool {
        !self.identity.build_id.is_empty()
    }
}

/// Parses the ELF build-id (`.note.gnu.build-id`) out of a mapped file, for
/// use as the module identity's version/hash component. Returns an empty
/// vec (not an error) if the file can't be parsed as ELF or carries no
/// build-id note, since plenty of legitimately mapped files (anonymous
/// JIT regions, vdso) aren't ELF at all.
pub fn read_build_id(path: &std::path::Path) -> Vec<u8> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    match goblin::elf::Elf::parse(&data) {
        Ok(elf) => elf
            .iter_note_headers(&data)
            .and_then(|mut notes| {
                notes.find_map(|n| match n {
                    Ok(note) if note.name == "GNU" && note.n_type == goblin::elf::note::NT_GNU_BUILD_ID => {
                        Some(note.desc.to_vec())
                    }
                    _ => None,
                })
            })
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// Process-wide map of executable regions, keyed by base address so range
/// lookups (`find`) and adjacency checks (for merging/splitting on
/// `mprotect`) are cheap.
#[derive(Default)]
pub struct ModuleMap {
    entries: BTreeMap<u64, ModuleEntry>,
}

impl ModuleMap {
    pub fn new() -> ModuleMap {
        ModuleMap {
            entries: BTreeMap::new(),
        }
    }

    /// Called on an image-load notification (mmap of a file with PROT_EXEC,
    /// or the initial exec).
    pub fn on_load(&mut self, entry: ModuleEntry) {
        log!(
            crate::log::LogLevel::LogDebug,
            "module loaded: {:?} [{:#x}, {:#x})",
            entry.identity.path,
            entry.base,
            entry.end()
        );
        self.entries.insert(entry.base, entry);
    }

    /// Called on an unmap notification. Returns the removed entry, if any,
    /// so callers (the cache consistency monitor) can invalidate fragments
    /// sourced from it.
    pub fn on_unload(&mut self, base: u64) -> Option<ModuleEntry> {
        let removed = self.entries.remove(&base);
        if let Some(ref e) = removed {
            log!(
                crate::log::LogLevel::LogDebug,
                "module unloaded: {:?} [{:#x}, {:#x})",
                e.identity.path,
                e.base,
                e.end()
            );
        }
        removed
    }

    /// Called on an `mprotect` notification affecting an already-tracked
    /// region.
    pub fn on_protect(&mut self, base: u64, protection: ProtFlags) {
        if let Some(e) = self.entries.get_mut(&base) {
            e.protection = protection;
        }
    }

    pub fn mark_executed(&mut self, pc: u64) {
        if let Some(e) = self.find_mut(pc) {
            e.executed = true;
        }
    }

    pub fn find(&self, pc: u64) -> Option<&ModuleEntry> {
        self.entries
            .range(..=pc)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(pc))
    }

    fn find_mut(&mut self, pc: u64) -> Option<&mut ModuleEntry> {
        let base = self.find(pc).map(|e| e.base)?;
        self.entries.get_mut(&base)
    }

    pub fn is_executable_pc(&self, pc: u64) -> bool {
        self.find(pc).map(|e| e.is_executable()).unwrap_or(false)
    }

    /// All entries whose range intersects `[start, end)`. Used by the cache
    /// consistency monitor to invalidate fragments whenever a syscall
    /// changes protection or unmaps a range.
    pub fn intersecting(&self, start: u64, end: u64) -> Vec<&ModuleEntry> {
        self.entries
            .values()
            .filter(|e| e.base < end && start < e.end())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(base: u64, size: u64) -> ModuleEntry {
        ModuleEntry {
            base,
            size,
            protection: ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            identity: ModuleIdentity {
                path: PathBuf::from("/bin/test"),
                build_id: vec![1, 2, 3],
            },
            executed: false,
            loaded: true,
        }
    }

    #[test]
    fn find_locates_pc_within_region() {
        let mut map = ModuleMap::new();
        map.on_load(entry(0x1000, 0x1000));
        assert!(map.find(0x1500).is_some());
        assert!(map.find(0x2500).is_none());
    }

    #[test]
    fn unload_removes_entry() {
        let mut map = ModuleMap::new();
        map.on_load(entry(0x1000, 0x1000));
        assert!(map.on_unload(0x1000).is_some());
        assert!(map.find(0x1500).is_none());
    }

    #[test]
    fn intersecting_finds_overlapping_ranges_only() {
        let mut map = ModuleMap::new();
        map.on_load(entry(0x1000, 0x1000));
        map.on_load(entry(0x5000, 0x1000));
        assert_eq!(map.intersecting(0x1500, 0x1600).len(), 1);
        assert_eq!(map.intersecting(0x3000, 0x3100).len(), 0);
        assert_eq!(map.intersecting(0x500, 0x6000).len(), 2);
    }

    #[test]
    fn mark_executed_flags_the_owning_entry() {
        let mut map = ModuleMap::new();
        map.on_load(entry(0x1000, 0x1000));
        map.mark_executed(0x1100);
        assert!(map.find(0x1100).unwrap().executed);
    }
}
