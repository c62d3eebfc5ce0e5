//! Persistent cached-fragment file: pre-built fragments keyed by module
//! identity, application PC, and a version tag, loaded at startup to
//! pre-populate the cache and skip the decode/instrument/emit path for
//! code seen on a previous run.
//!
//! Format: magic, ISA tag, version, then a sequence of records (header,
//! translation table, raw emitted bytes), all little-endian, matching §6's
//! "byte order is little-endian" requirement directly rather than via a
//! generic serialization crate — the file is mmap'd back in wholesale at
//! load time, so the layout has to be exactly this, not whatever serde's
//! derived format happens to produce.

use crate::arch::SupportedArch;
use crate::error::{DbiError, DbiResult};
use crate::fragment::TranslationTable;
use std::convert::TryInto;
use std::io::{Read, Write};

const MAGIC: [u8; 4] = *b"DRCF";
const FORMAT_VERSION: u32 = 1;

pub struct PersistedFragment {
    pub module_build_id: Vec<u8>,
    pub application_pc: u64,
    pub emitted_bytes: Vec<u8>,
    pub translation: TranslationTable,
}

fn isa_tag(arch: SupportedArch) -> u8 {
    match arch {
        SupportedArch::X86 => 0,
        SupportedArch::X64 => 1,
    }
}

fn isa_from_tag(tag: u8) -> DbiResult<SupportedArch> {
    match tag {
        0 => Ok(SupportedArch::X86),
        1 => Ok(SupportedArch::X64),
        other => Err(DbiError::AttachFailure {
            reason: format!("persisted cache file has unknown isa tag {}", other),
        }),
    }
}

pub fn write_cache_file<W: Write>(mut w: W, arch: SupportedArch, fragments: &[PersistedFragment]) -> DbiResult<()> {
    w.write_all(&MAGIC).map_err(DbiError::Io)?;
    w.write_all(&[isa_tag(arch)]).map_err(DbiError::Io)?;
    w.write_all(&FORMAT_VERSION.to_le_bytes()).map_err(DbiError::Io)?;
    w.write_all(&(fragments.len() as u32).to_le_bytes()).map_err(DbiError::Io)?;

    for f in fragments {
        w.write_all(&(f.module_build_id.len() as u32).to_le_bytes()).map_err(DbiError::Io)?;
        w.write_all(&f.module_build_id).map_err(DbiError::Io)?;
        w.write_all(&f.application_pc.to_le_bytes()).map_err(DbiError::Io)?;
        w.write_all(&(f.emitted_bytes.len() as u32).to_le_bytes()).map_err(DbiError::Io)?;
        w.write_all(&f.emitted_bytes).map_err(DbiError::Io)?;

        let translation_len = f.translation.len() as u32;
        w.write_all(&translation_len.to_le_bytes()).map_err(DbiError::Io)?;
        for (offset, pc) in f.translation.entries() {
            w.write_all(&offset.to_le_bytes()).map_err(DbiError::Io)?;
            w.write_all(&pc.to_le_bytes()).map_err(DbiError::Io)?;
        }
    }
    Ok(())
}

pub fn read_cache_file<R: Read>(mut r: R) -> DbiResult<(SupportedArch, Vec<PersistedFragment>)> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(DbiError::Io)?;
    if magic != MAGIC {
        return Err(DbiError::AttachFailure {
            reason: "persisted cache file has bad magic".into(),
        });
    }

    let mut isa_tag_buf = [0u8; 1];
    r.read_exact(&mut isa_tag_buf).map_err(DbiError::Io)?;
    let arch = isa_from_tag(isa_tag_buf[0])?;

    let version = read_u32(&mut r)?;
    if version != FORMAT_VERSION {
        return Err(DbiError::AttachFailure {
            reason: format!("persisted cache file version {} unsupported", version),
        });
    }

    let count = read_u32(&mut r)?;
    let mut fragments = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let build_id_len = read_u32(&mut r)? as usize;
        let mut module_build_id = vec![0u8; build_id_len];
        r.read_exact(&mut module_build_id).map_err(DbiError::Io)?;

        let application_pc = read_u64(&mut r)?;

        let body_len = read_u32(&mut r)? as usize;
        let mut emitted_bytes = vec![0u8; body_len];
        r.read_exact(&mut emitted_bytes).map_err(DbiError::Io)?;

        let entry_count = read_u32(&mut r)?;
        let mut translation = TranslationTable::default();
        for _ in 0..entry_count {
            let offset = read_u32(&mut r)?;
            let pc = read_u64(&mut r)?;
            translation.push(offset, pc);
        }

        fragments.push(PersistedFragment {
            module_build_id,
            application_pc,
            emitted_bytes,
            translation,
        });
    }

    Ok((arch, fragments))
}

fn read_u32<R: Read>(r: &mut R) -> DbiResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(DbiError::Io)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> DbiResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(DbiError::Io)?;
    Ok(u64::from_le_bytes(buf.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut translation = TranslationTable::default();
        translation.push(0, 0x1000);
        translation.push(4, 0x1002);

        let fragments = vec![PersistedFragment {
            module_build_id: vec![1, 2, 3, 4],
            application_pc: 0x1000,
            emitted_bytes: vec![0x90, 0x90, 0xc3],
            translation,
        }];

        let mut buf = Vec::new();
        write_cache_file(&mut buf, SupportedArch::X64, &fragments).unwrap();

        let (arch, read_back) = read_cache_file(&buf[..]).unwrap();
        assert_eq!(arch, SupportedArch::X64);
        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].application_pc, 0x1000);
        assert_eq!(read_back[0].emitted_bytes, vec![0x90, 0x90, 0xc3]);
        assert_eq!(read_back[0].translation.translate(3), Some(0x1000));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = vec![0u8; 16];
        assert!(read_cache_file(&buf[..]).is_err());
    }
}
