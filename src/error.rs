//! Error taxonomy for the instrumentation core.
//!
//! Recoverable errors travel as `Result<_, DbiError>` and never cross an
//! instrumentation callback boundary uncaught; fatal conditions use
//! `ed_assert!`/`fatal_abort` (see `crate::log`) instead of this enum,
//! because by the time they're detected the runtime can no longer trust its
//! own state enough to unwind cleanly.

use std::io;

pub type DbiResult<T> = Result<T, DbiError>;

#[derive(thiserror::Error, Debug)]
pub enum DbiError {
    #[error("decode failed at {pc:#x}: {reason}")]
    Decode { pc: u64, reason: String },

    #[error("encode failed: buffer full ({needed} bytes needed, {available} available)")]
    EncodeBufferFull { needed: usize, available: usize },

    #[error("encode failed: instruction not encodable: {reason}")]
    EncodeUnencodable { reason: String },

    #[error("out of code cache memory (requested {requested} bytes)")]
    OutOfCacheMemory { requested: usize },

    #[error("could not translate cache pc {cache_pc:#x} back to an application pc")]
    TranslationFailure { cache_pc: u64 },

    #[error("fragment builder rejected rewrite at {pc:#x}: {reason}")]
    InvalidRewrite { pc: u64, reason: String },

    #[error("synch-all operation timed out waiting for {remaining} thread(s)")]
    SynchAllTimeout { remaining: usize },

    #[error("foreign interference detected in unmonitored region {start:#x}..{end:#x}")]
    ForeignInterference { start: u64, end: u64 },

    #[error("attach failed: {reason}")]
    AttachFailure { reason: String },

    #[error("os call failed: {0}")]
    Os(#[from] nix::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DbiError {
    /// Decode/encode/out-of-cache-memory(once)/synch-all-timeout/
    /// foreign-interference are all recoverable; translation failure and a
    /// second consecutive out-of-memory are not. This classifies the ones
    /// that are unconditionally recoverable on their own, leaving the
    /// "second occurrence" escalation to the caller (code_cache.rs), which
    /// is the only place with the retry count.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DbiError::TranslationFailure { .. })
    }
}
