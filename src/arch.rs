//! Architecture tag threaded through the register file, module map, and
//! persistence format.
//!
//! Only `X64` is implemented end to end; `X86` is kept as a named variant
//! so every layer carries an explicit ISA tag rather than assuming
//! x86-64 outright.

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum SupportedArch {
    X86 = 0,
    X64 = 1,
}

/// The architecture this build of the runtime natively runs as. This core
/// only instruments tracees of its own architecture; no cross-architecture
/// support.
pub const RD_NATIVE_ARCH: SupportedArch = SupportedArch::X64;

impl SupportedArch {
    pub fn pointer_size(self) -> usize {
        match self {
            SupportedArch::X86 => 4,
            SupportedArch::X64 => 8,
        }
    }

    pub fn is_supported(self) -> bool {
        self == SupportedArch::X64
    }
}

impl std::fmt::Display for SupportedArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupportedArch::X86 => write!(f, "x86"),
            SupportedArch::X64 => write!(f, "x86_64"),
        }
    }
}
