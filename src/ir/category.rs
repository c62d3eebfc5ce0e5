//! Instruction category bitmask (int-math, fp-math, load, store, branch,
//! simd, other).
//!
//! Kept as power-of-two bit assignments, matching `dr_instr_category_type_t`-
//! style category APIs, so a record read back out of a persisted fragment
//! cache (`crate::persist`) built by a different instance of this runtime
//! still means the same thing.

use bitflags::bitflags;

bitflags! {
    pub struct Category: u32 {
        const UNCATEGORIZED = 0x0;
        const MATH_INT      = 0x1;
        const MATH_FLOAT    = 0x2;
        const LOAD          = 0x4;
        const STORE         = 0x8;
        const BRANCH        = 0x10;
        const SIMD          = 0x20;
        const OTHER         = 0x40;
        /// Lets the fragment builder special-case `cpuid`/`rdtsc`-class
        /// instructions as block terminators without overloading `BRANCH`.
        const SERIALIZING   = 0x80;
    }
}

impl Category {
    /// True for anything the fragment builder must stop a block at: direct/
    /// indirect/conditional branches, returns, traps, syscalls, and
    /// serializing instructions.
    pub fn is_terminator(self) -> bool {
        self.intersects(Category::BRANCH | Category::SERIALIZING)
    }
}
