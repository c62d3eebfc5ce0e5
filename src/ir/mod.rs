//! Instruction Representation (IR).
//!
//! A tagged representation of one machine instruction, independent of the
//! byte encoding it came from or will be emitted to. Decoder and encoder
//! (`crate::decoder`, `crate::encoder`) are the only things that construct
//! or consume the raw-byte field; instrumentation passes work purely in
//! terms of `Instruction`/`Operand`.

mod category;
mod instruction;
mod operand;

pub use category::Category;
pub use instruction::Instruction;
pub use operand::{MemoryOperand, Operand};
