//! v3d (VideoCore VI) back end.
//!
//! Unified 64-slot register file, TMU-only memory access, dual-issue
//! ADD/MUL ALUs per 64-bit instruction word.

pub mod encode;
pub mod instr;
pub mod small_imm;

pub use encode::{encode, mnemonics, to_opcodes, PROGRAM_TAIL_LEN};
pub use instr::V3dInstr;
pub use small_imm::SmallImmValue;
