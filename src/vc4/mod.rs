//! vc4 (VideoCore IV) back end.
//!
//! Two 32-slot register files, DMA/VPM memory I/O, one ADD and one MUL ALU
//! per instruction word.

pub mod encode;
pub mod instr;

pub use encode::{encode, mnemonics, to_opcodes, PROGRAM_TAIL_LEN};
pub use instr::Vc4Instr;
