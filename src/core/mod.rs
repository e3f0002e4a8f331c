//! Shared compiler infrastructure.
//!
//! Everything between the kernel AST and the target-specific encoders lives
//! here: the target IR, the control-flow graph, the liveness engine with its
//! accumulator peephole, and the graph-colouring register allocator. The
//! pipeline is strictly linear; each pass sees the full output of the
//! previous one, and the CFG is rebuilt whenever a pass changes the shape of
//! the instruction list.

pub mod cfg;
pub mod cond;
pub mod error;
pub mod instr;
pub mod liveness;
pub mod ops;
pub mod reg;
pub mod regalloc;
pub mod session;

pub use cfg::Cfg;
pub use cond::{AssignCond, BranchCond, CmpOp, Flag, SetCond};
pub use error::{CompileError, CompileResult};
pub use instr::{AluInstr, BranchTarget, Instr, InstrKind, InstrList, Label};
pub use liveness::{introduce_accum, LiveSets, Liveness, RegUsage, VarSet};
pub use ops::AluOp;
pub use reg::{Imm, Reg, RegId, RegOrImm, RegTag, SmallImm, Special};
pub use session::{CompileContext, CompileData, Target, Vc4MemPolicy};
