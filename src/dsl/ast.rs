//! The kernel AST.
//!
//! Kernel functions are host code: evaluating one builds this tree through
//! the [`KernelBuilder`](super::builder::KernelBuilder). Every value the
//! kernel manipulates is a 16-wide vector; variables are dense ids handed
//! out by the builder and carried straight through to the target IR, where
//! they become file-A register placeholders.

use crate::core::{AluOp, CmpOp};
use crate::core::reg::RegId;

pub type VarId = RegId;

/// Special function unit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SfuFunc {
    Recip,
    RecipSqrt,
    Exp,
    Log,
}

impl SfuFunc {
    pub fn name(self) -> &'static str {
        match self {
            SfuFunc::Recip => "recip",
            SfuFunc::RecipSqrt => "recipsqrt",
            SfuFunc::Exp => "exp",
            SfuFunc::Log => "log",
        }
    }
}

/// Rotate distance: compile-time or taken from a vector's lane 0 via r5.
#[derive(Debug, Clone)]
pub enum RotAmount {
    Imm(i32),
    Expr(Box<Expr>),
}

/// Expressions.
#[derive(Debug, Clone)]
pub enum Expr {
    IntLit(i32),
    FloatLit(f32),
    Var(VarId),
    /// Index of the executing QPU.
    QpuNum,
    /// Per-lane element indices 0..15.
    ElemNum,
    BinOp {
        op: AluOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Memory load through the target's read path.
    Deref(Box<Expr>),
    /// Special-function-unit call.
    Sfu { f: SfuFunc, arg: Box<Expr> },
    /// Vector rotate.
    Rotate { src: Box<Expr>, amount: RotAmount },
}

/// A comparison, the leaf of every condition.
#[derive(Debug, Clone)]
pub struct Cmp {
    pub op: CmpOp,
    pub float: bool,
    pub lhs: Expr,
    pub rhs: Expr,
}

/// Branch conditions aggregate the per-lane comparison result.
#[derive(Debug, Clone)]
pub enum BCond {
    Any(Cmp),
    All(Cmp),
}

impl BCond {
    pub fn cmp(&self) -> &Cmp {
        match self {
            BCond::Any(c) | BCond::All(c) => c,
        }
    }
}

/// Statements.
#[derive(Debug, Clone)]
pub enum Stmt {
    Assign {
        var: VarId,
        expr: Expr,
    },
    /// Memory store through the target's write path.
    Store {
        addr: Expr,
        value: Expr,
    },
    If {
        cond: BCond,
        then_: Vec<Stmt>,
        else_: Vec<Stmt>,
    },
    While {
        cond: BCond,
        body: Vec<Stmt>,
    },
    /// Per-lane masking: assignments in both arms run under the (negated)
    /// comparison flag.
    Where {
        cond: Cmp,
        then_: Vec<Stmt>,
        else_: Vec<Stmt>,
    },
}

/// Kernel parameter kinds, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Float,
    /// GPU bus address of a shared array.
    Ptr,
}

/// A finished kernel: parameters, body, and the variable count for the
/// register allocator.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub params: Vec<ParamKind>,
    pub body: Vec<Stmt>,
    pub num_vars: u32,
}
