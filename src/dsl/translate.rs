//! AST → target IR lowering.
//!
//! One linear pass over the statement tree. Every parameter becomes a
//! uniform load at the top of the program, followed by the init-block
//! markers the back ends fill in. Branch delay slots are padded with nops
//! here; the encoders only resolve labels.
//!
//! Memory access is the one place the two targets diverge during lowering:
//! v3d (and vc4 with the prefetch policy) goes through the TMU with
//! per-lane addresses, vc4 with the default policy transfers 16-word rows
//! over DMA through the VPM.

use crate::core::instr::{Instr, InstrKind, InstrList};
use crate::core::reg::{
    self, encode_small_float, encode_small_int, Imm, Reg, RegOrImm, SmallImm,
};
use crate::core::{
    AluOp, AssignCond, BranchCond, CompileContext, CompileError, CompileResult, Flag, Vc4MemPolicy,
};

use super::ast::{BCond, Cmp, Expr, Kernel, RotAmount, SfuFunc, Stmt};

/// Number of branch delay slots on both targets.
const DELAY_SLOTS: usize = 3;

/// Lower a kernel to the target IR.
pub fn translate(ctx: &mut CompileContext<'_>, kernel: &Kernel) -> CompileResult<InstrList> {
    ctx.adopt_var_count(kernel.num_vars);

    let mut seq = InstrList::new();

    for (i, _kind) in kernel.params.iter().enumerate() {
        seq.push(
            Instr::mov(Reg::var(i as u32), reg::UNIFORM).with_comment(format!("load uniform {i}")),
        );
    }

    seq.push(Instr::new(InstrKind::InitBegin));
    seq.push(Instr::new(InstrKind::InitEnd));

    translate_stmts(ctx, &mut seq, &kernel.body, None)?;

    if ctx.compiling_for_vc4() {
        seq.push(Instr::end());
    }
    Ok(seq)
}

fn translate_stmts(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    stmts: &[Stmt],
    where_cond: Option<AssignCond>,
) -> CompileResult<()> {
    for stmt in stmts {
        translate_stmt(ctx, seq, stmt, where_cond)?;
    }
    Ok(())
}

fn translate_stmt(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    stmt: &Stmt,
    where_cond: Option<AssignCond>,
) -> CompileResult<()> {
    match stmt {
        Stmt::Assign { var, expr } => var_assign(ctx, seq, Reg::var(*var), expr, where_cond),
        Stmt::Store { addr, value } => {
            if where_cond.is_some() {
                return Err(CompileError::UserAssertion(
                    "only assignments are allowed inside Where".into(),
                ));
            }
            translate_store(ctx, seq, addr, value)
        }
        Stmt::If { cond, then_, else_ } => {
            if where_cond.is_some() {
                return Err(CompileError::UserAssertion(
                    "only assignments are allowed inside Where".into(),
                ));
            }
            translate_if(ctx, seq, cond, then_, else_)
        }
        Stmt::While { cond, body } => {
            if where_cond.is_some() {
                return Err(CompileError::UserAssertion(
                    "only assignments are allowed inside Where".into(),
                ));
            }
            translate_while(ctx, seq, cond, body)
        }
        Stmt::Where { cond, then_, else_ } => {
            if where_cond.is_some() {
                return Err(CompileError::UserAssertion(
                    "nested Where is not supported".into(),
                ));
            }
            let flag = translate_cmp(ctx, seq, cond)?;
            translate_stmts(ctx, seq, then_, Some(AssignCond::Flag(flag)))?;
            translate_stmts(ctx, seq, else_, Some(AssignCond::Flag(flag.negate())))?;
            Ok(())
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Evaluate an expression into an ALU operand, materialising through a
/// fresh variable when it is not a register or small literal already.
fn operand(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    expr: &Expr,
) -> CompileResult<RegOrImm> {
    match expr {
        Expr::Var(v) => Ok(Reg::var(*v).into()),
        Expr::IntLit(i) => {
            if let Some(code) = encode_small_int(*i) {
                return Ok(SmallImm::new(code).into());
            }
            let t = Reg::var(ctx.fresh_var());
            seq.push(Instr::li(t, Imm::Int32(*i)));
            Ok(t.into())
        }
        Expr::FloatLit(f) => {
            if let Some(code) = encode_small_float(*f) {
                return Ok(SmallImm::new(code).into());
            }
            let t = Reg::var(ctx.fresh_var());
            seq.push(Instr::li(t, Imm::Float32(*f)));
            Ok(t.into())
        }
        _ => {
            let t = Reg::var(ctx.fresh_var());
            var_assign(ctx, seq, t, expr, None)?;
            Ok(t.into())
        }
    }
}

/// One instruction carries at most one small immediate; when both operands
/// are (different) literals, the left one moves through a register.
fn split_imm_pair(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    a: RegOrImm,
    b: &RegOrImm,
) -> RegOrImm {
    if a.is_imm() && b.is_imm() && a != *b {
        let t = Reg::var(ctx.fresh_var());
        seq.push(Instr::mov(t, a));
        return RegOrImm::Reg(t);
    }
    a
}

fn eval_to_reg(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    expr: &Expr,
) -> CompileResult<Reg> {
    match operand(ctx, seq, expr)? {
        RegOrImm::Reg(r) => Ok(r),
        imm @ RegOrImm::Imm(_) => {
            let t = Reg::var(ctx.fresh_var());
            seq.push(Instr::mov(t, imm));
            Ok(t)
        }
    }
}

/// Evaluate `expr` into `dest`, optionally under a where-mask.
///
/// Intermediate results are computed unconditionally into fresh variables;
/// only the final write to `dest` carries the mask.
fn var_assign(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    dest: Reg,
    expr: &Expr,
    where_cond: Option<AssignCond>,
) -> CompileResult<()> {
    let cond = where_cond.unwrap_or(AssignCond::Always);

    match expr {
        Expr::IntLit(i) => {
            seq.push(Instr::li(dest, Imm::Int32(*i)).with_cond(cond));
        }
        Expr::FloatLit(f) => {
            seq.push(Instr::li(dest, Imm::Float32(*f)).with_cond(cond));
        }
        Expr::Var(v) => {
            seq.push(Instr::mov(dest, Reg::var(*v)).with_cond(cond));
        }
        Expr::QpuNum => {
            seq.push(Instr::mov(dest, reg::QPU_ID).with_cond(cond));
        }
        Expr::ElemNum => {
            seq.push(Instr::mov(dest, reg::ELEM_ID).with_cond(cond));
        }
        Expr::BinOp { op, lhs, rhs } => {
            let a = operand(ctx, seq, lhs)?;
            let b = operand(ctx, seq, rhs)?;
            let a = split_imm_pair(ctx, seq, a, &b);
            seq.push(Instr::alu(dest, a, *op, b).with_cond(cond));
        }
        Expr::Deref(addr) => {
            translate_load(ctx, seq, addr, dest, cond)?;
        }
        Expr::Sfu { f, arg } => {
            translate_sfu(ctx, seq, *f, arg, dest, cond)?;
        }
        Expr::Rotate { src, amount } => {
            translate_rotate(ctx, seq, src, amount, dest, cond)?;
        }
    }
    Ok(())
}

// ============================================================================
// Special operations
// ============================================================================

/// SFU call sequence: write the operand to the function's register, wait
/// two slots, read the result from r4.
fn translate_sfu(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    f: SfuFunc,
    arg: &Expr,
    dest: Reg,
    cond: AssignCond,
) -> CompileResult<()> {
    let sfu_reg = match f {
        SfuFunc::Recip => reg::SFU_RECIP,
        SfuFunc::RecipSqrt => reg::SFU_RECIPSQRT,
        SfuFunc::Exp => reg::SFU_EXP,
        SfuFunc::Log => reg::SFU_LOG,
    };
    let a = eval_to_reg(ctx, seq, arg)?;
    seq.push(Instr::mov(sfu_reg, a).with_comment(format!("SFU function {}", f.name())));
    seq.push(Instr::nop());
    seq.push(Instr::nop());
    seq.push(Instr::mov(dest, reg::ACC4).with_cond(cond));
    Ok(())
}

/// Vector rotate. The source must be written at least one instruction
/// before the rotate reads it, hence the nop.
fn translate_rotate(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    src: &Expr,
    amount: &RotAmount,
    dest: Reg,
    cond: AssignCond,
) -> CompileResult<()> {
    let s = eval_to_reg(ctx, seq, src)?;
    match amount {
        RotAmount::Imm(n) => {
            if !(1..=15).contains(n) {
                return Err(CompileError::UserAssertion(format!(
                    "rotate distance {n} out of range 1..=15"
                )));
            }
            seq.push(Instr::nop());
            seq.push(Instr::alu(dest, s, AluOp::Rotate, SmallImm::new(*n)).with_cond(cond));
        }
        RotAmount::Expr(e) => {
            let r = eval_to_reg(ctx, seq, e)?;
            seq.push(Instr::mov(reg::ACC5, r));
            seq.push(Instr::nop());
            seq.push(Instr::alu(dest, s, AluOp::Rotate, reg::ACC5).with_cond(cond));
        }
    }
    Ok(())
}

// ============================================================================
// Memory
// ============================================================================

fn uses_tmu_loads(ctx: &CompileContext<'_>) -> bool {
    !ctx.compiling_for_vc4() || ctx.vc4_mem_policy == Vc4MemPolicy::DoPrefetch
}

// The VPM/DMA setup words are fixed by the hardware; only the handful of
// shapes used here are generated. All transfers are one horizontal row of
// sixteen 32-bit words.

fn vpm_read_setup_word() -> i32 {
    // num=1, stride=1, horizontal, 32-bit, address 0
    (1 << 20) | (1 << 12) | (1 << 11) | (2 << 8)
}

fn vpm_write_setup_word() -> i32 {
    (1 << 12) | (1 << 11) | (2 << 8)
}

fn vdr_setup_word() -> i32 {
    // ID=1, rowlen=16, nrows=1, vpitch=1
    (1u32 << 31) as i32 | (1 << 16) | (1 << 12)
}

fn vdw_setup_word() -> i32 {
    // ID=2, units=1, depth=16
    (2u32 << 30) as i32 | (1 << 23) | (16 << 16)
}

fn translate_load(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    addr: &Expr,
    dest: Reg,
    cond: AssignCond,
) -> CompileResult<()> {
    let addr_reg = eval_to_reg(ctx, seq, addr)?;

    if uses_tmu_loads(ctx) {
        // the address operand is a full per-lane vector; the TMU gathers
        // one word per lane
        seq.push(Instr::mov(reg::TMU0_S, addr_reg).with_comment("TMU gather"));
        seq.push(Instr::tmu0_to_acc4());
        seq.push(Instr::mov(dest, reg::ACC4).with_cond(cond));
    } else {
        seq.push(Instr::li(reg::RD_SETUP, Imm::Int32(vdr_setup_word())).with_comment("DMA load"));
        seq.push(Instr::mov(reg::DMA_LD_ADDR, addr_reg));
        seq.push(Instr::new(InstrKind::DmaLoadWait));
        seq.push(Instr::li(reg::RD_SETUP, Imm::Int32(vpm_read_setup_word())));
        seq.push(Instr::mov(dest, reg::VPM_READ).with_cond(cond));
    }
    Ok(())
}

fn translate_store(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    addr: &Expr,
    value: &Expr,
) -> CompileResult<()> {
    let value_reg = eval_to_reg(ctx, seq, value)?;
    let addr_reg = eval_to_reg(ctx, seq, addr)?;

    if !ctx.compiling_for_vc4() {
        // v3d: write data, then the per-lane addresses; the encoder's
        // program tail waits for completion.
        seq.push(Instr::mov(reg::TMUD, value_reg).with_comment("TMU store"));
        seq.push(Instr::mov(reg::TMUA, addr_reg));
    } else {
        seq.push(
            Instr::li(reg::WR_SETUP, Imm::Int32(vpm_write_setup_word())).with_comment("DMA store"),
        );
        seq.push(Instr::mov(reg::VPM_WRITE, value_reg));
        seq.push(Instr::li(reg::WR_SETUP, Imm::Int32(vdw_setup_word())));
        seq.push(Instr::mov(reg::DMA_ST_ADDR, addr_reg));
        seq.push(Instr::new(InstrKind::DmaStoreWait));
    }
    Ok(())
}

// ============================================================================
// Conditions and control flow
// ============================================================================

/// Evaluate a comparison into the flags; returns the flag that holds where
/// the comparison is true.
fn translate_cmp(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    cmp: &Cmp,
) -> CompileResult<Flag> {
    let a = operand(ctx, seq, &cmp.lhs)?;
    let b = operand(ctx, seq, &cmp.rhs)?;
    let a = split_imm_pair(ctx, seq, a, &b);
    let op = if cmp.float { AluOp::FSub } else { AluOp::Sub };
    // the difference itself is dead; only the flags matter
    let t = Reg::var(ctx.fresh_var());
    seq.push(Instr::alu(t, a, op, b).with_set_cond(cmp.op.set_cond()));
    Ok(cmp.op.flag())
}

fn branch_cond(cond: &BCond, flag: Flag) -> BranchCond {
    match cond {
        BCond::Any(_) => BranchCond::Any(flag),
        BCond::All(_) => BranchCond::All(flag),
    }
}

fn delay_slots(seq: &mut InstrList) {
    for _ in 0..DELAY_SLOTS {
        seq.push(Instr::nop());
    }
}

fn translate_if(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    cond: &BCond,
    then_: &[Stmt],
    else_: &[Stmt],
) -> CompileResult<()> {
    let flag = translate_cmp(ctx, seq, cond.cmp())?;
    let skip = branch_cond(cond, flag).negate();

    let else_label = ctx.fresh_label();
    seq.push(Instr::branch(skip, else_label));
    delay_slots(seq);

    translate_stmts(ctx, seq, then_, None)?;

    if else_.is_empty() {
        seq.push(Instr::label(else_label));
    } else {
        let end_label = ctx.fresh_label();
        seq.push(Instr::branch(BranchCond::Always, end_label));
        delay_slots(seq);
        seq.push(Instr::label(else_label));
        translate_stmts(ctx, seq, else_, None)?;
        seq.push(Instr::label(end_label));
    }
    Ok(())
}

fn translate_while(
    ctx: &mut CompileContext<'_>,
    seq: &mut InstrList,
    cond: &BCond,
    body: &[Stmt],
) -> CompileResult<()> {
    let start_label = ctx.fresh_label();
    let end_label = ctx.fresh_label();

    seq.push(Instr::label(start_label));
    let flag = translate_cmp(ctx, seq, cond.cmp())?;
    seq.push(Instr::branch(branch_cond(cond, flag).negate(), end_label));
    delay_slots(seq);

    translate_stmts(ctx, seq, body, None)?;

    seq.push(Instr::branch(BranchCond::Always, start_label));
    delay_slots(seq);
    seq.push(Instr::label(end_label));
    Ok(())
}
