//! IR → v3d instruction encoding.
//!
//! Beyond the per-instruction translation this pass owns the three places
//! where v3d differs sharply from the IR's vc4-flavoured view of the world:
//!
//! - constants that are not small immediates are synthesised (powers of two
//!   via shift, everything else nibble by nibble through r0/r1);
//! - `QPU_NUM`/`ELEM_NUM` are not registers but the `tidx`/`eidx`
//!   instructions, and rotates are pinned to r0 -> r1;
//! - adjacent ADD-ALU/MUL-ALU instructions are combined into one dual-issue
//!   word when the read ports and conditions allow it.
//!
//! Encoding ends with the canonical program tail and a label-resolution pass
//! that patches PC-relative branch offsets and drops the label metas.

use log::debug;
use rustc_hash::FxHashMap;

use crate::core::instr::{AluInstr, Instr, InstrKind, InstrList, Label};
use crate::core::reg::{decode_small_lit, Imm, Reg, RegOrImm, RegTag, Special};
use crate::core::{AluOp, CompileContext, CompileError, CompileResult};

use super::instr::{self as vi, add_op, mul_op, rf, waddr, Loc, Src, V3dInstr, R0, R1, R4};
use super::small_imm::{self, SmallImmValue};

/// Branch offsets must fit the platform's signed 26-bit range.
const BRANCH_RANGE: i64 = 1 << 25;

/// Length of the fixed program tail (TMU sync plus the end sequence).
pub const PROGRAM_TAIL_LEN: usize = 9;

// ============================================================================
// Register mapping
// ============================================================================

/// Unified register-file slot of an allocated register.
///
/// File B ids are offset by 32, reducing the two vc4 files to the single
/// v3d file.
fn to_waddr(reg: Reg) -> CompileResult<u8> {
    match reg.tag {
        RegTag::RegA => Ok(reg.id as u8),
        RegTag::RegB => Ok(reg.id as u8 + 32),
        _ => Err(CompileError::invariant(format!(
            "v3d: register {} has no register-file slot",
            reg.dump()
        ))),
    }
}

fn encode_src_reg(reg: Reg) -> CompileResult<Loc> {
    match reg.tag {
        RegTag::RegA => Ok(rf(reg.id as u8)),
        RegTag::RegB => Ok(rf(reg.id as u8 + 32)),
        RegTag::Acc => Ok(Loc::Acc(reg.id as u8)),
        RegTag::Special => Err(CompileError::UnsupportedInstruction {
            target: "v3d",
            mnemonic: format!("read of {}", reg.dump()),
        }),
        _ => Err(CompileError::invariant(format!(
            "v3d: unallocated source register {}",
            reg.dump()
        ))),
    }
}

fn encode_dest_reg(reg: Reg) -> CompileResult<Loc> {
    match reg.tag {
        RegTag::RegA => Ok(rf(reg.id as u8)),
        RegTag::RegB => Ok(rf(reg.id as u8 + 32)),
        RegTag::Acc => {
            if reg.id > 5 {
                return Err(CompileError::invariant(format!(
                    "v3d: no accumulator r{}",
                    reg.id
                )));
            }
            // r5 is not a general write target; writing it broadcasts lane 0,
            // which is exactly what the variable-rotate setup needs.
            Ok(Loc::Acc(reg.id as u8))
        }
        RegTag::None => Ok(Loc::Magic(waddr::NOP)),
        RegTag::Special => match reg.as_special() {
            // TMU plumbing: stores write data then address, loads write the
            // read address. Both address paths are the same register.
            Some(Special::VpmWrite) => Ok(Loc::Magic(waddr::TMUD)),
            Some(Special::DmaStAddr) | Some(Special::Tmu0S) => Ok(Loc::Magic(waddr::TMUA)),
            Some(Special::SfuRecip) => Ok(Loc::Magic(waddr::RECIP)),
            Some(Special::SfuRecipSqrt) => Ok(Loc::Magic(waddr::RSQRT)),
            Some(Special::SfuExp) => Ok(Loc::Magic(waddr::EXP)),
            Some(Special::SfuLog) => Ok(Loc::Magic(waddr::LOG)),
            _ => Err(CompileError::UnsupportedInstruction {
                target: "v3d",
                mnemonic: format!("write of {}", reg.dump()),
            }),
        },
        _ => Err(CompileError::invariant(format!(
            "v3d: unallocated destination register {}",
            reg.dump()
        ))),
    }
}

/// Translate a small-immediate operand from its vc4 code to the v3d value.
fn encode_small_imm(src: &RegOrImm) -> SmallImmValue {
    debug_assert!(src.is_imm());
    match decode_small_lit(src.imm().val) {
        Imm::Int32(i) => SmallImmValue::Int(i),
        Imm::Float32(f) => SmallImmValue::Float(f),
        Imm::Mask(m) => SmallImmValue::Int(m as i32),
    }
}

fn encode_src(src: &RegOrImm) -> CompileResult<Src> {
    if src.is_reg() {
        Ok(Src::Loc(encode_src_reg(src.reg())?))
    } else {
        Ok(Src::Imm(encode_small_imm(src)))
    }
}

// ============================================================================
// QPU / element index
// ============================================================================

/// On v3d the QPU and element numbers are instructions, not registers.
///
/// The only permitted use is the move idiom `x <- QPU_NUM` (an OR with both
/// operands the same special register); anything else is an error.
fn check_special_index(alu: &AluInstr) -> CompileResult<()> {
    let is_index = |s: &RegOrImm| {
        s.is_reg()
            && (s.reg().is_special(Special::QpuNum) || s.reg().is_special(Special::ElemNum))
    };

    let a_special = is_index(&alu.src_a);
    let b_special = is_index(&alu.src_b);
    if !a_special && !b_special {
        return Ok(());
    }

    if alu.op != AluOp::BOr {
        return Err(CompileError::UserAssertion(
            "for v3d, QPU_NUM and ELEM_NUM can only be used in a move instruction".into(),
        ));
    }
    if !(a_special && b_special && alu.src_a == alu.src_b) {
        return Err(CompileError::invariant(
            "QPU_NUM/ELEM_NUM move must use the same special register on both sides",
        ));
    }
    Ok(())
}

fn is_special_index(alu: &AluInstr, which: Special) -> bool {
    debug_assert!(matches!(which, Special::QpuNum | Special::ElemNum));
    alu.op == AluOp::BOr
        && alu.src_a.is_reg()
        && alu.src_b.is_reg()
        && alu.src_a.reg().is_special(which)
        && alu.src_b.reg().is_special(which)
}

// ============================================================================
// Opcode translation
// ============================================================================

fn add_alu_code(op: AluOp) -> Option<u64> {
    Some(match op {
        AluOp::Add => add_op::ADD,
        AluOp::Sub => add_op::SUB,
        AluOp::Shl => add_op::SHL,
        AluOp::Shr => add_op::SHR,
        AluOp::Asr => add_op::ASR,
        AluOp::Ror => add_op::ROR,
        AluOp::Min => add_op::MIN,
        AluOp::Max => add_op::MAX,
        AluOp::BAnd => add_op::BAND,
        AluOp::BOr => add_op::BOR,
        AluOp::BXor => add_op::BXOR,
        AluOp::BNot => add_op::BNOT,
        AluOp::FAdd => add_op::FADD,
        AluOp::FSub => add_op::FSUB,
        AluOp::FMin => add_op::FMIN,
        AluOp::FMax => add_op::FMAX,
        AluOp::FtoI => add_op::FTOI,
        AluOp::ItoF => add_op::ITOF,
        _ => return None,
    })
}

/// MUL-ALU opcode for an op the MUL ALU can execute.
fn mul_alu_code(op: AluOp) -> Option<u64> {
    Some(match op {
        AluOp::FMul => mul_op::FMUL,
        AluOp::Mul24 => mul_op::SMUL24,
        AluOp::Add => mul_op::ADD,
        AluOp::Sub => mul_op::SUB,
        AluOp::BOr => mul_op::BOR,
        AluOp::BAnd => mul_op::BAND,
        AluOp::BXor => mul_op::BXOR,
        AluOp::Min => mul_op::MIN,
        AluOp::Max => mul_op::MAX,
        _ => return None,
    })
}

/// Translate one ALU instruction into v3d instructions.
fn translate_opcode(alu: &AluInstr) -> CompileResult<Vec<V3dInstr>> {
    check_special_index(alu)?;

    let dst = encode_dest_reg(alu.dest)?;

    if is_special_index(alu, Special::QpuNum) {
        return Ok(vec![vi::tidx(dst)?]);
    }
    if is_special_index(alu, Special::ElemNum) {
        return Ok(vec![vi::eidx(dst)?]);
    }

    if alu.op.no_operands() {
        let i = match alu.op {
            AluOp::Tidx => vi::tidx(dst)?,
            AluOp::Eidx => vi::eidx(dst)?,
            _ => unreachable!(),
        };
        return Ok(vec![i]);
    }

    let a = encode_src(&alu.src_a)?;
    let b = encode_src(&alu.src_b)?;

    let instr = if alu.op.uses_mul_alu() {
        let code = mul_alu_code(alu.op).ok_or_else(|| CompileError::invariant(
            format!("v3d: no MUL-ALU encoding for {}", alu.op),
        ))?;
        let mut i = vi::nop();
        if !i.alu_mul_set(code, dst, a, b) {
            return Err(CompileError::invariant(format!(
                "v3d: cannot route {} operands",
                alu.op
            )));
        }
        i
    } else {
        let code = add_alu_code(alu.op).ok_or_else(|| CompileError::UnsupportedInstruction {
            target: "v3d",
            mnemonic: alu.op.mnemonic().into(),
        })?;
        vi::nop().alu_add_set(code, dst, a, b)?
    };

    Ok(vec![instr])
}

/// Lower a vector rotate.
///
/// Rotates use r0 as source and r1 as destination implicitly; a nop between
/// the setup move and the rotate is mandatory.
fn translate_rotate(alu: &AluInstr) -> CompileResult<Vec<V3dInstr>> {
    debug_assert!(alu.op.is_rot());
    let dst = encode_dest_reg(alu.dest)?;
    if dst == R1 {
        return Err(CompileError::invariant(
            "v3d: rotate cannot have destination r1",
        ));
    }

    let mut ret = Vec::new();

    let src_a = encode_src_reg(alu.src_a.reg())?;
    if src_a != R0 {
        ret.push(vi::mov(R0, src_a)?.with_comment("moving rotate source to r0"));
    }
    ret.push(vi::nop().with_comment("NOP required for rotate"));

    if alu.src_b.is_reg() {
        let src_b = alu.src_b.reg();
        if src_b != crate::core::reg::ACC5 {
            return Err(CompileError::invariant(
                "v3d: variable rotate amount must be in r5",
            ));
        }
        ret.push(vi::rotate(R1, R0, Src::Loc(super::instr::R5))?);
    } else {
        let imm = encode_small_imm(&alu.src_b);
        ret.push(vi::rotate(R1, R0, Src::Imm(imm))?);
    }

    ret.push(vi::bor(dst, R1, R1)?);
    Ok(ret)
}

// ============================================================================
// Immediate legalisation
// ============================================================================

/// Load a positive power-of-two multiple of a small immediate into r0.
fn convert_int_powers(output: &mut Vec<V3dInstr>, in_value: i32) -> CompileResult<bool> {
    if in_value < 0 {
        return Ok(false); // only positive values
    }
    if in_value < 16 {
        return Ok(false); // already in range
    }

    let mut value = in_value;
    let mut left_shift = 0;
    while value != 0 && (value & 1) == 0 {
        left_shift += 1;
        value >>= 1;
    }
    if left_shift == 0 {
        return Ok(false);
    }
    if small_imm::int_to_opcode_value(value).is_none() {
        return Ok(false);
    }

    output.push(
        vi::mov(R0, SmallImmValue::Int(value))?.with_comment(format!("load immediate {in_value}")),
    );
    output.push(vi::shl(R0, R0, SmallImmValue::Int(left_shift))?);
    Ok(true)
}

/// Blunt tool for converting any 32-bit constant.
///
/// Assembles the value in r1, four bits at a time from the most significant
/// nibble down, using r0 for shifted intermediates.
fn encode_int_immediate(output: &mut Vec<V3dInstr>, in_value: i32) -> CompileResult<bool> {
    let value = in_value as u32;
    let mut ret = Vec::new();

    let nibbles: Vec<u32> = (0..8).map(|i| (value >> (4 * i)) & 0xf).collect();

    let mut did_first = false;
    for i in (0..8usize).rev() {
        if nibbles[i] == 0 {
            continue;
        }
        let imm = SmallImmValue::Int(nibbles[i] as i32);

        if !did_first {
            ret.push(vi::mov(R1, imm)?);
            if i > 0 {
                if convert_int_powers(&mut ret, 4 * i as i32)? {
                    // r0 now contains the shift amount
                    ret.push(vi::shl(R1, R1, Src::Loc(R0))?);
                } else {
                    ret.push(vi::shl(R1, R1, SmallImmValue::Int(4 * i as i32))?);
                }
            }
            did_first = true;
        } else if i > 0 {
            if convert_int_powers(&mut ret, 4 * i as i32)? {
                ret.push(vi::shl(R0, imm, Src::Loc(R0))?);
            } else {
                ret.push(vi::mov(R0, imm)?);
                ret.push(vi::shl(R0, R0, SmallImmValue::Int(4 * i as i32))?);
            }
            ret.push(vi::bor(R1, R1, Src::Loc(R0))?);
        } else {
            ret.push(vi::bor(R1, R1, imm)?);
        }
    }

    if ret.is_empty() {
        return Ok(false);
    }

    if let Some(first) = ret.first_mut() {
        first.add_comment(format!("load immediate {in_value:#x}"));
    }
    if let Some(last) = ret.last_mut() {
        last.add_comment(format!("end load immediate {in_value:#x}"));
    }
    output.append(&mut ret);
    Ok(true)
}

/// Three-tier integer materialisation.
fn encode_int(ret: &mut Vec<V3dInstr>, dst: Loc, value: i32) -> CompileResult<bool> {
    if small_imm::int_to_opcode_value(value).is_some() {
        ret.push(vi::mov(dst, SmallImmValue::Int(value))?);
    } else if convert_int_powers(ret, value)? {
        ret.push(vi::mov(dst, R0)?);
    } else if encode_int_immediate(ret, value)? {
        ret.push(vi::mov(dst, R1)?);
    } else {
        return Ok(false);
    }
    Ok(true)
}

fn encode_float(ret: &mut Vec<V3dInstr>, dst: Loc, value: f32) -> CompileResult<bool> {
    if value < 0.0 && small_imm::float_to_opcode_value(-value).is_some() {
        // works because float zero is 0x0
        ret.push(vi::nop().fmov(dst, SmallImmValue::Float(-value))?);
        ret.push(vi::fsub(dst, SmallImmValue::Int(0), dst)?);
    } else if small_imm::float_to_opcode_value(value).is_some() {
        ret.push(vi::nop().fmov(dst, SmallImmValue::Float(value))?);
    } else if value == (value as i32) as f32 {
        // integral float: go through the int path and convert
        if !encode_int(ret, dst, value as i32)? {
            return Ok(false);
        }
        ret.push(vi::itof(dst, dst, SmallImmValue::Int(0))?);
    } else {
        // full bit image; the result is an int but is handled as float
        // downstream
        if !encode_int_immediate(ret, value.to_bits() as i32)? {
            return Ok(false);
        }
        ret.push(vi::mov(dst, R1)?);
    }
    Ok(true)
}

fn encode_load_immediate(instr: &Instr) -> CompileResult<Vec<V3dInstr>> {
    let InstrKind::LoadImm { cond, dest, imm, .. } = &instr.kind else {
        return Err(CompileError::invariant("encode_load_immediate on non-LI"));
    };
    let dst = encode_dest_reg(*dest)?;

    let mut ret = Vec::new();
    let ok = match imm {
        Imm::Int32(v) => encode_int(&mut ret, dst, *v)?,
        Imm::Float32(v) => encode_float(&mut ret, dst, *v)?,
        Imm::Mask(_) => {
            return Err(CompileError::UnsupportedInstruction {
                target: "v3d",
                mnemonic: instr.mnemonic(false),
            })
        }
    };
    if !ok {
        return Err(CompileError::ImmediateEncodingFailure {
            kind: match imm {
                Imm::Int32(_) => "int",
                _ => "float",
            },
            value: imm.to_string(),
        });
    }

    for i in &mut ret {
        i.set_cond_tag(*cond);
    }
    Ok(ret)
}

// ============================================================================
// Conditions
// ============================================================================

fn handle_condition_tags(instr: &Instr, ret: &mut [V3dInstr]) -> CompileResult<()> {
    let cond = instr.assign_cond();
    if cond.is_never() {
        return Err(CompileError::invariant("NEVER encountered in ALU cond"));
    }

    let set_cond = instr.set_cond_tag();
    if !set_cond.flags_set() {
        // use the flag as run condition for the current instructions
        for i in ret.iter_mut() {
            i.set_cond_tag(cond);
        }
        return Ok(());
    }

    // Set a condition flag with the current instruction. The flag is pushed
    // by the last one; any preceding instructions only compute inputs.
    if !cond.is_always() {
        return Err(CompileError::invariant(
            "flag-setting instruction with non-ALWAYS condition",
        ));
    }
    if let Some(last) = ret.last_mut() {
        last.set_push_tag(set_cond);
    }
    Ok(())
}

fn encode_alu_op(instr: &Instr) -> CompileResult<Vec<V3dInstr>> {
    let InstrKind::Alu(alu) = &instr.kind else {
        return Err(CompileError::invariant("encode_alu_op on non-ALU"));
    };

    if instr.is_uniform_load() {
        let addr = to_waddr(alu.dest).map(rf).or_else(|_| {
            if alu.dest.tag == RegTag::Acc {
                Ok(Loc::Acc(alu.dest.id as u8))
            } else {
                Err(CompileError::invariant(format!(
                    "v3d: uniform load into {}",
                    alu.dest.dump()
                )))
            }
        })?;
        return Ok(vec![vi::nop().ldunifrf(addr)?]);
    }

    let mut ret = if alu.op.is_rot() {
        translate_rotate(alu)?
    } else {
        translate_opcode(alu)?
    };
    handle_condition_tags(instr, &mut ret)?;
    Ok(ret)
}

// ============================================================================
// Branches
// ============================================================================

fn encode_branch_label(instr: &Instr) -> CompileResult<V3dInstr> {
    let InstrKind::BranchLabel { cond, label } = &instr.kind else {
        return Err(CompileError::invariant("encode_branch_label on non-BRL"));
    };
    let mut dst = V3dInstr::branch(0, true).with_branch_label(*label);
    dst.set_branch_condition(*cond)?;
    Ok(dst)
}

// ============================================================================
// Dual-issue combine
// ============================================================================

fn uses_mul_alu(instr: &Instr) -> bool {
    matches!(&instr.kind, InstrKind::Alu(alu) if alu.op.uses_mul_alu())
}

fn uses_add_alu(instr: &Instr) -> bool {
    matches!(&instr.kind, InstrKind::Alu(_)) && !uses_mul_alu(instr)
}

fn can_use_mul_alu(instr: &Instr) -> bool {
    matches!(&instr.kind, InstrKind::Alu(alu) if alu.op.can_run_on_mul_alu())
}

/// Combination is only possible with one op per ALU.
///
/// Returns whether to swap the pair (the first instruction takes the MUL
/// slot).
fn valid_combine_pair(instr: &Instr, next: &Instr) -> Option<bool> {
    if uses_add_alu(instr) && can_use_mul_alu(next) {
        return Some(false);
    }
    if can_use_mul_alu(instr) && uses_add_alu(next) {
        return Some(true);
    }
    None
}

fn src_imm(alu: &AluInstr) -> Option<SmallImmValue> {
    if alu.src_a.is_imm() {
        Some(encode_small_imm(&alu.src_a))
    } else if alu.src_b.is_imm() {
        Some(encode_small_imm(&alu.src_b))
    } else {
        None
    }
}

/// Check whether two adjacent instructions can share one dual-issue word.
///
/// At most two distinct register-file sources fit the two read ports; an
/// immediate counts as one source and both instructions must then agree on
/// it. Specials cannot be combined, and the ADD destination must not feed
/// the MUL sources.
fn can_combine(instr: &Instr, next: &Instr) -> bool {
    let (InstrKind::Alu(alu), InstrKind::Alu(next_alu)) = (&instr.kind, &next.kind) else {
        return false;
    };
    if valid_combine_pair(instr, next).is_none() {
        return false;
    }

    // Zero-operand index ops and rotates keep their own slot.
    for a in [alu, next_alu] {
        if a.op.no_operands() || a.op.is_rot() {
            return false;
        }
    }

    let imm = src_imm(alu);
    let next_imm = src_imm(next_alu);
    if let (Some(a), Some(b)) = (imm, next_imm) {
        if a != b {
            return false;
        }
    }

    let mut unique_src_count = 0;
    if imm.is_some() || next_imm.is_some() {
        unique_src_count += 1;
    }

    // Specials cannot be combined; count distinct rf registers. The number
    // of accumulators used is free.
    let mut rf_slots: Vec<(RegTag, u32)> = Vec::new();
    for src in [&alu.src_a, &alu.src_b, &next_alu.src_a, &next_alu.src_b] {
        if !src.is_reg() {
            continue;
        }
        let r = src.reg();
        if r.tag == RegTag::Special {
            return false;
        }
        if r.is_rf_reg() && !rf_slots.contains(&(r.tag, r.id)) {
            rf_slots.push((r.tag, r.id));
        }
    }
    unique_src_count += rf_slots.len();
    if unique_src_count > 2 {
        return false;
    }

    // dst of instr must not be read by next_instr
    let reads_dest = [&next_alu.src_a, &next_alu.src_b]
        .iter()
        .any(|s| s.is_reg() && s.reg() == alu.dest);
    if reads_dest {
        return false;
    }

    true
}

/// If possible, combine an ADD-ALU instruction with an adjacent MUL-ALU
/// instruction into one word.
fn try_combine(instr: &Instr, next: &Instr) -> CompileResult<Option<V3dInstr>> {
    // add and mul ALUs have separate condition fields, but combining is
    // kept strict: same condition, no conditional assigns.
    if instr.assign_cond() != next.assign_cond() {
        return Ok(None);
    }
    if instr.is_cond_assign() {
        return Ok(None);
    }
    if !can_combine(instr, next) {
        return Ok(None);
    }

    let Some(do_converse) = valid_combine_pair(instr, next) else {
        return Ok(None);
    };
    let (add_instr, mul_instr) = if do_converse { (next, instr) } else { (instr, next) };

    let (InstrKind::Alu(add_alu), InstrKind::Alu(mul_alu)) = (&add_instr.kind, &mul_instr.kind)
    else {
        return Ok(None);
    };

    // The MUL op retires last, so only it may push flags.
    if add_instr.set_cond_tag().flags_set() {
        return Ok(None);
    }

    let mut out = match translate_opcode(add_alu) {
        Ok(v) if v.len() == 1 => v.into_iter().next().unwrap(),
        _ => return Ok(None),
    };

    let Some(code) = mul_alu_code(mul_alu.op) else {
        return Ok(None);
    };
    let dst = encode_dest_reg(mul_alu.dest)?;
    let a = encode_src(&mul_alu.src_a)?;
    let b = encode_src(&mul_alu.src_b)?;
    if !out.alu_mul_set(code, dst, a, b) {
        debug!(
            "possible candidate for combine rejected:\n  instr     : {}\n  next_instr: {}",
            instr.dump(),
            next.dump()
        );
        return Ok(None);
    }

    out.set_cond_tag(instr.assign_cond());
    out.set_push_tag(mul_instr.set_cond_tag());

    if let Some(c) = instr.comment() {
        out.add_comment(c.to_string());
    }
    if let Some(c) = next.comment() {
        out.add_comment(c.to_string());
    }

    Ok(Some(out))
}

// ============================================================================
// Init block and program tail
// ============================================================================

/// Standard initialisation, inserted at the `INIT_END` marker.
///
/// Register-file slots touched here did not participate in liveness; keep
/// this to accumulators and magic registers.
fn encode_init() -> CompileResult<Vec<V3dInstr>> {
    Ok(vec![vi::mov(Loc::Magic(waddr::TMUC), SmallImmValue::Int(1))?
        .with_comment("enable TMU read")])
}

fn sync_tmu() -> CompileResult<V3dInstr> {
    Ok(vi::tmuwt()?.with_comment("sync TMU"))
}

/// The canonical program tail: drain the pipeline and signal completion.
fn end_program() -> Vec<V3dInstr> {
    vec![
        vi::nop().thrsw(),
        vi::nop().thrsw(),
        vi::nop(),
        vi::nop(),
        vi::nop().thrsw(),
        vi::nop(),
        vi::nop(),
        vi::nop(),
    ]
}

// ============================================================================
// Main loop
// ============================================================================

/// Uniform loads are expected as a contiguous prefix of the program.
fn check_uniform_at_top(instrs: &InstrList) -> CompileResult<()> {
    let mut doing_top = true;
    for instr in instrs.iter() {
        if doing_top {
            if !instr.is_uniform_load() {
                doing_top = false;
            }
        } else if instr.is_uniform_load() {
            return Err(CompileError::invariant(
                "uniform load below the top of the instruction list",
            ));
        }
    }
    Ok(())
}

fn encode_instr(instr: &Instr) -> CompileResult<Vec<V3dInstr>> {
    let mut ret = match &instr.kind {
        InstrKind::Branch { .. } => {
            return Err(CompileError::invariant(
                "not expecting BR; branch creation goes through BRL",
            ))
        }
        InstrKind::InitBegin | InstrKind::InitEnd | InstrKind::End => {
            return Err(CompileError::invariant("not expecting INIT or END tag here"))
        }
        InstrKind::Label(l) => vec![V3dInstr::label_meta(*l)],
        InstrKind::BranchLabel { .. } => vec![encode_branch_label(instr)?],
        InstrKind::LoadImm { .. } => encode_load_immediate(instr)?,
        InstrKind::Alu(_) => encode_alu_op(instr)?,
        InstrKind::Recv { dest } => vec![vi::nop().ldtmu(encode_dest_reg(*dest)?)?],
        InstrKind::Tmu0ToAcc4 => vec![vi::nop().ldtmu(R4)?],
        InstrKind::NoOp => vec![vi::nop()],
        InstrKind::Tmuwt => vec![sync_tmu()?],
        _ => {
            return Err(CompileError::UnsupportedInstruction {
                target: "v3d",
                mnemonic: instr.mnemonic(false),
            })
        }
    };

    if let Some(first) = ret.first_mut() {
        if let Some(h) = instr.header() {
            first.set_header(h.to_string());
        }
        if let Some(c) = instr.comment() {
            first.add_comment(c.to_string());
        }
    }
    Ok(ret)
}

/// Translate the allocated IR into v3d instructions, combining adjacent
/// ADD/MUL pairs where possible.
fn encode_list(ctx: &mut CompileContext<'_>, instrs: &InstrList) -> CompileResult<Vec<V3dInstr>> {
    check_uniform_at_top(instrs)?;

    let mut out: Vec<V3dInstr> = Vec::new();
    let mut prev_was_init_begin = false;
    let mut prev_was_init_end = false;

    let mut i = 0;
    while i < instrs.len() {
        let instr = &instrs[i];
        instr.check_platform(false)?;

        match instr.kind {
            InstrKind::InitBegin => {
                prev_was_init_begin = true;
                i += 1;
                continue;
            }
            InstrKind::InitEnd => {
                let mut init = encode_init()?;
                if prev_was_init_begin {
                    if let Some(first) = init.first_mut() {
                        first.set_header("Init block");
                    }
                    prev_was_init_begin = false;
                }
                out.extend(init);
                prev_was_init_end = true;
                i += 1;
                continue;
            }
            _ => {}
        }

        let mut ret = if i + 1 < instrs.len() {
            match try_combine(instr, &instrs[i + 1])? {
                Some(combined) => {
                    ctx.compile_data.num_instructions_combined += 1;
                    i += 1;
                    vec![combined]
                }
                None => encode_instr(instr)?,
            }
        } else {
            encode_instr(instr)?
        };

        if prev_was_init_begin {
            if let Some(first) = ret.first_mut() {
                first.set_header("Init block");
            }
            prev_was_init_begin = false;
        }
        if prev_was_init_end {
            if let Some(first) = ret.first_mut() {
                first.set_header("Main program");
            }
            prev_was_init_end = false;
        }

        out.append(&mut ret);
        i += 1;
    }

    out.push(sync_tmu()?);
    out.extend(end_program());
    Ok(out)
}

// ============================================================================
// Label resolution
// ============================================================================

/// Patch branch offsets and drop the label meta-instructions.
///
/// Branches take effect after their delay slots; offsets are relative to the
/// fourth instruction after the branch.
pub fn remove_labels(instrs: Vec<V3dInstr>) -> CompileResult<Vec<V3dInstr>> {
    let mut label_pos: FxHashMap<Label, usize> = FxHashMap::default();
    let mut pos = 0usize;
    for instr in &instrs {
        if let Some(l) = instr.label() {
            label_pos.insert(l, pos);
        } else {
            pos += 1;
        }
    }

    let mut out = Vec::with_capacity(instrs.len());
    let mut pos = 0usize;
    for mut instr in instrs {
        if instr.is_label() {
            continue;
        }
        if let Some(label) = instr.branch_label() {
            let target = *label_pos
                .get(&label)
                .ok_or(CompileError::UnresolvedLabel(label))?;
            let offset = 8 * (target as i64 - (pos as i64 + 4));
            if offset.abs() >= BRANCH_RANGE {
                return Err(CompileError::BranchOffsetOutOfRange { offset });
            }
            instr.label_to_target(offset as i32);
        }
        out.push(instr);
        pos += 1;
    }
    Ok(out)
}

// ============================================================================
// Entry points
// ============================================================================

/// Full back-end encode: translate, combine, resolve labels.
pub fn encode(ctx: &mut CompileContext<'_>, instrs: &InstrList) -> CompileResult<Vec<V3dInstr>> {
    let encoded = encode_list(ctx, instrs)?;
    remove_labels(encoded)
}

/// The packed opcode stream.
pub fn to_opcodes(instrs: &[V3dInstr]) -> Vec<u64> {
    instrs.iter().map(|i| i.code()).collect()
}

pub fn mnemonics(instrs: &[V3dInstr], with_comments: bool) -> String {
    let mut out = String::new();
    for (i, instr) in instrs.iter().enumerate() {
        out.push_str(&format!("{i:4}: {}\n", instr.mnemonic(with_comments)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cond::{BranchCond, Flag};
    use crate::core::reg::{SmallImm, ACC1, ACC2};
    use crate::core::session::Target;
    use bumpalo::Bump;

    fn ctx(arena: &Bump) -> CompileContext<'_> {
        CompileContext::new(arena, Target::V3d)
    }

    fn alu_regs(dest: Reg, a: Reg, op: AluOp, b: Reg) -> Instr {
        Instr::alu(dest, a, op, b)
    }

    fn a(id: u32) -> Reg {
        Reg::new(RegTag::RegA, id)
    }

    #[test]
    fn simple_add_sequence_length() {
        // Scenario: LI, LI, ADD, MOV -> 4 opcodes plus the program tail.
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::li(ACC1, Imm::Int32(10)));
        l.push(Instr::li(ACC2, Imm::Int32(12)));
        l.push(alu_regs(a(0), ACC1, AluOp::Add, ACC2));
        l.push(Instr::mov(a(1), a(0)));

        let out = encode(&mut c, &l).unwrap();
        assert_eq!(out.len(), 4 + PROGRAM_TAIL_LEN);
    }

    #[test]
    fn large_immediate_uses_nibble_scheme() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::li(a(0), Imm::Int32(0x12345678)));

        let out = encode(&mut c, &l).unwrap();
        let body = out.len() - PROGRAM_TAIL_LEN;
        assert!(body >= 3, "expected >=3 instructions for 0x12345678, got {body}");
        // final move comes from r1
        let movs: Vec<_> = out[..body].iter().filter(|i| i.op_add() == add_op::BOR).collect();
        assert!(!movs.is_empty());
    }

    #[test]
    fn power_of_two_immediate_uses_shift() {
        let mut ret = Vec::new();
        assert!(convert_int_powers(&mut ret, 4096).unwrap());
        assert_eq!(ret.len(), 2);
        assert_eq!(ret[1].op_add(), add_op::SHL);

        let mut ret = Vec::new();
        assert!(!convert_int_powers(&mut ret, 7).unwrap());
        assert!(!convert_int_powers(&mut ret, -8).unwrap());
    }

    #[test]
    fn small_immediates_encode_directly() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::li(a(0), Imm::Int32(7)));
        let out = encode(&mut c, &l).unwrap();
        assert_eq!(out.len(), 1 + PROGRAM_TAIL_LEN);
        assert_eq!(out[0].small_imm(), Some(SmallImmValue::Int(7)));
    }

    #[test]
    fn rotate_lowering_shape() {
        // rotate v1 <- v0 by 3, with v0 in rf0 and v1 in rf1
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::alu(a(1), a(0), AluOp::Rotate, RegOrImm::Imm(SmallImm::new(3))));

        let out = encode(&mut c, &l).unwrap();
        let body = &out[..out.len() - PROGRAM_TAIL_LEN];
        // mov r0, rf0; nop; rotate; mov rf1, r1
        assert_eq!(body.len(), 4);
        assert_eq!(body[0].op_add(), add_op::BOR, "setup move to r0");
        assert_eq!(body[1].code(), super::super::instr::NOP_WORD);
        assert_eq!(body[2].op_mul(), mul_op::ROTATE);
        assert_eq!(body[3].op_add(), add_op::BOR, "result move from r1");
    }

    #[test]
    fn rotate_from_r0_skips_setup_move() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::alu(a(1), Reg::acc(0), AluOp::Rotate, RegOrImm::Imm(SmallImm::new(3))));

        let out = encode(&mut c, &l).unwrap();
        let body = &out[..out.len() - PROGRAM_TAIL_LEN];
        assert_eq!(body.len(), 3, "no setup move needed from r0");
        assert_eq!(body[1].op_mul(), mul_op::ROTATE);
    }

    #[test]
    fn qpu_and_elem_num_become_tidx_eidx() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::mov(a(0), crate::core::reg::QPU_ID));
        l.push(Instr::mov(a(1), crate::core::reg::ELEM_ID));

        let out = encode(&mut c, &l).unwrap();
        assert_eq!(out[0].op_add(), add_op::TIDX);
        assert_eq!(out[1].op_add(), add_op::EIDX);
    }

    #[test]
    fn special_index_outside_mov_is_rejected() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::alu(a(0), crate::core::reg::QPU_ID, AluOp::Add, a(1)));

        match encode(&mut c, &l) {
            Err(CompileError::UserAssertion(_)) => {}
            other => panic!("expected UserAssertion, got {other:?}"),
        }
    }

    #[test]
    fn combine_add_and_fmul() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(alu_regs(a(0), a(1), AluOp::Add, a(2)));
        l.push(alu_regs(Reg::acc(3), a(1), AluOp::FMul, a(2)));

        let out = encode(&mut c, &l).unwrap();
        assert_eq!(out.len(), 1 + PROGRAM_TAIL_LEN, "pair must fuse into one word");
        assert_eq!(c.compile_data.num_instructions_combined, 1);
        assert_eq!(out[0].op_mul(), mul_op::FMUL);
        assert_ne!(out[0].op_add(), add_op::NOP);
    }

    #[test]
    fn combine_respects_read_port_limit() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        // four distinct rf sources: cannot combine
        let mut l = InstrList::new();
        l.push(alu_regs(Reg::acc(0), a(1), AluOp::Add, a(2)));
        l.push(alu_regs(Reg::acc(3), a(4), AluOp::FMul, a(5)));

        let out = encode(&mut c, &l).unwrap();
        assert_eq!(out.len(), 2 + PROGRAM_TAIL_LEN);
        assert_eq!(c.compile_data.num_instructions_combined, 0);
    }

    #[test]
    fn combine_rejects_dest_feeding_mul() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(alu_regs(Reg::acc(0), a(1), AluOp::Add, a(2)));
        l.push(alu_regs(Reg::acc(3), Reg::acc(0), AluOp::FMul, a(1)));

        let out = encode(&mut c, &l).unwrap();
        assert_eq!(out.len(), 2 + PROGRAM_TAIL_LEN);
    }

    #[test]
    fn combine_converse_pair() {
        // mul first, add second: swapped into the same word
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(alu_regs(Reg::acc(3), a(1), AluOp::FMul, a(2)));
        l.push(alu_regs(Reg::acc(0), a(1), AluOp::Add, a(2)));

        let out = encode(&mut c, &l).unwrap();
        assert_eq!(out.len(), 1 + PROGRAM_TAIL_LEN);
        assert_eq!(c.compile_data.num_instructions_combined, 1);
    }

    #[test]
    fn backward_branch_resolves_negative() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::label(0));
        l.push(Instr::mov(a(0), a(1)));
        l.push(Instr::branch(BranchCond::Any(Flag::Zc), 0));

        let out = encode(&mut c, &l).unwrap();
        // label dropped: mov at 0, branch at 1
        assert_eq!(out.len(), 2 + PROGRAM_TAIL_LEN);
        let br = &out[1];
        assert!(br.is_branch());
        assert_eq!(br.branch_offset(), 8 * (0 - (1 + 4)));
    }

    #[test]
    fn unresolved_label_fails_without_output() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::branch(BranchCond::Always, 42));

        match encode(&mut c, &l) {
            Err(CompileError::UnresolvedLabel(42)) => {}
            other => panic!("expected UnresolvedLabel, got {other:?}"),
        }
    }

    #[test]
    fn init_markers_insert_tmu_enable_and_headers() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::new(InstrKind::InitBegin));
        l.push(Instr::new(InstrKind::InitEnd));
        l.push(Instr::mov(a(0), a(1)));

        let out = encode(&mut c, &l).unwrap();
        // tmu enable + mov + tail
        assert_eq!(out.len(), 2 + PROGRAM_TAIL_LEN);
        assert_eq!(out[0].header(), Some("Init block"));
        assert_eq!(out[1].header(), Some("Main program"));
    }

    #[test]
    fn dma_tags_are_unsupported() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::new(InstrKind::DmaLoadWait));

        match encode(&mut c, &l) {
            Err(CompileError::UnsupportedInstruction { target: "v3d", .. }) => {}
            other => panic!("expected UnsupportedInstruction, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_all_emitted_words() {
        let arena = Bump::new();
        let mut c = ctx(&arena);

        let mut l = InstrList::new();
        l.push(Instr::li(a(0), Imm::Int32(0x12345678)));
        l.push(Instr::li(a(1), Imm::Float32(0.25)));
        l.push(alu_regs(a(2), a(0), AluOp::Add, a(1)));
        l.push(alu_regs(Reg::acc(3), a(0), AluOp::FMul, a(1)));
        l.push(Instr::mov(crate::core::reg::TMUD, a(2)));
        l.push(Instr::mov(crate::core::reg::TMUA, a(3)));
        l.push(Instr::tmuwt());

        let out = encode(&mut c, &l).unwrap();
        for instr in &out {
            let w = instr.code();
            assert_eq!(V3dInstr::unpack(w).code(), w, "round trip failed for {w:#018x}");
        }
    }
}
