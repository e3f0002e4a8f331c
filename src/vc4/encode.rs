//! IR → vc4 instruction encoding.
//!
//! The register allocator has already placed one operand of every
//! two-register instruction in each file, so routing here is direct:
//! file-A registers read through raddr_a, file-B through raddr_b,
//! accumulators through their muxes. Memory traffic arrives as writes to
//! the DMA/VPM setup and address registers plus the explicit wait tags;
//! SFU calls arrive as the `mov sfu_reg; nop; nop; mov dst, r4` sequence
//! built during lowering.
//!
//! Branch delay slots (three instructions) are filled with nops during
//! lowering; this pass only resolves the label of each branch into a
//! PC-relative byte offset and drops the label metas.

use rustc_hash::FxHashMap;

use crate::core::instr::{AluInstr, Instr, InstrKind, InstrList, Label};
use crate::core::reg::{Imm, Reg, RegOrImm, RegTag, Special, SMALL_LIT_ROT_R5};
use crate::core::{AluOp, CompileError, CompileResult};

use super::instr::{add_op, mul_op, raddr, sig, waddr, ReadSlot, Vc4Instr, WriteSlot};

/// Branch offsets must fit the platform's signed 26-bit range.
const BRANCH_RANGE: i64 = 1 << 25;

/// Instructions appended after the END signal; the signal takes effect
/// after two further slots.
pub const PROGRAM_TAIL_LEN: usize = 2;

// ============================================================================
// Register mapping
// ============================================================================

fn classify_src(reg: Reg) -> CompileResult<ReadSlot> {
    match reg.tag {
        RegTag::RegA => Ok(ReadSlot::FileA(reg.id as u8)),
        RegTag::RegB => Ok(ReadSlot::FileB(reg.id as u8)),
        RegTag::Acc => Ok(ReadSlot::Acc(reg.id as u8)),
        RegTag::Special => match reg.as_special() {
            Some(Special::Uniform) => Ok(ReadSlot::AnyFile(raddr::UNIFORM)),
            Some(Special::ElemNum) => Ok(ReadSlot::FileA(raddr::INDEX)),
            Some(Special::QpuNum) => Ok(ReadSlot::FileB(raddr::INDEX)),
            Some(Special::VpmRead) => Ok(ReadSlot::AnyFile(raddr::VPM_READ)),
            Some(Special::DmaLdWait) => Ok(ReadSlot::FileA(raddr::DMA_WAIT)),
            Some(Special::DmaStWait) => Ok(ReadSlot::FileB(raddr::DMA_WAIT)),
            _ => Err(CompileError::UnsupportedInstruction {
                target: "vc4",
                mnemonic: format!("read of {}", reg.dump()),
            }),
        },
        _ => Err(CompileError::invariant(format!(
            "vc4: unallocated source register {}",
            reg.dump()
        ))),
    }
}

fn classify_dest(reg: Reg) -> CompileResult<WriteSlot> {
    match reg.tag {
        RegTag::RegA => Ok(WriteSlot::FileA(reg.id as u8)),
        RegTag::RegB => Ok(WriteSlot::FileB(reg.id as u8)),
        RegTag::Acc => match reg.id {
            0..=3 => Ok(WriteSlot::Either(waddr::ACC0 + reg.id as u8)),
            5 => Ok(WriteSlot::Either(37)),
            _ => Err(CompileError::invariant(format!(
                "vc4: accumulator r{} is not writable",
                reg.id
            ))),
        },
        RegTag::None => Ok(WriteSlot::Either(waddr::NOP)),
        RegTag::Special => match reg.as_special() {
            Some(Special::VpmWrite) => Ok(WriteSlot::Either(waddr::VPM_WRITE)),
            Some(Special::RdSetup) => Ok(WriteSlot::SpecialA(waddr::VPM_SETUP)),
            Some(Special::WrSetup) => Ok(WriteSlot::SpecialB(waddr::VPM_SETUP)),
            Some(Special::DmaLdAddr) => Ok(WriteSlot::SpecialA(waddr::DMA_ADDR)),
            Some(Special::DmaStAddr) => Ok(WriteSlot::SpecialB(waddr::DMA_ADDR)),
            Some(Special::SfuRecip) => Ok(WriteSlot::Either(waddr::SFU_RECIP)),
            Some(Special::SfuRecipSqrt) => Ok(WriteSlot::Either(waddr::SFU_RECIPSQRT)),
            Some(Special::SfuExp) => Ok(WriteSlot::Either(waddr::SFU_EXP)),
            Some(Special::SfuLog) => Ok(WriteSlot::Either(waddr::SFU_LOG)),
            Some(Special::Tmu0S) => Ok(WriteSlot::Either(waddr::TMU0_S)),
            _ => Err(CompileError::UnsupportedInstruction {
                target: "vc4",
                mnemonic: format!("write of {}", reg.dump()),
            }),
        },
        _ => Err(CompileError::invariant(format!(
            "vc4: unallocated destination register {}",
            reg.dump()
        ))),
    }
}

fn classify_operand(src: &RegOrImm) -> CompileResult<ReadSlot> {
    if src.is_reg() {
        classify_src(src.reg())
    } else {
        let code = src.imm().val;
        if !(0..=47).contains(&code) {
            return Err(CompileError::invariant(format!(
                "vc4: small literal code {code} out of range"
            )));
        }
        Ok(ReadSlot::SmallImm(code as u8))
    }
}

// ============================================================================
// Opcode translation
// ============================================================================

fn add_alu_code(op: AluOp) -> Option<u64> {
    Some(match op {
        AluOp::Add => add_op::ADD,
        AluOp::Sub => add_op::SUB,
        AluOp::Shr => add_op::SHR,
        AluOp::Asr => add_op::ASR,
        AluOp::Ror => add_op::ROR,
        AluOp::Shl => add_op::SHL,
        AluOp::Min => add_op::MIN,
        AluOp::Max => add_op::MAX,
        AluOp::BAnd => add_op::AND,
        AluOp::BOr => add_op::OR,
        AluOp::BXor => add_op::XOR,
        AluOp::BNot => add_op::NOT,
        AluOp::FAdd => add_op::FADD,
        AluOp::FSub => add_op::FSUB,
        AluOp::FMin => add_op::FMIN,
        AluOp::FMax => add_op::FMAX,
        AluOp::FtoI => add_op::FTOI,
        AluOp::ItoF => add_op::ITOF,
        _ => return None,
    })
}

/// Vector rotate: a MUL-ALU move with the rotate distance on read port B.
fn encode_rotate(alu: &AluInstr) -> CompileResult<Vc4Instr> {
    let dst = classify_dest(alu.dest)?;
    let src = classify_operand(&alu.src_a)?;

    let rot_code = if alu.src_b.is_reg() {
        let r = alu.src_b.reg();
        if r != crate::core::reg::ACC5 {
            return Err(CompileError::invariant(
                "vc4: variable rotate amount must be in r5",
            ));
        }
        SMALL_LIT_ROT_R5 as u8
    } else {
        let n = alu.src_b.imm().val;
        if !(1..=15).contains(&n) {
            return Err(CompileError::invariant(format!(
                "vc4: rotate amount {n} out of range 1..=15"
            )));
        }
        (SMALL_LIT_ROT_R5 + n) as u8
    };

    if matches!(src, ReadSlot::FileB(_)) {
        return Err(CompileError::invariant(
            "vc4: rotate source cannot come from file B",
        ));
    }

    let mut i = Vc4Instr::nop().alu_mul_set(mul_op::V8MIN, alu.cond, dst, src, src)?;
    // the rotate distance lives in raddr_b with the small-imm signal
    i.set_rotate_code(rot_code)?;
    i.set_flags(alu.set_cond);
    Ok(i)
}

fn encode_alu(instr: &Instr) -> CompileResult<Vc4Instr> {
    let InstrKind::Alu(alu) = &instr.kind else {
        return Err(CompileError::invariant("encode_alu on non-ALU"));
    };

    if alu.op.is_rot() {
        return encode_rotate(alu);
    }

    let dst = classify_dest(alu.dest)?;
    let a = classify_operand(&alu.src_a)?;
    let b = classify_operand(&alu.src_b)?;

    let mut i = match alu.op {
        AluOp::FMul => Vc4Instr::nop().alu_mul_set(mul_op::FMUL, alu.cond, dst, a, b)?,
        AluOp::Mul24 => Vc4Instr::nop().alu_mul_set(mul_op::MUL24, alu.cond, dst, a, b)?,
        op => {
            let code = add_alu_code(op).ok_or_else(|| CompileError::UnsupportedInstruction {
                target: "vc4",
                mnemonic: op.mnemonic().into(),
            })?;
            Vc4Instr::nop().alu_add_set(code, alu.cond, dst, a, b)?
        }
    };
    i.set_flags(alu.set_cond);
    Ok(i)
}

fn encode_load_imm(instr: &Instr) -> CompileResult<Vc4Instr> {
    let InstrKind::LoadImm { set_cond, cond, dest, imm } = &instr.kind else {
        return Err(CompileError::invariant("encode_load_imm on non-LI"));
    };
    let dst = classify_dest(*dest)?;
    let mut i = match imm {
        Imm::Int32(v) => Vc4Instr::load_imm32(*cond, dst, *v as u32)?,
        Imm::Float32(v) => Vc4Instr::load_imm32(*cond, dst, v.to_bits())?,
        Imm::Mask(m) => Vc4Instr::load_imm_mask(*cond, dst, *m)?,
    };
    i.set_flags(*set_cond);
    Ok(i)
}

// ============================================================================
// Main loop
// ============================================================================

fn encode_instr(instr: &Instr) -> CompileResult<Vec<Vc4Instr>> {
    let mut ret = match &instr.kind {
        InstrKind::Branch { .. } => {
            return Err(CompileError::invariant(
                "not expecting BR; branch creation goes through BRL",
            ))
        }
        InstrKind::Label(l) => vec![Vc4Instr::label_meta(*l)],
        InstrKind::BranchLabel { cond, label } => vec![Vc4Instr::branch(*cond, *label)?],
        InstrKind::LoadImm { .. } => vec![encode_load_imm(instr)?],
        InstrKind::Alu(_) => vec![encode_alu(instr)?],
        InstrKind::NoOp => vec![Vc4Instr::nop()],
        InstrKind::End => {
            // program end signal, then two slots to let it take effect
            vec![
                Vc4Instr::nop().with_sig(sig::PROG_END)?,
                Vc4Instr::nop(),
                Vc4Instr::nop(),
            ]
        }
        InstrKind::DmaLoadWait => {
            // reading the VPM load-wait address stalls until the DMA completes
            vec![Vc4Instr::nop().alu_add_set(
                add_op::OR,
                crate::core::AssignCond::Always,
                WriteSlot::Either(waddr::NOP),
                ReadSlot::FileA(raddr::DMA_WAIT),
                ReadSlot::FileA(raddr::DMA_WAIT),
            )?]
        }
        InstrKind::DmaStoreWait => {
            vec![Vc4Instr::nop().alu_add_set(
                add_op::OR,
                crate::core::AssignCond::Always,
                WriteSlot::Either(waddr::NOP),
                ReadSlot::FileB(raddr::DMA_WAIT),
                ReadSlot::FileB(raddr::DMA_WAIT),
            )?]
        }
        InstrKind::SemaInc(id) => vec![Vc4Instr::semaphore(false, *id)?],
        InstrKind::SemaDec(id) => vec![Vc4Instr::semaphore(true, *id)?],
        InstrKind::Recv { dest } => {
            // receive the TMU result from r4
            vec![Vc4Instr::nop()
                .alu_add_set(
                    add_op::OR,
                    crate::core::AssignCond::Always,
                    classify_dest(*dest)?,
                    ReadSlot::Acc(4),
                    ReadSlot::Acc(4),
                )?
                .with_sig(sig::LOAD_TMU0)?]
        }
        InstrKind::Tmu0ToAcc4 => vec![Vc4Instr::nop().with_sig(sig::LOAD_TMU0)?],
        InstrKind::InitBegin | InstrKind::InitEnd => vec![],
        InstrKind::Tmuwt => {
            return Err(CompileError::UnsupportedInstruction {
                target: "vc4",
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

/// Patch branch offsets and drop the label metas.
///
/// Branches take effect after their three delay slots; offsets are relative
/// to the fourth instruction after the branch.
pub fn remove_labels(instrs: Vec<Vc4Instr>) -> CompileResult<Vec<Vc4Instr>> {
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

/// Full back-end encode: translate, resolve labels.
pub fn encode(instrs: &InstrList) -> CompileResult<Vec<Vc4Instr>> {
    let mut out = Vec::with_capacity(instrs.len());
    for instr in instrs.iter() {
        instr.check_platform(true)?;
        out.extend(encode_instr(instr)?);
    }
    remove_labels(out)
}

/// The packed opcode stream.
pub fn to_opcodes(instrs: &[Vc4Instr]) -> Vec<u64> {
    instrs.iter().map(|i| i.code()).collect()
}

pub fn mnemonics(instrs: &[Vc4Instr], with_comments: bool) -> String {
    let mut out = String::new();
    for (i, instr) in instrs.iter().enumerate() {
        out.push_str(&format!("{i:4}: {}\n", instr.mnemonic(with_comments)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cond::{AssignCond, BranchCond, Flag};
    use crate::core::reg::{SmallImm, ACC4, QPU_ID, UNIFORM};

    fn a(id: u32) -> Reg {
        Reg::new(RegTag::RegA, id)
    }

    fn b(id: u32) -> Reg {
        Reg::new(RegTag::RegB, id)
    }

    #[test]
    fn straight_line_program() {
        let mut l = InstrList::new();
        l.push(Instr::li(a(0), Imm::Int32(100)));
        l.push(Instr::li(b(0), Imm::Int32(200)));
        l.push(Instr::alu(a(1), a(0), AluOp::Add, b(0)));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        // li, li, add, end + 2 tail nops
        assert_eq!(out.len(), 4 + PROGRAM_TAIL_LEN);
        assert_eq!(out[0].sig(), sig::LOAD_IMM);
        assert_eq!(out[0].imm32(), 100);
        assert_eq!(out[2].op_add(), add_op::ADD);
        assert_eq!(out[3].sig(), sig::PROG_END);
    }

    #[test]
    fn uniform_read_shares_port() {
        let mut l = InstrList::new();
        l.push(Instr::mov(a(0), UNIFORM));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        assert_eq!(out[0].raddr_a(), raddr::UNIFORM);
        assert_eq!(out[0].op_add(), add_op::OR);
    }

    #[test]
    fn qpu_num_reads_port_b_index() {
        let mut l = InstrList::new();
        l.push(Instr::mov(a(0), QPU_ID));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        assert_eq!(out[0].raddr_b(), raddr::INDEX);
    }

    #[test]
    fn small_literal_operand() {
        let mut l = InstrList::new();
        l.push(Instr::alu(a(0), a(1), AluOp::Add, RegOrImm::Imm(SmallImm::new(4))));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        assert_eq!(out[0].sig(), sig::SMALL_IMM);
        assert_eq!(out[0].raddr_b(), 4);
    }

    #[test]
    fn rotate_uses_small_literal_space() {
        let mut l = InstrList::new();
        l.push(Instr::alu(Reg::acc(1), Reg::acc(0), AluOp::Rotate, RegOrImm::Imm(SmallImm::new(3))));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        assert_eq!(out[0].sig(), sig::SMALL_IMM);
        assert_eq!(out[0].raddr_b(), (SMALL_LIT_ROT_R5 + 3) as u8);
        assert_eq!(out[0].op_mul(), mul_op::V8MIN);
    }

    #[test]
    fn backward_branch_negative_offset() {
        let mut l = InstrList::new();
        l.push(Instr::label(0));
        l.push(Instr::mov(a(0), a(1)));
        l.push(Instr::branch(BranchCond::Any(Flag::Zc), 0));
        l.push(Instr::nop());
        l.push(Instr::nop());
        l.push(Instr::nop());
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        let br = &out[1];
        assert!(br.is_branch());
        assert_eq!(br.branch_offset(), 8 * (0 - (1 + 4)));
    }

    #[test]
    fn unresolved_label_fails() {
        let mut l = InstrList::new();
        l.push(Instr::branch(BranchCond::Always, 5));
        l.push(Instr::end());

        match encode(&l) {
            Err(CompileError::UnresolvedLabel(5)) => {}
            other => panic!("expected UnresolvedLabel, got {other:?}"),
        }
    }

    #[test]
    fn sfu_sequence_encodes_as_writes_and_r4_read() {
        let mut l = InstrList::new();
        l.push(Instr::mov(crate::core::reg::SFU_RECIP, a(0)));
        l.push(Instr::nop());
        l.push(Instr::nop());
        l.push(Instr::mov(a(1), ACC4));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        assert_eq!(out[0].waddr_add(), waddr::SFU_RECIP);
        assert_eq!(out[1].code(), super::super::instr::NOP_WORD);
        // the read of r4 uses the accumulator mux, no register port
        assert_eq!(out[3].raddr_a(), raddr::NOP);
    }

    #[test]
    fn dma_waits_read_the_stall_addresses() {
        let mut l = InstrList::new();
        l.push(Instr::new(InstrKind::DmaLoadWait));
        l.push(Instr::new(InstrKind::DmaStoreWait));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        assert_eq!(out[0].raddr_a(), raddr::DMA_WAIT);
        assert_eq!(out[1].raddr_b(), raddr::DMA_WAIT);
        assert_eq!(out[0].waddr_add(), waddr::NOP);
    }

    #[test]
    fn semaphores_encode() {
        let mut l = InstrList::new();
        l.push(Instr::new(InstrKind::SemaInc(2)));
        l.push(Instr::new(InstrKind::SemaDec(2)));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        assert_eq!(out[0].sig(), sig::LOAD_IMM);
        assert_eq!(out[0].imm32(), 2);
        assert_eq!(out[1].imm32(), 0x12);
    }

    #[test]
    fn tmuwt_is_rejected_on_vc4() {
        let mut l = InstrList::new();
        l.push(Instr::tmuwt());

        match encode(&l) {
            Err(CompileError::UnsupportedInstruction { target: "vc4", .. }) => {}
            other => panic!("expected UnsupportedInstruction, got {other:?}"),
        }
    }

    #[test]
    fn mask_load_uses_per_element_format() {
        let mut l = InstrList::new();
        l.push(Instr::li(a(0), Imm::Mask(0b101)));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        assert_eq!(out[0].sig(), sig::LOAD_IMM);
        assert_eq!(out[0].imm32(), 0b101);
    }

    #[test]
    fn where_cond_sets_cond_field() {
        let mut l = InstrList::new();
        l.push(Instr::li(a(0), Imm::Int32(1)).with_cond(AssignCond::Flag(Flag::Zs)));
        l.push(Instr::end());

        let out = encode(&l).unwrap();
        assert_eq!(out[0].cond_add(), super::super::instr::cond::ZS);
    }
}
