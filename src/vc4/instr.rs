//! The vc4 64-bit instruction word.
//!
//! vc4 has four word formats, selected by the signal nibble: ALU (with or
//! without a small immediate on read port B), load immediate / semaphore,
//! and branch. Words are built by mutating fields of the canonical NOP.
//!
//! Reads go through two register-file ports (raddr_a for file A, raddr_b
//! for file B) plus the accumulator muxes; writes go through one write
//! address per ALU, with the `ws` bit swapping which ALU writes which file.

use crate::core::{AssignCond, BranchCond, CompileError, CompileResult, Flag, SetCond};
use crate::core::instr::Label;

/// Canonical "nop ; nop" encoding.
pub const NOP_WORD: u64 = 0x1000_09e7_009e_7000;

// Field positions (hi, lo).
const F_SIG: (u32, u32) = (63, 60);
const F_LI_TYPE: (u32, u32) = (59, 57);
const F_COND_ADD: (u32, u32) = (51, 49);
const F_COND_MUL: (u32, u32) = (48, 46);
const F_SF: (u32, u32) = (45, 45);
const F_WS: (u32, u32) = (44, 44);
const F_WADDR_ADD: (u32, u32) = (43, 38);
const F_WADDR_MUL: (u32, u32) = (37, 32);
const F_OP_MUL: (u32, u32) = (31, 29);
const F_OP_ADD: (u32, u32) = (28, 24);
const F_RADDR_A: (u32, u32) = (23, 18);
const F_RADDR_B: (u32, u32) = (17, 12);
const F_MUX_ADD_A: (u32, u32) = (11, 9);
const F_MUX_ADD_B: (u32, u32) = (8, 6);
const F_MUX_MUL_A: (u32, u32) = (5, 3);
const F_MUX_MUL_B: (u32, u32) = (2, 0);
const F_IMM32: (u32, u32) = (31, 0);

// Branch format.
const F_BR_COND: (u32, u32) = (55, 52);
const F_BR_REL: (u32, u32) = (51, 51);

/// Signal nibble values.
pub mod sig {
    pub const NONE: u64 = 1;
    pub const THREAD_SWITCH: u64 = 2;
    pub const PROG_END: u64 = 3;
    pub const LOAD_TMU0: u64 = 10;
    pub const SMALL_IMM: u64 = 13;
    pub const LOAD_IMM: u64 = 14;
    pub const BRANCH: u64 = 15;
}

/// ADD-ALU opcodes.
pub mod add_op {
    pub const NOP: u64 = 0;
    pub const FADD: u64 = 1;
    pub const FSUB: u64 = 2;
    pub const FMIN: u64 = 3;
    pub const FMAX: u64 = 4;
    pub const FTOI: u64 = 7;
    pub const ITOF: u64 = 8;
    pub const ADD: u64 = 12;
    pub const SUB: u64 = 13;
    pub const SHR: u64 = 14;
    pub const ASR: u64 = 15;
    pub const ROR: u64 = 16;
    pub const SHL: u64 = 17;
    pub const MIN: u64 = 18;
    pub const MAX: u64 = 19;
    pub const AND: u64 = 20;
    pub const OR: u64 = 21;
    pub const XOR: u64 = 22;
    pub const NOT: u64 = 23;
}

/// MUL-ALU opcodes.
pub mod mul_op {
    pub const NOP: u64 = 0;
    pub const FMUL: u64 = 1;
    pub const MUL24: u64 = 2;
    /// Used as the carrier op for vector rotates.
    pub const V8MIN: u64 = 4;
}

/// Assign-condition codes.
pub mod cond {
    pub const NEVER: u64 = 0;
    pub const ALWAYS: u64 = 1;
    pub const ZS: u64 = 2;
    pub const ZC: u64 = 3;
    pub const NS: u64 = 4;
    pub const NC: u64 = 5;
}

/// Load-immediate subformats (bits 59:57 of a LOAD_IMM word).
pub mod li_type {
    pub const IMM32: u64 = 0;
    pub const PER_ELEMENT_UNSIGNED: u64 = 3;
    pub const SEMAPHORE: u64 = 4;
}

/// Read addresses beyond the register files.
pub mod raddr {
    pub const UNIFORM: u8 = 32;
    /// ELEM_NUM on port A, QPU_NUM on port B.
    pub const INDEX: u8 = 38;
    pub const NOP: u8 = 39;
    pub const VPM_READ: u8 = 48;
    /// DMA load wait on port A, DMA store wait on port B.
    pub const DMA_WAIT: u8 = 50;
}

/// Write addresses beyond the register files.
pub mod waddr {
    pub const ACC0: u8 = 32;
    pub const NOP: u8 = 39;
    pub const VPM_WRITE: u8 = 48;
    /// VPM read setup on file A, write setup on file B.
    pub const VPM_SETUP: u8 = 49;
    /// DMA load address on file A, store address on file B.
    pub const DMA_ADDR: u8 = 50;
    pub const SFU_RECIP: u8 = 52;
    pub const SFU_RECIPSQRT: u8 = 53;
    pub const SFU_EXP: u8 = 54;
    pub const SFU_LOG: u8 = 55;
    pub const TMU0_S: u8 = 56;
}

// Accumulator muxes are 0..5; these select the file ports.
const MUX_A: u64 = 6;
const MUX_B: u64 = 7;

fn get_field(word: u64, (hi, lo): (u32, u32)) -> u64 {
    (word >> lo) & ((1u64 << (hi - lo + 1)) - 1)
}

fn set_field(word: &mut u64, (hi, lo): (u32, u32), val: u64) {
    let mask = ((1u64 << (hi - lo + 1)) - 1) << lo;
    debug_assert_eq!(val & !((1u64 << (hi - lo + 1)) - 1), 0, "field overflow");
    *word = (*word & !mask) | ((val << lo) & mask);
}

pub fn assign_cond_code(cond: AssignCond) -> u64 {
    match cond {
        AssignCond::Always => cond::ALWAYS,
        AssignCond::Never => cond::NEVER,
        AssignCond::Flag(Flag::Zs) => cond::ZS,
        AssignCond::Flag(Flag::Zc) => cond::ZC,
        AssignCond::Flag(Flag::Ns) => cond::NS,
        AssignCond::Flag(Flag::Nc) => cond::NC,
    }
}

pub fn branch_cond_code(cond: BranchCond) -> CompileResult<u64> {
    Ok(match cond {
        BranchCond::All(Flag::Zs) => 0,
        BranchCond::All(Flag::Zc) => 1,
        BranchCond::Any(Flag::Zs) => 2,
        BranchCond::Any(Flag::Zc) => 3,
        BranchCond::All(Flag::Ns) => 4,
        BranchCond::All(Flag::Nc) => 5,
        BranchCond::Any(Flag::Ns) => 6,
        BranchCond::Any(Flag::Nc) => 7,
        BranchCond::Always => 15,
        BranchCond::Never => {
            return Err(CompileError::invariant("vc4: branch condition NEVER"))
        }
    })
}

/// Where a value is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSlot {
    /// Accumulator r0..r5; no register port needed.
    Acc(u8),
    /// Register file A only.
    FileA(u8),
    /// Register file B only.
    FileB(u8),
    /// Address valid on either port (uniforms, VPM read).
    AnyFile(u8),
    /// Small immediate on port B (also carries the rotate space).
    SmallImm(u8),
}

/// Where a value is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSlot {
    /// Register file A slot.
    FileA(u8),
    /// Register file B slot.
    FileB(u8),
    /// Write address valid on either file (accumulators, SFU, TMU, VPM).
    Either(u8),
    /// Write address that exists on file A only (e.g. DMA load address).
    SpecialA(u8),
    /// Write address that exists on file B only (e.g. DMA store address).
    SpecialB(u8),
}

/// One encoded vc4 instruction plus label metadata and listing text.
#[derive(Debug, Clone)]
pub struct Vc4Instr {
    word: u64,
    raddr_a_used: bool,
    raddr_b_used: bool,
    raddr_b_is_imm: bool,
    is_label: bool,
    label: Option<Label>,
    branch_label: Option<Label>,
    header: Option<String>,
    comment: Option<String>,
}

impl Vc4Instr {
    fn from_word(word: u64) -> Vc4Instr {
        Vc4Instr {
            word,
            raddr_a_used: false,
            raddr_b_used: false,
            raddr_b_is_imm: false,
            is_label: false,
            label: None,
            branch_label: None,
            header: None,
            comment: None,
        }
    }

    pub fn nop() -> Vc4Instr {
        Vc4Instr::from_word(NOP_WORD)
    }

    pub fn label_meta(label: Label) -> Vc4Instr {
        let mut i = Vc4Instr::nop();
        i.is_label = true;
        i.label = Some(label);
        i
    }

    pub fn code(&self) -> u64 {
        self.word
    }

    pub fn is_label(&self) -> bool {
        self.is_label
    }

    pub fn label(&self) -> Option<Label> {
        self.label
    }

    pub fn branch_label(&self) -> Option<Label> {
        self.branch_label
    }

    pub fn sig(&self) -> u64 {
        get_field(self.word, F_SIG)
    }

    pub fn op_add(&self) -> u64 {
        get_field(self.word, F_OP_ADD)
    }

    pub fn op_mul(&self) -> u64 {
        get_field(self.word, F_OP_MUL)
    }

    pub fn cond_add(&self) -> u64 {
        get_field(self.word, F_COND_ADD)
    }

    pub fn cond_mul(&self) -> u64 {
        get_field(self.word, F_COND_MUL)
    }

    pub fn waddr_add(&self) -> u8 {
        get_field(self.word, F_WADDR_ADD) as u8
    }

    pub fn waddr_mul(&self) -> u8 {
        get_field(self.word, F_WADDR_MUL) as u8
    }

    pub fn ws(&self) -> bool {
        get_field(self.word, F_WS) == 1
    }

    pub fn raddr_a(&self) -> u8 {
        get_field(self.word, F_RADDR_A) as u8
    }

    pub fn raddr_b(&self) -> u8 {
        get_field(self.word, F_RADDR_B) as u8
    }

    pub fn imm32(&self) -> u32 {
        get_field(self.word, F_IMM32) as u32
    }

    pub fn is_branch(&self) -> bool {
        !self.is_label && self.sig() == sig::BRANCH
    }

    // ==================================================
    // Listing text
    // ==================================================

    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn set_header(&mut self, msg: impl Into<String>) {
        self.header = Some(msg.into());
    }

    pub fn add_comment(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        match &mut self.comment {
            Some(c) => {
                c.push_str("; ");
                c.push_str(&msg);
            }
            None => self.comment = Some(msg),
        }
    }

    pub fn with_comment(mut self, msg: impl Into<String>) -> Vc4Instr {
        self.add_comment(msg);
        self
    }

    // ==================================================
    // Signals
    // ==================================================

    pub fn with_sig(mut self, code: u64) -> CompileResult<Vc4Instr> {
        let current = self.sig();
        if current != sig::NONE && current != code {
            return Err(CompileError::invariant(format!(
                "vc4: conflicting signals {current} and {code} in one instruction"
            )));
        }
        set_field(&mut self.word, F_SIG, code);
        Ok(self)
    }

    // ==================================================
    // Operand routing
    // ==================================================

    fn route_src(&mut self, slot: ReadSlot) -> CompileResult<u64> {
        let claim_a = |i: &mut Vc4Instr, addr: u8| {
            set_field(&mut i.word, F_RADDR_A, addr as u64);
            i.raddr_a_used = true;
            MUX_A
        };
        let claim_b = |i: &mut Vc4Instr, addr: u8| {
            set_field(&mut i.word, F_RADDR_B, addr as u64);
            i.raddr_b_used = true;
            MUX_B
        };

        let a_free_or = |i: &Vc4Instr, addr: u8| !i.raddr_a_used || i.raddr_a() == addr;
        let b_free_or =
            |i: &Vc4Instr, addr: u8| (!i.raddr_b_used || (!i.raddr_b_is_imm && i.raddr_b() == addr));

        match slot {
            ReadSlot::Acc(n) => Ok(n as u64),
            ReadSlot::FileA(addr) => {
                if a_free_or(self, addr) {
                    Ok(claim_a(self, addr))
                } else {
                    Err(CompileError::invariant(format!(
                        "vc4: both operands need register file A (slot {addr})"
                    )))
                }
            }
            ReadSlot::FileB(addr) => {
                if b_free_or(self, addr) {
                    Ok(claim_b(self, addr))
                } else {
                    Err(CompileError::invariant(format!(
                        "vc4: both operands need register file B (slot {addr})"
                    )))
                }
            }
            ReadSlot::AnyFile(addr) => {
                if self.raddr_a_used && self.raddr_a() == addr {
                    Ok(MUX_A)
                } else if self.raddr_b_used && !self.raddr_b_is_imm && self.raddr_b() == addr {
                    Ok(MUX_B)
                } else if !self.raddr_a_used {
                    Ok(claim_a(self, addr))
                } else if !self.raddr_b_used {
                    Ok(claim_b(self, addr))
                } else {
                    Err(CompileError::invariant(
                        "vc4: no free read port for special source",
                    ))
                }
            }
            ReadSlot::SmallImm(code) => {
                if self.sig() == sig::SMALL_IMM {
                    if self.raddr_b() == code {
                        return Ok(MUX_B);
                    }
                    return Err(CompileError::invariant(
                        "vc4: two different small immediates in one instruction",
                    ));
                }
                if self.raddr_b_used {
                    return Err(CompileError::invariant(
                        "vc4: small immediate conflicts with file-B read",
                    ));
                }
                set_field(&mut self.word, F_SIG, sig::SMALL_IMM);
                set_field(&mut self.word, F_RADDR_B, code as u64);
                self.raddr_b_used = true;
                self.raddr_b_is_imm = true;
                Ok(MUX_B)
            }
        }
    }

    fn set_write(&mut self, via_add: bool, dst: WriteSlot) -> CompileResult<()> {
        // ws == 0: the ADD ALU writes file A and the MUL ALU writes file B.
        let (waddr_field, ws) = match (via_add, dst) {
            (true, WriteSlot::FileA(a)) | (true, WriteSlot::SpecialA(a)) => (a, 0),
            (true, WriteSlot::FileB(a)) | (true, WriteSlot::SpecialB(a)) => (a, 1),
            (false, WriteSlot::FileA(a)) | (false, WriteSlot::SpecialA(a)) => (a, 1),
            (false, WriteSlot::FileB(a)) | (false, WriteSlot::SpecialB(a)) => (a, 0),
            (_, WriteSlot::Either(a)) => (a, get_field(self.word, F_WS) as u8),
        };

        if !matches!(dst, WriteSlot::Either(_)) {
            let current_ws = get_field(self.word, F_WS) as u8;
            if (self.waddr_add() != waddr::NOP || self.waddr_mul() != waddr::NOP) && current_ws != ws
            {
                return Err(CompileError::invariant(
                    "vc4: conflicting write-swap requirements",
                ));
            }
            set_field(&mut self.word, F_WS, ws as u64);
        }

        let field = if via_add { F_WADDR_ADD } else { F_WADDR_MUL };
        set_field(&mut self.word, field, waddr_field as u64);
        Ok(())
    }

    /// Fill in the ADD-ALU half.
    pub fn alu_add_set(
        mut self,
        op: u64,
        cond: AssignCond,
        dst: WriteSlot,
        a: ReadSlot,
        b: ReadSlot,
    ) -> CompileResult<Vc4Instr> {
        set_field(&mut self.word, F_OP_ADD, op);
        set_field(&mut self.word, F_COND_ADD, assign_cond_code(cond));
        self.set_write(true, dst)?;
        let mux_a = self.route_src(a)?;
        let mux_b = self.route_src(b)?;
        set_field(&mut self.word, F_MUX_ADD_A, mux_a);
        set_field(&mut self.word, F_MUX_ADD_B, mux_b);
        Ok(self)
    }

    /// Fill in the MUL-ALU half.
    pub fn alu_mul_set(
        mut self,
        op: u64,
        cond: AssignCond,
        dst: WriteSlot,
        a: ReadSlot,
        b: ReadSlot,
    ) -> CompileResult<Vc4Instr> {
        set_field(&mut self.word, F_OP_MUL, op);
        set_field(&mut self.word, F_COND_MUL, assign_cond_code(cond));
        self.set_write(false, dst)?;
        let mux_a = self.route_src(a)?;
        let mux_b = self.route_src(b)?;
        set_field(&mut self.word, F_MUX_MUL_A, mux_a);
        set_field(&mut self.word, F_MUX_MUL_B, mux_b);
        Ok(self)
    }

    /// Place a vector-rotate code (48 + n, or 48 for rotate-by-r5) on read
    /// port B. The rotate source must not occupy the port.
    pub fn set_rotate_code(&mut self, code: u8) -> CompileResult<()> {
        if self.raddr_b_used {
            return Err(CompileError::invariant(
                "vc4: rotate needs read port B but it is in use",
            ));
        }
        let current = self.sig();
        if current != sig::NONE {
            return Err(CompileError::invariant(
                "vc4: rotate conflicts with an existing signal",
            ));
        }
        set_field(&mut self.word, F_SIG, sig::SMALL_IMM);
        set_field(&mut self.word, F_RADDR_B, code as u64);
        self.raddr_b_used = true;
        self.raddr_b_is_imm = true;
        Ok(())
    }

    pub fn set_flags(&mut self, sc: SetCond) {
        if sc.flags_set() {
            set_field(&mut self.word, F_SF, 1);
        }
    }

    pub fn sf(&self) -> bool {
        get_field(self.word, F_SF) == 1
    }

    // ==================================================
    // Load immediate / semaphore
    // ==================================================

    /// A 32-bit load immediate through the ADD write port.
    pub fn load_imm32(cond: AssignCond, dst: WriteSlot, value: u32) -> CompileResult<Vc4Instr> {
        let mut i = Vc4Instr::nop();
        set_field(&mut i.word, F_SIG, sig::LOAD_IMM);
        set_field(&mut i.word, F_LI_TYPE, li_type::IMM32);
        set_field(&mut i.word, F_COND_ADD, assign_cond_code(cond));
        set_field(&mut i.word, F_COND_MUL, cond::NEVER);
        i.set_write(true, dst)?;
        set_field(&mut i.word, F_WADDR_MUL, waddr::NOP as u64);
        set_field(&mut i.word, F_IMM32, value as u64);
        Ok(i)
    }

    /// Per-element load: lane n receives bit n of `mask` (0 or 1).
    pub fn load_imm_mask(cond: AssignCond, dst: WriteSlot, mask: u16) -> CompileResult<Vc4Instr> {
        let mut i = Vc4Instr::load_imm32(cond, dst, mask as u32)?;
        set_field(&mut i.word, F_LI_TYPE, li_type::PER_ELEMENT_UNSIGNED);
        Ok(i)
    }

    /// Semaphore up/down.
    pub fn semaphore(down: bool, sema_id: u8) -> CompileResult<Vc4Instr> {
        if sema_id > 15 {
            return Err(CompileError::invariant(format!(
                "vc4: semaphore id {sema_id} out of range"
            )));
        }
        let mut i = Vc4Instr::nop();
        set_field(&mut i.word, F_SIG, sig::LOAD_IMM);
        set_field(&mut i.word, F_LI_TYPE, li_type::SEMAPHORE);
        set_field(&mut i.word, F_COND_ADD, cond::NEVER);
        set_field(&mut i.word, F_COND_MUL, cond::NEVER);
        set_field(&mut i.word, F_IMM32, ((down as u64) << 4) | sema_id as u64);
        Ok(i)
    }

    // ==================================================
    // Branches
    // ==================================================

    /// A PC-relative branch; the offset is patched by the label resolver.
    pub fn branch(cond: BranchCond, label: Label) -> CompileResult<Vc4Instr> {
        let mut i = Vc4Instr::from_word(0);
        set_field(&mut i.word, F_SIG, sig::BRANCH);
        set_field(&mut i.word, F_BR_COND, branch_cond_code(cond)?);
        set_field(&mut i.word, F_BR_REL, 1);
        set_field(&mut i.word, F_WADDR_ADD, waddr::NOP as u64);
        set_field(&mut i.word, F_WADDR_MUL, waddr::NOP as u64);
        i.branch_label = Some(label);
        Ok(i)
    }

    pub fn label_to_target(&mut self, offset_bytes: i32) {
        set_field(&mut self.word, F_IMM32, offset_bytes as u32 as u64);
        self.branch_label = None;
    }

    pub fn branch_offset(&self) -> i32 {
        self.imm32() as i32
    }

    // ==================================================
    // Listing
    // ==================================================

    pub fn mnemonic(&self, with_comments: bool) -> String {
        let body = if self.is_label {
            format!("L{}:", self.label.unwrap_or(0))
        } else if self.is_branch() {
            match self.branch_label {
                Some(l) => format!("br L{l}"),
                None => format!("br {}", self.branch_offset()),
            }
        } else if self.sig() == sig::LOAD_IMM {
            format!("li[{:#010x}]", self.imm32())
        } else {
            let mut s = format!("op_add[{}] ; op_mul[{}]", self.op_add(), self.op_mul());
            if self.sig() != sig::NONE {
                s.push_str(&format!(" sig[{}]", self.sig()));
            }
            s
        };

        if with_comments {
            let mut out = String::new();
            if let Some(h) = &self.header {
                out.push_str(&format!("# {h}\n"));
            }
            out.push_str(&format!("{:#018x}  {}", self.word, body));
            if let Some(c) = &self.comment {
                out.push_str(&format!("  # {c}"));
            }
            out
        } else {
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_is_canonical() {
        assert_eq!(Vc4Instr::nop().code(), 0x1000_09e7_009e_7000);
    }

    #[test]
    fn nop_field_decomposition() {
        let n = Vc4Instr::nop();
        assert_eq!(n.sig(), sig::NONE);
        assert_eq!(n.op_add(), add_op::NOP);
        assert_eq!(n.op_mul(), mul_op::NOP);
        assert_eq!(n.cond_add(), cond::NEVER);
        assert_eq!(n.waddr_add(), waddr::NOP);
        assert_eq!(n.waddr_mul(), waddr::NOP);
        assert_eq!(n.raddr_a(), raddr::NOP);
        assert_eq!(n.raddr_b(), raddr::NOP);
    }

    #[test]
    fn add_routes_one_operand_per_file() {
        let i = Vc4Instr::nop()
            .alu_add_set(
                add_op::ADD,
                AssignCond::Always,
                WriteSlot::FileA(3),
                ReadSlot::FileA(0),
                ReadSlot::FileB(1),
            )
            .unwrap();
        assert_eq!(i.op_add(), add_op::ADD);
        assert_eq!(i.cond_add(), cond::ALWAYS);
        assert_eq!(i.raddr_a(), 0);
        assert_eq!(i.raddr_b(), 1);
        assert_eq!(i.waddr_add(), 3);
        assert!(!i.ws());
    }

    #[test]
    fn two_file_a_reads_are_rejected() {
        let r = Vc4Instr::nop().alu_add_set(
            add_op::ADD,
            AssignCond::Always,
            WriteSlot::FileA(3),
            ReadSlot::FileA(0),
            ReadSlot::FileA(1),
        );
        assert!(r.is_err());
    }

    #[test]
    fn same_file_a_slot_is_shared() {
        let i = Vc4Instr::nop()
            .alu_add_set(
                add_op::OR,
                AssignCond::Always,
                WriteSlot::FileA(3),
                ReadSlot::FileA(5),
                ReadSlot::FileA(5),
            )
            .unwrap();
        assert_eq!(i.raddr_a(), 5);
        assert!(!i.raddr_b_used);
    }

    #[test]
    fn mul_write_to_file_a_sets_ws() {
        let i = Vc4Instr::nop()
            .alu_mul_set(
                mul_op::FMUL,
                AssignCond::Always,
                WriteSlot::FileA(3),
                ReadSlot::Acc(0),
                ReadSlot::Acc(1),
            )
            .unwrap();
        assert!(i.ws());
        assert_eq!(i.waddr_mul(), 3);
    }

    #[test]
    fn small_imm_sets_signal() {
        let i = Vc4Instr::nop()
            .alu_add_set(
                add_op::ADD,
                AssignCond::Always,
                WriteSlot::FileA(0),
                ReadSlot::FileA(1),
                ReadSlot::SmallImm(7),
            )
            .unwrap();
        assert_eq!(i.sig(), sig::SMALL_IMM);
        assert_eq!(i.raddr_b(), 7);
    }

    #[test]
    fn load_imm32_word() {
        let i = Vc4Instr::load_imm32(AssignCond::Always, WriteSlot::FileA(2), 0xdead_beef).unwrap();
        assert_eq!(i.sig(), sig::LOAD_IMM);
        assert_eq!(i.imm32(), 0xdead_beef);
        assert_eq!(i.waddr_add(), 2);
        assert_eq!(i.cond_mul(), cond::NEVER);
    }

    #[test]
    fn semaphore_word() {
        let up = Vc4Instr::semaphore(false, 3).unwrap();
        assert_eq!(up.sig(), sig::LOAD_IMM);
        assert_eq!(up.imm32() & 0x1f, 3);
        let down = Vc4Instr::semaphore(true, 3).unwrap();
        assert_eq!(down.imm32() & 0x1f, 0x13);
        assert!(Vc4Instr::semaphore(false, 16).is_err());
    }

    #[test]
    fn branch_word() {
        use crate::core::cond::Flag;
        let b = Vc4Instr::branch(BranchCond::Always, 3).unwrap();
        assert!(b.is_branch());
        assert_eq!(b.branch_label(), Some(3));

        let mut b = Vc4Instr::branch(BranchCond::All(Flag::Zc), 0).unwrap();
        b.label_to_target(-48);
        assert_eq!(b.branch_offset(), -48);
        assert_eq!(b.branch_label(), None);
    }

    #[test]
    fn set_flags_bit() {
        let mut i = Vc4Instr::nop()
            .alu_add_set(
                add_op::SUB,
                AssignCond::Always,
                WriteSlot::FileA(0),
                ReadSlot::Acc(0),
                ReadSlot::Acc(1),
            )
            .unwrap();
        assert!(!i.sf());
        i.set_flags(SetCond::Z);
        assert!(i.sf());
    }
}
