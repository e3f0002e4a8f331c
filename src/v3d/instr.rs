//! The v3d 64-bit instruction word.
//!
//! One word carries an ADD-ALU op and a MUL-ALU op (dual issue), a signal
//! code, a condition/push field and the register addressing. Instructions
//! are built by mutating fields of the canonical NOP word, the same way the
//! hardware assembler does, so everything not explicitly set stays at its
//! canonical value.
//!
//! The bit layout and the opcode/signal tables mirror the hardware ISA; they
//! are consumed here as an external contract and kept in one place.
//!
//! Operand plumbing: the word has two register-file read ports (raddr_a and
//! raddr_b) shared by both ALUs, and per-operand mux fields selecting among
//! r0..r5, port A and port B. A small immediate claims port B for the whole
//! word. [`V3dInstr::alu_mul_set`] fails (returns false) when the mul op
//! cannot be routed through the remaining ports; the caller then keeps the
//! instructions separate.

use crate::core::{AssignCond, BranchCond, CompileError, CompileResult, Flag, SetCond};
use crate::core::instr::Label;

use super::small_imm::{from_raddr, to_raddr, SmallImmValue};

/// Canonical "nop ; nop" encoding.
pub const NOP_WORD: u64 = 0x3c00_3186_bb80_0000;

// ALU word fields (hi, lo).
const F_OP_MUL: (u32, u32) = (63, 58);
const F_SIG: (u32, u32) = (57, 53);
const F_COND: (u32, u32) = (52, 46);
const F_MM: (u32, u32) = (45, 45);
const F_MA: (u32, u32) = (44, 44);
const F_WADDR_M: (u32, u32) = (43, 38);
const F_WADDR_A: (u32, u32) = (37, 32);
const F_OP_ADD: (u32, u32) = (31, 24);
const F_MUX_MUL_B: (u32, u32) = (23, 21);
const F_MUX_MUL_A: (u32, u32) = (20, 18);
const F_MUX_ADD_B: (u32, u32) = (17, 15);
const F_MUX_ADD_A: (u32, u32) = (14, 12);
const F_RADDR_A: (u32, u32) = (11, 6);
const F_RADDR_B: (u32, u32) = (5, 0);

// Branch word fields. A branch is recognised by op_mul == 0.
const F_BR_ADDR_LOW: (u32, u32) = (55, 35);
const F_BR_COND: (u32, u32) = (34, 32);
const F_BR_ADDR_HIGH: (u32, u32) = (31, 24);
const F_BR_BDI: (u32, u32) = (13, 12);

/// ADD-ALU opcodes (8-bit field).
pub mod add_op {
    pub const FADD: u64 = 0;
    pub const FSUB: u64 = 64;
    pub const ADD: u64 = 56;
    pub const SUB: u64 = 60;
    pub const MIN: u64 = 120;
    pub const MAX: u64 = 121;
    pub const SHL: u64 = 124;
    pub const SHR: u64 = 125;
    pub const ASR: u64 = 126;
    pub const ROR: u64 = 127;
    pub const FMIN: u64 = 128;
    pub const FMAX: u64 = 129;
    pub const BAND: u64 = 181;
    pub const BOR: u64 = 182;
    pub const BXOR: u64 = 183;
    pub const BNOT: u64 = 186;
    pub const NOP: u64 = 187;
    pub const EIDX: u64 = 203;
    pub const TIDX: u64 = 204;
    pub const TMUWT: u64 = 211;
    pub const FTOI: u64 = 250;
    pub const ITOF: u64 = 252;
}

/// MUL-ALU opcodes (6-bit field). Code 0 marks a branch word.
pub mod mul_op {
    pub const ADD: u64 = 1;
    pub const SUB: u64 = 2;
    pub const UMUL24: u64 = 3;
    pub const SMUL24: u64 = 9;
    pub const FMOV: u64 = 14;
    pub const NOP: u64 = 15;
    pub const MOV: u64 = 16;
    pub const ROTATE: u64 = 17;
    pub const FMUL: u64 = 32;
    pub const MIN: u64 = 40;
    pub const MAX: u64 = 41;
    pub const BOR: u64 = 42;
    pub const BAND: u64 = 43;
    pub const BXOR: u64 = 44;
}

/// Signal codes (5-bit field).
pub mod sig {
    pub const NONE: u64 = 0;
    pub const THRSW: u64 = 1;
    pub const LDUNIF: u64 = 2;
    pub const LDTMU: u64 = 4;
    pub const LDUNIFRF: u64 = 12;
    pub const SMALL_IMM: u64 = 15;
}

/// Magic write addresses (waddr with the magic bit set).
pub mod waddr {
    pub const R0: u8 = 0;
    pub const R5: u8 = 5;
    pub const NOP: u8 = 6;
    pub const UNIFA: u8 = 9;
    pub const TMUL: u8 = 10;
    pub const TMUD: u8 = 11;
    pub const TMUA: u8 = 12;
    pub const TMUAU: u8 = 13;
    pub const SYNCB: u8 = 18;
    pub const RECIP: u8 = 19;
    pub const RSQRT: u8 = 20;
    pub const EXP: u8 = 21;
    pub const LOG: u8 = 22;
    pub const SIN: u8 = 23;
    pub const TMUC: u8 = 32;
}

// Source muxes.
const MUX_A: u64 = 6;
const MUX_B: u64 = 7;

// Condition field layout: [1:0] add cond, [3:2] mul cond, [6:4] push.
const COND_NONE: u64 = 0;
const COND_IFA: u64 = 1;
const COND_IFNA: u64 = 2;
const PUSHZ: u64 = 1;
const PUSHN: u64 = 2;
const PUSHC: u64 = 3;

// Branch conditions (3-bit field).
const BR_COND_ALWAYS: u64 = 0;
const BR_COND_ALLA: u64 = 4;
const BR_COND_ALLNA: u64 = 5;
const BR_COND_ANYA: u64 = 6;
const BR_COND_ANYNA: u64 = 7;

fn get_field(word: u64, (hi, lo): (u32, u32)) -> u64 {
    (word >> lo) & ((1u64 << (hi - lo + 1)) - 1)
}

fn set_field(word: &mut u64, (hi, lo): (u32, u32), val: u64) {
    let mask = ((1u64 << (hi - lo + 1)) - 1) << lo;
    debug_assert_eq!(val & !((1u64 << (hi - lo + 1)) - 1), 0, "field overflow");
    *word = (*word & !mask) | ((val << lo) & mask);
}

/// A writable location: accumulator, register-file slot, or magic address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Acc(u8),
    Rf(u8),
    Magic(u8),
}

impl Loc {
    fn to_waddr(self) -> (u8, bool) {
        match self {
            Loc::Acc(n) => (n, true),
            Loc::Rf(a) => (a, false),
            Loc::Magic(m) => (m, true),
        }
    }

    /// The mux value if the location can be read without a register port.
    fn direct_mux(self) -> Option<u64> {
        match self {
            Loc::Acc(n) => Some(n as u64),
            _ => None,
        }
    }
}

pub const R0: Loc = Loc::Acc(0);
pub const R1: Loc = Loc::Acc(1);
pub const R2: Loc = Loc::Acc(2);
pub const R3: Loc = Loc::Acc(3);
pub const R4: Loc = Loc::Acc(4);
pub const R5: Loc = Loc::Acc(5);

pub fn rf(addr: u8) -> Loc {
    Loc::Rf(addr)
}

/// A readable source operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Src {
    Loc(Loc),
    Imm(SmallImmValue),
}

impl From<Loc> for Src {
    fn from(l: Loc) -> Src {
        Src::Loc(l)
    }
}

impl From<SmallImmValue> for Src {
    fn from(v: SmallImmValue) -> Src {
        Src::Imm(v)
    }
}

/// One encoded v3d instruction, plus label metadata and listing text that
/// live outside the 64-bit word.
#[derive(Debug, Clone)]
pub struct V3dInstr {
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

impl V3dInstr {
    fn from_word(word: u64) -> V3dInstr {
        V3dInstr {
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

    pub fn nop() -> V3dInstr {
        V3dInstr::from_word(NOP_WORD)
    }

    /// Label meta-instruction; dropped by the label resolver.
    pub fn label_meta(label: Label) -> V3dInstr {
        let mut i = V3dInstr::from_word(NOP_WORD);
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

    pub fn is_branch(&self) -> bool {
        !self.is_label && get_field(self.word, F_OP_MUL) == 0
    }

    pub fn branch_label(&self) -> Option<Label> {
        self.branch_label
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

    pub fn with_comment(mut self, msg: impl Into<String>) -> V3dInstr {
        self.add_comment(msg);
        self
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

    // ==================================================
    // Field accessors
    // ==================================================

    pub fn sig_code(&self) -> u64 {
        get_field(self.word, F_SIG)
    }

    pub fn op_add(&self) -> u64 {
        get_field(self.word, F_OP_ADD)
    }

    pub fn op_mul(&self) -> u64 {
        get_field(self.word, F_OP_MUL)
    }

    pub fn add_nop(&self) -> bool {
        self.op_add() == add_op::NOP
    }

    pub fn mul_nop(&self) -> bool {
        self.op_mul() == mul_op::NOP
    }

    pub fn raddr_a(&self) -> u8 {
        get_field(self.word, F_RADDR_A) as u8
    }

    pub fn raddr_b(&self) -> u8 {
        get_field(self.word, F_RADDR_B) as u8
    }

    pub fn waddr_add(&self) -> (u8, bool) {
        (get_field(self.word, F_WADDR_A) as u8, get_field(self.word, F_MA) == 1)
    }

    pub fn waddr_mul(&self) -> (u8, bool) {
        (get_field(self.word, F_WADDR_M) as u8, get_field(self.word, F_MM) == 1)
    }

    /// The small immediate carried on port B, if any.
    pub fn small_imm(&self) -> Option<SmallImmValue> {
        if self.sig_code() == sig::SMALL_IMM {
            from_raddr(self.raddr_b())
        } else {
            None
        }
    }

    fn add_cond_bits(&self) -> u64 {
        get_field(self.word, F_COND) & 0x3
    }

    fn mul_cond_bits(&self) -> u64 {
        (get_field(self.word, F_COND) >> 2) & 0x3
    }

    fn push_bits(&self) -> u64 {
        (get_field(self.word, F_COND) >> 4) & 0x7
    }

    pub fn flags_pushed(&self) -> bool {
        self.push_bits() != 0
    }

    // ==================================================
    // Signals
    // ==================================================

    fn set_sig(&mut self, code: u64) -> CompileResult<()> {
        let current = self.sig_code();
        if current != sig::NONE && current != code {
            return Err(CompileError::invariant(format!(
                "v3d: conflicting signals {current} and {code} in one instruction"
            )));
        }
        set_field(&mut self.word, F_SIG, code);
        Ok(())
    }

    pub fn thrsw(mut self) -> V3dInstr {
        set_field(&mut self.word, F_SIG, sig::THRSW);
        self
    }

    /// Load the next uniform into a register-file slot or accumulator.
    pub fn ldunifrf(mut self, dst: Loc) -> CompileResult<V3dInstr> {
        let (addr, magic) = dst.to_waddr();
        self.set_sig(sig::LDUNIFRF)?;
        // The signal destination shares the add-ALU write fields; the add op
        // is a nop here so the slot is free.
        set_field(&mut self.word, F_WADDR_A, addr as u64);
        set_field(&mut self.word, F_MA, magic as u64);
        Ok(self)
    }

    /// Receive a TMU fetch result.
    pub fn ldtmu(mut self, dst: Loc) -> CompileResult<V3dInstr> {
        let (addr, magic) = dst.to_waddr();
        self.set_sig(sig::LDTMU)?;
        set_field(&mut self.word, F_WADDR_A, addr as u64);
        set_field(&mut self.word, F_MA, magic as u64);
        Ok(self)
    }

    // ==================================================
    // Operand routing
    // ==================================================

    /// Resolve a source into a mux value, claiming read ports as needed.
    fn route_src(&mut self, src: Src) -> CompileResult<u64> {
        match self.try_route_src(src) {
            Some(mux) => Ok(mux),
            None => Err(CompileError::invariant(format!(
                "v3d: no free read port for source {src:?}"
            ))),
        }
    }

    fn try_route_src(&mut self, src: Src) -> Option<u64> {
        match src {
            Src::Loc(loc) => {
                if let Some(mux) = loc.direct_mux() {
                    return Some(mux);
                }
                let addr = match loc {
                    Loc::Rf(a) => a,
                    _ => return None,
                };
                if self.raddr_a_used && self.raddr_a() == addr {
                    return Some(MUX_A);
                }
                if self.raddr_b_used && !self.raddr_b_is_imm && self.raddr_b() == addr {
                    return Some(MUX_B);
                }
                if !self.raddr_a_used {
                    set_field(&mut self.word, F_RADDR_A, addr as u64);
                    self.raddr_a_used = true;
                    return Some(MUX_A);
                }
                if !self.raddr_b_used && self.sig_code() != sig::SMALL_IMM {
                    set_field(&mut self.word, F_RADDR_B, addr as u64);
                    self.raddr_b_used = true;
                    return Some(MUX_B);
                }
                None
            }
            Src::Imm(v) => {
                let code = to_raddr(v)? as u64;
                if self.sig_code() == sig::SMALL_IMM {
                    if get_field(self.word, F_RADDR_B) == code {
                        return Some(MUX_B);
                    }
                    return None; // only one immediate per instruction
                }
                if self.raddr_b_used {
                    return None;
                }
                self.set_sig(sig::SMALL_IMM).ok()?;
                set_field(&mut self.word, F_RADDR_B, code);
                self.raddr_b_used = true;
                self.raddr_b_is_imm = true;
                Some(MUX_B)
            }
        }
    }

    /// Fill in the ADD-ALU half.
    pub fn alu_add_set(mut self, op: u64, dst: Loc, a: Src, b: Src) -> CompileResult<V3dInstr> {
        set_field(&mut self.word, F_OP_ADD, op);
        let (wa, magic) = dst.to_waddr();
        set_field(&mut self.word, F_WADDR_A, wa as u64);
        set_field(&mut self.word, F_MA, magic as u64);
        let mux_a = self.route_src(a)?;
        let mux_b = self.route_src(b)?;
        set_field(&mut self.word, F_MUX_ADD_A, mux_a);
        set_field(&mut self.word, F_MUX_ADD_B, mux_b);
        Ok(self)
    }

    /// Try to fill in the MUL-ALU half of an existing word.
    ///
    /// Returns false when the operands cannot be routed through the
    /// remaining read ports (or would need a second immediate); the word is
    /// left unchanged in that case.
    pub fn alu_mul_set(&mut self, op: u64, dst: Loc, a: Src, b: Src) -> bool {
        let saved = self.clone();

        set_field(&mut self.word, F_OP_MUL, op);
        let (wm, magic) = dst.to_waddr();
        set_field(&mut self.word, F_WADDR_M, wm as u64);
        set_field(&mut self.word, F_MM, magic as u64);

        let mux_a = match self.try_route_src(a) {
            Some(m) => m,
            None => {
                *self = saved;
                return false;
            }
        };
        let mux_b = match self.try_route_src(b) {
            Some(m) => m,
            None => {
                *self = saved;
                return false;
            }
        };
        set_field(&mut self.word, F_MUX_MUL_A, mux_a);
        set_field(&mut self.word, F_MUX_MUL_B, mux_b);
        true
    }

    // Mul-ALU builder methods, chained off `nop()`.

    pub fn fmul(mut self, dst: Loc, a: Src, b: Src) -> CompileResult<V3dInstr> {
        if !self.alu_mul_set(mul_op::FMUL, dst, a, b) {
            return Err(CompileError::invariant("v3d: cannot route fmul operands"));
        }
        Ok(self)
    }

    pub fn smul24(mut self, dst: Loc, a: Src, b: Src) -> CompileResult<V3dInstr> {
        if !self.alu_mul_set(mul_op::SMUL24, dst, a, b) {
            return Err(CompileError::invariant("v3d: cannot route smul24 operands"));
        }
        Ok(self)
    }

    /// Move a small float immediate (mul ALU fmov).
    pub fn fmov(mut self, dst: Loc, v: SmallImmValue) -> CompileResult<V3dInstr> {
        if !self.alu_mul_set(mul_op::FMOV, dst, Src::Imm(v), Src::Imm(v)) {
            return Err(CompileError::invariant("v3d: cannot route fmov operand"));
        }
        Ok(self)
    }

    // ==================================================
    // Conditions
    // ==================================================

    /// Guard the non-nop ALU halves with an assign condition.
    ///
    /// The flag namespace is the vc4 one: set-variants run where the flag
    /// is set (ifa), clear-variants where it is clear (ifna).
    pub fn set_cond_tag(&mut self, cond: AssignCond) {
        let bits = match cond {
            AssignCond::Always => return,
            AssignCond::Never => COND_IFNA, // masked everywhere; lanes never pass
            AssignCond::Flag(Flag::Zs) | AssignCond::Flag(Flag::Ns) => COND_IFA,
            AssignCond::Flag(Flag::Zc) | AssignCond::Flag(Flag::Nc) => COND_IFNA,
        };
        let mut field = get_field(self.word, F_COND);
        if !self.add_nop() {
            field = (field & !0x3) | bits;
        }
        if !self.mul_nop() {
            field = (field & !(0x3 << 2)) | (bits << 2);
        }
        set_field(&mut self.word, F_COND, field);
    }

    /// Push flags from this instruction.
    pub fn set_push_tag(&mut self, set_cond: SetCond) {
        let bits = match set_cond {
            SetCond::None => return,
            SetCond::Z => PUSHZ,
            SetCond::N => PUSHN,
            SetCond::C => PUSHC,
        };
        let mut field = get_field(self.word, F_COND);
        field = (field & !(0x7 << 4)) | (bits << 4);
        set_field(&mut self.word, F_COND, field);
    }

    pub fn add_cond(&self) -> u64 {
        self.add_cond_bits()
    }

    pub fn mul_cond(&self) -> u64 {
        self.mul_cond_bits()
    }

    // ==================================================
    // Branches
    // ==================================================

    /// A PC-relative branch; the offset is patched by the label resolver.
    pub fn branch(offset_bytes: i32, relative: bool) -> V3dInstr {
        let mut i = V3dInstr::from_word(0);
        // op_mul == 0 marks the branch format
        set_field(&mut i.word, F_BR_BDI, if relative { 1 } else { 0 });
        i.set_branch_offset(offset_bytes);
        i
    }

    pub fn set_branch_offset(&mut self, offset_bytes: i32) {
        let off = offset_bytes as u32;
        debug_assert_eq!(off & 0x7, 0, "branch offset must be instruction aligned");
        set_field(&mut self.word, F_BR_ADDR_LOW, ((off >> 3) & 0x1f_ffff) as u64);
        set_field(&mut self.word, F_BR_ADDR_HIGH, ((off >> 24) & 0xff) as u64);
    }

    pub fn branch_offset(&self) -> i32 {
        let low = get_field(self.word, F_BR_ADDR_LOW) as u32;
        let high = get_field(self.word, F_BR_ADDR_HIGH) as u32;
        ((low << 3) | (high << 24)) as i32
    }

    pub fn with_branch_label(mut self, label: Label) -> V3dInstr {
        self.branch_label = Some(label);
        self
    }

    /// Resolve the symbolic label into a concrete offset.
    pub fn label_to_target(&mut self, offset_bytes: i32) {
        self.set_branch_offset(offset_bytes);
        self.branch_label = None;
    }

    /// Translate a front-end branch condition.
    ///
    /// Set-variants test the a-flag, clear-variants its complement.
    pub fn set_branch_condition(&mut self, cond: BranchCond) -> CompileResult<()> {
        let code = match cond {
            BranchCond::Always => BR_COND_ALWAYS,
            BranchCond::All(Flag::Zs) | BranchCond::All(Flag::Ns) => BR_COND_ALLA,
            BranchCond::All(Flag::Zc) | BranchCond::All(Flag::Nc) => BR_COND_ALLNA,
            BranchCond::Any(Flag::Zs) | BranchCond::Any(Flag::Ns) => BR_COND_ANYA,
            BranchCond::Any(Flag::Zc) | BranchCond::Any(Flag::Nc) => BR_COND_ANYNA,
            BranchCond::Never => {
                return Err(CompileError::invariant("v3d: branch condition NEVER"))
            }
        };
        set_field(&mut self.word, F_BR_COND, code);
        Ok(())
    }

    pub fn branch_cond_code(&self) -> u64 {
        get_field(self.word, F_BR_COND)
    }

    // ==================================================
    // Round trip
    // ==================================================

    /// Reconstruct an instruction from its encoded word.
    ///
    /// Port-usage flags are recovered from the mux fields, so a decoded
    /// instruction re-encodes to the identical word.
    pub fn unpack(word: u64) -> V3dInstr {
        let mut i = V3dInstr::from_word(word);
        if i.is_branch() {
            return i;
        }

        let muxes = [
            (get_field(word, F_MUX_ADD_A), !i.add_nop()),
            (get_field(word, F_MUX_ADD_B), !i.add_nop()),
            (get_field(word, F_MUX_MUL_A), !i.mul_nop()),
            (get_field(word, F_MUX_MUL_B), !i.mul_nop()),
        ];
        for (mux, live) in muxes {
            if !live {
                continue;
            }
            if mux == MUX_A {
                i.raddr_a_used = true;
            }
            if mux == MUX_B {
                i.raddr_b_used = true;
            }
        }
        if i.sig_code() == sig::SMALL_IMM {
            i.raddr_b_is_imm = i.raddr_b_used;
        }
        i
    }

    // ==================================================
    // Listing
    // ==================================================

    pub fn mnemonic(&self, with_comments: bool) -> String {
        let body = if self.is_label {
            format!("L{}:", self.label.unwrap_or(0))
        } else if self.is_branch() {
            let target = match self.branch_label {
                Some(l) => format!("L{l}"),
                None => format!("{}", self.branch_offset()),
            };
            let cond = match self.branch_cond_code() {
                BR_COND_ALLA => "alla ",
                BR_COND_ALLNA => "allna ",
                BR_COND_ANYA => "anya ",
                BR_COND_ANYNA => "anyna ",
                _ => "",
            };
            format!("b {cond}{target}")
        } else {
            let mut parts: Vec<String> = Vec::new();
            if !self.add_nop() || self.mul_nop() {
                parts.push(format!("op_add[{}]", self.op_add()));
            }
            if !self.mul_nop() {
                parts.push(format!("op_mul[{}]", self.op_mul()));
            }
            let mut s = parts.join(" ; ");
            if self.sig_code() != sig::NONE {
                s.push_str(&format!(" sig[{}]", self.sig_code()));
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

// ============================================================================
// Instruction constructors
// ============================================================================

pub fn nop() -> V3dInstr {
    V3dInstr::nop()
}

fn alu(op: u64, dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    V3dInstr::nop().alu_add_set(op, dst, a.into(), b.into())
}

pub fn add(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::ADD, dst, a, b)
}

pub fn sub(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::SUB, dst, a, b)
}

pub fn fadd(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::FADD, dst, a, b)
}

pub fn fsub(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::FSUB, dst, a, b)
}

pub fn fmin(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::FMIN, dst, a, b)
}

pub fn fmax(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::FMAX, dst, a, b)
}

pub fn shl(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::SHL, dst, a, b)
}

pub fn shr(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::SHR, dst, a, b)
}

pub fn asr(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::ASR, dst, a, b)
}

pub fn ror(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::ROR, dst, a, b)
}

pub fn band(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::BAND, dst, a, b)
}

pub fn bor(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::BOR, dst, a, b)
}

pub fn bxor(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::BXOR, dst, a, b)
}

pub fn min(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::MIN, dst, a, b)
}

pub fn max(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::MAX, dst, a, b)
}

pub fn ftoi(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::FTOI, dst, a, b)
}

pub fn itof(dst: Loc, a: impl Into<Src>, b: impl Into<Src>) -> CompileResult<V3dInstr> {
    alu(add_op::ITOF, dst, a, b)
}

pub fn mov(dst: Loc, src: impl Into<Src>) -> CompileResult<V3dInstr> {
    let src = src.into();
    alu(add_op::BOR, dst, src, src)
}

/// Materialise the current QPU index.
pub fn tidx(dst: Loc) -> CompileResult<V3dInstr> {
    alu(add_op::TIDX, dst, R0, R0)
}

/// Materialise the per-QPU element indices 0..15.
pub fn eidx(dst: Loc) -> CompileResult<V3dInstr> {
    alu(add_op::EIDX, dst, R0, R0)
}

/// Wait for outstanding TMU writes.
pub fn tmuwt() -> CompileResult<V3dInstr> {
    alu(add_op::TMUWT, Loc::Magic(waddr::NOP), R0, R0)
}

/// Vector rotate: r1 <- r0 rotated by `n` lanes or by r5.
///
/// The source must already be in r0 and the destination is always r1; the
/// encoder inserts the required moves around this.
pub fn rotate(dst: Loc, src: Loc, amount: Src) -> CompileResult<V3dInstr> {
    if dst != R1 || src != R0 {
        return Err(CompileError::invariant(
            "v3d: rotate operates on r0 -> r1 only",
        ));
    }
    let b = match amount {
        Src::Loc(l) if l == R5 => Src::Loc(R5),
        Src::Imm(SmallImmValue::Int(n)) => {
            if !(-15..=16).contains(&n) {
                return Err(CompileError::invariant(format!(
                    "v3d: rotate amount {n} out of range -15..=16"
                )));
            }
            // rotation is mod 16, so +16 encodes as the (equal) -16
            Src::Imm(SmallImmValue::Int(if n == 16 { -16 } else { n }))
        }
        other => {
            return Err(CompileError::invariant(format!(
                "v3d: rotate amount must be r5 or a small immediate, got {other:?}"
            )))
        }
    };

    let mut i = V3dInstr::nop();
    if !i.alu_mul_set(mul_op::ROTATE, dst, Src::Loc(src), b) {
        return Err(CompileError::invariant("v3d: cannot route rotate operands"));
    }
    Ok(i)
}
