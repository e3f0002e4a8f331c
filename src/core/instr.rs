//! The target IR: instructions, instruction lists, use/def computation and
//! the rename helpers used by the allocator.
//!
//! One IR serves both targets. Tags that only exist on one platform are
//! rejected up front by [`Instr::check_platform`]; everything else is encoded
//! by the backend selected at compile time.
//!
//! Instructions carry optional `header`/`comment` strings which survive all
//! passes and end up in the debug listing, so a dump of the encoded program
//! can still show where each piece came from.

use smallvec::SmallVec;
use std::fmt;

use super::cond::{AssignCond, BranchCond, Flag, SetCond};
use super::error::{CompileError, CompileResult};
use super::ops::AluOp;
use super::reg::{Reg, RegId, RegOrImm, RegTag, Imm, Special, ACC4};

/// Symbolic label id, dense from 0 per compile.
pub type Label = u32;

/// Branch target of a resolved (`Branch`) instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTarget {
    /// Relative to PC (always true for generated code).
    pub relative: bool,
    /// Byte offset.
    pub imm_offset: i32,
}

impl fmt::Display for BranchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relative {
            write!(f, "PC+{}", self.imm_offset)
        } else {
            write!(f, "{}", self.imm_offset)
        }
    }
}

/// The ALU instruction payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluInstr {
    pub set_cond: SetCond,
    pub cond: AssignCond,
    pub dest: Reg,
    pub src_a: RegOrImm,
    pub op: AluOp,
    pub src_b: RegOrImm,
}

/// Instruction kinds of the target IR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrKind {
    /// Load immediate.
    LoadImm {
        set_cond: SetCond,
        cond: AssignCond,
        dest: Reg,
        imm: Imm,
    },
    Alu(AluInstr),
    /// Branch with a resolved immediate offset (post label resolution only).
    Branch { cond: BranchCond, target: BranchTarget },
    /// Branch to a symbolic label.
    BranchLabel { cond: BranchCond, label: Label },
    /// Label meta-instruction.
    Label(Label),
    /// vc4 program terminator.
    End,
    NoOp,
    // vc4-only
    DmaLoadWait,
    DmaStoreWait,
    SemaInc(u8),
    SemaDec(u8),
    // both targets
    /// Receive a TMU load result into a register.
    Recv { dest: Reg },
    /// Trigger the TMU fetch into r4.
    Tmu0ToAcc4,
    /// Markers wrapping platform-specific initialisation code.
    InitBegin,
    InitEnd,
    // v3d-only
    Tmuwt,
}

/// One target instruction plus its attached listing text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub kind: InstrKind,
    header: Option<String>,
    comment: Option<String>,
}

/// The `use` and `def` register sets of one instruction.
#[derive(Debug, Default, Clone)]
pub struct UseDefReg {
    pub use_regs: SmallVec<[Reg; 3]>,
    pub def_regs: SmallVec<[Reg; 1]>,
}

impl UseDefReg {
    fn insert_use(&mut self, r: Reg) {
        if !self.use_regs.contains(&r) {
            self.use_regs.push(r);
        }
    }

    fn insert_def(&mut self, r: Reg) {
        if !self.def_regs.contains(&r) {
            self.def_regs.push(r);
        }
    }

    pub fn dump(&self) -> String {
        let fmt_set = |rs: &[Reg]| {
            rs.iter().map(|r| r.dump()).collect::<Vec<_>>().join(" ")
        };
        format!("(def: {}; use: {})", fmt_set(&self.def_regs), fmt_set(&self.use_regs))
    }
}

/// [`UseDefReg`] restricted to variables (file-A ids).
#[derive(Debug, Default, Clone)]
pub struct UseDef {
    pub use_vars: SmallVec<[RegId; 3]>,
    pub def_vars: SmallVec<[RegId; 1]>,
}

impl Instr {
    pub fn new(kind: InstrKind) -> Instr {
        Instr { kind, header: None, comment: None }
    }

    pub fn nop() -> Instr {
        Instr::new(InstrKind::NoOp)
    }

    pub fn end() -> Instr {
        Instr::new(InstrKind::End)
    }

    pub fn li(dest: Reg, imm: Imm) -> Instr {
        Instr::new(InstrKind::LoadImm {
            set_cond: SetCond::None,
            cond: AssignCond::Always,
            dest,
            imm,
        })
    }

    pub fn alu(dest: Reg, src_a: impl Into<RegOrImm>, op: AluOp, src_b: impl Into<RegOrImm>) -> Instr {
        Instr::new(InstrKind::Alu(AluInstr {
            set_cond: SetCond::None,
            cond: AssignCond::Always,
            dest,
            src_a: src_a.into(),
            op,
            src_b: src_b.into(),
        }))
    }

    /// A move is an OR with both operands equal.
    pub fn mov(dest: Reg, src: impl Into<RegOrImm>) -> Instr {
        let src = src.into();
        Instr::alu(dest, src, AluOp::BOr, src)
    }

    pub fn branch(cond: BranchCond, label: Label) -> Instr {
        Instr::new(InstrKind::BranchLabel { cond, label })
    }

    pub fn label(label: Label) -> Instr {
        Instr::new(InstrKind::Label(label))
    }

    pub fn recv(dest: Reg) -> Instr {
        Instr::new(InstrKind::Recv { dest })
    }

    pub fn tmu0_to_acc4() -> Instr {
        Instr::new(InstrKind::Tmu0ToAcc4)
    }

    pub fn tmuwt() -> Instr {
        Instr::new(InstrKind::Tmuwt)
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

    pub fn with_header(mut self, msg: impl Into<String>) -> Instr {
        self.header = Some(msg.into());
        self
    }

    pub fn with_comment(mut self, msg: impl Into<String>) -> Instr {
        self.comment = Some(msg.into());
        self
    }

    pub fn set_header(&mut self, msg: impl Into<String>) {
        self.header = Some(msg.into());
    }

    pub fn set_comment(&mut self, msg: impl Into<String>) {
        self.comment = Some(msg.into());
    }

    /// Move listing text over from a source instruction, keeping existing text.
    pub fn transfer_comments(&mut self, from: &Instr) {
        if self.header.is_none() {
            self.header = from.header.clone();
        }
        if self.comment.is_none() {
            self.comment = from.comment.clone();
        }
    }

    // ==================================================
    // Mutation helpers used by lowering
    // ==================================================

    /// Set the assign condition (LI and ALU only).
    pub fn set_cond(&mut self, cond: AssignCond) {
        match &mut self.kind {
            InstrKind::LoadImm { cond: c, .. } => *c = cond,
            InstrKind::Alu(alu) => alu.cond = cond,
            _ => {}
        }
    }

    pub fn with_cond(mut self, cond: AssignCond) -> Instr {
        self.set_cond(cond);
        self
    }

    /// Request flag setting for the given flag's bit.
    pub fn set_cond_flag(&mut self, flag: Flag) {
        let sc = SetCond::for_flag(flag);
        match &mut self.kind {
            InstrKind::LoadImm { set_cond, .. } => *set_cond = sc,
            InstrKind::Alu(alu) => alu.set_cond = sc,
            _ => {}
        }
    }

    pub fn with_set_cond(mut self, sc: SetCond) -> Instr {
        match &mut self.kind {
            InstrKind::LoadImm { set_cond, .. } => *set_cond = sc,
            InstrKind::Alu(alu) => alu.set_cond = sc,
            _ => {}
        }
        self
    }

    pub fn set_cond_tag(&self) -> SetCond {
        match &self.kind {
            InstrKind::LoadImm { set_cond, .. } => *set_cond,
            InstrKind::Alu(alu) => alu.set_cond,
            _ => SetCond::None,
        }
    }

    // ==================================================
    // Predicates
    // ==================================================

    pub fn is_branch(&self) -> bool {
        matches!(self.kind, InstrKind::Branch { .. } | InstrKind::BranchLabel { .. })
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, InstrKind::Label(_))
    }

    pub fn is_branch_label(&self) -> bool {
        matches!(self.kind, InstrKind::BranchLabel { .. })
    }

    pub fn branch_label(&self) -> Option<Label> {
        match self.kind {
            InstrKind::BranchLabel { label, .. } => Some(label),
            _ => None,
        }
    }

    pub fn label_id(&self) -> Option<Label> {
        match self.kind {
            InstrKind::Label(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_rot(&self) -> bool {
        matches!(&self.kind, InstrKind::Alu(alu) if alu.op.is_rot())
    }

    /// A read of the next uniform-stream value.
    pub fn is_uniform_load(&self) -> bool {
        match &self.kind {
            InstrKind::Alu(alu) => {
                alu.src_a.is_reg() && alu.src_a.reg().is_special(Special::Uniform)
            }
            _ => false,
        }
    }

    /// A write of the TMU address register (memory store on v3d).
    pub fn is_tmua_write(&self) -> bool {
        match &self.kind {
            InstrKind::Alu(alu) => alu.dest.is_special(Special::DmaStAddr),
            _ => false,
        }
    }

    pub fn assign_cond(&self) -> AssignCond {
        match &self.kind {
            InstrKind::LoadImm { cond, .. } => *cond,
            InstrKind::Alu(alu) => alu.cond,
            _ => AssignCond::Always,
        }
    }

    pub fn is_always(&self) -> bool {
        self.assign_cond().is_always()
    }

    pub fn is_cond_assign(&self) -> bool {
        match &self.kind {
            InstrKind::LoadImm { cond, .. } => !cond.is_always(),
            InstrKind::Alu(alu) => !alu.cond.is_always(),
            _ => false,
        }
    }

    /// Kinds that reference registers at all.
    pub fn has_registers(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::LoadImm { .. } | InstrKind::Alu(_) | InstrKind::Recv { .. }
        )
    }

    /// Reject tags that are invalid for the selected target.
    pub fn check_platform(&self, for_vc4: bool) -> CompileResult<()> {
        let bad = if for_vc4 {
            match &self.kind {
                InstrKind::Tmuwt => true,
                InstrKind::Alu(alu) => alu.op.v3d_only(),
                _ => false,
            }
        } else {
            matches!(
                self.kind,
                InstrKind::DmaLoadWait
                    | InstrKind::DmaStoreWait
                    | InstrKind::SemaInc(_)
                    | InstrKind::SemaDec(_)
                    | InstrKind::End
            )
        };

        if bad {
            return Err(CompileError::UnsupportedInstruction {
                target: if for_vc4 { "vc4" } else { "v3d" },
                mnemonic: self.mnemonic(false),
            });
        }
        Ok(())
    }

    // ==================================================
    // Use/def
    // ==================================================

    pub fn dst_reg(&self) -> Reg {
        match &self.kind {
            InstrKind::LoadImm { dest, .. } => *dest,
            InstrKind::Alu(alu) => alu.dest,
            InstrKind::Recv { dest } => *dest,
            _ => Reg::none(),
        }
    }

    /// Source registers of the instruction.
    ///
    /// With `set_use_where`, a conditional write also counts its destination
    /// as a source, so that the previous value stays live across the
    /// conditional. Only the liveness analysis passes `true` here.
    pub fn src_regs(&self, set_use_where: bool) -> SmallVec<[Reg; 3]> {
        let mut out: SmallVec<[Reg; 3]> = SmallVec::new();
        let mut push = |r: Reg| {
            if r.tag != RegTag::None && !out.contains(&r) {
                out.push(r);
            }
        };

        match &self.kind {
            InstrKind::LoadImm { cond, dest, .. } => {
                if set_use_where && !cond.is_always() {
                    push(*dest);
                }
            }
            InstrKind::Alu(alu) => {
                if set_use_where && !alu.cond.is_always() {
                    push(alu.dest);
                }
                if let RegOrImm::Reg(r) = alu.src_a {
                    push(r);
                }
                if let RegOrImm::Reg(r) = alu.src_b {
                    push(r);
                }
            }
            _ => {}
        }
        out
    }

    /// Compute the `use` and `def` register sets.
    pub fn use_def_reg(&self, set_use_where: bool) -> UseDefReg {
        let mut out = UseDefReg::default();
        let dst = self.dst_reg();
        if dst.tag != RegTag::None {
            out.insert_def(dst);
        }
        for r in self.src_regs(set_use_where) {
            out.insert_use(r);
        }
        out
    }

    /// [`Instr::use_def_reg`] restricted to variables (registers in file A).
    pub fn use_def(&self, set_use_where: bool) -> UseDef {
        let full = self.use_def_reg(set_use_where);
        let mut out = UseDef::default();
        for r in &full.use_regs {
            if r.tag == RegTag::RegA && !out.use_vars.contains(&r.id) {
                out.use_vars.push(r.id);
            }
        }
        for r in &full.def_regs {
            if r.tag == RegTag::RegA && !out.def_vars.contains(&r.id) {
                out.def_vars.push(r.id);
            }
        }
        out
    }

    // ==================================================
    // Renaming
    // ==================================================

    /// Rename the destination register `from` to `to`.
    pub fn rename_dest(&mut self, from: Reg, to: Reg) {
        match &mut self.kind {
            InstrKind::LoadImm { dest, .. } if *dest == from => *dest = to,
            InstrKind::Alu(alu) if alu.dest == from => alu.dest = to,
            InstrKind::Recv { dest } if *dest == from => *dest = to,
            _ => {}
        }
    }

    /// Rename every use of register `from` to `to`.
    pub fn rename_uses(&mut self, from: Reg, to: Reg) {
        if let InstrKind::Alu(alu) = &mut self.kind {
            if let RegOrImm::Reg(r) = &mut alu.src_a {
                if *r == from {
                    *r = to;
                }
            }
            if let RegOrImm::Reg(r) = &mut alu.src_b {
                if *r == from {
                    *r = to;
                }
            }
        }
    }

    /// Globally replace tag `from` with tag `to`, keeping ids.
    pub fn subst_reg_tag(&mut self, from: RegTag, to: RegTag) {
        let subst = |r: &mut Reg| {
            if r.tag == from {
                r.tag = to;
            }
        };
        match &mut self.kind {
            InstrKind::LoadImm { dest, .. } => subst(dest),
            InstrKind::Recv { dest } => subst(dest),
            InstrKind::Alu(alu) => {
                subst(&mut alu.dest);
                if let RegOrImm::Reg(r) = &mut alu.src_a {
                    subst(r);
                }
                if let RegOrImm::Reg(r) = &mut alu.src_b {
                    subst(r);
                }
            }
            _ => {}
        }
    }

    // ==================================================
    // Listing
    // ==================================================

    pub fn mnemonic(&self, with_comments: bool) -> String {
        let body = match &self.kind {
            InstrKind::LoadImm { set_cond, cond, dest, imm } => {
                format!("{cond}li {dest}, {imm}{}", set_cond.pretty())
            }
            InstrKind::Alu(alu) => {
                if alu.op.no_operands() {
                    format!("{}{} {}{}", alu.cond, alu.op, alu.dest, alu.set_cond.pretty())
                } else {
                    format!(
                        "{}{} {}, {}, {}{}",
                        alu.cond,
                        alu.op,
                        alu.dest,
                        alu.src_a,
                        alu.src_b,
                        alu.set_cond.pretty()
                    )
                }
            }
            InstrKind::Branch { cond, target } => match cond {
                BranchCond::Always => format!("br {target}"),
                c => format!("if {c} br {target}"),
            },
            InstrKind::BranchLabel { cond, label } => match cond {
                BranchCond::Always => format!("br L{label}"),
                c => format!("if {c} br L{label}"),
            },
            InstrKind::Label(l) => format!("L{l}:"),
            InstrKind::End => "end".into(),
            InstrKind::NoOp => "nop".into(),
            InstrKind::DmaLoadWait => "dma_load_wait".into(),
            InstrKind::DmaStoreWait => "dma_store_wait".into(),
            InstrKind::SemaInc(id) => format!("sinc {id}"),
            InstrKind::SemaDec(id) => format!("sdec {id}"),
            InstrKind::Recv { dest } => format!("recv {dest}"),
            InstrKind::Tmu0ToAcc4 => format!("recv {ACC4}"),
            InstrKind::InitBegin => "init_begin".into(),
            InstrKind::InitEnd => "init_end".into(),
            InstrKind::Tmuwt => "tmuwt".into(),
        };

        if with_comments {
            let mut out = String::new();
            if let Some(h) = &self.header {
                out.push_str(&format!("# {h}\n"));
            }
            out.push_str(&body);
            if let Some(c) = &self.comment {
                out.push_str(&format!("  # {c}"));
            }
            out
        } else {
            body
        }
    }

    pub fn dump(&self) -> String {
        self.mnemonic(false)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic(false))
    }
}

/// An ordered sequence of instructions.
#[derive(Debug, Default, Clone)]
pub struct InstrList {
    items: Vec<Instr>,
}

impl InstrList {
    pub fn new() -> InstrList {
        InstrList::default()
    }

    pub fn push(&mut self, instr: Instr) {
        self.items.push(instr);
    }

    pub fn append(&mut self, mut other: InstrList) {
        self.items.append(&mut other.items);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get_mut(&mut self, i: usize) -> &mut Instr {
        &mut self.items[i]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instr> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Instr> {
        self.items.iter_mut()
    }

    /// Index of the single instruction with the given predicate, if any.
    pub fn position(&self, mut pred: impl FnMut(&Instr) -> bool) -> Option<usize> {
        self.items.iter().position(|i| pred(i))
    }

    pub fn mnemonics(&self, with_comments: bool) -> String {
        let mut out = String::new();
        for (i, instr) in self.items.iter().enumerate() {
            out.push_str(&format!("{i:4}: {}\n", instr.mnemonic(with_comments)));
        }
        out
    }

    pub fn dump(&self) -> String {
        self.mnemonics(false)
    }
}

impl std::ops::Index<usize> for InstrList {
    type Output = Instr;
    fn index(&self, i: usize) -> &Instr {
        &self.items[i]
    }
}

impl std::ops::IndexMut<usize> for InstrList {
    fn index_mut(&mut self, i: usize) -> &mut Instr {
        &mut self.items[i]
    }
}

impl FromIterator<Instr> for InstrList {
    fn from_iter<T: IntoIterator<Item = Instr>>(iter: T) -> Self {
        InstrList { items: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a InstrList {
    type Item = &'a Instr;
    type IntoIter = std::slice::Iter<'a, Instr>;
    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl Extend<Instr> for InstrList {
    fn extend<T: IntoIterator<Item = Instr>>(&mut self, iter: T) {
        self.items.extend(iter);
    }
}
