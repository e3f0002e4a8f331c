//! Control-flow graph over an instruction list.
//!
//! Successor sets only; predecessor counts are never needed by the passes
//! that run here. The graph is rebuilt from scratch whenever a pass changes
//! the shape of the list (adds, removes or reorders instructions).

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::error::{CompileError, CompileResult};
use super::instr::{InstrKind, InstrList, Label};

/// Successor set of one instruction. Two entries cover every case.
pub type Succs = SmallVec<[usize; 2]>;

#[derive(Debug, Clone)]
pub struct Cfg {
    succs: Vec<Succs>,
}

impl Cfg {
    /// Build the CFG for `instrs`.
    ///
    /// - non-branch, non-terminal instructions fall through to `i + 1`;
    /// - an unconditional branch goes to its label only;
    /// - a conditional branch goes to `i + 1` and its label;
    /// - `End` (and the final instruction) have no successors.
    ///
    /// A branch to an unknown label is a hard error. Already-resolved
    /// `Branch` instructions must not appear before encoding.
    pub fn build(instrs: &InstrList) -> CompileResult<Cfg> {
        let mut label_at: FxHashMap<Label, usize> = FxHashMap::default();
        for (i, instr) in instrs.iter().enumerate() {
            if let Some(l) = instr.label_id() {
                label_at.insert(l, i);
            }
        }

        let n = instrs.len();
        let mut succs: Vec<Succs> = Vec::with_capacity(n);

        for (i, instr) in instrs.iter().enumerate() {
            let mut s = Succs::new();
            match &instr.kind {
                InstrKind::End => {}
                InstrKind::Branch { .. } => {
                    return Err(CompileError::invariant(
                        "resolved branch in IR before label resolution",
                    ));
                }
                InstrKind::BranchLabel { cond, label } => {
                    let target = *label_at
                        .get(label)
                        .ok_or(CompileError::UnresolvedLabel(*label))?;
                    if !matches!(cond, super::cond::BranchCond::Always) && i + 1 < n {
                        s.push(i + 1);
                    }
                    s.push(target);
                }
                _ => {
                    if i + 1 < n {
                        s.push(i + 1);
                    }
                }
            }
            succs.push(s);
        }

        Ok(Cfg { succs })
    }

    pub fn len(&self) -> usize {
        self.succs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.succs.is_empty()
    }

    pub fn succs(&self, i: usize) -> &[usize] {
        &self.succs[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cond::{BranchCond, Flag};
    use crate::core::instr::Instr;
    use crate::core::reg::{Imm, Reg};

    #[test]
    fn straight_line_falls_through() {
        let mut l = InstrList::new();
        l.push(Instr::li(Reg::var(0), Imm::Int32(1)));
        l.push(Instr::li(Reg::var(1), Imm::Int32(2)));
        l.push(Instr::end());

        let cfg = Cfg::build(&l).unwrap();
        assert_eq!(cfg.succs(0), &[1]);
        assert_eq!(cfg.succs(1), &[2]);
        assert!(cfg.succs(2).is_empty());
    }

    #[test]
    fn conditional_branch_has_two_successors() {
        let mut l = InstrList::new();
        l.push(Instr::label(0));
        l.push(Instr::li(Reg::var(0), Imm::Int32(1)));
        l.push(Instr::branch(BranchCond::Any(Flag::Zc), 0));
        l.push(Instr::end());

        let cfg = Cfg::build(&l).unwrap();
        assert_eq!(cfg.succs(2), &[3, 0]);
    }

    #[test]
    fn unconditional_branch_only_goes_to_label() {
        let mut l = InstrList::new();
        l.push(Instr::branch(BranchCond::Always, 1));
        l.push(Instr::nop());
        l.push(Instr::label(1));
        l.push(Instr::end());

        let cfg = Cfg::build(&l).unwrap();
        assert_eq!(cfg.succs(0), &[2]);
    }

    #[test]
    fn unknown_label_is_hard_error() {
        let mut l = InstrList::new();
        l.push(Instr::branch(BranchCond::Always, 9));
        l.push(Instr::end());

        match Cfg::build(&l) {
            Err(crate::core::error::CompileError::UnresolvedLabel(9)) => {}
            other => panic!("expected UnresolvedLabel(9), got {other:?}"),
        }
    }
}
