//! Condition flags and the three condition kinds of the target IR.
//!
//! `AssignCond` guards a register write (where-masking), `BranchCond` guards
//! a branch, and `SetCond` asks an instruction to update the flags. The flag
//! namespace is the vc4 one (Z/N, set/clear); the v3d encoder translates at
//! the boundary.

use std::fmt;

/// A condition flag over the per-lane Z and N bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Zero set.
    Zs,
    /// Zero clear.
    Zc,
    /// Negative set.
    Ns,
    /// Negative clear.
    Nc,
}

impl Flag {
    pub fn negate(self) -> Flag {
        match self {
            Flag::Zs => Flag::Zc,
            Flag::Zc => Flag::Zs,
            Flag::Ns => Flag::Nc,
            Flag::Nc => Flag::Ns,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Flag::Zs => "ZS",
            Flag::Zc => "ZC",
            Flag::Ns => "NS",
            Flag::Nc => "NC",
        };
        write!(f, "{s}")
    }
}

/// Guard on a register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignCond {
    Always,
    Never,
    Flag(Flag),
}

impl AssignCond {
    pub fn is_always(&self) -> bool {
        matches!(self, AssignCond::Always)
    }

    pub fn is_never(&self) -> bool {
        matches!(self, AssignCond::Never)
    }

    pub fn negate(self) -> AssignCond {
        match self {
            AssignCond::Always => AssignCond::Never,
            AssignCond::Never => AssignCond::Always,
            AssignCond::Flag(f) => AssignCond::Flag(f.negate()),
        }
    }

    /// Turn the assign condition into a branch condition.
    ///
    /// `do_all` selects the all-lanes form, otherwise any-lane.
    pub fn to_branch_cond(self, do_all: bool) -> BranchCond {
        match self {
            AssignCond::Always => BranchCond::Always,
            AssignCond::Never => BranchCond::Never,
            AssignCond::Flag(f) => {
                if do_all {
                    BranchCond::All(f)
                } else {
                    BranchCond::Any(f)
                }
            }
        }
    }
}

impl fmt::Display for AssignCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignCond::Always => Ok(()),
            AssignCond::Never => write!(f, "where never: "),
            AssignCond::Flag(flag) => write!(f, "where {flag}: "),
        }
    }
}

/// Guard on a branch, aggregated over all 16 lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchCond {
    Always,
    Never,
    All(Flag),
    Any(Flag),
}

impl BranchCond {
    pub fn negate(self) -> BranchCond {
        match self {
            BranchCond::Always => BranchCond::Never,
            BranchCond::Never => BranchCond::Always,
            BranchCond::All(f) => BranchCond::Any(f.negate()),
            BranchCond::Any(f) => BranchCond::All(f.negate()),
        }
    }
}

impl fmt::Display for BranchCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchCond::Always => write!(f, "always"),
            BranchCond::Never => write!(f, "never"),
            BranchCond::All(flag) => write!(f, "all({flag})"),
            BranchCond::Any(flag) => write!(f, "any({flag})"),
        }
    }
}

/// Flag-setting directive carried by LI and ALU instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SetCond {
    #[default]
    None,
    Z,
    N,
    C,
}

impl SetCond {
    pub fn flags_set(&self) -> bool {
        !matches!(self, SetCond::None)
    }

    /// The flag-setting directive needed to evaluate `flag` afterwards.
    pub fn for_flag(flag: Flag) -> SetCond {
        match flag {
            Flag::Zs | Flag::Zc => SetCond::Z,
            Flag::Ns | Flag::Nc => SetCond::N,
        }
    }

    pub fn pretty(&self) -> String {
        if self.flags_set() {
            format!("{{sf-{self}}}")
        } else {
            String::new()
        }
    }
}

impl fmt::Display for SetCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetCond::None => "None",
            SetCond::Z => "Z",
            SetCond::N => "N",
            SetCond::C => "C",
        };
        write!(f, "{s}")
    }
}

/// Comparison operators of the DSL, as they reach the lowering stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Ge,
}

impl CmpOp {
    /// The flag that holds after `sub a, b` with the matching [`SetCond`].
    pub fn flag(self) -> Flag {
        match self {
            CmpOp::Eq => Flag::Zs,
            CmpOp::Neq => Flag::Zc,
            CmpOp::Lt => Flag::Ns,
            CmpOp::Ge => Flag::Nc,
        }
    }

    pub fn set_cond(self) -> SetCond {
        SetCond::for_flag(self.flag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_negation_is_involutive() {
        for f in [Flag::Zs, Flag::Zc, Flag::Ns, Flag::Nc] {
            assert_eq!(f.negate().negate(), f);
        }
    }

    #[test]
    fn branch_cond_negation() {
        assert_eq!(BranchCond::Always.negate(), BranchCond::Never);
        assert_eq!(BranchCond::All(Flag::Zs).negate(), BranchCond::Any(Flag::Zc));
        assert_eq!(BranchCond::Any(Flag::Nc).negate(), BranchCond::All(Flag::Ns));
    }

    #[test]
    fn assign_to_branch_cond() {
        assert_eq!(AssignCond::Always.to_branch_cond(true), BranchCond::Always);
        assert_eq!(
            AssignCond::Flag(Flag::Zs).to_branch_cond(true),
            BranchCond::All(Flag::Zs)
        );
        assert_eq!(
            AssignCond::Flag(Flag::Zs).to_branch_cond(false),
            BranchCond::Any(Flag::Zs)
        );
    }

    #[test]
    fn cmp_op_flags() {
        assert_eq!(CmpOp::Eq.flag(), Flag::Zs);
        assert_eq!(CmpOp::Eq.set_cond(), SetCond::Z);
        assert_eq!(CmpOp::Lt.set_cond(), SetCond::N);
    }
}
