//! Registers, immediates and the vc4 small-literal table.
//!
//! Before register allocation every variable is represented as a register in
//! file A whose id is the variable index; only after allocation do the ids
//! mean physical register-file slots. `TmpA`/`TmpB` exist solely for the
//! two-phase rename inside the allocator and must never survive it.

use std::fmt;

/// Register id. Doubles as a variable id before allocation.
pub type RegId = u32;

/// Number of registers in one vc4 register file.
pub const VC4_REGFILE_SIZE: usize = 32;

/// Number of slots in the unified v3d register file.
pub const V3D_REGFILE_SIZE: usize = 64;

/// Register classes of the target IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegTag {
    /// vc4 register file A; also the variable namespace before allocation.
    RegA,
    /// vc4 register file B.
    RegB,
    /// Accumulators r0..r5.
    Acc,
    /// Named hardware register, see [`Special`].
    Special,
    /// No register (e.g. an instruction without a destination).
    None,
    /// Transient tag used during allocation, resolves to `RegA`.
    TmpA,
    /// Transient tag used during allocation, resolves to `RegB`.
    TmpB,
}

/// Named hardware registers.
///
/// On v3d, `VpmWrite` and `DmaStAddr` double as TMUD/TMUA; the encoder maps
/// them to the corresponding magic write addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Special {
    Uniform = 0,
    QpuNum,
    ElemNum,
    Tmu0S,
    VpmRead,
    VpmWrite,
    RdSetup,
    WrSetup,
    DmaLdWait,
    DmaStWait,
    DmaLdAddr,
    DmaStAddr,
    SfuRecip,
    SfuRecipSqrt,
    SfuExp,
    SfuLog,
}

impl Special {
    pub fn from_id(id: RegId) -> Option<Special> {
        use Special::*;
        Some(match id {
            0 => Uniform,
            1 => QpuNum,
            2 => ElemNum,
            3 => Tmu0S,
            4 => VpmRead,
            5 => VpmWrite,
            6 => RdSetup,
            7 => WrSetup,
            8 => DmaLdWait,
            9 => DmaStWait,
            10 => DmaLdAddr,
            11 => DmaStAddr,
            12 => SfuRecip,
            13 => SfuRecipSqrt,
            14 => SfuExp,
            15 => SfuLog,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use Special::*;
        match self {
            Uniform => "UNIFORM",
            QpuNum => "QPU_NUM",
            ElemNum => "ELEM_NUM",
            Tmu0S => "TMU0_S",
            VpmRead => "VPM_READ",
            VpmWrite => "VPM_WRITE",
            RdSetup => "RD_SETUP",
            WrSetup => "WR_SETUP",
            DmaLdWait => "DMA_LD_WAIT",
            DmaStWait => "DMA_ST_WAIT",
            DmaLdAddr => "DMA_LD_ADDR",
            DmaStAddr => "DMA_ST_ADDR",
            SfuRecip => "SFU_RECIP",
            SfuRecipSqrt => "SFU_RECIPSQRT",
            SfuExp => "SFU_EXP",
            SfuLog => "SFU_LOG",
        }
    }
}

/// A tagged register reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg {
    pub tag: RegTag,
    pub id: RegId,
}

impl Reg {
    pub const fn new(tag: RegTag, id: RegId) -> Reg {
        Reg { tag, id }
    }

    pub const fn none() -> Reg {
        Reg::new(RegTag::None, 0)
    }

    /// A variable placeholder (file A before allocation).
    pub const fn var(id: RegId) -> Reg {
        Reg::new(RegTag::RegA, id)
    }

    pub const fn acc(id: RegId) -> Reg {
        Reg::new(RegTag::Acc, id)
    }

    pub const fn special(s: Special) -> Reg {
        Reg::new(RegTag::Special, s as RegId)
    }

    pub fn as_special(&self) -> Option<Special> {
        if self.tag == RegTag::Special {
            Special::from_id(self.id)
        } else {
            None
        }
    }

    pub fn is_special(&self, s: Special) -> bool {
        self.tag == RegTag::Special && self.id == s as RegId
    }

    /// True for registers living in a register file (A or B).
    pub fn is_rf_reg(&self) -> bool {
        matches!(self.tag, RegTag::RegA | RegTag::RegB)
    }

    pub fn dump(&self) -> String {
        format!("{self}")
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            RegTag::RegA => write!(f, "A{}", self.id),
            RegTag::RegB => write!(f, "B{}", self.id),
            RegTag::Acc => write!(f, "ACC{}", self.id),
            RegTag::Special => match self.as_special() {
                Some(s) => write!(f, "S[{}]", s.name()),
                None => write!(f, "S[?{}]", self.id),
            },
            RegTag::None => write!(f, "_"),
            RegTag::TmpA => write!(f, "TMP_A{}", self.id),
            RegTag::TmpB => write!(f, "TMP_B{}", self.id),
        }
    }
}

// Handy constants, mirroring the names used throughout the lowering code.
pub const ACC0: Reg = Reg::acc(0);
pub const ACC1: Reg = Reg::acc(1);
pub const ACC2: Reg = Reg::acc(2);
pub const ACC3: Reg = Reg::acc(3);
pub const ACC4: Reg = Reg::acc(4);
pub const ACC5: Reg = Reg::acc(5);
pub const UNIFORM: Reg = Reg::special(Special::Uniform);
pub const QPU_ID: Reg = Reg::special(Special::QpuNum);
pub const ELEM_ID: Reg = Reg::special(Special::ElemNum);
pub const TMU0_S: Reg = Reg::special(Special::Tmu0S);
pub const VPM_READ: Reg = Reg::special(Special::VpmRead);
pub const VPM_WRITE: Reg = Reg::special(Special::VpmWrite);
pub const RD_SETUP: Reg = Reg::special(Special::RdSetup);
pub const WR_SETUP: Reg = Reg::special(Special::WrSetup);
pub const DMA_LD_WAIT: Reg = Reg::special(Special::DmaLdWait);
pub const DMA_ST_WAIT: Reg = Reg::special(Special::DmaStWait);
pub const DMA_LD_ADDR: Reg = Reg::special(Special::DmaLdAddr);
pub const DMA_ST_ADDR: Reg = Reg::special(Special::DmaStAddr);
pub const SFU_RECIP: Reg = Reg::special(Special::SfuRecip);
pub const SFU_RECIPSQRT: Reg = Reg::special(Special::SfuRecipSqrt);
pub const SFU_EXP: Reg = Reg::special(Special::SfuExp);
pub const SFU_LOG: Reg = Reg::special(Special::SfuLog);

/// TMU data register on v3d (write side).
pub const TMUD: Reg = VPM_WRITE;
/// TMU address register on v3d (write side).
pub const TMUA: Reg = DMA_ST_ADDR;

/// An immediate operand of a load-immediate instruction.
#[derive(Debug, Clone, Copy)]
pub enum Imm {
    Int32(i32),
    Float32(f32),
    /// 16-bit per-element mask, one bit per vector lane.
    Mask(u16),
}

impl PartialEq for Imm {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Imm::Int32(a), Imm::Int32(b)) => a == b,
            (Imm::Float32(a), Imm::Float32(b)) => a.to_bits() == b.to_bits(),
            (Imm::Mask(a), Imm::Mask(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Imm {}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imm::Int32(i) => write!(f, "{i}"),
            Imm::Float32(x) => write!(f, "{x}"),
            Imm::Mask(m) => write!(f, "mask({m:#06x})"),
        }
    }
}

/// A small immediate as it appears in an ALU source operand.
///
/// The value is the vc4 small-literal code (0..=63), not the decoded value;
/// see [`encode_small_int`] and [`decode_small_lit`]. Codes 48..=63 are the
/// vc4 vector-rotate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmallImm {
    pub val: i32,
}

impl SmallImm {
    pub const fn new(val: i32) -> SmallImm {
        SmallImm { val }
    }
}

impl fmt::Display for SmallImm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", decode_small_lit(self.val))
    }
}

/// Either a register or a small immediate; the source operand of an ALU op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOrImm {
    Reg(Reg),
    Imm(SmallImm),
}

impl RegOrImm {
    pub fn is_reg(&self) -> bool {
        matches!(self, RegOrImm::Reg(_))
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, RegOrImm::Imm(_))
    }

    pub fn reg(&self) -> Reg {
        match self {
            RegOrImm::Reg(r) => *r,
            RegOrImm::Imm(_) => panic!("RegOrImm::reg() on immediate"),
        }
    }

    pub fn imm(&self) -> SmallImm {
        match self {
            RegOrImm::Imm(i) => *i,
            RegOrImm::Reg(_) => panic!("RegOrImm::imm() on register"),
        }
    }
}

impl From<Reg> for RegOrImm {
    fn from(r: Reg) -> Self {
        RegOrImm::Reg(r)
    }
}

impl From<SmallImm> for RegOrImm {
    fn from(i: SmallImm) -> Self {
        RegOrImm::Imm(i)
    }
}

impl fmt::Display for RegOrImm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegOrImm::Reg(r) => write!(f, "{r}"),
            RegOrImm::Imm(i) => write!(f, "{i}"),
        }
    }
}

// ============================================================================
// vc4 small literals
//
// The encoding table is fixed by the hardware:
//   0..15   ->  0..15
//   16..31  -> -16..-1
//   32..39  ->  1.0, 2.0, 4.0, ... 128.0        (2^0 .. 2^7)
//   40..47  ->  1/256, 1/128, ... 1/2           (2^-8 .. 2^-1)
//   48      ->  vector rotate by r5
//   49..63  ->  vector rotate by 1..15
// ============================================================================

/// Small-literal code for "rotate by r5".
pub const SMALL_LIT_ROT_R5: i32 = 48;

/// Small-literal code for "rotate by n", n in 1..=15.
pub fn small_lit_rot(n: i32) -> i32 {
    debug_assert!((1..=15).contains(&n));
    48 + n
}

/// Encode an integer as a vc4 small-literal code, if representable.
pub fn encode_small_int(v: i32) -> Option<i32> {
    match v {
        0..=15 => Some(v),
        -16..=-1 => Some(32 + v),
        _ => None,
    }
}

/// Encode a float as a vc4 small-literal code, if representable.
pub fn encode_small_float(v: f32) -> Option<i32> {
    for k in 0..8 {
        if v == (1u32 << k) as f32 {
            return Some(32 + k as i32);
        }
        if v == 1.0 / (1u32 << (8 - k)) as f32 {
            return Some(40 + k as i32);
        }
    }
    None
}

/// Decode a small-literal code back into its value.
///
/// Rotate codes (48..=63) have no operand value and decode to `Int32(0)`;
/// they are never fed back into arithmetic.
pub fn decode_small_lit(code: i32) -> Imm {
    match code {
        0..=15 => Imm::Int32(code),
        16..=31 => Imm::Int32(code - 32),
        32..=39 => Imm::Float32((1u32 << (code - 32)) as f32),
        40..=47 => Imm::Float32(1.0 / (1u32 << (48 - code)) as f32),
        _ => Imm::Int32(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_int_round_trip() {
        for v in -16..=15 {
            let code = encode_small_int(v).unwrap();
            assert_eq!(decode_small_lit(code), Imm::Int32(v), "value {v}");
        }
        assert_eq!(encode_small_int(16), None);
        assert_eq!(encode_small_int(-17), None);
    }

    #[test]
    fn small_float_round_trip() {
        for k in 0..8 {
            let v = (1u32 << k) as f32;
            let code = encode_small_float(v).unwrap();
            assert_eq!(decode_small_lit(code), Imm::Float32(v));
        }
        for k in 1..=8u32 {
            let v = 1.0 / (1u32 << k) as f32;
            let code = encode_small_float(v).unwrap();
            assert_eq!(decode_small_lit(code), Imm::Float32(v));
        }
        assert_eq!(encode_small_float(3.0), None);
        assert_eq!(encode_small_float(-1.0), None);
    }

    #[test]
    fn special_ids_are_stable() {
        for id in 0..16 {
            let s = Special::from_id(id).unwrap();
            assert_eq!(s as RegId, id);
        }
        assert!(Special::from_id(16).is_none());
    }

    #[test]
    fn reg_display() {
        assert_eq!(Reg::var(3).dump(), "A3");
        assert_eq!(Reg::new(RegTag::RegB, 7).dump(), "B7");
        assert_eq!(ACC4.dump(), "ACC4");
        assert_eq!(UNIFORM.dump(), "S[UNIFORM]");
    }
}
