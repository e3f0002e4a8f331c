//! Liveness analysis and the pre-allocation accumulator peephole.
//!
//! The analysis is the textbook backward fixed point: starting from empty
//! sets, `liveIn[i] = (liveOut[i] \ def[i]) ∪ use[i]` with
//! `liveOut[i] = ∪ liveIn[s]` over the successors, iterated until nothing
//! changes. Conditional writes count their destination as a use here (and
//! only here), so the previous value stays live across a where-masked
//! assignment.
//!
//! That conservative rule can extend a range from program entry down to the
//! first real use; a post-correction pass prunes exactly that overhang.
//!
//! Variable sets are bit sets keyed by the dense variable ids.

use log::warn;
use smallvec::SmallVec;

use super::cfg::Cfg;
use super::error::{CompileError, CompileResult};
use super::instr::{Instr, InstrList};
use super::reg::{Reg, RegId, RegTag};
use super::session::Target;

// ============================================================================
// VarSet
// ============================================================================

/// A set of variable ids, backed by a bit vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarSet {
    words: Vec<u64>,
}

impl VarSet {
    pub fn new() -> VarSet {
        VarSet::default()
    }

    pub fn with_capacity(num_vars: usize) -> VarSet {
        VarSet { words: vec![0; num_vars.div_ceil(64)] }
    }

    /// Insert `v`; returns true if the set changed.
    pub fn insert(&mut self, v: RegId) -> bool {
        let (w, b) = (v as usize / 64, v as usize % 64);
        if w >= self.words.len() {
            self.words.resize(w + 1, 0);
        }
        let old = self.words[w];
        self.words[w] = old | (1 << b);
        self.words[w] != old
    }

    pub fn remove(&mut self, v: RegId) {
        let (w, b) = (v as usize / 64, v as usize % 64);
        if w < self.words.len() {
            self.words[w] &= !(1 << b);
        }
    }

    pub fn contains(&self, v: RegId) -> bool {
        let (w, b) = (v as usize / 64, v as usize % 64);
        w < self.words.len() && (self.words[w] >> b) & 1 == 1
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Union `other` into self; returns true if self changed.
    pub fn union_with(&mut self, other: &VarSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (i, &ow) in other.words.iter().enumerate() {
            let old = self.words[i];
            self.words[i] = old | ow;
            changed |= self.words[i] != old;
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = RegId> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..64).filter_map(move |b| {
                if (w >> b) & 1 == 1 {
                    Some((wi * 64 + b) as RegId)
                } else {
                    None
                }
            })
        })
    }
}

impl FromIterator<RegId> for VarSet {
    fn from_iter<T: IntoIterator<Item = RegId>>(iter: T) -> Self {
        let mut s = VarSet::new();
        for v in iter {
            s.insert(v);
        }
        s
    }
}

// ============================================================================
// Liveness
// ============================================================================

/// Per-instruction live-in sets over a fixed CFG.
pub struct Liveness<'a> {
    cfg: &'a Cfg,
    live_in: Vec<VarSet>,
}

impl<'a> Liveness<'a> {
    /// Run the analysis to its fixed point, then prune the entry overhang
    /// introduced by the where-assign rule.
    pub fn compute(cfg: &'a Cfg, instrs: &InstrList, num_vars: usize) -> Liveness<'a> {
        debug_assert_eq!(cfg.len(), instrs.len());
        let n = instrs.len();
        let mut live_in = vec![VarSet::with_capacity(num_vars); n];

        // Cache the use/def sets; they do not change across iterations.
        let use_defs: Vec<_> = instrs.iter().map(|i| i.use_def(true)).collect();

        let mut live_out = VarSet::with_capacity(num_vars);
        let mut changed = true;
        while changed {
            changed = false;

            for i in (0..n).rev() {
                live_out.clear();
                for &s in cfg.succs(i) {
                    live_out.union_with(&live_in[s]);
                }

                let ud = &use_defs[i];
                for v in live_out.iter() {
                    if !ud.def_vars.contains(&v) {
                        changed |= live_in[i].insert(v);
                    }
                }
                for &v in &ud.use_vars {
                    changed |= live_in[i].insert(v);
                }
            }
        }

        let mut live = Liveness { cfg, live_in };
        live.prune_entry_overhang(instrs, num_vars);
        live
    }

    /// Remove ranges that run from program entry to the first definition.
    ///
    /// Such a range means the variable was made live purely by the
    /// where-assign-counts-as-use rule; the value before the first definition
    /// does not actually exist.
    fn prune_entry_overhang(&mut self, instrs: &InstrList, num_vars: usize) {
        let mut first_def: Vec<Option<usize>> = vec![None; num_vars];
        for (i, instr) in instrs.iter().enumerate() {
            for &d in &instr.use_def(false).def_vars {
                let slot = &mut first_def[d as usize];
                if slot.is_none() {
                    *slot = Some(i);
                }
            }
        }

        let mut first_live: Vec<Option<usize>> = vec![None; num_vars];
        for (i, set) in self.live_in.iter().enumerate() {
            for v in set.iter() {
                let slot = &mut first_live[v as usize];
                if slot.is_none() {
                    *slot = Some(i);
                }
            }
        }

        for v in 0..num_vars {
            if let (Some(fd), Some(fl)) = (first_def[v], first_live[v]) {
                if fd + 1 != fl && fl <= fd {
                    for j in fl..=fd {
                        self.live_in[j].remove(v as RegId);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.live_in.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live_in.is_empty()
    }

    pub fn live_in(&self, i: usize) -> &VarSet {
        &self.live_in[i]
    }

    /// The union of the live-in sets of the successors of `i`.
    pub fn compute_live_out(&self, i: usize, out: &mut VarSet) {
        out.clear();
        for &s in self.cfg.succs(i) {
            out.union_with(&self.live_in[s]);
        }
    }

    pub fn dump(&self) -> String {
        let mut ret = String::new();
        for (i, set) in self.live_in.iter().enumerate() {
            let vars: Vec<String> = set.iter().map(|v| v.to_string()).collect();
            ret.push_str(&format!("{i}: {}\n", vars.join(", ")));
        }
        ret.push('\n');
        ret
    }
}

// ============================================================================
// RegUsage
// ============================================================================

/// Usage statistics for one variable.
#[derive(Debug, Clone)]
pub struct RegUsageItem {
    /// Register assigned to the variable; `None` tag until allocation.
    pub reg: Reg,
    pub dst_use: u32,
    pub src_use: u32,
    pub dst_first: Option<usize>,
    pub src_first: Option<usize>,
    pub live_first: Option<usize>,
    pub live_last: Option<usize>,
    pub live_count: usize,
}

impl Default for RegUsageItem {
    fn default() -> Self {
        RegUsageItem {
            reg: Reg::none(),
            dst_use: 0,
            src_use: 0,
            dst_first: None,
            src_first: None,
            live_first: None,
            live_last: None,
            live_count: 0,
        }
    }
}

impl RegUsageItem {
    pub fn unused(&self) -> bool {
        self.dst_use == 0 && self.src_use == 0
    }

    /// Defined but never read.
    pub fn only_assigned(&self) -> bool {
        self.dst_use > 0 && self.src_use == 0
    }

    /// Read but never defined on any path; always a compile error.
    pub fn never_assigned(&self) -> bool {
        self.src_use > 0 && self.dst_use == 0
    }

    fn add_live(&mut self, n: usize) {
        if self.live_first.map_or(true, |f| f > n) {
            self.live_first = Some(n);
        }
        if self.live_last.map_or(true, |l| l < n) {
            self.live_last = Some(n);
        }
        self.live_count += 1;
    }

    pub fn dump(&self) -> String {
        if self.unused() {
            return format!("{}; Not used", self.reg.dump());
        }
        let opt = |o: Option<usize>| o.map_or("-".into(), |v: usize| v.to_string());
        format!(
            "{}; use(dst_first, src_first, dst_count, src_count): ({}, {}, {}, {}); live(first, last, count): ({}, {}, {})",
            self.reg.dump(),
            opt(self.dst_first),
            opt(self.src_first),
            self.dst_use,
            self.src_use,
            opt(self.live_first),
            opt(self.live_last),
            self.live_count,
        )
    }
}

/// Per-variable usage table, indexed by variable id.
#[derive(Debug, Clone, Default)]
pub struct RegUsage {
    items: Vec<RegUsageItem>,
}

impl RegUsage {
    pub fn new(num_vars: usize) -> RegUsage {
        RegUsage { items: vec![RegUsageItem::default(); num_vars] }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Collect definition and use counts from the instruction list.
    pub fn set_used(&mut self, instrs: &InstrList) {
        for (i, instr) in instrs.iter().enumerate() {
            let ud = instr.use_def(false);
            for &d in &ud.def_vars {
                let item = &mut self.items[d as usize];
                if item.dst_first.map_or(true, |f| f > i) {
                    item.dst_first = Some(i);
                }
                item.dst_use += 1;
            }
            for &u in &ud.use_vars {
                let item = &mut self.items[u as usize];
                if item.src_first.map_or(true, |f| f > i) {
                    item.src_first = Some(i);
                }
                item.src_use += 1;
            }
        }
    }

    /// Collect live-range extents from a computed liveness table.
    pub fn set_live(&mut self, live: &Liveness<'_>) {
        for i in 0..live.len() {
            for v in live.live_in(i).iter() {
                self.items[v as usize].add_live(i);
            }
        }
    }

    /// Enforce the definedness invariants.
    ///
    /// Variables that are defined but never used get a warning; variables
    /// used but never defined are a hard error.
    pub fn check(&self, target: Target) -> CompileResult<()> {
        let only = self.assigned_only_list();
        if !only.is_empty() {
            warn!(
                "RegUsage in reg_alloc() {target}: variables assigned but never used: {}",
                only.join(",")
            );
        }

        let never = self.never_assigned_list();
        if !never.is_empty() {
            return Err(CompileError::invariant(format!(
                "RegUsage in reg_alloc() {target}: variables used but never assigned: {}",
                never.join(",")
            )));
        }
        Ok(())
    }

    pub fn unused_list(&self) -> Vec<String> {
        self.filtered_list(|it| it.unused())
    }

    pub fn assigned_only_list(&self) -> Vec<String> {
        self.filtered_list(|it| it.only_assigned())
    }

    pub fn never_assigned_list(&self) -> Vec<String> {
        self.filtered_list(|it| it.never_assigned())
    }

    fn filtered_list(&self, pred: impl Fn(&RegUsageItem) -> bool) -> Vec<String> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, it)| pred(it))
            .map(|(i, _)| i.to_string())
            .collect()
    }

    pub fn allocated_registers_dump(&self) -> String {
        let mut ret = String::new();
        for (i, item) in self.items.iter().enumerate() {
            ret.push_str(&format!("{i}: {}\n", item.reg.dump()));
        }
        ret
    }

    pub fn dump(&self, verbose: bool) -> String {
        if !verbose {
            return self.allocated_registers_dump();
        }

        let mut ret = String::new();
        for (i, item) in self.items.iter().enumerate() {
            if !item.unused() {
                ret.push_str(&format!("{i}: {}\n", item.dump()));
            }
        }

        let unused = self.unused_list();
        if !unused.is_empty() {
            ret.push_str(&format!("\nNot used: {}\n", unused.join(",")));
        }
        let only = self.assigned_only_list();
        if !only.is_empty() {
            ret.push_str(&format!("\nOnly assigned: {}\n", only.join(",")));
        }
        let never = self.never_assigned_list();
        if !never.is_empty() {
            ret.push_str(&format!("\nNever assigned: {}\n", never.join(",")));
        }
        ret
    }
}

impl std::ops::Index<RegId> for RegUsage {
    type Output = RegUsageItem;
    fn index(&self, i: RegId) -> &RegUsageItem {
        &self.items[i as usize]
    }
}

impl std::ops::IndexMut<RegId> for RegUsage {
    fn index_mut(&mut self, i: RegId) -> &mut RegUsageItem {
        &mut self.items[i as usize]
    }
}

// ============================================================================
// Interference sets
// ============================================================================

/// For each variable, the set of variables it may never share a register
/// with: those simultaneously live-out of some instruction, and those live
/// while it is being defined.
pub struct LiveSets {
    sets: Vec<VarSet>,
}

impl LiveSets {
    pub fn new(num_vars: usize) -> LiveSets {
        LiveSets { sets: vec![VarSet::with_capacity(num_vars); num_vars] }
    }

    pub fn init(&mut self, instrs: &InstrList, live: &Liveness<'_>) {
        let mut live_out = VarSet::new();

        for (i, instr) in instrs.iter().enumerate() {
            live.compute_live_out(i, &mut live_out);
            let ud = instr.use_def(false);

            let out: SmallVec<[RegId; 8]> = live_out.iter().collect();
            for &rx in &out {
                for &ry in &out {
                    if rx != ry {
                        self.sets[rx as usize].insert(ry);
                    }
                }
                for &rd in &ud.def_vars {
                    if rd != rx {
                        self.sets[rx as usize].insert(rd);
                        self.sets[rd as usize].insert(rx);
                    }
                }
            }
        }
    }

    pub fn interferes(&self, x: RegId, y: RegId) -> bool {
        self.sets[x as usize].contains(y)
    }

    /// The register-file slots still available for variable `index` in the
    /// file identified by `reg_tag` (vc4: `RegA` or `RegB`).
    pub fn possible_registers(&self, index: RegId, alloc: &RegUsage, reg_tag: RegTag, num_regs: usize) -> Vec<bool> {
        debug_assert!(reg_tag == RegTag::RegA || reg_tag == RegTag::RegB);
        let mut possible = vec![true; num_regs];

        for n in self.sets[index as usize].iter() {
            let neighbour = alloc[n].reg;
            if neighbour.tag == reg_tag {
                possible[neighbour.id as usize] = false;
            }
        }
        possible
    }

    /// v3d variant: one unified file; file-B neighbours occupy slot id + 32.
    pub fn possible_slots(&self, index: RegId, alloc: &RegUsage, num_slots: usize) -> Vec<bool> {
        let mut possible = vec![true; num_slots];

        for n in self.sets[index as usize].iter() {
            let neighbour = alloc[n].reg;
            let slot = match neighbour.tag {
                RegTag::RegA => Some(neighbour.id as usize),
                RegTag::RegB => Some(neighbour.id as usize + 32),
                _ => None,
            };
            if let Some(s) = slot {
                if s < num_slots {
                    possible[s] = false;
                }
            }
        }
        possible
    }

    /// First available register in a possible-vector.
    pub fn choose_register(possible: &[bool]) -> Option<RegId> {
        possible.iter().position(|&p| p).map(|i| i as RegId)
    }
}

// ============================================================================
// Accumulator peephole
// ============================================================================

/// Accumulator used for a substitution around `prev`/`instr`.
///
/// r1 by default; rotates on v3d use r0/r1 internally, so a rotate in either
/// slot pushes the substitution to r2.
fn replacement_acc(target: Target, prev: &Instr, instr: &Instr) -> Reg {
    let mut acc_id = 1;
    if target == Target::V3d && (prev.is_rot() || instr.is_rot()) {
        warn!("introduce_accum(): substituting ACC in rotate operation");
        acc_id = 2;
    }
    Reg::acc(acc_id)
}

/// Rewrite rule:
///
/// ```text
///     i:  x <- f(...)
///     j:  g(..., x, ...)        j = i + 1
///
/// ===> if x not live-out of j
///
///     i:  acc <- f(...)
///     j:  g(..., acc, ...)
/// ```
///
/// Skipped when the defining instruction assigns conditionally; the
/// substitution would clobber the masked lanes.
fn peephole_1(target: Target, live: &Liveness<'_>, instrs: &mut InstrList, allocated_vars: &mut RegUsage) -> usize {
    let mut live_out = VarSet::new();
    let mut subst_count = 0;

    for i in 1..instrs.len() {
        let ud_prev = instrs[i - 1].use_def(false);
        if ud_prev.def_vars.is_empty() {
            continue;
        }
        let def = ud_prev.def_vars[0];

        let ud_cur = instrs[i].use_def(false);
        live.compute_live_out(i, &mut live_out);

        let do_it = ud_cur.use_vars.contains(&def) && !live_out.contains(def);
        if !do_it {
            continue;
        }

        if !instrs[i - 1].is_always() {
            continue;
        }

        let current = Reg::var(def);
        let replace_with = replacement_acc(target, &instrs[i - 1], &instrs[i]);

        instrs[i - 1].rename_dest(current, replace_with);
        instrs[i].rename_uses(current, replace_with);

        // Stored for debug display only; later passes must not rely on it.
        allocated_vars[def].reg = replace_with;

        subst_count += 1;
    }

    subst_count
}

/// Dead stores: a variable that is assigned but never read is rewritten to
/// an accumulator so the slot never reaches the allocator.
fn peephole_2(target: Target, instrs: &mut InstrList, allocated_vars: &mut RegUsage) -> usize {
    let mut subst_count = 0;
    let prev = Instr::nop();

    for i in 0..instrs.len() {
        let ud = instrs[i].use_def(false);
        if ud.def_vars.is_empty() {
            continue;
        }
        let def = ud.def_vars[0];

        if !allocated_vars[def].only_assigned() {
            continue;
        }

        let current = Reg::var(def);
        let replace_with = replacement_acc(target, &prev, &instrs[i]);
        instrs[i].rename_dest(current, replace_with);

        allocated_vars[def].reg = replace_with;
        subst_count += 1;
    }

    subst_count
}

/// Run both accumulator passes; returns the number of substitutions.
pub fn introduce_accum(
    target: Target,
    live: &Liveness<'_>,
    instrs: &mut InstrList,
    allocated_vars: &mut RegUsage,
) -> usize {
    peephole_1(target, live, instrs, allocated_vars) + peephole_2(target, instrs, allocated_vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cfg::Cfg;
    use crate::core::cond::{AssignCond, BranchCond, Flag};
    use crate::core::instr::InstrKind;
    use crate::core::ops::AluOp;
    use crate::core::reg::Imm;

    fn simple_add_program() -> InstrList {
        let mut l = InstrList::new();
        l.push(Instr::li(Reg::var(0), Imm::Int32(100)));
        l.push(Instr::li(Reg::var(1), Imm::Int32(200)));
        l.push(Instr::alu(Reg::var(2), Reg::var(0), AluOp::Add, Reg::var(1)));
        l.push(Instr::mov(Reg::var(3), Reg::var(2)));
        l.push(Instr::end());
        l
    }

    #[test]
    fn varset_basics() {
        let mut s = VarSet::new();
        assert!(s.insert(3));
        assert!(!s.insert(3));
        assert!(s.insert(100));
        assert!(s.contains(3));
        assert!(s.contains(100));
        assert!(!s.contains(4));
        assert_eq!(s.len(), 2);
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![3, 100]);
        s.remove(3);
        assert!(!s.contains(3));
    }

    #[test]
    fn liveness_reaches_fixpoint() {
        let instrs = simple_add_program();
        let cfg = Cfg::build(&instrs).unwrap();
        let live = Liveness::compute(&cfg, &instrs, 4);

        // live-in of the add: v0 and v1
        let at2: Vec<_> = live.live_in(2).iter().collect();
        assert_eq!(at2, vec![0, 1]);

        // live-in of the mov: v2 only
        let at3: Vec<_> = live.live_in(3).iter().collect();
        assert_eq!(at3, vec![2]);

        // Fixpoint property: liveIn[i] == (liveOut[i] \ def) ∪ use for all i.
        let mut live_out = VarSet::new();
        for (i, instr) in instrs.iter().enumerate() {
            live.compute_live_out(i, &mut live_out);
            let ud = instr.use_def(true);
            let mut expect = VarSet::new();
            for v in live_out.iter() {
                if !ud.def_vars.contains(&v) {
                    expect.insert(v);
                }
            }
            for &v in &ud.use_vars {
                expect.insert(v);
            }
            assert_eq!(*live.live_in(i), expect, "fixpoint violated at {i}");
        }
    }

    #[test]
    fn liveness_through_a_loop() {
        // v0 = 0; L0: v0 = v0 + 1; if any(ZC) br L0; end
        let mut l = InstrList::new();
        l.push(Instr::li(Reg::var(0), Imm::Int32(0)));
        l.push(Instr::label(0));
        l.push(
            Instr::alu(Reg::var(0), Reg::var(0), AluOp::Add, Reg::var(1))
                .with_set_cond(crate::core::cond::SetCond::Z),
        );
        l.push(Instr::branch(BranchCond::Any(Flag::Zc), 0));
        l.push(Instr::end());

        let cfg = Cfg::build(&l).unwrap();
        let live = Liveness::compute(&cfg, &l, 2);

        // v1 is never assigned: live from entry into the loop
        assert!(live.live_in(0).contains(1));
        assert!(live.live_in(2).contains(0));
        assert!(live.live_in(2).contains(1));
        // back edge keeps v0 live at the branch
        assert!(live.live_in(3).contains(0));
    }

    #[test]
    fn where_assign_overhang_is_pruned() {
        // v0 defined at 2 (conditionally), used at 3. The where-use rule
        // would make it live from entry; the post-correction removes that.
        let mut l = InstrList::new();
        l.push(Instr::li(Reg::var(1), Imm::Int32(0)));
        l.push(Instr::nop());
        l.push(Instr::li(Reg::var(0), Imm::Int32(1)).with_cond(AssignCond::Flag(Flag::Zs)));
        l.push(Instr::mov(Reg::var(2), Reg::var(0)));
        l.push(Instr::end());

        let cfg = Cfg::build(&l).unwrap();
        let live = Liveness::compute(&cfg, &l, 3);

        assert!(!live.live_in(0).contains(0), "overhang not pruned at entry");
        assert!(!live.live_in(2).contains(0));
        assert!(live.live_in(3).contains(0), "genuine range must survive");
    }

    #[test]
    fn reg_usage_classification() {
        let instrs = simple_add_program();
        let mut usage = RegUsage::new(5);
        usage.set_used(&instrs);

        assert!(!usage[0].unused());
        assert_eq!(usage[0].dst_use, 1);
        assert_eq!(usage[0].src_use, 1);
        assert_eq!(usage[0].dst_first, Some(0));
        assert_eq!(usage[0].src_first, Some(2));

        assert!(usage[3].only_assigned());
        assert!(usage[4].unused());
        assert!(usage.check(Target::V3d).is_ok());
    }

    #[test]
    fn never_assigned_is_hard_error() {
        let mut l = InstrList::new();
        l.push(Instr::mov(Reg::var(1), Reg::var(0)));
        l.push(Instr::end());

        let mut usage = RegUsage::new(2);
        usage.set_used(&l);
        assert!(usage[0].never_assigned());
        assert!(usage.check(Target::Vc4).is_err());
    }

    #[test]
    fn interference_from_live_out() {
        let instrs = simple_add_program();
        let cfg = Cfg::build(&instrs).unwrap();
        let live = Liveness::compute(&cfg, &instrs, 4);
        let mut sets = LiveSets::new(4);
        sets.init(&instrs, &live);

        // v0 and v1 are simultaneously live
        assert!(sets.interferes(0, 1));
        assert!(sets.interferes(1, 0));
        // v0 and v1 are dead once v2 is defined
        assert!(!sets.interferes(2, 0));
        assert!(!sets.interferes(2, 1));
    }

    #[test]
    fn peephole_rewrites_adjacent_def_use() {
        let mut instrs = simple_add_program();
        let cfg = Cfg::build(&instrs).unwrap();

        let mut usage = RegUsage::new(4);
        usage.set_used(&instrs);
        let live = Liveness::compute(&cfg, &instrs, 4);

        let n = introduce_accum(Target::V3d, &live, &mut instrs, &mut usage);
        assert!(n >= 1, "expected at least one substitution, got {n}");

        // v2 was defined at 2 and used at 3 with no later use: must be gone.
        for instr in instrs.iter() {
            let ud = instr.use_def(false);
            assert!(!ud.use_vars.contains(&2), "v2 still used: {}", instr.dump());
            assert!(!ud.def_vars.contains(&2), "v2 still defined: {}", instr.dump());
        }
    }

    #[test]
    fn peephole_skips_conditional_def() {
        let mut l = InstrList::new();
        l.push(Instr::li(Reg::var(0), Imm::Int32(1)).with_cond(AssignCond::Flag(Flag::Zs)));
        l.push(Instr::mov(Reg::var(1), Reg::var(0)));
        l.push(Instr::mov(Reg::var(2), Reg::var(1)));
        l.push(Instr::end());

        let cfg = Cfg::build(&l).unwrap();
        let mut usage = RegUsage::new(3);
        usage.set_used(&l);
        let live = Liveness::compute(&cfg, &l, 3);

        introduce_accum(Target::V3d, &live, &mut l, &mut usage);

        // the conditional def of v0 must not be rewritten
        match &l[0].kind {
            InstrKind::LoadImm { dest, .. } => assert_eq!(*dest, Reg::var(0)),
            _ => panic!("unexpected shape"),
        }
    }

    #[test]
    fn peephole_respects_live_out() {
        // v0 used at i+1 but also live later: no substitution allowed.
        let mut l = InstrList::new();
        l.push(Instr::li(Reg::var(0), Imm::Int32(1)));
        l.push(Instr::mov(Reg::var(1), Reg::var(0)));
        l.push(Instr::mov(Reg::var(2), Reg::var(0)));
        l.push(Instr::end());

        let cfg = Cfg::build(&l).unwrap();
        let mut usage = RegUsage::new(3);
        usage.set_used(&l);
        let live = Liveness::compute(&cfg, &l, 3);

        introduce_accum(Target::V3d, &live, &mut l, &mut usage);

        match &l[0].kind {
            InstrKind::LoadImm { dest, .. } => assert_eq!(*dest, Reg::var(0)),
            _ => panic!("unexpected shape"),
        }
    }

    #[test]
    fn rotate_pushes_substitution_to_r2() {
        let mut l = InstrList::new();
        l.push(Instr::li(Reg::var(0), Imm::Int32(1)));
        l.push(Instr::alu(
            Reg::var(1),
            Reg::var(0),
            AluOp::Rotate,
            crate::core::reg::RegOrImm::Imm(crate::core::reg::SmallImm::new(3)),
        ));
        l.push(Instr::mov(Reg::var(2), Reg::var(1)));
        l.push(Instr::end());

        let cfg = Cfg::build(&l).unwrap();
        let mut usage = RegUsage::new(3);
        usage.set_used(&l);
        let live = Liveness::compute(&cfg, &l, 3);

        introduce_accum(Target::V3d, &live, &mut l, &mut usage);

        // the def feeding the rotate went to r2, not r1
        assert_eq!(l[0].dst_reg(), Reg::acc(2));
    }
}
