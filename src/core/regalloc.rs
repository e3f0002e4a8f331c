//! Graph-colouring register allocation.
//!
//! The incoming instruction list has every variable tagged as a file-A
//! register whose id is the variable index. Colouring happens against the
//! interference sets from [`LiveSets`]; the chosen physical register is
//! written back through a two-phase rename (first to the transient
//! `TmpA`/`TmpB` tags, then globally back to `RegA`/`RegB`). Without the
//! intermediate tags, renaming variable i to register i would collide with a
//! not-yet-renamed variable of the same id. This has happened IRL.
//!
//! Spill code is not implemented: register pressure beyond the file is a
//! compile-time error.

use log::warn;

use super::cfg::Cfg;
use super::error::{CompileError, CompileResult};
use super::instr::InstrList;
use super::liveness::{introduce_accum, LiveSets, Liveness, RegUsage};
use super::reg::{Reg, RegTag, V3D_REGFILE_SIZE, VC4_REGFILE_SIZE};
use super::session::CompileContext;

/// The two register operands of an ALU instruction, if it has two.
fn get_two_uses(instr: &super::instr::Instr) -> Option<(Reg, Reg)> {
    if let super::instr::InstrKind::Alu(alu) = &instr.kind {
        if alu.src_a.is_reg() && alu.src_b.is_reg() {
            return Some((alu.src_a.reg(), alu.src_b.reg()));
        }
    }
    None
}

/// For each variable, count the pull toward register file A or B.
///
/// Two variables read by the same instruction must come from different
/// files; an immediate on one side occupies raddr B, biasing the register
/// operand toward A.
fn determine_regfile_prefs(instrs: &InstrList, pref_a: &mut [i32], pref_b: &mut [i32]) {
    for instr in instrs.iter() {
        if let Some((ra, rb)) = get_two_uses(instr) {
            if ra.tag == RegTag::RegA && rb.tag == RegTag::RegA {
                let x = ra.id as usize;
                let y = rb.id as usize;
                if pref_a[x] > pref_a[y] || pref_b[y] > pref_b[x] {
                    pref_a[x] += 1;
                    pref_b[y] += 1;
                } else {
                    pref_a[y] += 1;
                    pref_b[x] += 1;
                }
                continue;
            }
        }

        if let super::instr::InstrKind::Alu(alu) = &instr.kind {
            if alu.src_a.is_reg() && alu.src_a.reg().tag == RegTag::RegA && alu.src_b.is_imm() {
                pref_a[alu.src_a.reg().id as usize] += 1;
            } else if alu.src_b.is_reg() && alu.src_b.reg().tag == RegTag::RegA && alu.src_a.is_imm() {
                pref_a[alu.src_b.reg().id as usize] += 1;
            }
        }
    }
}

/// The allocator requires a list without file-B or transient registers.
fn check_safe_for_regalloc(instrs: &InstrList) -> CompileResult<()> {
    for instr in instrs.iter() {
        let ud = instr.use_def_reg(false);
        for r in ud.use_regs.iter().chain(ud.def_regs.iter()) {
            if matches!(r.tag, RegTag::RegB | RegTag::TmpA | RegTag::TmpB) {
                return Err(CompileError::invariant(format!(
                    "reg_alloc(): unexpected register {} in pre-allocation code",
                    r.dump()
                )));
            }
        }
    }
    Ok(())
}

/// Run the accumulator pre-pass, recompute liveness, enforce the usage
/// invariants, and return the usage table ready for colouring.
fn prepare<'a>(
    ctx: &mut CompileContext<'_>,
    cfg: &'a Cfg,
    instrs: &mut InstrList,
    num_vars: usize,
) -> CompileResult<(RegUsage, Liveness<'a>)> {
    // Introduce accumulators where possible. The idea is to minimize
    // beforehand the number of variables considered in the liveness
    // analysis.
    {
        let mut alloc = RegUsage::new(num_vars);
        alloc.set_used(instrs);
        let live = Liveness::compute(cfg, instrs, num_vars);
        ctx.compile_data.num_accs_introduced = introduce_accum(ctx.target(), &live, instrs, &mut alloc);
    }

    let mut alloc = RegUsage::new(num_vars);
    alloc.set_used(instrs);
    let live = Liveness::compute(cfg, instrs, num_vars);
    ctx.compile_data.liveness_dump = live.dump();
    alloc.set_live(&live);
    alloc.check(ctx.target())?;

    Ok((alloc, live))
}

/// Step 4 - apply the allocation to the code.
///
/// Per instruction, every variable operand is renamed to its allocated
/// register via the transient tags, then the tags are resolved in one go.
fn apply_allocation(instrs: &mut InstrList, alloc: &RegUsage) {
    for i in 0..instrs.len() {
        let instr = instrs.get_mut(i);
        let ud = instr.use_def(false);

        for &r in &ud.def_vars {
            let mut replace_with = alloc[r].reg;
            if replace_with.tag == RegTag::Acc {
                warn!(
                    "reg_alloc(): ACC encountered in register allocation of dest vars, not expecting this. \
                     Instruction: {}, reg id: {r}",
                    instr.dump()
                );
                continue;
            }
            replace_with.tag = if replace_with.tag == RegTag::RegA { RegTag::TmpA } else { RegTag::TmpB };
            instr.rename_dest(Reg::var(r), replace_with);
        }

        for &r in &ud.use_vars {
            let mut replace_with = alloc[r].reg;
            if replace_with.tag == RegTag::Acc {
                warn!(
                    "reg_alloc(): ACC encountered in register allocation of use vars, not expecting this. \
                     Instruction: {}, reg id: {r}",
                    instr.dump()
                );
                continue;
            }
            replace_with.tag = if replace_with.tag == RegTag::RegA { RegTag::TmpA } else { RegTag::TmpB };
            instr.rename_uses(Reg::var(r), replace_with);
        }

        instr.subst_reg_tag(RegTag::TmpA, RegTag::RegA);
        instr.subst_reg_tag(RegTag::TmpB, RegTag::RegB);
    }
}

/// Post-condition of both allocators: only physical registers remain.
fn check_allocation(instrs: &InstrList, regfile_size: usize) -> CompileResult<()> {
    for instr in instrs.iter() {
        let ud = instr.use_def_reg(false);
        for r in ud.use_regs.iter().chain(ud.def_regs.iter()) {
            let ok = match r.tag {
                RegTag::RegA | RegTag::RegB => (r.id as usize) < regfile_size.min(VC4_REGFILE_SIZE),
                RegTag::Acc => r.id <= 5,
                RegTag::Special | RegTag::None => true,
                RegTag::TmpA | RegTag::TmpB => false,
            };
            if !ok {
                return Err(CompileError::invariant(format!(
                    "reg_alloc(): {} escaped allocation in '{}'",
                    r.dump(),
                    instr.dump()
                )));
            }
        }
    }
    Ok(())
}

pub mod vc4 {
    use super::*;

    /// Allocate registers across the two vc4 register files.
    pub fn reg_alloc(ctx: &mut CompileContext<'_>, cfg: &Cfg, instrs: &mut InstrList) -> CompileResult<()> {
        check_safe_for_regalloc(instrs)?;

        let num_vars = ctx.fresh_var_count();
        let (mut alloc, live) = prepare(ctx, cfg, instrs, num_vars)?;

        // Step 1 - for each variable, determine a preference for register
        // file A or B.
        let arena = ctx.arena();
        let pref_a = arena.alloc_slice_fill_copy(num_vars, 0i32);
        let pref_b = arena.alloc_slice_fill_copy(num_vars, 0i32);
        determine_regfile_prefs(instrs, pref_a, pref_b);

        // Step 2 - for each variable, determine all variables ever live at
        // the same time.
        let mut live_with = LiveSets::new(num_vars);
        live_with.init(instrs, &live);

        // Step 3 - allocate a register to each variable.
        let mut prev_chosen_file = RegTag::RegB;

        for i in 0..num_vars {
            let i = i as u32;
            if alloc[i].reg.tag != RegTag::None {
                continue; // already carries an accumulator from the peephole
            }
            if alloc[i].unused() {
                continue;
            }

            let possible_a = live_with.possible_registers(i, &alloc, RegTag::RegA, VC4_REGFILE_SIZE);
            let possible_b = live_with.possible_registers(i, &alloc, RegTag::RegB, VC4_REGFILE_SIZE);

            let chosen_a = LiveSets::choose_register(&possible_a);
            let chosen_b = LiveSets::choose_register(&possible_b);

            let chosen_file = match (chosen_a, chosen_b) {
                (None, None) => {
                    return Err(CompileError::RegAllocFailure {
                        reason: "insufficient capacity in both vc4 register files".into(),
                    })
                }
                (None, Some(_)) => RegTag::RegB,
                (Some(_), None) => RegTag::RegA,
                (Some(_), Some(_)) => {
                    if pref_a[i as usize] > pref_b[i as usize] {
                        RegTag::RegA
                    } else if pref_a[i as usize] < pref_b[i as usize] {
                        RegTag::RegB
                    } else if prev_chosen_file == RegTag::RegA {
                        RegTag::RegB
                    } else {
                        RegTag::RegA
                    }
                }
            };
            prev_chosen_file = chosen_file;

            let id = if chosen_file == RegTag::RegA {
                chosen_a.unwrap()
            } else {
                chosen_b.unwrap()
            };
            alloc[i].reg = Reg::new(chosen_file, id);
        }

        ctx.compile_data.allocated_registers_dump = alloc.allocated_registers_dump();
        ctx.compile_data.reg_usage_dump = alloc.dump(true);

        apply_allocation(instrs, &alloc);
        check_allocation(instrs, VC4_REGFILE_SIZE)
    }
}

pub mod v3d {
    use super::*;

    /// Allocate registers in the unified 64-slot v3d register file.
    ///
    /// Identical to vc4 colouring except there is a single file and no
    /// file preference. Slots 32..63 are represented as file-B ids 0..31 by
    /// convention; the v3d encoder folds them back to one namespace.
    pub fn reg_alloc(ctx: &mut CompileContext<'_>, cfg: &Cfg, instrs: &mut InstrList) -> CompileResult<()> {
        check_safe_for_regalloc(instrs)?;

        let num_vars = ctx.fresh_var_count();
        let (mut alloc, live) = prepare(ctx, cfg, instrs, num_vars)?;

        let mut live_with = LiveSets::new(num_vars);
        live_with.init(instrs, &live);

        for i in 0..num_vars {
            let i = i as u32;
            if alloc[i].reg.tag != RegTag::None {
                continue;
            }
            if alloc[i].unused() {
                continue;
            }

            let possible = live_with.possible_slots(i, &alloc, V3D_REGFILE_SIZE);
            let slot = LiveSets::choose_register(&possible).ok_or_else(|| CompileError::RegAllocFailure {
                reason: "insufficient capacity in the v3d register file".into(),
            })?;

            alloc[i].reg = if (slot as usize) < VC4_REGFILE_SIZE {
                Reg::new(RegTag::RegA, slot)
            } else {
                Reg::new(RegTag::RegB, slot - VC4_REGFILE_SIZE as u32)
            };
        }

        ctx.compile_data.allocated_registers_dump = alloc.allocated_registers_dump();
        ctx.compile_data.reg_usage_dump = alloc.dump(true);

        apply_allocation(instrs, &alloc);
        check_allocation(instrs, V3D_REGFILE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instr::{Instr, InstrKind};
    use crate::core::liveness::VarSet;
    use crate::core::ops::AluOp;
    use crate::core::reg::Imm;
    use crate::core::session::Target;
    use bumpalo::Bump;

    fn ctx_for(arena: &Bump, target: Target, num_vars: u32) -> CompileContext<'_> {
        let mut ctx = CompileContext::new(arena, target);
        ctx.adopt_var_count(num_vars);
        ctx
    }

    /// A program keeping `n` variables simultaneously live.
    fn pressure_program(n: u32) -> InstrList {
        let mut l = InstrList::new();
        for v in 0..n {
            l.push(Instr::li(Reg::var(v), Imm::Int32(v as i32)));
        }
        // single instruction reading all of them pairwise keeps them alive
        // until their final use below
        for v in 0..n {
            let next = (v + 1) % n;
            l.push(Instr::alu(Reg::var(n + v), Reg::var(v), AluOp::Add, Reg::var(next)));
        }
        // consume the sums so nothing is only-assigned
        let mut acc = Reg::var(n);
        for v in 1..n {
            let dst = Reg::var(2 * n + v);
            l.push(Instr::alu(dst, acc, AluOp::Add, Reg::var(n + v)));
            acc = dst;
        }
        l.push(Instr::alu(Reg::special(crate::core::reg::Special::VpmWrite), acc, AluOp::BOr, acc));
        l.push(Instr::end());
        l
    }

    fn all_operand_regs(instrs: &InstrList) -> Vec<Reg> {
        let mut out = Vec::new();
        for instr in instrs.iter() {
            let ud = instr.use_def_reg(false);
            out.extend(ud.use_regs);
            out.extend(ud.def_regs);
        }
        out
    }

    #[test]
    fn v3d_simple_allocation_removes_all_variables() {
        let arena = Bump::new();
        let mut ctx = ctx_for(&arena, Target::V3d, 4);

        let mut instrs = InstrList::new();
        instrs.push(Instr::li(Reg::var(0), Imm::Int32(100)));
        instrs.push(Instr::li(Reg::var(1), Imm::Int32(200)));
        instrs.push(Instr::alu(Reg::var(2), Reg::var(0), AluOp::Add, Reg::var(1)));
        instrs.push(Instr::alu(
            Reg::special(crate::core::reg::Special::VpmWrite),
            Reg::var(2),
            AluOp::BOr,
            Reg::var(2),
        ));
        instrs.push(Instr::end());

        let cfg = Cfg::build(&instrs).unwrap();
        v3d::reg_alloc(&mut ctx, &cfg, &mut instrs).unwrap();

        for r in all_operand_regs(&instrs) {
            assert!(
                matches!(r.tag, RegTag::RegA | RegTag::RegB | RegTag::Acc | RegTag::Special),
                "unallocated register {} left behind",
                r.dump()
            );
            if r.tag == RegTag::RegA || r.tag == RegTag::RegB {
                assert!(r.id < 32);
            }
        }
    }

    #[test]
    fn allocation_respects_interference() {
        let arena = Bump::new();
        let n = 8u32;
        let mut ctx = ctx_for(&arena, Target::V3d, 3 * n);

        let mut instrs = pressure_program(n);
        let cfg = Cfg::build(&instrs).unwrap();
        v3d::reg_alloc(&mut ctx, &cfg, &mut instrs).unwrap();

        // variables v0..v7 all stay live together, so their assigned slots
        // must be pairwise distinct.
        let dump = &ctx.compile_data.allocated_registers_dump;
        let mut seen = std::collections::HashSet::new();
        for (v, line) in dump.lines().enumerate().take(n as usize) {
            let reg = line.split(": ").nth(1).unwrap();
            if reg != "_" {
                assert!(seen.insert(reg.to_string()), "variable {v} shares {reg}");
            }
        }
    }

    #[test]
    fn v3d_handles_35_live_variables_but_not_65() {
        let arena = Bump::new();

        let mut ctx = ctx_for(&arena, Target::V3d, 3 * 35);
        let mut instrs = pressure_program(35);
        let cfg = Cfg::build(&instrs).unwrap();
        v3d::reg_alloc(&mut ctx, &cfg, &mut instrs).expect("35 live variables must fit in 64 slots");

        let mut ctx = ctx_for(&arena, Target::V3d, 3 * 65);
        let mut instrs = pressure_program(65);
        let cfg = Cfg::build(&instrs).unwrap();
        match v3d::reg_alloc(&mut ctx, &cfg, &mut instrs) {
            Err(CompileError::RegAllocFailure { .. }) => {}
            other => panic!("expected RegAllocFailure, got {other:?}"),
        }
    }

    #[test]
    fn vc4_pressure_beyond_both_files_fails() {
        let arena = Bump::new();
        let mut ctx = ctx_for(&arena, Target::Vc4, 3 * 70);
        let mut instrs = pressure_program(70);
        let cfg = Cfg::build(&instrs).unwrap();
        match vc4::reg_alloc(&mut ctx, &cfg, &mut instrs) {
            Err(CompileError::RegAllocFailure { .. }) => {}
            other => panic!("expected RegAllocFailure, got {other:?}"),
        }
    }

    #[test]
    fn vc4_two_register_sources_land_in_different_files() {
        let arena = Bump::new();
        let mut ctx = ctx_for(&arena, Target::Vc4, 3);

        let mut instrs = InstrList::new();
        instrs.push(Instr::li(Reg::var(0), Imm::Int32(1)));
        instrs.push(Instr::li(Reg::var(1), Imm::Int32(2)));
        // keep both alive across two reads so neither becomes an accumulator
        instrs.push(Instr::alu(Reg::var(2), Reg::var(0), AluOp::Add, Reg::var(1)));
        instrs.push(Instr::alu(
            Reg::special(crate::core::reg::Special::VpmWrite),
            Reg::var(0),
            AluOp::Add,
            Reg::var(1),
        ));
        instrs.push(Instr::alu(
            Reg::special(crate::core::reg::Special::VpmWrite),
            Reg::var(2),
            AluOp::BOr,
            Reg::var(2),
        ));
        instrs.push(Instr::end());

        let cfg = Cfg::build(&instrs).unwrap();
        vc4::reg_alloc(&mut ctx, &cfg, &mut instrs).unwrap();

        // the add at index 3 must read one operand from each file
        match &instrs[3].kind {
            InstrKind::Alu(alu) => {
                let (a, b) = (alu.src_a.reg(), alu.src_b.reg());
                assert_ne!(a.tag, b.tag, "two reads from one vc4 file: {} / {}", a.dump(), b.dump());
            }
            _ => panic!("unexpected shape"),
        }
    }

    #[test]
    fn two_phase_rename_does_not_alias() {
        // Craft an allocation where variable 0 gets register A1 and
        // variable 1 gets register A0: a naive in-place rename would merge
        // them; the TMP tags must keep them apart.
        let mut instrs = InstrList::new();
        instrs.push(Instr::alu(Reg::var(0), Reg::var(1), AluOp::Add, Reg::var(1)));

        let mut alloc = RegUsage::new(2);
        alloc[0].reg = Reg::new(RegTag::RegA, 1);
        alloc[1].reg = Reg::new(RegTag::RegA, 0);

        apply_allocation(&mut instrs, &alloc);

        match &instrs[0].kind {
            InstrKind::Alu(alu) => {
                assert_eq!(alu.dest, Reg::new(RegTag::RegA, 1));
                assert_eq!(alu.src_a.reg(), Reg::new(RegTag::RegA, 0));
                assert_eq!(alu.src_b.reg(), Reg::new(RegTag::RegA, 0));
            }
            _ => panic!("unexpected shape"),
        }
    }

    #[test]
    fn interference_sets_feed_possible_registers() {
        let mut sets = LiveSets::new(3);
        // fake: 0 interferes with 1
        let mut instrs = InstrList::new();
        instrs.push(Instr::li(Reg::var(0), Imm::Int32(1)));
        instrs.push(Instr::li(Reg::var(1), Imm::Int32(2)));
        instrs.push(Instr::alu(Reg::var(2), Reg::var(0), AluOp::Add, Reg::var(1)));
        instrs.push(Instr::alu(Reg::var(2), Reg::var(2), AluOp::Add, Reg::var(2)));
        let cfg = Cfg::build(&instrs).unwrap();
        let live = Liveness::compute(&cfg, &instrs, 3);
        sets.init(&instrs, &live);

        let mut alloc = RegUsage::new(3);
        alloc[0].reg = Reg::new(RegTag::RegA, 0);

        let possible = sets.possible_registers(1, &alloc, RegTag::RegA, 4);
        assert_eq!(possible, vec![false, true, true, true]);
        let unified = sets.possible_slots(1, &alloc, 64);
        assert!(!unified[0]);
        assert!(unified[1]);
    }

    #[test]
    fn dead_set_is_really_dead() {
        // guards against VarSet regressions that would break colouring
        let mut s = VarSet::with_capacity(70);
        s.insert(65);
        assert!(s.contains(65));
        s.remove(65);
        assert!(s.is_empty());
    }
}
