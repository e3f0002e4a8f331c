//! Arena-based compile context.
//!
//! Target selection, the fresh-variable and fresh-label counters and the
//! compile-data scratch record all live here and are threaded explicitly
//! through the pipeline, so independent compiles can run concurrently.
//! Per-compile scratch arrays are allocated in the bump arena and freed
//! wholesale when the compile returns.

use bumpalo::Bump;
use std::fmt;

use super::instr::Label;
use super::reg::{RegId, V3D_REGFILE_SIZE, VC4_REGFILE_SIZE};

/// Compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// VideoCore IV (Pi 1-3): two register files, DMA/VPM memory I/O.
    Vc4,
    /// VideoCore VI (Pi 4): unified register file, TMU-only memory.
    V3d,
}

impl Target {
    pub fn name(self) -> &'static str {
        match self {
            Target::Vc4 => "vc4",
            Target::V3d => "v3d",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How the vc4 back end lowers memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Vc4MemPolicy {
    /// DMA transfers through the VPM.
    #[default]
    Default,
    /// Prefetch through the TMU.
    DoPrefetch,
}

/// Diagnostics collected over one compile.
///
/// Pure debug output: nothing here feeds back into code generation, and the
/// exact dump lines are not a stable contract.
#[derive(Debug, Default, Clone)]
pub struct CompileData {
    pub liveness_dump: String,
    pub target_code_before_optimization: String,
    pub target_code_before_regalloc: String,
    pub allocated_registers_dump: String,
    pub reg_usage_dump: String,
    pub num_accs_introduced: usize,
    pub num_instructions_combined: usize,
}

impl CompileData {
    pub fn clear(&mut self) {
        *self = CompileData::default();
    }

    pub fn dump(&self, verbose: bool) -> String {
        let mut out = String::new();
        out.push_str("Liveness:\n");
        out.push_str(&self.liveness_dump);
        out.push_str("\nAllocated registers:\n");
        out.push_str(&self.allocated_registers_dump);
        out.push_str(&format!(
            "\nAccumulators introduced: {}\nInstructions combined: {}\n",
            self.num_accs_introduced, self.num_instructions_combined
        ));
        if verbose {
            out.push_str("\nRegister usage:\n");
            out.push_str(&self.reg_usage_dump);
            out.push_str("\nTarget code before optimization:\n");
            out.push_str(&self.target_code_before_optimization);
            out.push_str("\nTarget code before register allocation:\n");
            out.push_str(&self.target_code_before_regalloc);
        }
        out
    }
}

/// Per-compile state, owned by the current compile until it returns.
pub struct CompileContext<'arena> {
    arena: &'arena Bump,
    target: Target,
    pub vc4_mem_policy: Vc4MemPolicy,
    pub compile_data: CompileData,
    fresh_var: RegId,
    fresh_label: Label,
}

impl<'arena> CompileContext<'arena> {
    pub fn new(arena: &'arena Bump, target: Target) -> Self {
        Self {
            arena,
            target,
            vc4_mem_policy: Vc4MemPolicy::default(),
            compile_data: CompileData::default(),
            fresh_var: 0,
            fresh_label: 0,
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn compiling_for_vc4(&self) -> bool {
        self.target == Target::Vc4
    }

    /// Size of one allocatable register file on the current target.
    pub fn size_regfile(&self) -> usize {
        match self.target {
            Target::Vc4 => VC4_REGFILE_SIZE,
            Target::V3d => V3D_REGFILE_SIZE,
        }
    }

    /// Obtain a fresh variable id.
    pub fn fresh_var(&mut self) -> RegId {
        let v = self.fresh_var;
        self.fresh_var += 1;
        v
    }

    /// Number of variables handed out so far.
    pub fn fresh_var_count(&self) -> usize {
        self.fresh_var as usize
    }

    /// Obtain a fresh label.
    pub fn fresh_label(&mut self) -> Label {
        let l = self.fresh_label;
        self.fresh_label += 1;
        l
    }

    pub fn fresh_label_count(&self) -> usize {
        self.fresh_label as usize
    }

    /// Seed the variable counter when the front end allocated its own ids.
    pub fn adopt_var_count(&mut self, count: RegId) {
        debug_assert!(count >= self.fresh_var);
        self.fresh_var = count;
    }

    /// Seed the label counter likewise.
    pub fn adopt_label_count(&mut self, count: Label) {
        debug_assert!(count >= self.fresh_label);
        self.fresh_label = count;
    }
}
