//! The kernel front contract: compile, load, invoke.
//!
//! [`compile`] runs the full pipeline (translate → register allocation →
//! encode) for the selected target and returns a [`CompiledKernel`]
//! carrying the packed opcodes and the compile diagnostics.
//!
//! Job dispatch itself is an external collaborator behind [`QpuDriver`]:
//! the real implementation talks ioctl/mailbox to the kernel driver, tests
//! use [`RecordingDriver`]. The uniform-buffer layout produced here is the
//! contract both sides agree on:
//!
//! ```text
//!   per QPU: [ qpu_index, num_qpus, arg_0 .. arg_K-1, done_address ]
//! ```
//!
//! where each QPU reads its strip at a per-QPU offset.

use std::io::Write;
use std::path::Path;

use bumpalo::Bump;

use crate::core::cfg::Cfg;
use crate::core::{regalloc, CompileContext, CompileData, CompileError, CompileResult, Target};
use crate::dsl::ast::ParamKind;
use crate::dsl::{translate, KernelBuilder};
use crate::heap::Heap;
use crate::{v3d, vc4};

/// A uniform argument supplied at load time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformArg {
    Int(i32),
    Float(f32),
    /// GPU bus address of a shared array.
    Address(u32),
}

impl UniformArg {
    fn to_word(self) -> u32 {
        match self {
            UniformArg::Int(i) => i as u32,
            UniformArg::Float(f) => f.to_bits(),
            UniformArg::Address(a) => a,
        }
    }

    fn matches(self, kind: ParamKind) -> bool {
        matches!(
            (self, kind),
            (UniformArg::Int(_), ParamKind::Int)
                | (UniformArg::Float(_), ParamKind::Float)
                | (UniformArg::Address(_), ParamKind::Ptr)
        )
    }
}

/// Dispatch interface to the GPU.
///
/// `execute` receives the packed opcode stream and the concatenated per-QPU
/// uniform strips, and blocks until the job completes. Completion is
/// signalled by the GPU writing a non-zero word to the done address carried
/// in the last uniform slot.
pub trait QpuDriver {
    fn execute(&mut self, code: &[u64], uniforms: &[u32], num_qpus: u32) -> CompileResult<()>;
}

/// Driver stub for tests: records the submitted job and signals completion.
#[derive(Default)]
pub struct RecordingDriver {
    pub heap: Option<Heap>,
    pub code: Vec<u64>,
    pub uniforms: Vec<u32>,
    pub num_qpus: u32,
    pub calls: usize,
}

impl RecordingDriver {
    pub fn new() -> RecordingDriver {
        RecordingDriver::default()
    }

    pub fn with_heap(heap: Heap) -> RecordingDriver {
        RecordingDriver { heap: Some(heap), ..RecordingDriver::default() }
    }
}

impl QpuDriver for RecordingDriver {
    fn execute(&mut self, code: &[u64], uniforms: &[u32], num_qpus: u32) -> CompileResult<()> {
        self.code = code.to_vec();
        self.uniforms = uniforms.to_vec();
        self.num_qpus = num_qpus;
        self.calls += 1;

        // signal completion through the done slot
        if let (Some(heap), Some(&done_addr)) = (&self.heap, uniforms.last()) {
            let mut bo = heap.borrow_mut();
            if let Some(offset) = bo.offset_of(done_addr) {
                bo.write(offset, 1);
            }
        }
        Ok(())
    }
}

/// A compiled kernel, ready to be loaded and invoked.
#[derive(Debug)]
pub struct CompiledKernel {
    target: Target,
    code: Vec<u64>,
    params: Vec<ParamKind>,
    args: Vec<UniformArg>,
    num_qpus: u32,
    compile_data: CompileData,
    listing: String,
    code_buffer: Option<(u32, u32)>, // heap offset, size in bytes
}

/// Compile a kernel function for the given target.
pub fn compile(
    target: Target,
    f: impl FnOnce(&mut KernelBuilder),
) -> CompileResult<CompiledKernel> {
    let arena = Bump::new();
    let mut ctx = CompileContext::new(&arena, target);

    let mut builder = KernelBuilder::new();
    f(&mut builder);
    let kernel = builder.finish();

    let mut instrs = translate(&mut ctx, &kernel)?;
    ctx.compile_data.target_code_before_optimization = instrs.mnemonics(false);

    let cfg = Cfg::build(&instrs)?;
    ctx.compile_data.target_code_before_regalloc = instrs.mnemonics(false);

    let (code, listing) = match target {
        Target::Vc4 => {
            regalloc::vc4::reg_alloc(&mut ctx, &cfg, &mut instrs)?;
            let encoded = vc4::encode(&instrs)?;
            (vc4::to_opcodes(&encoded), vc4::mnemonics(&encoded, true))
        }
        Target::V3d => {
            regalloc::v3d::reg_alloc(&mut ctx, &cfg, &mut instrs)?;
            let encoded = v3d::encode(&mut ctx, &instrs)?;
            (v3d::to_opcodes(&encoded), v3d::mnemonics(&encoded, true))
        }
    };

    Ok(CompiledKernel {
        target,
        code,
        params: kernel.params,
        args: Vec::new(),
        num_qpus: 1,
        compile_data: ctx.compile_data,
        listing,
        code_buffer: None,
    })
}

impl CompiledKernel {
    pub fn target(&self) -> Target {
        self.target
    }

    /// The packed little-endian 64-bit opcode stream.
    pub fn code(&self) -> &[u64] {
        &self.code
    }

    pub fn compile_data(&self) -> &CompileData {
        &self.compile_data
    }

    /// Bind uniform arguments, in declaration order.
    pub fn load(&mut self, args: &[UniformArg]) -> CompileResult<&mut Self> {
        if args.len() != self.params.len() {
            return Err(CompileError::UserAssertion(format!(
                "kernel takes {} arguments, {} supplied",
                self.params.len(),
                args.len()
            )));
        }
        for (i, (arg, kind)) in args.iter().zip(&self.params).enumerate() {
            if !arg.matches(*kind) {
                return Err(CompileError::UserAssertion(format!(
                    "argument {i} does not match parameter kind {kind:?}"
                )));
            }
        }
        self.args = args.to_vec();
        Ok(self)
    }

    /// Select how many QPUs run the kernel.
    ///
    /// v3d supports 1 or 8; vc4 supports 1..=12.
    pub fn set_num_qpus(&mut self, n: u32) -> CompileResult<&mut Self> {
        let ok = match self.target {
            Target::V3d => n == 1 || n == 8,
            Target::Vc4 => (1..=12).contains(&n),
        };
        if !ok {
            return Err(CompileError::UserAssertion(format!(
                "num QPUs {n} invalid for {}",
                self.target
            )));
        }
        self.num_qpus = n;
        Ok(self)
    }

    pub fn num_qpus(&self) -> u32 {
        self.num_qpus
    }

    /// The concatenated per-QPU uniform strips.
    pub fn uniform_strips(&self, done_addr: u32) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.num_qpus as usize * (self.params.len() + 3));
        for q in 0..self.num_qpus {
            out.push(q);
            out.push(self.num_qpus);
            out.extend(self.args.iter().map(|a| a.to_word()));
            out.push(done_addr);
        }
        out
    }

    /// Upload the opcodes and uniforms and run the kernel.
    ///
    /// Blocks until the driver reports completion via the done slot.
    pub fn invoke(&mut self, driver: &mut dyn QpuDriver, heap: &Heap) -> CompileResult<()> {
        if self.args.len() != self.params.len() {
            return Err(CompileError::UserAssertion(
                "kernel arguments not loaded before invoke".into(),
            ));
        }

        let map_heap = |e: crate::heap::HeapError| CompileError::UserAssertion(e.to_string());

        // code buffer is allocated once and reused across invocations
        if self.code_buffer.is_none() {
            let size = (self.code.len() * 8) as u32;
            let offset = heap.borrow_mut().alloc(size).map_err(map_heap)?;
            {
                let mut bo = heap.borrow_mut();
                for (i, word) in self.code.iter().enumerate() {
                    bo.write(offset + 8 * i as u32, *word as u32);
                    bo.write(offset + 8 * i as u32 + 4, (*word >> 32) as u32);
                }
            }
            self.code_buffer = Some((offset, size));
        }

        let done_offset = heap.borrow_mut().alloc(4).map_err(map_heap)?;
        let done_addr = heap.borrow().address(done_offset);
        heap.borrow_mut().write(done_offset, 0);

        let uniforms = self.uniform_strips(done_addr);
        driver.execute(&self.code, &uniforms, self.num_qpus)?;

        let done = heap.borrow().read(done_offset);
        heap.borrow_mut().dealloc(done_offset, 4).map_err(map_heap)?;
        if done == 0 {
            return Err(CompileError::UserAssertion(
                "kernel did not signal completion".into(),
            ));
        }
        Ok(())
    }

    /// Write the compile diagnostics (liveness table, allocated registers,
    /// counters, and with `verbose` the full listings).
    pub fn dump_compile_data(&self, verbose: bool, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut f = std::fs::File::create(path)?;
        write!(f, "{}", self.compile_data.dump(verbose))?;
        if verbose {
            writeln!(f, "\nEncoded instructions:\n{}", self.listing)?;
        }
        Ok(())
    }

    pub fn listing(&self) -> &str {
        &self.listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::IntElem;
    use crate::heap::new_heap;

    fn trivial_kernel(target: Target) -> CompiledKernel {
        compile(target, |k| {
            let n = k.uniform_int();
            let x = k.int_var();
            k.assign(x, n + 1);
        })
        .unwrap()
    }

    #[test]
    fn num_qpus_validation() {
        let mut k = trivial_kernel(Target::V3d);
        assert!(k.set_num_qpus(1).is_ok());
        assert!(k.set_num_qpus(8).is_ok());
        assert!(matches!(k.set_num_qpus(3), Err(CompileError::UserAssertion(_))));

        let mut k = trivial_kernel(Target::Vc4);
        assert!(k.set_num_qpus(12).is_ok());
        assert!(k.set_num_qpus(13).is_err());
        assert!(k.set_num_qpus(0).is_err());
    }

    #[test]
    fn load_checks_arity_and_kinds() {
        let mut k = trivial_kernel(Target::V3d);
        assert!(k.load(&[]).is_err());
        assert!(k.load(&[UniformArg::Float(1.0)]).is_err());
        assert!(k.load(&[UniformArg::Int(5)]).is_ok());
    }

    #[test]
    fn uniform_strip_layout() {
        let mut k = compile(Target::V3d, |k| {
            let n = k.uniform_int();
            let p = k.uniform_ptr::<IntElem>();
            let x = k.int_var();
            k.assign(x, n + 1);
            let addr = p.addr();
            let v = k.load(addr);
            let y = k.int_var();
            k.assign(y, v);
        })
        .unwrap();

        k.load(&[UniformArg::Int(7), UniformArg::Address(0x1000)]).unwrap();
        k.set_num_qpus(8).unwrap();

        let strips = k.uniform_strips(0xdead_0000);
        assert_eq!(strips.len(), 8 * 5);
        for q in 0..8u32 {
            let s = &strips[(q as usize) * 5..][..5];
            assert_eq!(s[0], q, "qpu index");
            assert_eq!(s[1], 8, "num qpus");
            assert_eq!(s[2], 7, "first argument");
            assert_eq!(s[3], 0x1000, "pointer argument");
            assert_eq!(s[4], 0xdead_0000, "done address");
        }
    }

    #[test]
    fn invoke_round_trip() {
        let heap = new_heap(0x1000);
        let mut driver = RecordingDriver::with_heap(heap.clone());

        let mut k = trivial_kernel(Target::V3d);
        k.load(&[UniformArg::Int(41)]).unwrap();
        k.invoke(&mut driver, &heap).unwrap();

        assert_eq!(driver.calls, 1);
        assert_eq!(driver.code, k.code());
        assert_eq!(driver.num_qpus, 1);
        assert_eq!(driver.uniforms[2], 41);

        // second invoke reuses the code buffer
        k.invoke(&mut driver, &heap).unwrap();
        assert_eq!(driver.calls, 2);
    }

    #[test]
    fn invoke_without_load_fails() {
        let heap = new_heap(0x1000);
        let mut driver = RecordingDriver::with_heap(heap.clone());
        let mut k = trivial_kernel(Target::V3d);
        assert!(k.invoke(&mut driver, &heap).is_err());
    }

    #[test]
    fn compile_data_is_populated() {
        let k = trivial_kernel(Target::V3d);
        let cd = k.compile_data();
        assert!(!cd.liveness_dump.is_empty());
        assert!(!cd.allocated_registers_dump.is_empty());
    }

    #[test]
    fn dump_compile_data_writes_file() {
        let k = trivial_kernel(Target::V3d);
        let path = std::env::temp_dir().join("qpu_compile_data_test.txt");
        k.dump_compile_data(true, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Accumulators introduced"));
        assert!(text.contains("Encoded instructions"));
        let _ = std::fs::remove_file(&path);
    }
}
