//! QPU kernel compiler for the Raspberry Pi VideoCore GPUs.
//!
//! Kernels are written in host code against a small DSL; evaluating one
//! builds a statement tree which the back end lowers to a target IR,
//! optimises, register-allocates and encodes into packed 64-bit opcodes for
//! either the vc4 (Pi 1-3) or v3d (Pi 4) QPUs.
//!
//! # Primary usage
//!
//! ```no_run
//! use qpu_compiler::{compile, Target, UniformArg, RecordingDriver};
//! use qpu_compiler::heap::{new_heap, SharedArray};
//! use qpu_compiler::dsl::IntElem;
//!
//! let mut kernel = compile(Target::V3d, |k| {
//!     let n = k.uniform_int();
//!     let p = k.uniform_ptr::<IntElem>();
//!     let x = k.int_var();
//!     k.assign(x, n + 1);
//!     let addr = p.at(k.elem_num());
//!     k.store(addr, x);
//! })?;
//!
//! let heap = new_heap(0x10000);
//! let result: SharedArray<i32> = SharedArray::alloc(&heap, 16).unwrap();
//!
//! let mut driver = RecordingDriver::with_heap(heap.clone());
//! kernel
//!     .load(&[UniformArg::Int(41), UniformArg::Address(result.address())])?
//!     .invoke(&mut driver, &heap)?;
//! # Ok::<(), qpu_compiler::CompileError>(())
//! ```
//!
//! # Architecture
//!
//! - [`dsl`] - kernel AST, typed value handles, AST → IR lowering
//! - [`core`] - shared infrastructure (IR, CFG, liveness, register
//!   allocation, compile context)
//! - [`vc4`] - VideoCore IV encoder (two register files, DMA/VPM)
//! - [`v3d`] - VideoCore VI encoder (unified file, TMU, dual issue)
//! - [`driver`] - compile/load/invoke front contract
//! - [`heap`] - buffer-object heap manager and shared arrays
//!
//! The pipeline is strictly linear within one compile:
//! translate → CFG → accumulator peephole → register allocation →
//! target encode → label resolution.

pub mod core;
pub mod driver;
pub mod dsl;
pub mod heap;
pub mod v3d;
pub mod vc4;

pub use crate::core::{CompileData, CompileError, CompileResult, Target};
pub use driver::{compile, CompiledKernel, QpuDriver, RecordingDriver, UniformArg};
pub use dsl::KernelBuilder;
