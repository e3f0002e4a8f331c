//! The kernel DSL front end.
//!
//! Kernels are ordinary host functions over typed value handles
//! ([`IntExpr`], [`FloatExpr`], [`Ptr`], [`Complex`]); evaluating one
//! against a [`KernelBuilder`] records a statement tree, which
//! [`translate`] lowers to the target IR.

pub mod ast;
pub mod builder;
pub mod translate;

pub use ast::{Kernel, ParamKind};
pub use builder::{
    all, any, Complex, FloatElem, FloatExpr, FloatVar, IntElem, IntExpr, IntVar, KernelBuilder, Ptr,
};
pub use translate::translate;
