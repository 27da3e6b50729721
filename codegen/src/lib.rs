//! Single-pass low-level code generator library.
//!
//! This crate lowers a client-supplied IR to machine code in one linear
//! pass per function and emits a relocatable ELF object (or hands its
//! in-memory sections to a JIT mapper). It is built for compile-time
//! performance: no optimization passes, no SSA deconstruction, no
//! scheduling — the client IR is walked once in an analyzed block order
//! and every value gets its storage assigned on first definition.
//!
//! The crate splits into:
//!
//! - [`adaptor`]: the trait a client IR implements;
//! - [`analyzer`]: reverse post-order layout, loop tree, liveness;
//! - [`assembler`] and [`ehframe`]: the ELF section/symbol/relocation
//!   builder with DWARF unwind info;
//! - [`compiler`]: the value-assignment system, register allocation, PHI
//!   and branch resolution;
//! - [`isa`]: the x86-64 and AArch64 back-ends.

#![deny(missing_docs)]

pub use tarmac_entity as entity;

pub mod adaptor;
pub mod analyzer;
pub mod assembler;
pub mod assignments;
pub mod bitset;
pub mod compiler;
pub mod ehframe;
mod error;
pub mod isa;
pub mod regfile;
pub mod segmented_vec;

pub use error::{CodegenError, CodegenResult};
