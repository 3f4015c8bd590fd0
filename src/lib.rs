//! Taint-tracking dynamic binary translator for 32-bit x86 user processes.
//!
//! Every instruction the guest executes is first decoded, classified and re-emitted into the
//! JIT address range together with inline code that propagates a byte-granular taint shadow
//! through registers and memory. Control transfers are rewritten so that execution never
//! leaves translated code: direct branches are linked, everything else goes through the
//! jump cache and the runtime's resolver stubs.
#![warn(missing_docs)]
#![allow(clippy::too_many_arguments, clippy::upper_case_acronyms)]

pub mod classify;
pub mod codegen;
pub mod config;
pub mod context;
pub mod control;
pub mod decoder;
pub mod error;
pub mod fragment;
pub mod jit;
pub mod jump_cache;
pub mod memory_management;
pub mod shadow;
pub mod syscalls;
pub mod taint_code;
pub mod translate;
pub mod x86;
