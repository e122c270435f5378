//! Core data model for the Vesper runtime.
//!
//! This crate defines the types shared by the compiler, the JIT backend,
//! and the interpreter:
//!
//! - **Value**: NaN-boxed 64-bit value representation (`Copy`, register-sized)
//! - **AST statements**: the granularity at which execution position is tracked
//! - **Source descriptors**: function and module identity for tracebacks
//! - **FrameInfo / ExcInfo**: per-frame exception state
//! - **LineInfo**: resolved source position records

#![deny(unsafe_op_in_unsafe_fn)]

pub mod ast;
pub mod config;
pub mod frame_info;
pub mod line_info;
pub mod value;

pub use ast::{AstStmt, SourceFunction, SourceModule, StmtKind};
pub use config::verbosity;
pub use frame_info::{ExcInfo, FrameInfo};
pub use line_info::LineInfo;
pub use value::Value;
