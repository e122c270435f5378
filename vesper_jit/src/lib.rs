//! JIT-side frame introspection for the Vesper runtime.
//!
//! The code generator compiles source functions to native x86-64 and this
//! crate keeps enough metadata to reconstruct the source-level view of any
//! live native frame:
//!
//! - **stackmap**: parsing of the call-site location records the backend
//!   emits alongside machine code
//! - **unwind**: the `.eh_frame` shim, the compiled-code registry, the
//!   per-function location maps, and the frame walker built on top of them

#![deny(unsafe_op_in_unsafe_fn)]

pub mod stackmap;
pub mod unwind;
