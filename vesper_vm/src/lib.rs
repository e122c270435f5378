//! Runtime-facing stack introspection for Vesper.
//!
//! Builds the language-level view of the current thread's call stack on
//! top of the native frame walker:
//!
//! - **interp**: registration of live interpreter frames and their
//!   accessor surface
//! - **introspect**: current statement, locals, per-frame exception
//!   state, traceback capture, and top-frame conveniences

#![deny(unsafe_op_in_unsafe_fn)]

pub mod interp;
pub mod introspect;

pub use interp::InterpFrameGuard;
pub use introspect::{
    current_locals, current_module, current_statement, frame_exc_info, most_recent_line_info,
    top_compiled_code, traceback_entries,
};
