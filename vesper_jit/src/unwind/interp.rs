//! Rendezvous with the interpreter's frame accessor surface.
//!
//! Interpreter frames all execute inside one host trampoline, so the
//! walker cannot classify them by code range. Instead the interpreter
//! registers every live frame keyed by the trampoline's frame-base value
//! and installs these hooks once at startup; a native frame whose base is
//! known to the interpreter is an interpreter frame. A frame base is the
//! address of a slot on the owning thread's stack, so foreign frames can
//! never collide with a registered one.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use vesper_core::{AstStmt, FrameInfo, Value};

use super::registry::CompiledCode;

/// Accessors into the interpreter's per-frame state, keyed by the
/// trampoline frame's base-register value.
pub struct InterpreterHooks {
    /// The function the frame at `bp` is executing, or `None` if `bp` is
    /// not an interpreter frame.
    pub frame_code_for: fn(bp: u64) -> Option<Arc<CompiledCode>>,
    /// Statement the frame is currently executing.
    pub current_statement_for: fn(bp: u64) -> *const AstStmt,
    /// The frame's metadata record.
    pub frame_info_for: fn(bp: u64) -> *mut FrameInfo,
    /// Snapshot of the frame's local bindings.
    pub locals_for: fn(bp: u64, only_user_visible: bool) -> FxHashMap<Arc<str>, Value>,
}

static HOOKS: OnceLock<InterpreterHooks> = OnceLock::new();

/// Install the interpreter's accessors. Called once at runtime startup.
///
/// # Panics
///
/// Panics on a second installation.
pub fn install_interpreter_hooks(hooks: InterpreterHooks) {
    if HOOKS.set(hooks).is_err() {
        panic!("interpreter hooks installed twice");
    }
}

/// The installed hooks.
///
/// # Panics
///
/// Panics if the walker classified a frame as interpreted while no
/// interpreter is installed, which cannot happen through
/// [`interpreted_frame_code`].
pub(crate) fn hooks() -> &'static InterpreterHooks {
    HOOKS.get().expect("interpreter hooks not installed")
}

/// Classification query: the function the interpreter frame at `bp` is
/// running, or `None` if `bp` is not an interpreter frame (or no
/// interpreter is installed).
#[inline]
pub(crate) fn interpreted_frame_code(bp: u64) -> Option<Arc<CompiledCode>> {
    HOOKS.get().and_then(|h| (h.frame_code_for)(bp))
}
