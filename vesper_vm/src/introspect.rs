//! The stack introspection facade.
//!
//! Language-level queries over the current thread's call stack. Each
//! entry point starts a fresh walk at its own call site; runtime and
//! host frames between the caller and the nearest source frame are
//! skipped by the walker.
//!
//! Exception-state lookup follows the chain rule: the current exception
//! of a frame is the nearest populated exception triple at or below it
//! on the stack. Frames passed over while searching get the resolved
//! triple written back so later lookups stop immediately.
//!
//! Nothing here raises language-level exceptions: these are the
//! operations that *report* them.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use vesper_core::{AstStmt, ExcInfo, LineInfo, SourceModule, Value};
use vesper_jit::unwind::{CompiledCode, FrameWalker, UnwindStepper};

// =============================================================================
// Walk-generic operations
// =============================================================================

/// Position `walker` on the top source frame.
///
/// # Panics
///
/// Panics if there is no source frame above the caller; every caller of
/// these operations executes under one.
fn to_top_frame<C: UnwindStepper>(walker: &mut FrameWalker<C>) {
    assert!(walker.advance(), "no source frame above the caller");
}

/// Statement the top frame is executing.
pub fn current_statement_in<C: UnwindStepper>(walker: &mut FrameWalker<C>) -> *const AstStmt {
    to_top_frame(walker);
    walker.current_statement()
}

/// Snapshot of the top frame's locals.
pub fn current_locals_in<C: UnwindStepper>(
    walker: &mut FrameWalker<C>,
    only_user_visible: bool,
) -> FxHashMap<Arc<str>, Value> {
    to_top_frame(walker);
    walker.locals(only_user_visible)
}

/// Resolve the exception state visible to the top frame.
///
/// Walks outward collecting frames whose triple is still unset until a
/// populated triple is found; if the stack runs out first, the deepest
/// frame's triple becomes the `(None, None, None)` sentinel. The
/// resolved triple is then written into every collected frame, so a
/// repeated query performs no writes and stops at the top frame.
pub fn frame_exc_info_in<C: UnwindStepper>(walker: &mut FrameWalker<C>) -> ExcInfo {
    let mut to_update: Vec<*mut vesper_core::FrameInfo> = Vec::new();
    let mut top = None;
    let mut last = None;

    while walker.advance() {
        let fi = walker.frame_info();
        if top.is_none() {
            top = Some(fi);
        }
        last = Some(fi);
        // SAFETY: fi addresses the frame record of a frame on the current
        // thread's stack (or this thread's interpreter registration); no
        // other thread reads or writes it.
        let exc = unsafe { (*fi).exc };
        if exc.is_unset() {
            to_update.push(fi);
            continue;
        }
        break;
    }

    let last = last.expect("no source frame above the caller");
    let top = top.expect("no source frame above the caller");
    // SAFETY: as above; all pointers target this thread's own frames.
    unsafe {
        if (*last).exc.is_unset() {
            (*last).exc = ExcInfo::none_sentinel();
        }
        let resolved = (*last).exc;
        for fi in to_update {
            (*fi).exc = resolved;
        }
        // The top frame's state is the one the caller sees; by now it
        // either broke the walk or was backfilled above.
        (*top).exc
    }
}

/// Per-frame source positions, outermost first.
pub fn traceback_in<C: UnwindStepper>(walker: &mut FrameWalker<C>) -> Vec<LineInfo> {
    let mut entries = Vec::new();
    while walker.advance() {
        entries.push(line_info_for_frame(walker));
    }
    entries.reverse();
    entries
}

/// Source position of the frame the walker is on.
fn line_info_for_frame<C: UnwindStepper>(walker: &FrameWalker<C>) -> LineInfo {
    // SAFETY: statement nodes are allocated per compilation unit and
    // never move or die while their code can run.
    let stmt = unsafe { &*walker.current_statement() };
    let source = walker.compiled_code().source();
    LineInfo::new(
        stmt.lineno,
        stmt.col_offset,
        Arc::clone(source.filename()),
        Arc::clone(&source.name),
    )
}

/// Source position of the top frame.
pub fn most_recent_line_info_in<C: UnwindStepper>(walker: &mut FrameWalker<C>) -> LineInfo {
    to_top_frame(walker);
    line_info_for_frame(walker)
}

/// The function executing in the top frame.
pub fn top_compiled_code_in<C: UnwindStepper>(walker: &mut FrameWalker<C>) -> Arc<CompiledCode> {
    to_top_frame(walker);
    Arc::clone(walker.compiled_code())
}

// =============================================================================
// Public entry points
// =============================================================================

/// Statement the innermost source frame is executing.
pub fn current_statement() -> *const AstStmt {
    current_statement_in(&mut FrameWalker::from_here())
}

/// Locals of the innermost source frame.
pub fn current_locals(only_user_visible: bool) -> FxHashMap<Arc<str>, Value> {
    current_locals_in(&mut FrameWalker::from_here(), only_user_visible)
}

/// Exception state visible to the innermost source frame.
pub fn frame_exc_info() -> ExcInfo {
    frame_exc_info_in(&mut FrameWalker::from_here())
}

/// Capture the source-level traceback, outermost entry first.
pub fn traceback_entries() -> Vec<LineInfo> {
    #[cfg(feature = "frame-introspection")]
    {
        traceback_in(&mut FrameWalker::from_here())
    }
    #[cfg(not(feature = "frame-introspection"))]
    {
        use std::sync::Once;
        static WARNED: Once = Once::new();
        WARNED.call_once(|| {
            eprintln!("warning: can't capture tracebacks, frame introspection is compiled out");
        });
        Vec::new()
    }
}

/// Source position of the innermost source frame.
pub fn most_recent_line_info() -> LineInfo {
    most_recent_line_info_in(&mut FrameWalker::from_here())
}

/// The function executing in the innermost source frame.
pub fn top_compiled_code() -> Arc<CompiledCode> {
    top_compiled_code_in(&mut FrameWalker::from_here())
}

/// The module enclosing the innermost source frame's function.
pub fn current_module() -> Arc<SourceModule> {
    Arc::clone(&top_compiled_code().source().module)
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(all(test, not(feature = "frame-introspection")))]
mod disabled_tests {
    use super::*;

    #[test]
    fn test_traceback_degrades_to_empty() {
        // First call warns once, both calls return nothing.
        assert!(traceback_entries().is_empty());
        assert!(traceback_entries().is_empty());
    }
}
