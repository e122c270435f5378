//! Live interpreter frame registration.
//!
//! Every interpreter invocation executes inside one host trampoline, so
//! nothing about an interpreter frame is recoverable from machine code.
//! Instead the trampoline registers each frame here, keyed by its own
//! frame-base value, for the duration of the call. The frame walker
//! classifies a native frame as interpreted by finding its base in this
//! map, and routes all per-frame queries through the accessors installed
//! with the JIT's interpreter hooks.
//!
//! The map is thread-local: a frame base is an address on its owning
//! thread's stack, and only that thread may walk or mutate its frames.

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::sync::{Arc, Once};
use vesper_core::{AstStmt, FrameInfo, Value};
use vesper_jit::unwind::{
    install_interpreter_hooks, is_synthetic, CompiledCode, InterpreterHooks,
};

struct InterpFrame {
    code: Arc<CompiledCode>,
    /// Kept alive here so the raw statement pointer handed to the walker
    /// stays valid while the frame is registered.
    current_stmt: Option<Arc<AstStmt>>,
    /// Boxed for a stable address: the walker reads and writes through a
    /// raw pointer while the map may rehash.
    frame_info: Box<FrameInfo>,
    locals: FxHashMap<Arc<str>, Value>,
}

thread_local! {
    static FRAMES: RefCell<FxHashMap<u64, InterpFrame>> =
        RefCell::new(FxHashMap::default());
}

static INSTALL_HOOKS: Once = Once::new();

fn with_frame<R>(bp: u64, f: impl FnOnce(&mut InterpFrame) -> R) -> R {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let frame = frames
            .get_mut(&bp)
            .unwrap_or_else(|| panic!("no interpreter frame at base {bp:#x}"));
        f(frame)
    })
}

fn hook_frame_code_for(bp: u64) -> Option<Arc<CompiledCode>> {
    FRAMES.with(|frames| frames.borrow().get(&bp).map(|f| Arc::clone(&f.code)))
}

fn hook_current_statement_for(bp: u64) -> *const AstStmt {
    with_frame(bp, |frame| {
        frame
            .current_stmt
            .as_ref()
            .map(Arc::as_ptr)
            .expect("interpreter frame has not executed a statement yet")
    })
}

fn hook_frame_info_for(bp: u64) -> *mut FrameInfo {
    // The pointer outlives the borrow: it targets the boxed record, which
    // stays put until the frame is deregistered.
    with_frame(bp, |frame| &mut *frame.frame_info as *mut FrameInfo)
}

fn hook_locals_for(bp: u64, only_user_visible: bool) -> FxHashMap<Arc<str>, Value> {
    with_frame(bp, |frame| {
        frame
            .locals
            .iter()
            .filter(|(name, _)| !(only_user_visible && is_synthetic(name)))
            .map(|(name, value)| (Arc::clone(name), *value))
            .collect()
    })
}

/// RAII registration of one interpreter frame.
///
/// The trampoline constructs this on entry with its own frame base and
/// drops it on exit; while it lives, the walker sees the frame as
/// interpreted.
pub struct InterpFrameGuard {
    bp: u64,
}

impl InterpFrameGuard {
    pub fn register(bp: u64, code: Arc<CompiledCode>) -> Self {
        INSTALL_HOOKS.call_once(|| {
            install_interpreter_hooks(InterpreterHooks {
                frame_code_for: hook_frame_code_for,
                current_statement_for: hook_current_statement_for,
                frame_info_for: hook_frame_info_for,
                locals_for: hook_locals_for,
            });
        });
        FRAMES.with(|frames| {
            let prev = frames.borrow_mut().insert(
                bp,
                InterpFrame {
                    code,
                    current_stmt: None,
                    frame_info: Box::new(FrameInfo::new()),
                    locals: FxHashMap::default(),
                },
            );
            assert!(prev.is_none(), "interpreter frame base {bp:#x} reused");
        });
        Self { bp }
    }

    #[inline]
    pub fn frame_base(&self) -> u64 {
        self.bp
    }

    /// Record the statement about to execute.
    pub fn set_current_statement(&self, stmt: Arc<AstStmt>) {
        with_frame(self.bp, |frame| frame.current_stmt = Some(stmt));
    }

    /// Bind or rebind a local.
    pub fn set_local(&self, name: Arc<str>, value: Value) {
        with_frame(self.bp, |frame| {
            frame.locals.insert(name, value);
        });
    }
}

impl Drop for InterpFrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().remove(&self.bp);
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
