//! The source-frame walker.
//!
//! Walks the native stack outward from its own call site and yields only
//! the frames that correspond to source-level execution: frames inside
//! registered compiled code and interpreter trampoline frames. Everything
//! else (runtime internals, libc, FFI glue) is stepped across silently.
//!
//! # On-stack replacement
//!
//! When a hot loop is replaced on-stack, the replacement frame sits
//! directly above the frame it replaced and both describe the same source
//! invocation. The walker yields the replacement and swallows the shadow:
//! after yielding a frame whose code carries an entry descriptor, the next
//! source frame found is discarded.

use std::sync::Arc;
use vesper_core::{AstStmt, FrameInfo, Value};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::cursor::{FpCursor, UnwindStepper, DWARF_RBP};
use super::interp;
use super::location_map::{is_synthetic, LocationMap, CURRENT_STMT, FRAME_INFO};
use super::registry::{code_registry, CompiledCode};

// =============================================================================
// FrameId
// =============================================================================

/// Identity of one source frame on the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameId {
    /// A frame of JIT-compiled code, identified by the return address
    /// saved for it.
    Compiled { ip: u64 },
    /// An interpreter trampoline frame, identified by its frame-base
    /// value, which is also the interpreter's key for its own frame
    /// record.
    Interpreted { bp: u64 },
}

// =============================================================================
// FrameWalker
// =============================================================================

/// Lazy walk over the current thread's source frames.
///
/// `advance` positions the walker on the next source frame outward;
/// the accessor methods then read that frame. Accessors other than
/// [`FrameWalker::locals`] never allocate, so the walker is usable from
/// exception-raising paths.
pub struct FrameWalker<C> {
    cursor: C,
    id: Option<FrameId>,
    code: Option<Arc<CompiledCode>>,
    cur_is_osr: bool,
}

impl FrameWalker<FpCursor> {
    /// Start a walk at the caller.
    #[inline(never)]
    pub fn from_here() -> Self {
        Self::new(FpCursor::from_here())
    }
}

impl<C: UnwindStepper> FrameWalker<C> {
    /// Wrap an already-positioned cursor.
    pub fn new(cursor: C) -> Self {
        Self {
            cursor,
            id: None,
            code: None,
            cur_is_osr: false,
        }
    }

    /// Advance to the next source frame outward. Returns `false` once the
    /// native stack is exhausted; the walker then holds no frame.
    pub fn advance(&mut self) -> bool {
        let was_osr = self.cur_is_osr;
        if !self.advance_to_source_frame() {
            return false;
        }
        if was_osr {
            // The frame just found is the pre-replacement shadow of the
            // frame yielded before it: same source invocation, stale
            // machine state. Drop it.
            assert!(
                !self.cur_is_osr,
                "two successive on-stack-replacement frames"
            );
            return self.advance_to_source_frame();
        }
        true
    }

    /// Step the native cursor until it lands on a compiled or interpreter
    /// frame, classifying as it goes.
    fn advance_to_source_frame(&mut self) -> bool {
        loop {
            if !self.cursor.step() {
                self.id = None;
                self.code = None;
                return false;
            }
            let ip = self.cursor.ip();

            if let Some(code) = code_registry().lookup(ip) {
                self.id = Some(FrameId::Compiled { ip });
                self.cur_is_osr = code.is_osr_continuation();
                self.code = Some(code);
                return true;
            }

            let bp = self.cursor.bp();
            if let Some(code) = interp::interpreted_frame_code(bp) {
                self.id = Some(FrameId::Interpreted { bp });
                self.cur_is_osr = code.is_osr_continuation();
                self.code = Some(code);
                return true;
            }

            // Foreign native frame: keep stepping.
        }
    }

    /// Identity of the frame the walker is positioned on.
    ///
    /// # Panics
    ///
    /// Panics if the walker is not positioned on a frame.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.id.expect("walker is not positioned on a frame")
    }

    /// The compiled function active in this frame. For interpreter frames
    /// this is the function the interpreter is running, which may not
    /// have machine code yet.
    #[inline]
    pub fn compiled_code(&self) -> &Arc<CompiledCode> {
        self.code
            .as_ref()
            .expect("walker is not positioned on a frame")
    }

    /// PC offset of this frame inside its compiled code.
    fn code_offset(&self, ip: u64, code: &CompiledCode) -> u32 {
        let start = code.code_start();
        assert!(
            ip > start,
            "return address {ip:#x} at or below code start {start:#x}"
        );
        (ip - start) as u32
    }

    fn location_map<'a>(&self, code: &'a CompiledCode) -> &'a LocationMap {
        code.location_map().unwrap_or_else(|| {
            panic!(
                "function `{}` has no introspection metadata",
                code.source().name
            )
        })
    }

    /// Decode one synthetic name to its single raw word.
    fn read_synthetic(&self, ip: u64, name: &str) -> u64 {
        let code = self.compiled_code();
        let map = self.location_map(code);
        let offset = self.code_offset(ip, code);
        let entry = map
            .table(name)
            .and_then(|t| t.entry_covering(offset))
            .unwrap_or_else(|| {
                panic!(
                    "no `{name}` mapping at offset {offset:#x} in `{}`",
                    code.source().name
                )
            });
        assert_eq!(
            entry.locations.len(),
            1,
            "`{name}` must occupy a single word"
        );
        entry.locations[0].read(&self.cursor, map.constants())
    }

    /// Statement the frame is currently executing.
    pub fn current_statement(&self) -> *const AstStmt {
        match self.frame_id() {
            FrameId::Compiled { ip } => self.read_synthetic(ip, CURRENT_STMT) as *const AstStmt,
            FrameId::Interpreted { bp } => (interp::hooks().current_statement_for)(bp),
        }
    }

    /// The frame's metadata record.
    pub fn frame_info(&self) -> *mut FrameInfo {
        match self.frame_id() {
            FrameId::Compiled { ip } => self.read_synthetic(ip, FRAME_INFO) as *mut FrameInfo,
            FrameId::Interpreted { bp } => (interp::hooks().frame_info_for)(bp),
        }
    }

    /// Snapshot the frame's local bindings into a fresh map.
    ///
    /// With `only_user_visible`, synthetic names (`!...`, `#...`) are
    /// omitted. This is the one walker operation that allocates.
    pub fn locals(&self, only_user_visible: bool) -> FxHashMap<Arc<str>, Value> {
        match self.frame_id() {
            FrameId::Compiled { ip } => {
                let code = self.compiled_code();
                let map = self.location_map(code);
                let offset = self.code_offset(ip, code);

                let mut out = FxHashMap::default();
                for (name, table) in map.names() {
                    if only_user_visible && is_synthetic(name) {
                        continue;
                    }
                    if let Some(entry) = table.entry_covering(offset) {
                        let words: SmallVec<[u64; 2]> =
                            entry.read_words(&self.cursor, map.constants());
                        out.insert(Arc::clone(name), entry.layout.reconstruct(&words));
                    }
                }
                out
            }
            FrameId::Interpreted { bp } => (interp::hooks().locals_for)(bp, only_user_visible),
        }
    }

    /// The frame-base value of the current native frame.
    #[inline]
    pub fn frame_base(&self) -> u64 {
        self.cursor.register(DWARF_RBP)
    }
}

// =============================================================================
// Tests
// =============================================================================
