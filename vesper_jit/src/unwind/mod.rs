//! Native-stack introspection.
//!
//! The optimizing backend decides where every variable lives; the
//! interpreter hosts not-yet-compiled frames inside one trampoline; OSR
//! leaves replaced frames resident under their replacements. This module
//! rebuilds the source-level stack out of that mixture:
//!
//! ```text
//! ┌─────────────┐  object_emitted   ┌──────────────────┐
//! │ JIT backend ├──────────────────►│ emission observer │
//! └─────────────┘                   └───┬──────────┬───┘
//!                                       │          │
//!                         .eh_frame     ▼          ▼  (code range,
//!                        ┌──────────────────┐  ┌────────────────┐
//!                        │   eh_frame shim  │  │  code registry │
//!                        └──────────────────┘  └───────┬────────┘
//!                                                      │ lookup(ip)
//!                        ┌──────────────────┐  ┌───────┴────────┐
//!                        │ interpreter hooks│◄─┤  frame walker  │
//!                        └──────────────────┘  └────────────────┘
//! ```
//!
//! The walker steps the native stack with an unwind cursor, classifies
//! each frame through the registry (compiled) or the interpreter hooks
//! (trampoline-hosted), and decodes per-frame state through the owning
//! function's location map.

pub mod cursor;
pub mod eh_frame;
pub mod emission;
pub mod interp;
pub mod location_map;
pub mod registry;
pub mod walker;

pub use cursor::{FpCursor, UnwindStepper, DWARF_RBP};
pub use eh_frame::{parse_eh_frame, register_eh_frame, EhFrameError, UnwindTableEntry};
pub use emission::{object_emitted, set_pending_compilation, EmissionError, EmittedObject, SectionInfo};
pub use interp::{install_interpreter_hooks, InterpreterHooks};
pub use location_map::{
    is_synthetic, Location, LocationEntry, LocationMap, LocationTable, RegisterReader,
    ValueLayout, CURRENT_STMT, FRAME_INFO,
};
pub use registry::{code_registry, CodeRegistry, CompiledCode, OsrEntryDescriptor};
pub use walker::{FrameId, FrameWalker};
