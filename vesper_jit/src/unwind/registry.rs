//! Process-wide registry of compiled code ranges.
//!
//! Maps a native instruction pointer back to the compiled function whose
//! machine code contains it. Registration happens once per emitted object
//! and is append-only for the life of the process; lookups may race with a
//! concurrent emission on another thread and must not allocate.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use vesper_core::SourceFunction;

use super::location_map::LocationMap;

// =============================================================================
// OsrEntryDescriptor
// =============================================================================

/// Marks a compiled function as the on-stack-replacement continuation of a
/// frame that is still resident further down the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsrEntryDescriptor {
    /// Bytecode offset of the loop header the replacement entered at.
    pub bc_offset: u32,
    /// Offset of the replacement entry point in the new machine code.
    pub entry_offset: u32,
}

// =============================================================================
// CompiledCode
// =============================================================================

/// One compiled rendition of a source function.
///
/// Created by the compiler before emission with a zero `code_start`; the
/// emission observer publishes the final code range exactly once. After
/// publication the record never changes.
#[derive(Debug)]
pub struct CompiledCode {
    /// Address of the first instruction. Zero until emitted. Published
    /// with Release ordering so a walker that reached this code through a
    /// return address sees the whole record.
    code_start: AtomicU64,
    /// Machine-code size in bytes. Written before `code_start`.
    code_size: AtomicU32,
    /// Variable location metadata. Absent only for functions the runtime
    /// promises never to introspect.
    location_map: Option<LocationMap>,
    /// The source function this code was compiled from.
    source: Arc<SourceFunction>,
    /// Present iff this code is an OSR continuation.
    entry_descriptor: Option<OsrEntryDescriptor>,
}

impl CompiledCode {
    pub fn new(source: Arc<SourceFunction>, location_map: Option<LocationMap>) -> Arc<Self> {
        Arc::new(Self {
            code_start: AtomicU64::new(0),
            code_size: AtomicU32::new(0),
            location_map,
            source,
            entry_descriptor: None,
        })
    }

    /// Create an OSR continuation of `source`.
    pub fn new_osr(
        source: Arc<SourceFunction>,
        location_map: Option<LocationMap>,
        descriptor: OsrEntryDescriptor,
    ) -> Arc<Self> {
        Arc::new(Self {
            code_start: AtomicU64::new(0),
            code_size: AtomicU32::new(0),
            location_map,
            source,
            entry_descriptor: Some(descriptor),
        })
    }

    #[inline]
    pub fn code_start(&self) -> u64 {
        self.code_start.load(Ordering::Acquire)
    }

    #[inline]
    pub fn code_size(&self) -> u32 {
        self.code_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn location_map(&self) -> Option<&LocationMap> {
        self.location_map.as_ref()
    }

    #[inline]
    pub fn source(&self) -> &Arc<SourceFunction> {
        &self.source
    }

    #[inline]
    pub fn entry_descriptor(&self) -> Option<&OsrEntryDescriptor> {
        self.entry_descriptor.as_ref()
    }

    /// True if this code replaced a frame that is still on the stack.
    #[inline]
    pub fn is_osr_continuation(&self) -> bool {
        self.entry_descriptor.is_some()
    }

    /// Return-address containment: `code_start < addr <= code_start + size`.
    ///
    /// A return address points one past the call instruction, so the upper
    /// bound is inclusive and the lower exclusive.
    #[inline]
    pub fn contains_return_address(&self, addr: u64) -> bool {
        let start = self.code_start();
        start != 0 && start < addr && addr <= start + self.code_size() as u64
    }

    /// Publish the emitted code range. Fails if already published.
    pub(crate) fn publish_code(&self, start: u64, size: u32) -> Result<(), PublishError> {
        assert!(start != 0, "emitted code at address zero");
        self.code_size.store(size, Ordering::Relaxed);
        self.code_start
            .compare_exchange(0, start, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| PublishError {
                name: Arc::clone(&self.source.name),
            })
    }
}

/// A compiled function was emitted twice.
#[derive(Debug)]
pub struct PublishError {
    pub name: Arc<str>,
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code for `{}` was already emitted", self.name)
    }
}

impl std::error::Error for PublishError {}

// =============================================================================
// CodeRegistry
// =============================================================================

/// Append-only set of published code ranges.
///
/// Small scale makes a linear scan adequate; the read lock plus one `Arc`
/// clone keeps lookup allocation-free, which matters because lookups run
/// on exception-reporting paths.
#[derive(Debug)]
pub struct CodeRegistry {
    entries: RwLock<Vec<Arc<CompiledCode>>>,
}

impl CodeRegistry {
    pub const fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register published code.
    ///
    /// # Panics
    ///
    /// Panics if the code range is unpublished or overlaps a registered
    /// range. Ranges are immutable afterwards, so this holds for the
    /// remaining process lifetime.
    pub fn register(&self, code: Arc<CompiledCode>) {
        let start = code.code_start();
        assert!(start != 0, "registering unemitted code");
        let end = start + code.code_size() as u64;

        let mut entries = self.entries.write();
        for existing in entries.iter() {
            let e_start = existing.code_start();
            let e_end = e_start + existing.code_size() as u64;
            assert!(
                end <= e_start || e_end <= start,
                "code range {start:#x}..{end:#x} overlaps `{}` at {e_start:#x}..{e_end:#x}",
                existing.source().name,
            );
        }
        entries.push(code);
    }

    /// The compiled function whose code contains return address `addr`.
    pub fn lookup(&self, addr: u64) -> Option<Arc<CompiledCode>> {
        let entries = self.entries.read();
        entries
            .iter()
            .find(|code| code.contains_return_address(addr))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for CodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry consulted by the frame walker.
static CODE_REGISTRY: CodeRegistry = CodeRegistry::new();

#[inline]
pub fn code_registry() -> &'static CodeRegistry {
    &CODE_REGISTRY
}

// =============================================================================
// Tests
// =============================================================================
