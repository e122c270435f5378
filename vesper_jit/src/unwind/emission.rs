//! Observation of code emission.
//!
//! When the backend finishes materializing an object in executable
//! memory it notifies this module, which wires the new code into the
//! introspection machinery: the code range goes into the registry, the
//! `.eh_frame` bytes go to the unwinder shim, and the compiled-function
//! record that was pending for this emission gets its final addresses.
//!
//! The compiler announces which record the next emission belongs to
//! through a one-slot rendezvous ([`set_pending_compilation`]); emission
//! is serialized by the compilation lock, so the slot never sees two
//! producers.
//!
//! Every error returned here is a contract violation between compiler
//! and backend. The driver treats them as fatal; there is no recovery
//! from a half-described object.

use parking_lot::Mutex;
use std::sync::Arc;
use vesper_core::verbosity;

use super::eh_frame::{self, EhFrameError};
use super::registry::{code_registry, CompiledCode};

// =============================================================================
// Emitted-object description
// =============================================================================

/// One section of an emitted object, already loaded at its final address.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

/// The sections of one emitted object.
#[derive(Debug, Clone, Default)]
pub struct EmittedObject {
    pub sections: Vec<SectionInfo>,
}

impl EmittedObject {
    fn unique_section(&self, name: &'static str) -> Result<&SectionInfo, EmissionError> {
        let mut found = None;
        for sec in &self.sections {
            if sec.name == name {
                if found.is_some() {
                    return Err(EmissionError::DuplicateSection { name });
                }
                found = Some(sec);
            }
        }
        found.ok_or(EmissionError::MissingSection { name })
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum EmissionError {
    /// No compilation was pending; the backend emitted an object nobody
    /// announced.
    NoPendingCompilation,
    /// The pending record already has machine code.
    AlreadyEmitted { name: Arc<str> },
    MissingSection { name: &'static str },
    DuplicateSection { name: &'static str },
    EhFrame(EhFrameError),
}

impl std::fmt::Display for EmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmissionError::NoPendingCompilation => {
                write!(f, "object emitted with no pending compilation")
            }
            EmissionError::AlreadyEmitted { name } => {
                write!(f, "pending function `{name}` already has machine code")
            }
            EmissionError::MissingSection { name } => {
                write!(f, "emitted object has no {name} section")
            }
            EmissionError::DuplicateSection { name } => {
                write!(f, "emitted object has more than one {name} section")
            }
            EmissionError::EhFrame(e) => write!(f, "bad .eh_frame section: {e}"),
        }
    }
}

impl std::error::Error for EmissionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmissionError::EhFrame(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EhFrameError> for EmissionError {
    fn from(e: EhFrameError) -> Self {
        EmissionError::EhFrame(e)
    }
}

// =============================================================================
// Pending-compilation rendezvous
// =============================================================================

static PENDING: Mutex<Option<Arc<CompiledCode>>> = Mutex::new(None);

/// Announce that the next emitted object belongs to `code`.
///
/// # Panics
///
/// Panics if a previous announcement was never consumed.
pub fn set_pending_compilation(code: Arc<CompiledCode>) {
    let mut slot = PENDING.lock();
    assert!(
        slot.is_none(),
        "a pending compilation was never emitted"
    );
    *slot = Some(code);
}

/// Whether an announcement is waiting. Test hook.
pub fn pending_compilation_set() -> bool {
    PENDING.lock().is_some()
}

// =============================================================================
// Observer
// =============================================================================

/// Wire a freshly emitted object into the introspection machinery.
///
/// Steps, in order: locate the single `.text` and `.eh_frame` sections,
/// validate the `.eh_frame` framing, consume the pending record, publish
/// its code range, register it, and hand the unwind table to the shim.
/// Validation happens before any state changes, so a rejected object
/// leaves the registry and unwinder untouched (the pending slot is
/// consumed regardless; the caller is expected to abort on error).
///
/// Returns the now-registered record.
pub fn object_emitted(obj: &EmittedObject) -> Result<Arc<CompiledCode>, EmissionError> {
    let text = obj.unique_section(".text")?.clone();
    let eh = obj.unique_section(".eh_frame")?.clone();

    // SAFETY: the backend loaded the section at this address and it stays
    // mapped for the process lifetime; emission is serialized, so nobody
    // is concurrently writing it.
    let eh_bytes =
        unsafe { std::slice::from_raw_parts(eh.addr as *const u8, eh.size as usize) };
    let table_entry = eh_frame::parse_eh_frame(eh_bytes)?;

    let code = PENDING
        .lock()
        .take()
        .ok_or(EmissionError::NoPendingCompilation)?;

    code.publish_code(text.addr, text.size as u32)
        .map_err(|e| EmissionError::AlreadyEmitted { name: e.name })?;
    code_registry().register(Arc::clone(&code));

    eh_frame::register_dyn_info(text.addr, text.addr + text.size, eh.addr, table_entry);

    if verbosity() >= 1 {
        eprintln!(
            "vesper-jit: emitted `{}` text={:#x}+{:#x} eh_frame={:#x}+{:#x}",
            code.source().name,
            text.addr,
            text.size,
            eh.addr,
            eh.size,
        );
    }
    if verbosity() >= 2 {
        if let Some(map) = code.location_map() {
            for (name, table) in map.names() {
                eprintln!("  {name}: {} live ranges", table.entries.len());
            }
        }
    }

    Ok(code)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::{SourceFunction, SourceModule};

    // The pending slot is process-global; tests touching it take turns.
    static SLOT_LOCK: Mutex<()> = Mutex::new(());

    fn function(name: &str) -> Arc<SourceFunction> {
        SourceFunction::new(name, SourceModule::new("m", "m.vsp"), Vec::new())
    }

    /// A minimal well-formed .eh_frame: one CIE, one FDE.
    fn eh_frame_bytes() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0x10u32.to_le_bytes()); // CIE length
        out.extend_from_slice(&0u32.to_le_bytes()); // CIE id
        out.extend(std::iter::repeat(0).take(0x10 - 4));
        out.extend_from_slice(&0x18u32.to_le_bytes()); // FDE length
        out.extend(std::iter::repeat(0).take(0x18));
        out
    }

    fn object(text_addr: u64, text_size: u64, eh: &[u8]) -> EmittedObject {
        EmittedObject {
            sections: vec![
                SectionInfo {
                    name: ".text".into(),
                    addr: text_addr,
                    size: text_size,
                },
                SectionInfo {
                    name: ".eh_frame".into(),
                    addr: eh.as_ptr() as u64,
                    size: eh.len() as u64,
                },
            ],
        }
    }

    #[test]
    fn test_full_emission_path() {
        let _guard = SLOT_LOCK.lock();
        let eh = eh_frame_bytes();
        let code = CompiledCode::new(function("emit_f"), None);
        set_pending_compilation(Arc::clone(&code));

        let emitted = object_emitted(&object(0x31_0000, 0x100, &eh)).unwrap();
        assert!(Arc::ptr_eq(&emitted, &code));
        assert_eq!(code.code_start(), 0x31_0000);
        assert_eq!(code.code_size(), 0x100);
        assert!(!pending_compilation_set());

        // The registry resolves return addresses into the new code.
        let hit = code_registry().lookup(0x31_0001).unwrap();
        assert!(Arc::ptr_eq(&hit, &code));

        // The shim recorded the unwind coordinates.
        let info = eh_frame::dyn_info_covering(0x31_0080).unwrap();
        assert_eq!(info.segbase, eh.as_ptr() as u64);
    }

    #[test]
    fn test_emission_without_pending_slot_rejected() {
        let _guard = SLOT_LOCK.lock();
        let eh = eh_frame_bytes();
        let err = object_emitted(&object(0x32_0000, 0x100, &eh)).unwrap_err();
        assert!(matches!(err, EmissionError::NoPendingCompilation));
    }

    #[test]
    fn test_missing_and_duplicate_sections_rejected() {
        let _guard = SLOT_LOCK.lock();
        let eh = eh_frame_bytes();

        let mut obj = object(0x33_0000, 0x100, &eh);
        obj.sections.retain(|s| s.name != ".eh_frame");
        assert!(matches!(
            object_emitted(&obj).unwrap_err(),
            EmissionError::MissingSection { name: ".eh_frame" }
        ));

        let mut obj = object(0x33_0000, 0x100, &eh);
        obj.sections.push(SectionInfo {
            name: ".text".into(),
            addr: 0x34_0000,
            size: 0x40,
        });
        assert!(matches!(
            object_emitted(&obj).unwrap_err(),
            EmissionError::DuplicateSection { name: ".text" }
        ));
    }

    #[test]
    fn test_malformed_eh_frame_rejected_before_registration() {
        let _guard = SLOT_LOCK.lock();
        // Two FDEs: reject, and the pending slot must not be consumed
        // before validation.
        let mut eh = eh_frame_bytes();
        eh.extend_from_slice(&0x8u32.to_le_bytes());
        eh.extend(std::iter::repeat(0).take(8));

        let code = CompiledCode::new(function("emit_bad"), None);
        set_pending_compilation(code);
        let err = object_emitted(&object(0x35_0000, 0x100, &eh)).unwrap_err();
        assert!(matches!(
            err,
            EmissionError::EhFrame(EhFrameError::MultipleFdes { .. })
        ));
        // Validation precedes the slot take.
        assert!(pending_compilation_set());
        assert!(code_registry().lookup(0x35_0001).is_none());

        // Drain the slot for other tests.
        PENDING.lock().take();
    }
}
