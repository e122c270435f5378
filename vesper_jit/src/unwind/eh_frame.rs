//! Registration of JIT-emitted `.eh_frame` sections with the native
//! unwinder.
//!
//! The backend emits exactly one CIE followed by exactly one FDE per
//! object. That fixed shape lets us skip a general CFI parser: the record
//! framing alone (self-describing 32-bit lengths) yields the one-entry
//! binary search table the unwinder's dynamic-info interface wants, the
//! same table an `.eh_frame_hdr` section would carry.
//!
//! Callers must serialize with code emission; the shim shares the
//! emission path's single-threaded discipline and performs no internal
//! ordering beyond the record-list mutex.

use parking_lot::Mutex;

// =============================================================================
// Errors
// =============================================================================

/// Rejection reasons for an emitted `.eh_frame` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhFrameError {
    /// Section too small to hold the CIE and FDE headers it claims.
    Truncated { size: usize },
    /// The word after the first length must be the CIE id, zero.
    BadCieId { found: u32 },
    /// Section holds more than the single expected FDE.
    MultipleFdes {
        cie_length: u32,
        fde_length: u32,
        size: usize,
    },
}

impl std::fmt::Display for EhFrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EhFrameError::Truncated { size } => {
                write!(f, "truncated .eh_frame section ({size} bytes)")
            }
            EhFrameError::BadCieId { found } => {
                write!(f, "CIE id is {found:#x}, expected 0")
            }
            EhFrameError::MultipleFdes {
                cie_length,
                fde_length,
                size,
            } => write!(
                f,
                ".eh_frame section of {size} bytes holds more than one FDE \
                 (cie={cie_length}, first fde={fde_length})"
            ),
        }
    }
}

impl std::error::Error for EhFrameError {}

// =============================================================================
// Parsing
// =============================================================================

/// One entry of an `.eh_frame_hdr`-style binary search table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindTableEntry {
    /// IP offset from the text base at which the FDE's coverage starts.
    pub start_ip_offset: i32,
    /// Byte offset of the FDE within the `.eh_frame` section.
    pub fde_offset: i32,
}

#[inline]
fn read_u32(section: &[u8], at: usize) -> Option<u32> {
    let bytes = section.get(at..at + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Parse a single-CIE, single-FDE `.eh_frame` section into a one-entry
/// binary search table.
///
/// Layout checks, in order:
/// 1. 32-bit length at byte 0 is the CIE length; the word at byte 4 is
///    the CIE id and must be zero. The CIE record occupies
///    `4 + cie_length` bytes.
/// 2. The next 32-bit length is the FDE length, and
///    `cie_length + fde_length + 8` must equal the section size exactly.
///    A longer section means a second FDE, which the backend never emits.
pub fn parse_eh_frame(section: &[u8]) -> Result<UnwindTableEntry, EhFrameError> {
    let truncated = || EhFrameError::Truncated {
        size: section.len(),
    };

    let cie_length = read_u32(section, 0).ok_or_else(truncated)?;
    let cie_id = read_u32(section, 4).ok_or_else(truncated)?;
    if cie_id != 0 {
        return Err(EhFrameError::BadCieId { found: cie_id });
    }

    let fde_start = 4usize + cie_length as usize;
    let fde_length = read_u32(section, fde_start).ok_or_else(truncated)?;

    let expected = cie_length as usize + fde_length as usize + 8;
    if expected != section.len() {
        if expected > section.len() {
            return Err(truncated());
        }
        return Err(EhFrameError::MultipleFdes {
            cie_length,
            fde_length,
            size: section.len(),
        });
    }

    Ok(UnwindTableEntry {
        start_ip_offset: 0,
        fde_offset: fde_start as i32,
    })
}

// =============================================================================
// Dynamic-info registration
// =============================================================================

/// One dynamic unwind-info record: the coordinates the native unwinder
/// needs to step across a JIT-emitted code range.
#[derive(Debug, Clone, Copy)]
pub struct DynUnwindInfo {
    pub start_ip: u64,
    pub end_ip: u64,
    /// Base address the FDE offsets in the table are relative to: the
    /// load address of the `.eh_frame` section.
    pub segbase: u64,
    /// The search table. Leaked at registration; the unwinder may read it
    /// for the remaining process lifetime.
    pub table: &'static UnwindTableEntry,
    /// Number of table entries, always 1 here.
    pub table_len: u64,
}

/// Registered records, in emission order. Records are never removed: the
/// unwinder offers no atomic deregistration and the code ranges live as
/// long as the process does.
static DYN_INFO: Mutex<Vec<DynUnwindInfo>> = Mutex::new(Vec::new());

/// Register a parsed table with the process unwinder.
pub fn register_dyn_info(start_ip: u64, end_ip: u64, segbase: u64, entry: UnwindTableEntry) {
    let info = DynUnwindInfo {
        start_ip,
        end_ip,
        segbase,
        table: Box::leak(Box::new(entry)),
        table_len: 1,
    };

    #[cfg(feature = "libunwind")]
    super::cursor::libunwind::dyn_register(&info);

    DYN_INFO.lock().push(info);
}

/// Parse and register in one step.
pub fn register_eh_frame(
    text_base: u64,
    text_size: u64,
    eh_frame: &[u8],
    eh_frame_base: u64,
) -> Result<(), EhFrameError> {
    let entry = parse_eh_frame(eh_frame)?;
    register_dyn_info(text_base, text_base + text_size, eh_frame_base, entry);
    Ok(())
}

/// The record whose IP range covers `ip`, if any.
pub fn dyn_info_covering(ip: u64) -> Option<DynUnwindInfo> {
    DYN_INFO
        .lock()
        .iter()
        .find(|info| info.start_ip <= ip && ip < info.end_ip)
        .copied()
}

/// Number of records registered so far.
pub fn dyn_info_count() -> usize {
    DYN_INFO.lock().len()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a section from CIE and FDE payload lengths. Contents
    /// other than the framing words are irrelevant to the shim.
    fn section(cie_payload: u32, fde_payloads: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&cie_payload.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // CIE id
        out.extend(std::iter::repeat(0xaa).take(cie_payload as usize - 4));
        for &fde_payload in fde_payloads {
            out.extend_from_slice(&fde_payload.to_le_bytes());
            out.extend(std::iter::repeat(0xbb).take(fde_payload as usize));
        }
        out
    }

    #[test]
    fn test_parse_single_fde() {
        let bytes = section(0x14, &[0x24]);
        let entry = parse_eh_frame(&bytes).unwrap();
        assert_eq!(entry.start_ip_offset, 0);
        assert_eq!(entry.fde_offset, 4 + 0x14);
        // Cross-check the framing arithmetic.
        assert_eq!(bytes.len(), 0x14 + 0x24 + 8);
    }

    #[test]
    fn test_parse_rejects_two_fdes() {
        let bytes = section(0x14, &[0x24, 0x1c]);
        match parse_eh_frame(&bytes) {
            Err(EhFrameError::MultipleFdes {
                cie_length,
                fde_length,
                ..
            }) => {
                assert_eq!(cie_length, 0x14);
                assert_eq!(fde_length, 0x24);
            }
            other => panic!("expected MultipleFdes, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_cie_id() {
        let mut bytes = section(0x14, &[0x24]);
        bytes[4] = 1;
        assert!(matches!(
            parse_eh_frame(&bytes),
            Err(EhFrameError::BadCieId { found: 1 })
        ));
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let bytes = section(0x14, &[0x24]);
        assert!(matches!(
            parse_eh_frame(&bytes[..6]),
            Err(EhFrameError::Truncated { .. })
        ));
        // Chop the FDE tail: the declared lengths now exceed the section.
        assert!(matches!(
            parse_eh_frame(&bytes[..bytes.len() - 4]),
            Err(EhFrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_register_and_query() {
        let bytes = section(0x10, &[0x18]);
        let before = dyn_info_count();
        register_eh_frame(0x7000_0000, 0x200, &bytes, 0x7100_0000).unwrap();
        assert_eq!(dyn_info_count(), before + 1);

        let info = dyn_info_covering(0x7000_0100).unwrap();
        assert_eq!(info.start_ip, 0x7000_0000);
        assert_eq!(info.end_ip, 0x7000_0200);
        assert_eq!(info.segbase, 0x7100_0000);
        assert_eq!(info.table_len, 1);
        assert_eq!(info.table.fde_offset, 4 + 0x10);

        assert!(dyn_info_covering(0x7000_0200).is_none());
    }
}
