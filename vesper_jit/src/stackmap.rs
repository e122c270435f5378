//! Parsing of the backend's call-site location records.
//!
//! Alongside each object the backend emits one stack-map blob describing,
//! per recorded call site, where values live at that site. The layout is
//! a reduced form of the LLVM stack-map format, little-endian throughout:
//!
//! ```text
//! header    : u8 version (= 3), u8 reserved, u16 reserved
//!             u32 num_functions, u32 num_constants, u32 num_records
//! functions : num_functions × { u64 addr, u64 stack_size, u64 record_count }
//! constants : num_constants × u64
//! records   : num_records × { u64 id, u32 instr_offset, u16 flags,
//!                             u16 num_locations, locations... }
//! location  : u8 type, u8 flags, u16 size, u16 regnum, i32 offset
//! ```
//!
//! Records appear in function order; the per-function `record_count`
//! fields partition them. The location `type` is one of Register, Direct,
//! Indirect, Constant, ConstIndex, with the same meanings as the decoded
//! [`Location`] variants.

use smallvec::SmallVec;
use std::sync::Arc;

use crate::unwind::location_map::{
    Location, LocationEntry, LocationMap, LocationTable, ValueLayout,
};

/// The one stack-map layout version this runtime emits.
pub const STACKMAP_VERSION: u8 = 3;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMapError {
    UnsupportedVersion(u8),
    Truncated { at: usize },
    BadLocationType(u8),
    /// Per-function record counts do not add up to the record total.
    RecordCountMismatch { declared: u32, partitioned: u64 },
    /// A ConstIndex location carries a negative index.
    BadConstIndex(i32),
    /// No record with this id exists (location-map construction).
    UnknownRecordId(u64),
}

impl std::fmt::Display for StackMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackMapError::UnsupportedVersion(v) => {
                write!(f, "unsupported stack-map version {v}")
            }
            StackMapError::Truncated { at } => {
                write!(f, "stack-map section truncated at byte {at}")
            }
            StackMapError::BadLocationType(t) => write!(f, "unknown location type {t}"),
            StackMapError::RecordCountMismatch {
                declared,
                partitioned,
            } => write!(
                f,
                "{partitioned} records partitioned across functions, {declared} declared"
            ),
            StackMapError::BadConstIndex(i) => {
                write!(f, "negative constant-pool index {i}")
            }
            StackMapError::UnknownRecordId(id) => {
                write!(f, "no stack-map record with id {id}")
            }
        }
    }
}

impl std::error::Error for StackMapError {}

// =============================================================================
// Data model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Register = 1,
    Direct = 2,
    Indirect = 3,
    Constant = 4,
    ConstIndex = 5,
}

impl LocationKind {
    fn from_u8(v: u8) -> Result<Self, StackMapError> {
        match v {
            1 => Ok(LocationKind::Register),
            2 => Ok(LocationKind::Direct),
            3 => Ok(LocationKind::Indirect),
            4 => Ok(LocationKind::Constant),
            5 => Ok(LocationKind::ConstIndex),
            other => Err(StackMapError::BadLocationType(other)),
        }
    }
}

/// One raw location as emitted by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub kind: LocationKind,
    pub flags: u8,
    /// Value width in bytes at this location.
    pub size: u16,
    /// DWARF register number, meaningful for Register/Direct/Indirect.
    pub regnum: u16,
    /// Displacement, immediate, or pool index depending on `kind`.
    pub offset: i32,
}

impl RecordLocation {
    /// Lower to the decoded representation the walker consumes.
    pub fn to_location(self) -> Location {
        match self.kind {
            LocationKind::Register => Location::Register(self.regnum),
            LocationKind::Direct => Location::Direct {
                regnum: self.regnum,
                offset: self.offset,
            },
            LocationKind::Indirect => Location::Indirect {
                regnum: self.regnum,
                offset: self.offset,
            },
            // Small immediates are sign-extended to a full word.
            LocationKind::Constant => Location::Constant(self.offset as i64 as u64),
            // Index validated non-negative at parse time.
            LocationKind::ConstIndex => Location::ConstIndex(self.offset as u32),
        }
    }
}

/// One recorded call site.
#[derive(Debug, Clone, PartialEq)]
pub struct StackMapRecord {
    pub id: u64,
    /// Byte offset of the site from the function's first instruction.
    pub instr_offset: u32,
    pub flags: u16,
    pub locations: SmallVec<[RecordLocation; 4]>,
}

/// Per-function grouping of records.
#[derive(Debug, Clone, PartialEq)]
pub struct StackMapFunction {
    pub addr: u64,
    pub stack_size: u64,
    pub records: Vec<StackMapRecord>,
}

/// A fully parsed stack-map section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackMapSection {
    pub functions: Vec<StackMapFunction>,
    pub constants: Vec<u64>,
}

impl StackMapSection {
    /// The record with the given id, searched across all functions.
    pub fn record(&self, id: u64) -> Option<&StackMapRecord> {
        self.functions
            .iter()
            .flat_map(|f| f.records.iter())
            .find(|r| r.id == id)
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StackMapError> {
        let out = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(StackMapError::Truncated { at: self.pos })?;
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, StackMapError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, StackMapError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, StackMapError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, StackMapError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, StackMapError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

/// Parse a stack-map section.
pub fn parse_stackmap(bytes: &[u8]) -> Result<StackMapSection, StackMapError> {
    let mut r = Reader::new(bytes);

    let version = r.u8()?;
    if version != STACKMAP_VERSION {
        return Err(StackMapError::UnsupportedVersion(version));
    }
    r.u8()?;
    r.u16()?;

    let num_functions = r.u32()?;
    let num_constants = r.u32()?;
    let num_records = r.u32()?;

    let mut headers = Vec::with_capacity(num_functions as usize);
    for _ in 0..num_functions {
        let addr = r.u64()?;
        let stack_size = r.u64()?;
        let record_count = r.u64()?;
        headers.push((addr, stack_size, record_count));
    }

    let partitioned: u64 = headers.iter().map(|h| h.2).sum();
    if partitioned != num_records as u64 {
        return Err(StackMapError::RecordCountMismatch {
            declared: num_records,
            partitioned,
        });
    }

    let mut constants = Vec::with_capacity(num_constants as usize);
    for _ in 0..num_constants {
        constants.push(r.u64()?);
    }

    let mut functions = Vec::with_capacity(headers.len());
    for (addr, stack_size, record_count) in headers {
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            let id = r.u64()?;
            let instr_offset = r.u32()?;
            let flags = r.u16()?;
            let num_locations = r.u16()?;

            let mut locations = SmallVec::with_capacity(num_locations as usize);
            for _ in 0..num_locations {
                let kind = LocationKind::from_u8(r.u8()?)?;
                let loc_flags = r.u8()?;
                let size = r.u16()?;
                let regnum = r.u16()?;
                let offset = r.i32()?;
                if kind == LocationKind::ConstIndex && offset < 0 {
                    return Err(StackMapError::BadConstIndex(offset));
                }
                locations.push(RecordLocation {
                    kind,
                    flags: loc_flags,
                    size,
                    regnum,
                    offset,
                });
            }
            records.push(StackMapRecord {
                id,
                instr_offset,
                flags,
                locations,
            });
        }
        functions.push(StackMapFunction {
            addr,
            stack_size,
            records,
        });
    }

    Ok(StackMapSection {
        functions,
        constants,
    })
}

// =============================================================================
// LocationMap construction
// =============================================================================

/// Compiler-side description of one live range: which record carries the
/// variable's locations and how long past the site the range stays live.
#[derive(Debug, Clone)]
pub struct LiveRangeSpec {
    pub name: Arc<str>,
    pub record_id: u64,
    pub length: u32,
    pub layout: ValueLayout,
}

/// Build a function's [`LocationMap`] from its stack-map section and the
/// compiler's live-range manifest. The section's constant pool becomes
/// the function's pool.
pub fn build_location_map(
    section: &StackMapSection,
    specs: &[LiveRangeSpec],
) -> Result<LocationMap, StackMapError> {
    let mut map = LocationMap::new(section.constants.clone());
    for spec in specs {
        let record = section
            .record(spec.record_id)
            .ok_or(StackMapError::UnknownRecordId(spec.record_id))?;
        let entry = LocationEntry {
            offset: record.instr_offset,
            length: spec.length,
            locations: record.locations.iter().map(|l| l.to_location()).collect(),
            layout: spec.layout,
        };
        map.insert(Arc::clone(&spec.name), LocationTable::new(vec![entry]));
    }
    Ok(map)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize a section the way the backend does.
    fn write_section(
        functions: &[(u64, u64, &[(u64, u32, &[(u8, u16, u16, i32)])])],
        constants: &[u64],
    ) -> Vec<u8> {
        let mut out = vec![STACKMAP_VERSION, 0, 0, 0];
        let num_records: u64 = functions.iter().map(|f| f.2.len() as u64).sum();
        out.extend_from_slice(&(functions.len() as u32).to_le_bytes());
        out.extend_from_slice(&(constants.len() as u32).to_le_bytes());
        out.extend_from_slice(&(num_records as u32).to_le_bytes());
        for (addr, stack_size, records) in functions {
            out.extend_from_slice(&addr.to_le_bytes());
            out.extend_from_slice(&stack_size.to_le_bytes());
            out.extend_from_slice(&(records.len() as u64).to_le_bytes());
        }
        for c in constants {
            out.extend_from_slice(&c.to_le_bytes());
        }
        for (_, _, records) in functions {
            for (id, instr_offset, locations) in *records {
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&instr_offset.to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes()); // flags
                out.extend_from_slice(&(locations.len() as u16).to_le_bytes());
                for (kind, size, regnum, offset) in *locations {
                    out.push(*kind);
                    out.push(0);
                    out.extend_from_slice(&size.to_le_bytes());
                    out.extend_from_slice(&regnum.to_le_bytes());
                    out.extend_from_slice(&offset.to_le_bytes());
                }
            }
        }
        out
    }

    #[test]
    fn test_parse_two_functions() {
        let bytes = write_section(
            &[
                (0x1000, 64, &[(1, 0x10, &[(1, 8, 3, 0)])]),
                (
                    0x2000,
                    128,
                    &[
                        (2, 0x20, &[(3, 8, 6, -16)]),
                        (3, 0x30, &[(4, 8, 0, -7), (5, 8, 0, 1)]),
                    ],
                ),
            ],
            &[0xabcd, 0xef01],
        );

        let section = parse_stackmap(&bytes).unwrap();
        assert_eq!(section.functions.len(), 2);
        assert_eq!(section.constants, vec![0xabcd, 0xef01]);

        let f0 = &section.functions[0];
        assert_eq!(f0.addr, 0x1000);
        assert_eq!(f0.stack_size, 64);
        assert_eq!(f0.records.len(), 1);
        assert_eq!(
            f0.records[0].locations[0].to_location(),
            Location::Register(3)
        );

        let f1 = &section.functions[1];
        assert_eq!(f1.records.len(), 2);
        assert_eq!(
            f1.records[0].locations[0].to_location(),
            Location::Indirect {
                regnum: 6,
                offset: -16
            }
        );
        // Negative immediates sign-extend.
        assert_eq!(
            f1.records[1].locations[0].to_location(),
            Location::Constant(-7i64 as u64)
        );
        assert_eq!(
            f1.records[1].locations[1].to_location(),
            Location::ConstIndex(1)
        );
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        let mut bytes = write_section(&[], &[]);
        bytes[0] = 2;
        assert_eq!(
            parse_stackmap(&bytes),
            Err(StackMapError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let bytes = write_section(&[(0x1000, 64, &[(1, 0x10, &[(1, 8, 3, 0)])])], &[]);
        for cut in [2, 10, 20, bytes.len() - 1] {
            assert!(matches!(
                parse_stackmap(&bytes[..cut]),
                Err(StackMapError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn test_parse_rejects_count_mismatch() {
        let mut bytes = write_section(&[(0x1000, 64, &[(1, 0x10, &[])])], &[]);
        // Declare two records while the function partition holds one.
        bytes[12..16].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            parse_stackmap(&bytes),
            Err(StackMapError::RecordCountMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_location_type() {
        let bytes = write_section(&[(0x1000, 64, &[(1, 0x10, &[(9, 8, 0, 0)])])], &[]);
        assert_eq!(
            parse_stackmap(&bytes),
            Err(StackMapError::BadLocationType(9))
        );
    }

    #[test]
    fn test_parse_rejects_negative_const_index() {
        let bytes = write_section(&[(0x1000, 64, &[(1, 0x10, &[(5, 8, 0, -1)])])], &[]);
        assert_eq!(parse_stackmap(&bytes), Err(StackMapError::BadConstIndex(-1)));
    }

    #[test]
    fn test_build_location_map() {
        let bytes = write_section(
            &[(
                0x1000,
                64,
                &[(1, 0x10, &[(1, 8, 3, 0)]), (2, 0x24, &[(3, 8, 6, -24)])],
            )],
            &[42],
        );
        let section = parse_stackmap(&bytes).unwrap();

        let specs = [
            LiveRangeSpec {
                name: "x".into(),
                record_id: 1,
                length: 0x30,
                layout: ValueLayout::Boxed,
            },
            LiveRangeSpec {
                name: "!frame_info".into(),
                record_id: 2,
                length: 0x10,
                layout: ValueLayout::Address,
            },
        ];
        let map = build_location_map(&section, &specs).unwrap();

        assert_eq!(map.constants(), &[42]);
        assert!(map.has_frame_info());

        let entry = map.table("x").unwrap().entry_covering(0x20).unwrap();
        assert_eq!(entry.offset, 0x10);
        assert_eq!(entry.length, 0x30);
        assert_eq!(entry.locations[0], Location::Register(3));

        let missing = build_location_map(
            &section,
            &[LiveRangeSpec {
                name: "y".into(),
                record_id: 99,
                length: 1,
                layout: ValueLayout::Int,
            }],
        );
        assert_eq!(missing.unwrap_err(), StackMapError::UnknownRecordId(99));
    }
}
