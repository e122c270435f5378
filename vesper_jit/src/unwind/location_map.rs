//! Per-function variable location maps.
//!
//! For every compiled function the code generator records, per variable
//! name, where that variable lives at every instruction at which the
//! runtime may look: a machine register, a frame slot, or an immediate.
//! Given a native PC inside the function and a way to read the frame's
//! registers and memory, this module recovers the variable's raw bits and
//! reconstitutes the runtime value.
//!
//! # Names
//!
//! Two categories of name share one table:
//!
//! - source-visible identifiers (`x`, `total`, ...)
//! - synthetic names, prefixed with a reserved sigil. `!current_stmt`
//!   (address of the executing statement node) and `!frame_info` (address
//!   of the frame's [`FrameInfo`] record) are always present.
//!
//! # PC matching
//!
//! A live range `(offset, length)` covers PC offset `p` iff
//! `offset < p <= offset + length`. The lookup PC is a return address and
//! return addresses point one past the call, so the low bound is exclusive
//! and the high bound inclusive.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use vesper_core::Value;

#[cfg(doc)]
use vesper_core::FrameInfo;

/// Synthetic name bound to the executing statement node.
pub const CURRENT_STMT: &str = "!current_stmt";

/// Synthetic name bound to the frame's metadata record.
pub const FRAME_INFO: &str = "!frame_info";

/// True for names hidden from user-visible locals listings.
#[inline]
pub fn is_synthetic(name: &str) -> bool {
    name.starts_with(['#', '!'])
}

// =============================================================================
// RegisterReader
// =============================================================================

/// Access to one live native frame's registers and memory.
///
/// Implemented by the unwind cursors for real frames and by fixtures in
/// tests. Register numbering is DWARF; only 0..=15 are valid on x86-64.
pub trait RegisterReader {
    /// Current contents of a DWARF-numbered register in this frame.
    fn register(&self, dwarf_regnum: u16) -> u64;

    /// Load one machine word from memory.
    fn load(&self, addr: u64) -> u64;
}

// =============================================================================
// Location
// =============================================================================

/// Where one machine word of a variable lives at some PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The contents of a register.
    Register(u16),
    /// The address `reg + offset`. No load is performed.
    Direct { regnum: u16, offset: i32 },
    /// The word at `*(reg + offset)`.
    Indirect { regnum: u16, offset: i32 },
    /// An immediate.
    Constant(u64),
    /// An index into the owning function's constant pool.
    ConstIndex(u32),
}

impl Location {
    /// Read the raw word this location denotes from a live frame.
    ///
    /// # Panics
    ///
    /// Panics on a register number outside 0..=15 or a constant-pool index
    /// out of bounds. Both are code-generator contract violations.
    pub fn read(&self, reader: &dyn RegisterReader, constants: &[u64]) -> u64 {
        match *self {
            Location::Register(regnum) => {
                assert!(regnum < 16, "bad DWARF register number {regnum}");
                reader.register(regnum)
            }
            Location::Direct { regnum, offset } => {
                assert!(regnum < 16, "bad DWARF register number {regnum}");
                reader.register(regnum).wrapping_add(offset as i64 as u64)
            }
            Location::Indirect { regnum, offset } => {
                assert!(regnum < 16, "bad DWARF register number {regnum}");
                let addr = reader.register(regnum).wrapping_add(offset as i64 as u64);
                reader.load(addr)
            }
            Location::Constant(value) => value,
            Location::ConstIndex(idx) => {
                *constants
                    .get(idx as usize)
                    .unwrap_or_else(|| panic!("constant-pool index {idx} out of bounds"))
            }
        }
    }
}

// =============================================================================
// ValueLayout
// =============================================================================

/// How raw frame words map back to a runtime value.
///
/// The scalar layouts below each consume exactly one word. Aggregate values
/// that the backend splits across several locations are decoded word by
/// word with [`LocationEntry::read_words`] and reassembled by the object
/// model above this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLayout {
    /// The word is already a NaN-boxed value.
    Boxed,
    /// Unboxed signed integer.
    Int,
    /// Unboxed IEEE-754 double.
    Float,
    /// Unboxed boolean, 0 or 1.
    Bool,
    /// A native address (statement nodes, frame metadata). The consumer
    /// interprets the bit pattern; reconstruction wraps it as an object
    /// reference.
    Address,
}

impl ValueLayout {
    /// Reconstitute a runtime value from decoded frame words.
    ///
    /// # Panics
    ///
    /// Panics if the word count does not match the layout, or if an
    /// unboxed integer exceeds the boxable range. Both indicate corrupt
    /// location metadata.
    pub fn reconstruct(&self, words: &[u64]) -> Value {
        assert_eq!(words.len(), 1, "scalar layout fed {} words", words.len());
        let word = words[0];
        match self {
            ValueLayout::Boxed => Value::from_raw_bits(word),
            ValueLayout::Int => {
                Value::int(word as i64).expect("unboxed integer exceeds boxable range")
            }
            ValueLayout::Float => Value::float(f64::from_bits(word)),
            ValueLayout::Bool => Value::bool(word != 0),
            ValueLayout::Address => Value::object(word),
        }
    }
}

// =============================================================================
// LocationEntry / LocationTable
// =============================================================================

/// One live range of one name: the PC window and the location of each of
/// the value's machine words within it.
#[derive(Debug, Clone)]
pub struct LocationEntry {
    /// Start of the live range, in bytes from the function's first
    /// instruction. Exclusive.
    pub offset: u32,
    /// Length of the live range in bytes. The end is inclusive.
    pub length: u32,
    /// One location per machine word, lowest word first.
    pub locations: SmallVec<[Location; 1]>,
    /// How to turn the decoded words back into a value.
    pub layout: ValueLayout,
}

impl LocationEntry {
    /// Half-open range test: `offset < pc_offset <= offset + length`.
    #[inline]
    pub fn covers(&self, pc_offset: u32) -> bool {
        self.offset < pc_offset && pc_offset <= self.offset + self.length
    }

    /// Read every word of this entry from a live frame.
    pub fn read_words(
        &self,
        reader: &dyn RegisterReader,
        constants: &[u64],
    ) -> SmallVec<[u64; 2]> {
        self.locations
            .iter()
            .map(|loc| loc.read(reader, constants))
            .collect()
    }
}

/// Ordered live ranges of a single name.
#[derive(Debug, Clone, Default)]
pub struct LocationTable {
    pub entries: Vec<LocationEntry>,
}

impl LocationTable {
    pub fn new(entries: Vec<LocationEntry>) -> Self {
        Self { entries }
    }

    /// The unique entry covering `pc_offset`, if any.
    ///
    /// The code generator guarantees live ranges of one name never
    /// overlap; debug builds verify it.
    pub fn entry_covering(&self, pc_offset: u32) -> Option<&LocationEntry> {
        let mut matches = self.entries.iter().filter(|e| e.covers(pc_offset));
        let first = matches.next();
        debug_assert!(
            matches.next().is_none(),
            "overlapping live ranges at offset {pc_offset:#x}"
        );
        first
    }
}

// =============================================================================
// LocationMap
// =============================================================================

/// All variable location metadata of one compiled function.
#[derive(Debug, Clone, Default)]
pub struct LocationMap {
    names: FxHashMap<Arc<str>, LocationTable>,
    constants: Vec<u64>,
}

impl LocationMap {
    pub fn new(constants: Vec<u64>) -> Self {
        Self {
            names: FxHashMap::default(),
            constants,
        }
    }

    /// Add (or extend) the table of one name.
    pub fn insert(&mut self, name: Arc<str>, table: LocationTable) {
        self.names
            .entry(name)
            .or_default()
            .entries
            .extend(table.entries);
    }

    #[inline]
    pub fn table(&self, name: &str) -> Option<&LocationTable> {
        self.names.get(name)
    }

    #[inline]
    pub fn names(&self) -> impl Iterator<Item = (&Arc<str>, &LocationTable)> {
        self.names.iter()
    }

    #[inline]
    pub fn constants(&self) -> &[u64] {
        &self.constants
    }

    /// True once the mandatory frame-metadata synthetic is present.
    #[inline]
    pub fn has_frame_info(&self) -> bool {
        self.names.contains_key(FRAME_INFO)
    }

    /// Decode the raw words of `name` at `pc_offset`, or `None` if the
    /// name has no live range there.
    pub fn read_raw(
        &self,
        name: &str,
        pc_offset: u32,
        reader: &dyn RegisterReader,
    ) -> Option<SmallVec<[u64; 2]>> {
        let entry = self.table(name)?.entry_covering(pc_offset)?;
        Some(entry.read_words(reader, &self.constants))
    }
}

// =============================================================================
// Tests
// =============================================================================
