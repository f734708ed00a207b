#![forbid(unsafe_code)]
//! Core vocabulary types for tofs.
//!
//! Unit-carrying newtypes for medium addresses and identifiers, validated
//! volume geometry, file priority/flags, validated file names, and the
//! static resource limits a volume is mounted with.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum file name length in bytes (flat root namespace).
pub const MAX_NAME_LEN: usize = 15;

/// Index of an erase block on the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

/// Absolute byte address on the medium (32-bit addressing, max 2^32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Addr(pub u32);

impl Addr {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u32) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Stable file identifier assigned at creation, never reused until reformat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// Transaction identifier (session-local counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u32);

/// Open-handle identifier, an index into the volume's handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

// ── Geometry ────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("offset_bits must be in 8..=16, got {0}")]
    OffsetBits(u8),
    #[error("block_count must be nonzero")]
    ZeroBlocks,
    #[error("volume exceeds 32-bit addressing: {blocks} blocks of 2^{offset_bits} bytes")]
    TooLarge { blocks: u32, offset_bits: u8 },
}

/// Validated volume geometry: `block_count` erase blocks of `2^offset_bits`
/// bytes each, total size at most 2^32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    offset_bits: u8,
    block_count: u32,
}

impl Geometry {
    /// Create a `Geometry` if the parameters are in range.
    pub fn new(offset_bits: u8, block_count: u32) -> Result<Self, GeometryError> {
        if !(8..=16).contains(&offset_bits) {
            return Err(GeometryError::OffsetBits(offset_bits));
        }
        if block_count == 0 {
            return Err(GeometryError::ZeroBlocks);
        }
        let total = u64::from(block_count) << offset_bits;
        if total > 1 << 32 {
            return Err(GeometryError::TooLarge {
                blocks: block_count,
                offset_bits,
            });
        }
        Ok(Self {
            offset_bits,
            block_count,
        })
    }

    #[must_use]
    pub fn offset_bits(self) -> u8 {
        self.offset_bits
    }

    #[must_use]
    pub fn block_size(self) -> u32 {
        1 << self.offset_bits
    }

    #[must_use]
    pub fn block_count(self) -> u32 {
        self.block_count
    }

    /// Total volume size in bytes.
    #[must_use]
    pub fn total_bytes(self) -> u64 {
        u64::from(self.block_count) << self.offset_bits
    }

    /// The block containing `addr`.
    #[must_use]
    pub fn block_of(self, addr: Addr) -> BlockIndex {
        BlockIndex(addr.0 >> self.offset_bits)
    }

    /// Byte offset of `addr` within its block.
    #[must_use]
    pub fn offset_in_block(self, addr: Addr) -> u32 {
        addr.0 & (self.block_size() - 1)
    }

    /// First byte address of `block`.
    #[must_use]
    pub fn block_start(self, block: BlockIndex) -> Addr {
        Addr(block.0 << self.offset_bits)
    }

    /// One past the last byte address of `block`, as a 64-bit value: the
    /// end of the last block of a maximal volume is 2^32, which a 32-bit
    /// address cannot carry.
    #[must_use]
    pub fn block_end(self, block: BlockIndex) -> u64 {
        (u64::from(block.0) << self.offset_bits) + u64::from(self.block_size())
    }

    /// Whether `addr..addr + len` stays inside a single block.
    #[must_use]
    pub fn fits_in_block(self, addr: Addr, len: u32) -> bool {
        len <= self.block_size() - self.offset_in_block(addr)
    }
}

// ── Priority and flags ──────────────────────────────────────────────────────

/// Reclamation priority of a file's content. Higher-priority content is
/// never evicted to make room for lower-priority writes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_bits(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::Normal => f.write_str("normal"),
            Self::High => f.write_str("high"),
        }
    }
}

/// Persistent per-file flag byte. The low two bits encode [`Priority`];
/// the remaining bits are user-visible and uninterpreted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFlags(u8);

impl FileFlags {
    const PRIORITY_MASK: u8 = 0b0000_0011;

    /// Decode a raw flag byte. Fails if the priority bits hold the
    /// reserved pattern `0b11`.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        Priority::from_bits(bits & Self::PRIORITY_MASK)?;
        Some(Self(bits))
    }

    #[must_use]
    pub fn new(priority: Priority) -> Self {
        Self(priority.to_bits())
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn priority(self) -> Priority {
        // Invariant: priority bits validated at construction.
        Priority::from_bits(self.0 & Self::PRIORITY_MASK).unwrap_or(Priority::Normal)
    }

    #[must_use]
    pub fn with_priority(self, priority: Priority) -> Self {
        Self((self.0 & !Self::PRIORITY_MASK) | priority.to_bits())
    }
}

impl Default for FileFlags {
    fn default() -> Self {
        Self::new(Priority::Normal)
    }
}

// ── File names ──────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    #[error("name exceeds {MAX_NAME_LEN} bytes")]
    TooLong,
    #[error("name is empty")]
    Empty,
    #[error("name contains NUL")]
    EmbeddedNul,
    #[error("name contains a path separator")]
    PathSeparator,
}

/// Validated file name: 1..=15 bytes, no NUL, no `/` (flat namespace).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileName {
    bytes: [u8; MAX_NAME_LEN],
    len: u8,
}

impl FileName {
    pub fn new(name: &[u8]) -> Result<Self, NameError> {
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong);
        }
        if name.contains(&0) {
            return Err(NameError::EmbeddedNul);
        }
        if name.contains(&b'/') {
            return Err(NameError::PathSeparator);
        }
        let mut bytes = [0_u8; MAX_NAME_LEN];
        bytes[..name.len()].copy_from_slice(name);
        // len <= MAX_NAME_LEN, fits in u8.
        #[expect(clippy::cast_possible_truncation)]
        let len = name.len() as u8;
        Ok(Self { bytes, len })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileName({})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl std::str::FromStr for FileName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, NameError> {
        Self::new(s.as_bytes())
    }
}

// ── Static limits ───────────────────────────────────────────────────────────

/// Static sizing of a mounted volume's in-RAM structures. Exceeding a
/// limit surfaces as `Exhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum concurrently open handles.
    pub max_handles: usize,
    /// Maximum files in the directory.
    pub max_files: usize,
    /// Maximum records staged in one transaction.
    pub max_txn_records: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_handles: 16,
            max_files: 64,
            max_txn_records: 64,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_validates_offset_bits() {
        assert!(Geometry::new(7, 4).is_err());
        assert!(Geometry::new(17, 4).is_err());
        assert!(Geometry::new(8, 4).is_ok());
        assert!(Geometry::new(16, 4).is_ok());
    }

    #[test]
    fn geometry_rejects_oversized_volume() {
        // 2^16-byte blocks: 65536 blocks is exactly 2^32 bytes, 65537 over.
        assert!(Geometry::new(16, 65536).is_ok());
        assert!(Geometry::new(16, 65537).is_err());
    }

    #[test]
    fn geometry_address_math() {
        let geo = Geometry::new(10, 8).expect("valid geometry");
        assert_eq!(geo.block_size(), 1024);
        assert_eq!(geo.total_bytes(), 8192);
        assert_eq!(geo.block_of(Addr(1024)), BlockIndex(1));
        assert_eq!(geo.block_of(Addr(1023)), BlockIndex(0));
        assert_eq!(geo.offset_in_block(Addr(1030)), 6);
        assert_eq!(geo.block_start(BlockIndex(3)), Addr(3072));
        assert!(geo.fits_in_block(Addr(1000), 24));
        assert!(!geo.fits_in_block(Addr(1000), 25));
    }

    #[test]
    fn name_validation() {
        assert!(FileName::new(b"q").is_ok());
        assert!(FileName::new(b"exactly15bytes!").is_ok());
        assert_eq!(FileName::new(b"sixteen.bytes.xx"), Err(NameError::TooLong));
        assert_eq!(FileName::new(b""), Err(NameError::Empty));
        assert_eq!(FileName::new(b"a\0b"), Err(NameError::EmbeddedNul));
        assert_eq!(FileName::new(b"a/b"), Err(NameError::PathSeparator));
    }

    #[test]
    fn flags_priority_roundtrip() {
        let f = FileFlags::new(Priority::High);
        assert_eq!(f.priority(), Priority::High);
        let f = f.with_priority(Priority::Low);
        assert_eq!(f.priority(), Priority::Low);
        assert!(FileFlags::from_bits(0b11).is_none());
        assert_eq!(
            FileFlags::from_bits(0b10).map(FileFlags::priority),
            Some(Priority::High)
        );
    }

    #[test]
    fn priority_ordering_matches_eviction_rules() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
    }
}
