#![forbid(unsafe_code)]
//! On-medium record codec.
//!
//! Every unit of log content is a self-delimiting record confined to one
//! erase block:
//!
//! ```text
//! offset 0   tag        u8   (0xFF means erased slot / end of log)
//! offset 1   state      u8   (0xFF tentative, 0x7F live, 0x00 dead)
//! offset 2   reserved   u16  (written as zero)
//! offset 4   len        u32  LE, payload byte length
//! offset 8   crc        u32  LE, crc32c over the payload
//! offset 12  payload
//! ```
//!
//! The state byte transitions `TENTATIVE → LIVE → DEAD` by clearing bits
//! only, so markers can be rewritten in place without an erase. It is
//! excluded from the checksum for the same reason.

use tofs_device::BlockDevice;
use tofs_error::{Result, TofsError};
use tofs_types::{Addr, FileFlags, FileId, FileName, Geometry, TxnId};
use tracing::trace;

/// Fixed record header size in bytes.
pub const HEADER_SIZE: u32 = 12;

/// Superblock payload magic: `T O F S` read as little-endian u32.
pub const SUPERBLOCK_MAGIC: u32 = 0x5346_4F54;

/// On-medium format version.
pub const FORMAT_VERSION: u16 = 1;

const STATE_TENTATIVE: u8 = 0xFF;
const STATE_LIVE: u8 = 0x7F;
const STATE_DEAD: u8 = 0x00;

/// Byte offset of the state marker within a record header.
const STATE_BYTE: u32 = 1;

// ── Tags and states ─────────────────────────────────────────────────────────

/// Record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Superblock = 0x01,
    FileCreate = 0x02,
    Append = 0x03,
    Truncate = 0x04,
    Delete = 0x05,
    SetFlags = 0x06,
    TxnBegin = 0x07,
    TxnCommit = 0x08,
    TxnAbort = 0x09,
    Padding = 0x0A,
}

impl Tag {
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Superblock),
            0x02 => Some(Self::FileCreate),
            0x03 => Some(Self::Append),
            0x04 => Some(Self::Truncate),
            0x05 => Some(Self::Delete),
            0x06 => Some(Self::SetFlags),
            0x07 => Some(Self::TxnBegin),
            0x08 => Some(Self::TxnCommit),
            0x09 => Some(Self::TxnAbort),
            0x0A => Some(Self::Padding),
            _ => None,
        }
    }
}

/// Record state as read back from the marker byte.
///
/// Any marker value other than the three canonical ones can only result
/// from corruption and reads back as `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Tentative,
    Live,
    Dead,
}

impl State {
    #[must_use]
    pub fn from_byte(b: u8) -> Self {
        match b {
            STATE_TENTATIVE => Self::Tentative,
            STATE_LIVE => Self::Live,
            _ => Self::Dead,
        }
    }
}

// ── Decoded records ─────────────────────────────────────────────────────────

/// Parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: Tag,
    pub state: State,
    pub len: u32,
}

/// Volume identity carried by the superblock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockInfo {
    pub version: u16,
    pub geometry: Geometry,
    pub epoch: u32,
}

/// Structured record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Superblock(SuperblockInfo),
    FileCreate {
        file: FileId,
        flags: FileFlags,
        name: FileName,
    },
    Append {
        file: FileId,
        /// Logical offset of the first data byte within the file.
        start: u32,
        data: Vec<u8>,
    },
    Truncate {
        file: FileId,
        new_head: u32,
    },
    Delete {
        file: FileId,
    },
    SetFlags {
        file: FileId,
        flags: FileFlags,
        seq: u32,
    },
    TxnBegin {
        txn: TxnId,
    },
    TxnCommit {
        txn: TxnId,
    },
    TxnAbort {
        txn: TxnId,
    },
    Padding,
}

/// A decoded record at a known address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub addr: Addr,
    pub header: Header,
    pub body: Body,
}

impl Record {
    /// Total on-medium size including the header.
    #[must_use]
    pub fn size(&self) -> u32 {
        HEADER_SIZE + self.header.len
    }
}

/// Outcome of decoding at an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A parseable record; `next` is the address just past it.
    Record { record: Record, next: Addr },
    /// Erased header: end of log within this block.
    EndOfLog,
    /// Header or payload cannot be trusted; the rest of the block must be
    /// treated as sealed. The state byte at `addr` has been marked dead if
    /// the medium allowed it.
    Torn,
}

// ── Payload builders ────────────────────────────────────────────────────────

/// Largest payload a single record may carry on a volume with `geo`.
#[must_use]
pub fn max_payload(geo: Geometry) -> u32 {
    geo.block_size() - HEADER_SIZE
}

/// Largest `Append` data length (payload minus file id and start offset).
#[must_use]
pub fn max_append_data(geo: Geometry) -> u32 {
    max_payload(geo) - 8
}

#[must_use]
pub fn superblock_payload(info: &SuperblockInfo) -> Vec<u8> {
    let mut p = Vec::with_capacity(16);
    p.extend_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
    p.extend_from_slice(&info.version.to_le_bytes());
    p.push(info.geometry.offset_bits());
    p.push(0);
    p.extend_from_slice(&info.geometry.block_count().to_le_bytes());
    p.extend_from_slice(&info.epoch.to_le_bytes());
    p
}

#[must_use]
pub fn file_create_payload(file: FileId, flags: FileFlags, name: &FileName) -> Vec<u8> {
    let mut p = Vec::with_capacity(6 + name.len());
    p.extend_from_slice(&file.0.to_le_bytes());
    p.push(flags.bits());
    // name.len() <= 15, fits in u8.
    #[expect(clippy::cast_possible_truncation)]
    let name_len = name.len() as u8;
    p.push(name_len);
    p.extend_from_slice(name.as_bytes());
    p
}

#[must_use]
pub fn append_payload(file: FileId, start: u32, data: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(8 + data.len());
    p.extend_from_slice(&file.0.to_le_bytes());
    p.extend_from_slice(&start.to_le_bytes());
    p.extend_from_slice(data);
    p
}

#[must_use]
pub fn truncate_payload(file: FileId, new_head: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(8);
    p.extend_from_slice(&file.0.to_le_bytes());
    p.extend_from_slice(&new_head.to_le_bytes());
    p
}

#[must_use]
pub fn delete_payload(file: FileId) -> Vec<u8> {
    file.0.to_le_bytes().to_vec()
}

#[must_use]
pub fn set_flags_payload(file: FileId, flags: FileFlags, seq: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(9);
    p.extend_from_slice(&file.0.to_le_bytes());
    p.push(flags.bits());
    p.extend_from_slice(&seq.to_le_bytes());
    p
}

#[must_use]
pub fn txn_payload(txn: TxnId) -> Vec<u8> {
    txn.0.to_le_bytes().to_vec()
}

// ── Writing ─────────────────────────────────────────────────────────────────

/// Write a record at `addr` in TENTATIVE state.
///
/// The caller guarantees `addr..addr + HEADER_SIZE + payload.len()` lies in
/// erased space within one block; `payload.len()` must not exceed
/// [`max_payload`].
pub fn write_tentative(
    dev: &mut dyn BlockDevice,
    addr: Addr,
    tag: Tag,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| TofsError::Exhausted("record payload size"))?;
    debug_assert!(len <= max_payload(dev.geometry()));
    let crc = crc32c::crc32c(payload);

    let mut buf = Vec::with_capacity(HEADER_SIZE as usize + payload.len());
    buf.push(tag as u8);
    buf.push(STATE_TENTATIVE);
    buf.extend_from_slice(&0_u16.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    dev.program(addr, &buf)?;
    trace!(target: "tofs::record", addr = addr.0, tag = ?tag, len, "record_written");
    Ok(())
}

/// Write a `Padding` record filling `addr..block_end`, already DEAD.
///
/// `remainder` must be at least `HEADER_SIZE` and at most the space left in
/// the block.
pub fn write_padding(dev: &mut dyn BlockDevice, addr: Addr, remainder: u32) -> Result<()> {
    debug_assert!(remainder >= HEADER_SIZE);
    let len = remainder - HEADER_SIZE;
    let mut buf = vec![0_u8; remainder as usize];
    buf[0] = Tag::Padding as u8;
    buf[1] = STATE_DEAD;
    buf[4..8].copy_from_slice(&len.to_le_bytes());
    let crc = crc32c::crc32c(&buf[12..]);
    buf[8..12].copy_from_slice(&crc.to_le_bytes());
    dev.program(addr, &buf)
}

/// Transition the state marker at `addr` from TENTATIVE to LIVE.
///
/// Idempotent: a record already LIVE is untouched, and a DEAD record stays
/// DEAD (the marker is monotonic).
pub fn mark_live(dev: &mut dyn BlockDevice, addr: Addr) -> Result<()> {
    let mut b = [0_u8; 1];
    dev.read(Addr(addr.0 + STATE_BYTE), &mut b)?;
    match State::from_byte(b[0]) {
        State::Tentative => dev.program(Addr(addr.0 + STATE_BYTE), &[STATE_LIVE]),
        State::Live | State::Dead => Ok(()),
    }
}

/// Transition the state marker at `addr` to DEAD. Always possible without
/// an erase (0x00 clears bits from any value) and idempotent.
pub fn mark_dead(dev: &mut dyn BlockDevice, addr: Addr) -> Result<()> {
    dev.program(Addr(addr.0 + STATE_BYTE), &[STATE_DEAD])
}

// ── Decoding ────────────────────────────────────────────────────────────────

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn parse_body(tag: Tag, state: State, payload: &[u8]) -> Option<Body> {
    match tag {
        Tag::Superblock => {
            if payload.len() < 16 {
                return None;
            }
            if le_u32(payload, 0) != SUPERBLOCK_MAGIC {
                return None;
            }
            let version = u16::from_le_bytes([payload[4], payload[5]]);
            let geometry = Geometry::new(payload[6], le_u32(payload, 8)).ok()?;
            Some(Body::Superblock(SuperblockInfo {
                version,
                geometry,
                epoch: le_u32(payload, 12),
            }))
        }
        Tag::FileCreate => {
            if payload.len() < 6 {
                return None;
            }
            let name_len = usize::from(payload[5]);
            if payload.len() < 6 + name_len {
                return None;
            }
            // Dead records may carry flags wiped to zero by supersession;
            // only live content needs strict validation.
            let flags = FileFlags::from_bits(payload[4]).or_else(|| {
                (state == State::Dead).then(FileFlags::default)
            })?;
            let name = FileName::new(&payload[6..6 + name_len]).ok()?;
            Some(Body::FileCreate {
                file: FileId(le_u32(payload, 0)),
                flags,
                name,
            })
        }
        Tag::Append => {
            if payload.len() < 8 {
                return None;
            }
            Some(Body::Append {
                file: FileId(le_u32(payload, 0)),
                start: le_u32(payload, 4),
                data: payload[8..].to_vec(),
            })
        }
        Tag::Truncate => {
            if payload.len() < 8 {
                return None;
            }
            Some(Body::Truncate {
                file: FileId(le_u32(payload, 0)),
                new_head: le_u32(payload, 4),
            })
        }
        Tag::Delete => {
            if payload.len() < 4 {
                return None;
            }
            Some(Body::Delete {
                file: FileId(le_u32(payload, 0)),
            })
        }
        Tag::SetFlags => {
            if payload.len() < 9 {
                return None;
            }
            let flags = FileFlags::from_bits(payload[4]).or_else(|| {
                (state == State::Dead).then(FileFlags::default)
            })?;
            Some(Body::SetFlags {
                file: FileId(le_u32(payload, 0)),
                flags,
                seq: le_u32(payload, 5),
            })
        }
        Tag::TxnBegin => (payload.len() >= 4).then(|| Body::TxnBegin {
            txn: TxnId(le_u32(payload, 0)),
        }),
        Tag::TxnCommit => (payload.len() >= 4).then(|| Body::TxnCommit {
            txn: TxnId(le_u32(payload, 0)),
        }),
        Tag::TxnAbort => (payload.len() >= 4).then(|| Body::TxnAbort {
            txn: TxnId(le_u32(payload, 0)),
        }),
        Tag::Padding => Some(Body::Padding),
    }
}

/// Decode the record starting at `addr`.
///
/// `addr` must leave at least `HEADER_SIZE` bytes in its block (the caller
/// treats shorter tails as sealed space). Corruption is self-healing where
/// the medium permits: a record whose payload fails its checksum, or whose
/// header cannot be trusted, is marked DEAD in place.
pub fn decode_at(dev: &mut dyn BlockDevice, addr: Addr) -> Result<Decoded> {
    let geo = dev.geometry();
    let block_end = geo.block_end(geo.block_of(addr));
    debug_assert!(u64::from(addr.0) + u64::from(HEADER_SIZE) <= block_end);

    let mut header = [0_u8; HEADER_SIZE as usize];
    dev.read(addr, &mut header)?;

    if header.iter().all(|&b| b == 0xFF) {
        return Ok(Decoded::EndOfLog);
    }

    let state = State::from_byte(header[1]);
    let len = le_u32(&header, 4);
    let crc = le_u32(&header, 8);

    let remaining = block_end - u64::from(addr.0) - u64::from(HEADER_SIZE);
    let Some(tag) = Tag::from_byte(header[0]) else {
        // An unknown tag byte cannot be distinguished from a torn header,
        // so the length field is untrustworthy too.
        trace!(target: "tofs::record", addr = addr.0, tag = header[0], "torn_header");
        mark_dead(dev, addr)?;
        return Ok(Decoded::Torn);
    };
    if u64::from(len) > remaining {
        trace!(target: "tofs::record", addr = addr.0, len, remaining, "oversized_length");
        mark_dead(dev, addr)?;
        return Ok(Decoded::Torn);
    }

    let mut payload = vec![0_u8; len as usize];
    dev.read(Addr(addr.0 + HEADER_SIZE), &mut payload)?;
    // One past the record; saturates at the unrepresentable end of a
    // maximal volume, where no further record can start anyway.
    let next = Addr(u32::try_from(u64::from(addr.0) + u64::from(HEADER_SIZE) + u64::from(len)).unwrap_or(u32::MAX));

    // Padding is integrity-checked only loosely; it is never content.
    let effective_state = if tag == Tag::Padding {
        State::Dead
    } else if state != State::Dead && crc32c::crc32c(&payload) != crc {
        // LIVE or TENTATIVE with a bad checksum decodes as DEAD.
        trace!(target: "tofs::record", addr = addr.0, "checksum_mismatch");
        mark_dead(dev, addr)?;
        State::Dead
    } else {
        state
    };

    let Some(body) = parse_body(tag, effective_state, &payload) else {
        trace!(target: "tofs::record", addr = addr.0, tag = ?tag, "unparseable_payload");
        mark_dead(dev, addr)?;
        return Ok(Decoded::Record {
            record: Record {
                addr,
                header: Header {
                    tag,
                    state: State::Dead,
                    len,
                },
                body: Body::Padding,
            },
            next,
        });
    };

    Ok(Decoded::Record {
        record: Record {
            addr,
            header: Header {
                tag,
                state: effective_state,
                len,
            },
            body,
        },
        next,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tofs_device::RamDevice;
    use tofs_types::Priority;

    fn geo() -> Geometry {
        Geometry::new(10, 8).expect("valid geometry")
    }

    fn dev() -> RamDevice {
        RamDevice::new(geo())
    }

    #[test]
    fn append_roundtrip_tentative_then_live() {
        let mut d = dev();
        let payload = append_payload(FileId(7), 64, b"hello");
        write_tentative(&mut d, Addr(0), Tag::Append, &payload).unwrap();

        match decode_at(&mut d, Addr(0)).unwrap() {
            Decoded::Record { record, next } => {
                assert_eq!(record.header.state, State::Tentative);
                assert_eq!(
                    record.body,
                    Body::Append {
                        file: FileId(7),
                        start: 64,
                        data: b"hello".to_vec()
                    }
                );
                assert_eq!(next, Addr(HEADER_SIZE + 13));
            }
            other => panic!("expected record, got {other:?}"),
        }

        mark_live(&mut d, Addr(0)).unwrap();
        match decode_at(&mut d, Addr(0)).unwrap() {
            Decoded::Record { record, .. } => assert_eq!(record.header.state, State::Live),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn markers_are_monotonic_and_idempotent() {
        let mut d = dev();
        let payload = delete_payload(FileId(1));
        write_tentative(&mut d, Addr(0), Tag::Delete, &payload).unwrap();

        mark_live(&mut d, Addr(0)).unwrap();
        mark_live(&mut d, Addr(0)).unwrap();
        mark_dead(&mut d, Addr(0)).unwrap();
        mark_dead(&mut d, Addr(0)).unwrap();
        // A dead record cannot be resurrected.
        mark_live(&mut d, Addr(0)).unwrap();
        match decode_at(&mut d, Addr(0)).unwrap() {
            Decoded::Record { record, .. } => assert_eq!(record.header.state, State::Dead),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn erased_header_is_end_of_log() {
        let mut d = dev();
        assert_eq!(decode_at(&mut d, Addr(512)).unwrap(), Decoded::EndOfLog);
    }

    #[test]
    fn corrupt_payload_decodes_dead() {
        let mut d = dev();
        let payload = append_payload(FileId(3), 0, b"abcdef");
        write_tentative(&mut d, Addr(0), Tag::Append, &payload).unwrap();
        mark_live(&mut d, Addr(0)).unwrap();
        // Clear a payload bit behind the codec's back.
        d.program(Addr(HEADER_SIZE + 8), &[0]).unwrap();

        match decode_at(&mut d, Addr(0)).unwrap() {
            Decoded::Record { record, .. } => assert_eq!(record.header.state, State::Dead),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_torn() {
        let mut d = dev();
        d.program(Addr(0), &[0x5A, 0xFF, 0, 0, 4, 0, 0, 0]).unwrap();
        assert_eq!(decode_at(&mut d, Addr(0)).unwrap(), Decoded::Torn);
    }

    #[test]
    fn oversized_length_is_torn() {
        let mut d = dev();
        let mut hdr = [0xFF_u8; 12];
        hdr[0] = Tag::Append as u8;
        hdr[4..8].copy_from_slice(&5000_u32.to_le_bytes());
        hdr[8..12].copy_from_slice(&0_u32.to_le_bytes());
        d.program(Addr(0), &hdr).unwrap();
        assert_eq!(decode_at(&mut d, Addr(0)).unwrap(), Decoded::Torn);
    }

    #[test]
    fn padding_fills_exact_remainder() {
        let mut d = dev();
        write_padding(&mut d, Addr(1000), 24).unwrap();
        match decode_at(&mut d, Addr(1000)).unwrap() {
            Decoded::Record { record, next } => {
                assert_eq!(record.header.tag, Tag::Padding);
                assert_eq!(record.header.state, State::Dead);
                assert_eq!(next, Addr(1024));
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn superblock_roundtrip() {
        let mut d = dev();
        let info = SuperblockInfo {
            version: FORMAT_VERSION,
            geometry: geo(),
            epoch: 3,
        };
        let payload = superblock_payload(&info);
        write_tentative(&mut d, Addr(0), Tag::Superblock, &payload).unwrap();
        mark_live(&mut d, Addr(0)).unwrap();

        match decode_at(&mut d, Addr(0)).unwrap() {
            Decoded::Record { record, .. } => {
                assert_eq!(record.body, Body::Superblock(info));
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn file_create_roundtrip() {
        let mut d = dev();
        let name: FileName = "queue".parse().unwrap();
        let payload = file_create_payload(FileId(9), FileFlags::new(Priority::High), &name);
        write_tentative(&mut d, Addr(0), Tag::FileCreate, &payload).unwrap();

        match decode_at(&mut d, Addr(0)).unwrap() {
            Decoded::Record { record, .. } => match record.body {
                Body::FileCreate { file, flags, name } => {
                    assert_eq!(file, FileId(9));
                    assert_eq!(flags.priority(), Priority::High);
                    assert_eq!(name.as_bytes(), b"queue");
                }
                other => panic!("expected FileCreate, got {other:?}"),
            },
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn max_payload_honors_header() {
        assert_eq!(max_payload(geo()), 1024 - HEADER_SIZE);
        assert_eq!(max_append_data(geo()), 1024 - HEADER_SIZE - 8);
    }
}
