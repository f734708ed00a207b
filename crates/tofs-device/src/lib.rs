#![forbid(unsafe_code)]
//! Block-device adapter contract and reference adapters.
//!
//! The core talks to media through [`BlockDevice`]: byte-granular reads and
//! bit-clearing programs within a block, whole-block erases, and a durable
//! flush barrier. Adapters must commit writes in submission order and never
//! tear a single byte (a byte is either the old or the new value after a
//! crash).
//!
//! Three reference adapters live here: [`RamDevice`] (the strictest — it
//! enforces the bit-clearing program contract so protocol bugs surface in
//! tests), [`FileDevice`] (a host file image), and [`FaultDevice`] (power
//! loss and write-failure simulation for recovery tests).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tofs_error::{Result, TofsError};
use tofs_types::{Addr, BlockIndex, Geometry};
use tracing::trace;

/// Erased byte value. After `erase` every byte of the block reads back as
/// this; programs may only clear bits from it.
pub const ERASED: u8 = 0xFF;

/// Raw medium access in erase-block units.
///
/// Contract:
/// - `read`/`program` never cross a block boundary.
/// - `program` only clears bits (1→0). Programming a byte that would
///   require a 0→1 transition is a protocol violation.
/// - Writes become persistent in submission order; `flush` returns only
///   once all prior writes are durable.
pub trait BlockDevice {
    fn geometry(&self) -> Geometry;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: Addr, buf: &mut [u8]) -> Result<()>;

    /// Program `data` starting at `addr`, clearing bits only.
    fn program(&mut self, addr: Addr, data: &[u8]) -> Result<()>;

    /// Erase `block`, setting every byte to [`ERASED`].
    fn erase(&mut self, block: BlockIndex) -> Result<()>;

    /// Durable barrier.
    fn flush(&mut self) -> Result<()>;
}

fn check_range(geo: Geometry, addr: Addr, len: usize) -> Result<()> {
    let len32 = u32::try_from(len)
        .map_err(|_| TofsError::Io(io::Error::new(io::ErrorKind::InvalidInput, "length overflow")))?;
    if u64::from(addr.0) + u64::from(len32) > geo.total_bytes() {
        return Err(TofsError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("access at {:#010x}+{len} beyond volume end", addr.0),
        )));
    }
    if !geo.fits_in_block(addr, len32) {
        return Err(TofsError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("access at {:#010x}+{len} crosses a block boundary", addr.0),
        )));
    }
    Ok(())
}

// ── RAM adapter ─────────────────────────────────────────────────────────────

/// Volatile in-memory medium.
///
/// Enforces flash semantics strictly: reads of never-erased space return
/// [`ERASED`], and `program` rejects any 0→1 bit transition.
#[derive(Debug, Clone)]
pub struct RamDevice {
    geo: Geometry,
    bytes: Vec<u8>,
}

impl RamDevice {
    #[must_use]
    pub fn new(geo: Geometry) -> Self {
        let total = usize::try_from(geo.total_bytes()).unwrap_or(usize::MAX);
        Self {
            geo,
            bytes: vec![ERASED; total],
        }
    }

    /// Direct image access for test assertions.
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.bytes
    }
}

impl BlockDevice for RamDevice {
    fn geometry(&self) -> Geometry {
        self.geo
    }

    fn read(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        check_range(self.geo, addr, buf.len())?;
        let start = addr.0 as usize;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn program(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        check_range(self.geo, addr, data.len())?;
        let start = addr.0 as usize;
        for (i, &new) in data.iter().enumerate() {
            let old = self.bytes[start + i];
            if new & !old != 0 {
                return Err(TofsError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "program at {:#010x} sets bits: {old:#04x} -> {new:#04x}",
                        addr.0 + u32::try_from(i).unwrap_or(u32::MAX),
                    ),
                )));
            }
            self.bytes[start + i] = old & new;
        }
        trace!(target: "tofs::device", addr = addr.0, len = data.len(), "ram_program");
        Ok(())
    }

    fn erase(&mut self, block: BlockIndex) -> Result<()> {
        if block.0 >= self.geo.block_count() {
            return Err(TofsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("erase of block {} out of range", block.0),
            )));
        }
        let start = self.geo.block_start(block).0 as usize;
        let end = start + self.geo.block_size() as usize;
        self.bytes[start..end].fill(ERASED);
        trace!(target: "tofs::device", block = block.0, "ram_erase");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── File adapter ────────────────────────────────────────────────────────────

/// Host-file medium for CLI and integration use.
///
/// The image is a plain file of `geometry.total_bytes()` bytes; erased
/// space is stored as 0xFF. Bit-clear discipline is the caller's protocol
/// and is not re-checked here.
#[derive(Debug)]
pub struct FileDevice {
    geo: Geometry,
    file: File,
}

impl FileDevice {
    /// Open (or create) an image file sized to `geo`.
    pub fn open(path: &Path, geo: Geometry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(geo.total_bytes())?;
        Ok(Self { geo, file })
    }
}

impl BlockDevice for FileDevice {
    fn geometry(&self) -> Geometry {
        self.geo
    }

    fn read(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        check_range(self.geo, addr, buf.len())?;
        self.file.read_exact_at(buf, u64::from(addr.0))?;
        Ok(())
    }

    fn program(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        check_range(self.geo, addr, data.len())?;
        self.file.write_all_at(data, u64::from(addr.0))?;
        Ok(())
    }

    fn erase(&mut self, block: BlockIndex) -> Result<()> {
        if block.0 >= self.geo.block_count() {
            return Err(TofsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("erase of block {} out of range", block.0),
            )));
        }
        let blank = vec![ERASED; self.geo.block_size() as usize];
        self.file
            .write_all_at(&blank, u64::from(self.geo.block_start(block).0))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

// ── Fault-injecting adapter ─────────────────────────────────────────────────

/// Power-loss and write-failure simulation over a [`RamDevice`].
///
/// Writes land in a volatile image and are journaled until `flush`
/// promotes them to the durable image. [`FaultDevice::crash`] discards
/// everything since the last flush; [`FaultDevice::crash_after`] persists
/// only an in-order prefix of the unflushed operations, modeling an
/// order-preserving adapter that lost power mid-batch.
#[derive(Debug, Clone)]
pub struct FaultDevice {
    volatile: RamDevice,
    durable: RamDevice,
    pending: Vec<PendingOp>,
    /// Fail the N-th program from now with `IoError` (0 = next).
    fail_program_in: Option<u32>,
    programs: u64,
    erases: u64,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Program { addr: Addr, data: Vec<u8> },
    Erase(BlockIndex),
}

impl FaultDevice {
    #[must_use]
    pub fn new(geo: Geometry) -> Self {
        let ram = RamDevice::new(geo);
        Self {
            volatile: ram.clone(),
            durable: ram,
            pending: Vec::new(),
            fail_program_in: None,
            programs: 0,
            erases: 0,
        }
    }

    /// Drop all writes since the last `flush`.
    pub fn crash(&mut self) {
        trace!(target: "tofs::device", dropped = self.pending.len(), "fault_crash");
        self.volatile = self.durable.clone();
        self.pending.clear();
    }

    /// Persist only the first `n` unflushed operations, then crash.
    pub fn crash_after(&mut self, n: usize) {
        let ops: Vec<PendingOp> = self.pending.drain(..).take(n).collect();
        self.volatile = self.durable.clone();
        for op in ops {
            match op {
                PendingOp::Program { addr, data } => {
                    let _ = self.volatile.program(addr, &data);
                }
                PendingOp::Erase(block) => {
                    let _ = self.volatile.erase(block);
                }
            }
        }
        self.durable = self.volatile.clone();
        self.pending.clear();
    }

    /// Number of operations since the last flush (for `crash_after`).
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Arrange for the `n`-th upcoming program call to fail.
    pub fn fail_program_in(&mut self, n: u32) {
        self.fail_program_in = Some(n);
    }

    #[must_use]
    pub fn program_count(&self) -> u64 {
        self.programs
    }

    #[must_use]
    pub fn erase_count(&self) -> u64 {
        self.erases
    }
}

impl BlockDevice for FaultDevice {
    fn geometry(&self) -> Geometry {
        self.volatile.geometry()
    }

    fn read(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        self.volatile.read(addr, buf)
    }

    fn program(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        if let Some(n) = self.fail_program_in {
            if n == 0 {
                self.fail_program_in = None;
                return Err(TofsError::Io(io::Error::other("injected program failure")));
            }
            self.fail_program_in = Some(n - 1);
        }
        self.programs += 1;
        self.volatile.program(addr, data)?;
        self.pending.push(PendingOp::Program {
            addr,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn erase(&mut self, block: BlockIndex) -> Result<()> {
        self.erases += 1;
        self.volatile.erase(block)?;
        self.pending.push(PendingOp::Erase(block));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.durable = self.volatile.clone();
        self.pending.clear();
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry::new(10, 8).expect("valid geometry")
    }

    #[test]
    fn ram_starts_erased() {
        let dev = RamDevice::new(geo());
        let mut buf = [0_u8; 16];
        dev.read(Addr(100), &mut buf).unwrap();
        assert_eq!(buf, [ERASED; 16]);
    }

    #[test]
    fn ram_program_clears_bits_only() {
        let mut dev = RamDevice::new(geo());
        dev.program(Addr(0), &[0xF0]).unwrap();
        // Clearing more bits is fine.
        dev.program(Addr(0), &[0x70]).unwrap();
        // Setting a cleared bit is a protocol violation.
        let err = dev.program(Addr(0), &[0x80]).unwrap_err();
        assert!(matches!(err, TofsError::Io(_)));
        // Overlaying 0x00 always works.
        dev.program(Addr(0), &[0x00]).unwrap();
    }

    #[test]
    fn ram_rejects_block_crossing() {
        let mut dev = RamDevice::new(geo());
        let err = dev.program(Addr(1020), &[0; 8]).unwrap_err();
        assert!(matches!(err, TofsError::Io(_)));
    }

    #[test]
    fn ram_erase_restores_erased_state() {
        let mut dev = RamDevice::new(geo());
        dev.program(Addr(2048), &[0x00; 32]).unwrap();
        dev.erase(BlockIndex(2)).unwrap();
        let mut buf = [0_u8; 32];
        dev.read(Addr(2048), &mut buf).unwrap();
        assert_eq!(buf, [ERASED; 32]);
    }

    #[test]
    fn file_device_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let mut dev = FileDevice::open(&path, geo()).unwrap();
        dev.erase(BlockIndex(0)).unwrap();
        dev.program(Addr(10), &[1, 2, 3]).unwrap();
        dev.flush().unwrap();

        let dev2 = FileDevice::open(&path, geo()).unwrap();
        let mut buf = [0_u8; 3];
        dev2.read(Addr(10), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn fault_device_crash_drops_unflushed() {
        let mut dev = FaultDevice::new(geo());
        dev.program(Addr(0), &[0x11]).unwrap();
        dev.flush().unwrap();
        dev.program(Addr(1), &[0x22]).unwrap();
        dev.crash();

        let mut buf = [0_u8; 2];
        dev.read(Addr(0), &mut buf).unwrap();
        assert_eq!(buf, [0x11, ERASED]);
    }

    #[test]
    fn fault_device_injected_failure() {
        let mut dev = FaultDevice::new(geo());
        dev.fail_program_in(1);
        dev.program(Addr(0), &[0x00]).unwrap();
        assert!(dev.program(Addr(1), &[0x00]).is_err());
        // Subsequent programs succeed again.
        dev.program(Addr(2), &[0x00]).unwrap();
    }
}
