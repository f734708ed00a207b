//! The mounted volume: public operation surface.
//!
//! A [`Volume`] owns its block device and all derived in-RAM state. The
//! caller serializes access; there are no internal locks and no internal
//! threads. Every mutating operation outside an explicit transaction runs
//! as an implicit single-operation transaction and is durable when it
//! returns.

use crate::alloc::Blocks;
use crate::dir::{Directory, Extent, FileEntry, FileInfo};
use crate::handle::{HandleKind, HandleTable, OpenHandle};
use crate::txn::{Effect, TxnEngine, Undo};
use tofs_device::BlockDevice;
use tofs_error::{Result, TofsError};
use tofs_record::{
    append_payload, delete_payload, file_create_payload, max_append_data, set_flags_payload, Tag,
    HEADER_SIZE,
};
use tofs_types::{FileFlags, FileName, Geometry, Handle, Limits, Priority};
use tracing::debug;

/// Mount-time options.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Format the medium when no valid superblock is found.
    pub auto_format: bool,
    /// Static sizing of in-RAM structures.
    pub limits: Limits,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            auto_format: true,
            limits: Limits::default(),
        }
    }
}

/// Open mode for [`Volume::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Write cursor at the file's tail.
    Append,
    /// Sequential reader from the head.
    Read,
    /// Sequential reader with bookmark (head-advance) capability.
    Queue,
}

/// Open options: mode, priority selection, and create behavior.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    mode: OpenMode,
    priority: Option<Priority>,
    dont_create: bool,
    resume_at: Option<u32>,
}

impl OpenOptions {
    #[must_use]
    pub fn append() -> Self {
        Self {
            mode: OpenMode::Append,
            priority: None,
            dont_create: false,
            resume_at: None,
        }
    }

    #[must_use]
    pub fn read() -> Self {
        Self {
            mode: OpenMode::Read,
            ..Self::append()
        }
    }

    #[must_use]
    pub fn queue() -> Self {
        Self {
            mode: OpenMode::Queue,
            ..Self::append()
        }
    }

    /// Set or update the file's priority (recorded on the medium when it
    /// changes an existing file). Without this, existing flags are kept.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Fail with `NotFound` instead of creating a missing file.
    #[must_use]
    pub fn dont_create(mut self) -> Self {
        self.dont_create = true;
        self
    }

    /// Start the read cursor at a caller-supplied logical offset instead
    /// of the file's head (read and queue modes only).
    #[must_use]
    pub fn resume_at(mut self, offset: u32) -> Self {
        self.resume_at = Some(offset);
        self
    }
}

/// Aggregate space accounting, mainly for hosts and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    /// Sealed blocks with no live bytes, reusable after an erase.
    pub reclaimable_blocks: u32,
    pub live_bytes: u64,
}

/// A mounted tofs volume over a block device.
#[derive(Debug)]
pub struct Volume<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) geo: Geometry,
    pub(crate) limits: Limits,
    pub(crate) epoch: u32,
    pub(crate) dir: Directory,
    pub(crate) blocks: Blocks,
    pub(crate) txn: TxnEngine,
    pub(crate) handles: HandleTable,
}

impl<D: BlockDevice> Volume<D> {
    /// Flush and release the device.
    pub fn unmount(mut self) -> Result<D> {
        self.dev.flush()?;
        Ok(self.dev)
    }

    /// Release the device without flushing. Pending writes may be lost —
    /// this models power loss and is what crash-recovery tests build on.
    #[must_use]
    pub fn into_device(self) -> D {
        self.dev
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    /// Format epoch from the superblock.
    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    // ── Directory operations ────────────────────────────────────────────

    /// Open `name`, creating it unless `dont_create` is set.
    pub fn open(&mut self, name: &FileName, opts: &OpenOptions) -> Result<Handle> {
        if opts.resume_at.is_some() && opts.mode == OpenMode::Append {
            return Err(TofsError::InvalidFlags("resume_at requires a read mode"));
        }

        let idx = match self.dir.find_by_name(name) {
            Some(idx) => {
                if let Some(p) = opts.priority {
                    if p != self.dir.files[idx].flags.priority() {
                        self.set_priority(idx, p)?;
                    }
                }
                idx
            }
            None => {
                if opts.dont_create {
                    return Err(TofsError::NotFound);
                }
                self.create_file(name, opts.priority.unwrap_or_default())?
            }
        };

        let entry = &mut self.dir.files[idx];
        let state = match opts.mode {
            OpenMode::Append => {
                if entry.append_open {
                    return Err(TofsError::Busy);
                }
                entry.append_open = true;
                OpenHandle {
                    file: entry.id,
                    kind: HandleKind::Append,
                    cursor: entry.tail,
                }
            }
            OpenMode::Read | OpenMode::Queue => OpenHandle {
                file: entry.id,
                kind: if opts.mode == OpenMode::Read {
                    HandleKind::Read
                } else {
                    HandleKind::Queue
                },
                cursor: opts
                    .resume_at
                    .map_or(entry.head, |at| at.clamp(entry.head, entry.tail)),
            },
        };

        let file = state.file;
        let kind = state.kind;
        match self.handles.claim(state, self.limits.max_handles) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if kind == HandleKind::Append {
                    if let Some(i) = self.dir.find_by_id(file) {
                        self.dir.files[i].append_open = false;
                    }
                }
                Err(err)
            }
        }
    }

    fn create_file(&mut self, name: &FileName, priority: Priority) -> Result<usize> {
        if self.dir.files.len() >= self.limits.max_files {
            return Err(TofsError::Exhausted("directory entries"));
        }
        let id = self.dir.alloc_id();
        let flags = FileFlags::new(priority);

        let watermark = self.op_begin()?;
        let result = (|| -> Result<()> {
            let payload = file_create_payload(id, flags, name);
            let size = HEADER_SIZE + u32::try_from(payload.len()).unwrap_or(u32::MAX);
            let addr = self.emit(Tag::FileCreate, &payload, priority)?;
            self.dir.insert(FileEntry {
                id,
                name: *name,
                flags,
                head: 0,
                tail: 0,
                chain: Vec::new(),
                create_addr: addr,
                create_size: size,
                last_truncate: None,
                last_set_flags: None,
                flags_seq: 1,
                append_open: false,
            });
            self.push_member(addr, size, Undo::Create { file: id }, Effect::Create);
            self.op_end()
        })();
        if let Err(err) = result {
            self.op_fail(watermark, &err);
            return Err(err);
        }
        debug!(target: "tofs::volume", file = id.0, name = %name, "file_created");
        self.dir.find_by_id(id).ok_or(TofsError::NotFound)
    }

    fn set_priority(&mut self, idx: usize, priority: Priority) -> Result<()> {
        let entry = &self.dir.files[idx];
        let (file, old_flags) = (entry.id, entry.flags);
        let new_flags = old_flags.with_priority(priority);
        let seq = entry.flags_seq;
        // Place with the stronger of the two priorities so a promotion is
        // not starved by content it is about to outrank.
        let place_prio = priority.max(old_flags.priority());

        let watermark = self.op_begin()?;
        let result = (|| -> Result<()> {
            let payload = set_flags_payload(file, new_flags, seq);
            let size = HEADER_SIZE + u32::try_from(payload.len()).unwrap_or(u32::MAX);
            let addr = self.emit(Tag::SetFlags, &payload, place_prio)?;
            let entry = &mut self.dir.files[idx];
            entry.flags = new_flags;
            entry.flags_seq = seq + 1;
            self.push_member(
                addr,
                size,
                Undo::SetFlags { file, old_flags },
                Effect::SetFlags { file, seq },
            );
            self.op_end()
        })();
        if let Err(err) = result {
            self.op_fail(watermark, &err);
            return Err(err);
        }
        Ok(())
    }

    /// Delete `name`. Fails with `Busy` while an append handle is open.
    pub fn delete(&mut self, name: &FileName) -> Result<()> {
        let idx = self.dir.find_by_name(name).ok_or(TofsError::NotFound)?;
        if self.dir.files[idx].append_open {
            return Err(TofsError::Busy);
        }
        let (file, prio) = (self.dir.files[idx].id, self.dir.files[idx].flags.priority());

        let watermark = self.op_begin()?;
        let result = (|| -> Result<()> {
            let payload = delete_payload(file);
            let size = HEADER_SIZE + u32::try_from(payload.len()).unwrap_or(u32::MAX);
            let addr = self.emit(Tag::Delete, &payload, prio)?;
            // Snapshot after placement: eviction during placement may have
            // retired parts of the chain already.
            let entry = self.dir.remove_by_id(file).ok_or(TofsError::NotFound)?;
            let effect = Effect::Delete {
                create: (entry.create_addr, entry.create_size),
                extents: entry
                    .chain
                    .iter()
                    .map(|e: &Extent| (e.addr, e.record_size()))
                    .collect(),
                truncate: entry.last_truncate,
                set_flags: entry.last_set_flags,
            };
            self.push_member(
                addr,
                size,
                Undo::Delete {
                    entry: Box::new(entry),
                },
                effect,
            );
            self.op_end()
        })();
        if let Err(err) = result {
            self.op_fail(watermark, &err);
            return Err(err);
        }
        debug!(target: "tofs::volume", file = file.0, name = %name, "file_deleted");
        Ok(())
    }

    /// Per-file metadata without opening a handle.
    pub fn stat(&self, name: &FileName) -> Result<FileInfo> {
        let idx = self.dir.find_by_name(name).ok_or(TofsError::NotFound)?;
        Ok(FileInfo::of(&self.dir.files[idx]))
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.dir.files.len()
    }

    /// Fill `out` with directory entries; returns how many were written.
    /// Order is ascending file id, stable within a mount.
    pub fn list_into(&self, out: &mut [FileInfo]) -> usize {
        let n = self.dir.files.len().min(out.len());
        for (slot, entry) in out.iter_mut().zip(&self.dir.files) {
            *slot = FileInfo::of(entry);
        }
        n
    }

    /// Callback-style enumeration in the same order as [`Self::list_into`].
    pub fn for_each_file(&self, mut f: impl FnMut(&FileInfo)) {
        for entry in &self.dir.files {
            f(&FileInfo::of(entry));
        }
    }

    // ── Data path ───────────────────────────────────────────────────────

    /// Append `data` as one record (partitioned transparently when larger
    /// than a block's payload capacity). Atomic within the enclosing
    /// transaction.
    pub fn write(&mut self, handle: Handle, data: &[u8]) -> Result<()> {
        let state = self.handles.get(handle)?;
        if state.kind != HandleKind::Append {
            return Err(TofsError::InvalidFlags("write requires an append handle"));
        }
        let idx = self.dir.find_by_id(state.file).ok_or(TofsError::NotFound)?;
        if data.is_empty() {
            return Ok(());
        }
        let (file, prio) = (state.file, self.dir.files[idx].flags.priority());

        let watermark = self.op_begin()?;
        let result = (|| -> Result<()> {
            for chunk in data.chunks(max_append_data(self.geo) as usize) {
                let start = self.dir.files[idx].tail;
                let payload = append_payload(file, start, chunk);
                let size = HEADER_SIZE + u32::try_from(payload.len()).unwrap_or(u32::MAX);
                let addr = self.emit(Tag::Append, &payload, prio)?;
                let len = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
                let entry = &mut self.dir.files[idx];
                entry.chain.push(Extent { addr, start, len });
                entry.tail += len;
                self.push_member(addr, size, Undo::Append { file, len }, Effect::Append);
            }
            self.op_end()
        })();
        if let Err(err) = result {
            self.op_fail(watermark, &err);
            return Err(err);
        }
        Ok(())
    }

    // ── Accounting ──────────────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        let mut stats = VolumeStats {
            total_blocks: self.geo.block_count(),
            free_blocks: 0,
            reclaimable_blocks: 0,
            live_bytes: 0,
        };
        for meta in &self.blocks.meta {
            if meta.state == crate::alloc::BlockState::Free {
                stats.free_blocks += 1;
            } else if meta.reclaimable() {
                stats.reclaimable_blocks += 1;
            }
            stats.live_bytes += u64::from(meta.content) + u64::from(meta.pinned);
        }
        stats
    }
}
