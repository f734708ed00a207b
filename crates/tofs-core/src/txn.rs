//! Transaction engine.
//!
//! Records written inside a transaction stay TENTATIVE until commit. The
//! durability point is the flushed LIVE `TxnCommit` record: staged members
//! flip LIVE after it, and the mount-time scanner completes an interrupted
//! flip (or kills the whole set when no commit record survives). Nested
//! `begin` calls flatten onto one volume-wide transaction; a mutating
//! operation outside any transaction runs as an implicit single-operation
//! transaction without bracket records.

use crate::dir::FileEntry;
use crate::volume::Volume;
use tofs_device::BlockDevice;
use tofs_error::{Result, TofsError};
use tofs_record::{mark_dead, mark_live, txn_payload, write_tentative, Tag, HEADER_SIZE};
use tofs_types::{Addr, FileId, Priority, TxnId};
use tracing::{debug, trace, warn};

/// RAM-state reversal for one staged record, applied on abort in reverse
/// submission order.
#[derive(Debug)]
pub(crate) enum Undo {
    Create {
        file: FileId,
    },
    Append {
        file: FileId,
        len: u32,
    },
    Truncate {
        file: FileId,
        old_head: u32,
    },
    Delete {
        entry: Box<FileEntry>,
    },
    SetFlags {
        file: FileId,
        old_flags: tofs_types::FileFlags,
    },
}

/// Deferred medium-side effect for one staged record, applied on commit in
/// submission order (immediately, for implicit transactions).
#[derive(Debug)]
pub(crate) enum Effect {
    Create,
    /// Migrate the record's bytes from pinned to content accounting.
    Append,
    /// Retire extents below the (already advanced) head and supersede the
    /// file's previous `Truncate` record with this one.
    Truncate {
        file: FileId,
    },
    /// Kill the file's surviving records, then the delete record itself.
    Delete {
        create: (Addr, u32),
        extents: Vec<(Addr, u32)>,
        truncate: Option<(Addr, u32)>,
        set_flags: Option<(Addr, u32)>,
    },
    /// Supersede the previous `SetFlags` record and advance the sequence.
    SetFlags {
        file: FileId,
        seq: u32,
    },
}

#[derive(Debug)]
pub(crate) struct Member {
    pub addr: Addr,
    pub size: u32,
    pub undo: Undo,
    pub effect: Effect,
}

#[derive(Debug, Default)]
pub(crate) struct TxnEngine {
    pub depth: u32,
    pub aborted: bool,
    pub next_id: u32,
    pub current: Option<TxnId>,
    pub begin_addr: Option<Addr>,
    pub commit_addr: Option<Addr>,
    pub members: Vec<Member>,
}

impl TxnEngine {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    pub fn open(&self) -> bool {
        self.depth > 0
    }
}

/// On-medium size of a bracket record (`TxnBegin`/`TxnCommit`/`TxnAbort`).
const BRACKET_SIZE: u32 = HEADER_SIZE + 4;

impl<D: BlockDevice> Volume<D> {
    /// Open a transaction, or deepen the current one (flattened nesting).
    pub fn transaction(&mut self) -> Result<()> {
        if self.txn.aborted {
            return Err(TofsError::TxnAborted);
        }
        if self.txn.depth == 0 {
            let id = TxnId(self.txn.next_id);
            self.txn.next_id += 1;
            self.txn.current = Some(id);
            trace!(target: "tofs::txn", txn = id.0, "begin");
        }
        self.txn.depth += 1;
        Ok(())
    }

    /// Commit the current transaction. Inner commits of a flattened
    /// transaction only decrement the depth; the outermost commit is the
    /// real one.
    pub fn commit(&mut self) -> Result<()> {
        if self.txn.aborted {
            return Err(TofsError::TxnAborted);
        }
        if self.txn.depth == 0 {
            return Ok(());
        }
        self.txn.depth -= 1;
        if self.txn.depth > 0 {
            return Ok(());
        }

        let members = std::mem::take(&mut self.txn.members);
        if members.is_empty() {
            // A failed operation may have unwound all its members while
            // leaving the bracket record behind.
            self.retire_brackets()?;
            self.dev.flush()?;
            self.txn.current = None;
            return Ok(());
        }

        let id = self.txn.current.unwrap_or(TxnId(0));
        match self.commit_durable(id, &members) {
            Ok(()) => {}
            Err(err) => {
                // The transaction can no longer complete; hold its members
                // until the caller issues an explicit abort.
                self.txn.members = members;
                self.txn.depth = 1;
                self.txn.aborted = true;
                warn!(target: "tofs::txn", txn = id.0, %err, "commit failed");
                return Err(err);
            }
        }

        // Past the durability point: the transaction is committed even if
        // the adapter now fails; the scanner finishes the bookkeeping on
        // the next mount.
        let settle = (|| -> Result<()> {
            for member in &members {
                mark_live(&mut self.dev, member.addr)?;
            }
            Ok(())
        })();
        if let Err(err) = settle {
            self.txn.begin_addr = None;
            self.txn.commit_addr = None;
            self.txn.current = None;
            warn!(target: "tofs::txn", txn = id.0, %err, "commit settled by next mount");
            return Err(err);
        }
        for member in members {
            self.apply_effect(member)?;
        }
        self.retire_brackets()?;
        self.dev.flush()?;
        self.txn.current = None;
        debug!(target: "tofs::txn", txn = id.0, "committed");
        Ok(())
    }

    /// Write and flush the LIVE `TxnCommit` record — the durability point.
    fn commit_durable(&mut self, id: TxnId, members: &[Member]) -> Result<()> {
        let prio = members
            .iter()
            .filter_map(|m| match &m.undo {
                Undo::Append { file, .. }
                | Undo::Create { file }
                | Undo::Truncate { file, .. }
                | Undo::SetFlags { file, .. } => {
                    let idx = self.dir.find_by_id(*file)?;
                    Some(self.dir.files[idx].flags.priority())
                }
                Undo::Delete { entry } => Some(entry.flags.priority()),
            })
            .max()
            .unwrap_or(Priority::Normal);

        let addr = self.place_record(BRACKET_SIZE, prio)?;
        write_tentative(&mut self.dev, addr, Tag::TxnCommit, &txn_payload(id))?;
        self.pin(addr, BRACKET_SIZE);
        self.txn.commit_addr = Some(addr);
        mark_live(&mut self.dev, addr)?;
        self.dev.flush()
    }

    /// Abort the current transaction: revert RAM state and kill every
    /// staged record. Always collapses the whole flattened transaction.
    pub fn abort(&mut self) -> Result<()> {
        if self.txn.depth == 0 && !self.txn.aborted {
            return Ok(());
        }
        let id = self.txn.current.unwrap_or(TxnId(0));
        let members = std::mem::take(&mut self.txn.members);
        for member in members.into_iter().rev() {
            let _ = mark_dead(&mut self.dev, member.addr);
            self.unpin(member.addr, member.size);
            self.apply_undo(member.undo);
        }

        // Best-effort abort marker; recovery handles its absence.
        if self.txn.begin_addr.is_some() {
            if let Ok(addr) = self.place_record(BRACKET_SIZE, Priority::Normal) {
                let _ = write_tentative(&mut self.dev, addr, Tag::TxnAbort, &txn_payload(id))
                    .and_then(|()| mark_live(&mut self.dev, addr))
                    .and_then(|()| mark_dead(&mut self.dev, addr));
            }
        }
        self.retire_brackets()?;
        self.dev.flush()?;
        self.txn.depth = 0;
        self.txn.aborted = false;
        self.txn.current = None;
        debug!(target: "tofs::txn", txn = id.0, "aborted");
        Ok(())
    }

    /// Mark the bracket records DEAD once the transaction is resolved.
    fn retire_brackets(&mut self) -> Result<()> {
        if let Some(addr) = self.txn.begin_addr.take() {
            mark_dead(&mut self.dev, addr)?;
            self.unpin(addr, BRACKET_SIZE);
        }
        if let Some(addr) = self.txn.commit_addr.take() {
            mark_dead(&mut self.dev, addr)?;
            self.unpin(addr, BRACKET_SIZE);
        }
        Ok(())
    }

    // ── Operation staging ───────────────────────────────────────────────

    /// Begin a mutating operation. Returns the member watermark used by
    /// [`Self::op_fail`] to unwind just this operation.
    pub(crate) fn op_begin(&mut self) -> Result<usize> {
        if self.txn.aborted {
            return Err(TofsError::TxnAborted);
        }
        Ok(self.txn.members.len())
    }

    /// Stage one record: place it, write it TENTATIVE, and account it as
    /// pinned. Writes the `TxnBegin` bracket first when an explicit
    /// transaction stages its first record.
    pub(crate) fn emit(&mut self, tag: Tag, payload: &[u8], prio: Priority) -> Result<Addr> {
        let size = HEADER_SIZE + u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if self.txn.open() {
            if self.txn.members.len() >= self.limits.max_txn_records {
                return Err(TofsError::Exhausted("records per transaction"));
            }
            if self.txn.begin_addr.is_none() {
                let id = self.txn.current.unwrap_or(TxnId(0));
                let addr = self.place_record(BRACKET_SIZE, prio)?;
                write_tentative(&mut self.dev, addr, Tag::TxnBegin, &txn_payload(id))?;
                self.pin(addr, BRACKET_SIZE);
                self.txn.begin_addr = Some(addr);
            }
        }
        let addr = self.place_record(size, prio)?;
        write_tentative(&mut self.dev, addr, tag, payload)?;
        self.pin(addr, size);
        Ok(addr)
    }

    pub(crate) fn push_member(&mut self, addr: Addr, size: u32, undo: Undo, effect: Effect) {
        self.txn.members.push(Member {
            addr,
            size,
            undo,
            effect,
        });
    }

    /// Finish a mutating operation. Inside an explicit transaction the
    /// staged members simply remain; outside, they commit immediately
    /// (TENTATIVE → LIVE → effects → flush) without bracket records.
    pub(crate) fn op_end(&mut self) -> Result<()> {
        if self.txn.open() {
            return Ok(());
        }
        let members = std::mem::take(&mut self.txn.members);
        for member in &members {
            mark_live(&mut self.dev, member.addr)?;
        }
        for member in members {
            self.apply_effect(member)?;
        }
        self.dev.flush()
    }

    /// Unwind the members staged since `watermark` after a failed
    /// operation, latching the ABORTED state when an adapter error hit an
    /// open transaction.
    pub(crate) fn op_fail(&mut self, watermark: usize, err: &TofsError) {
        let tail: Vec<Member> = self.txn.members.drain(watermark..).collect();
        for member in tail.into_iter().rev() {
            let _ = mark_dead(&mut self.dev, member.addr);
            self.unpin(member.addr, member.size);
            self.apply_undo(member.undo);
        }
        if self.txn.open() && matches!(err, TofsError::Io(_)) {
            self.txn.aborted = true;
            warn!(target: "tofs::txn", "transaction aborted by I/O error");
        }
    }

    // ── Effects and undo ────────────────────────────────────────────────

    fn apply_effect(&mut self, member: Member) -> Result<()> {
        match member.effect {
            Effect::Create => {}
            Effect::Append => {
                let block = self.geo.block_of(member.addr);
                let meta = self.blocks.meta_mut(block);
                meta.pinned = meta.pinned.saturating_sub(member.size);
                meta.content += member.size;
            }
            Effect::Truncate { file } => {
                if let Some(idx) = self.dir.find_by_id(file) {
                    self.supersede_truncate(idx, (member.addr, member.size));
                    self.retire_extents_below_head(idx)?;
                } else {
                    // File deleted later in the same transaction; the
                    // record dies with it.
                    mark_dead(&mut self.dev, member.addr)?;
                    self.unpin(member.addr, member.size);
                }
            }
            Effect::SetFlags { file, seq } => {
                if let Some(idx) = self.dir.find_by_id(file) {
                    self.supersede_set_flags(idx, (member.addr, member.size));
                    self.dir.files[idx].flags_seq = seq + 1;
                } else {
                    mark_dead(&mut self.dev, member.addr)?;
                    self.unpin(member.addr, member.size);
                }
            }
            Effect::Delete {
                create,
                extents,
                truncate,
                set_flags,
            } => {
                self.retire_dead(create.0, create.1, false)?;
                for (addr, size) in extents {
                    self.retire_dead(addr, size, true)?;
                }
                if let Some((addr, size)) = truncate {
                    self.retire_dead(addr, size, false)?;
                }
                if let Some((addr, size)) = set_flags {
                    self.retire_dead(addr, size, false)?;
                }
                // Finally retire the delete record itself.
                self.retire_dead(member.addr, member.size, false)?;
            }
        }
        Ok(())
    }

    /// Mark a record DEAD and drop its bytes from the owning block's
    /// accounting.
    fn retire_dead(&mut self, addr: Addr, size: u32, content: bool) -> Result<()> {
        mark_dead(&mut self.dev, addr)?;
        let block = self.geo.block_of(addr);
        let meta = self.blocks.meta_mut(block);
        if content {
            meta.content = meta.content.saturating_sub(size);
        } else {
            meta.pinned = meta.pinned.saturating_sub(size);
        }
        Ok(())
    }

    fn apply_undo(&mut self, undo: Undo) {
        match undo {
            Undo::Create { file } => {
                self.dir.remove_by_id(file);
                // Ids stay monotonic; the burned id is not reused.
            }
            Undo::Append { file, len } => {
                if let Some(idx) = self.dir.find_by_id(file) {
                    let entry = &mut self.dir.files[idx];
                    if let Some(last) = entry.chain.pop() {
                        debug_assert_eq!(last.len, len);
                        entry.tail -= len;
                    }
                }
            }
            Undo::Truncate { file, old_head } => {
                if let Some(idx) = self.dir.find_by_id(file) {
                    self.dir.files[idx].head = old_head;
                }
            }
            Undo::Delete { entry } => {
                self.dir.insert(*entry);
            }
            Undo::SetFlags { file, old_flags } => {
                if let Some(idx) = self.dir.find_by_id(file) {
                    self.dir.files[idx].flags = old_flags;
                }
            }
        }
    }
}
