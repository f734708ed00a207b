//! Mount-time volume scan: replay the log, finish interrupted
//! transactions, and rebuild the in-RAM indices.
//!
//! The scanner walks every block in address order, record by record, until
//! an erased slot or a torn header. Recovery is a series of passes over
//! the collected records:
//!
//! 1. Transaction resolution — TENTATIVE records flip LIVE when a LIVE
//!    `TxnCommit` for the open bracket survives, DEAD otherwise; bracket
//!    records are then retired.
//! 2. Delete resolution — a LIVE `Delete` kills every record of its file.
//! 3. Directory build — files from LIVE `FileCreate`, newest flags by
//!    sequence number, head from the largest `Truncate`.
//! 4. Chain healing — each file's readable region is the contiguous run
//!    of appended records ending at the tail; anything below it dies.
//!
//! Every marker conversion is written back to the medium, so a remount of
//! the same image reaches the same state (idempotent mount).

use crate::alloc::{BlockState, Blocks, Writable};
use crate::dir::{Directory, Extent, FileEntry};
use crate::handle::HandleTable;
use crate::txn::TxnEngine;
use crate::volume::{MountOptions, Volume};
use std::collections::{BTreeMap, BTreeSet};
use tofs_device::BlockDevice;
use tofs_error::{Result, TofsError};
use tofs_record::{
    decode_at, mark_dead, mark_live, superblock_payload, write_tentative, Body, Decoded, Record,
    State, SuperblockInfo, Tag, FORMAT_VERSION, HEADER_SIZE,
};
use tofs_types::{Addr, BlockIndex, FileId, Geometry, Limits, TxnId};
use tracing::{debug, info, warn};

/// How a block's record walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockTail {
    /// Erased space from this address to the block end.
    Erased(Addr),
    /// No room for another record header.
    Full,
    /// Untrustworthy header; the rest of the block is sealed.
    Torn,
}

fn walk_block<D: BlockDevice>(
    dev: &mut D,
    geo: Geometry,
    block: BlockIndex,
    out: &mut Vec<Record>,
) -> Result<BlockTail> {
    let end = geo.block_end(block);
    let mut cur = geo.block_start(block);
    loop {
        if end - u64::from(cur.0) < u64::from(HEADER_SIZE) {
            return Ok(BlockTail::Full);
        }
        match decode_at(dev, cur)? {
            Decoded::EndOfLog => return Ok(BlockTail::Erased(cur)),
            Decoded::Torn => return Ok(BlockTail::Torn),
            Decoded::Record { record, next } => {
                out.push(record);
                cur = next;
            }
        }
    }
}

fn body_file(body: &Body) -> Option<FileId> {
    match body {
        Body::FileCreate { file, .. }
        | Body::Append { file, .. }
        | Body::Truncate { file, .. }
        | Body::Delete { file }
        | Body::SetFlags { file, .. } => Some(*file),
        Body::Superblock(_) | Body::TxnBegin { .. } | Body::TxnCommit { .. }
        | Body::TxnAbort { .. } | Body::Padding => None,
    }
}

fn is_txn_marker(tag: Tag) -> bool {
    matches!(tag, Tag::TxnBegin | Tag::TxnCommit | Tag::TxnAbort)
}

/// Finish the (at most one) interrupted transaction, then retire all
/// bracket records.
fn resolve_transactions<D: BlockDevice>(dev: &mut D, records: &mut [Record]) -> Result<()> {
    let mut open_begins: Vec<TxnId> = Vec::new();
    let mut live_commits: BTreeSet<TxnId> = BTreeSet::new();
    for r in records.iter() {
        match (&r.body, r.header.state) {
            (Body::TxnBegin { txn }, State::Tentative | State::Live) => open_begins.push(*txn),
            (Body::TxnCommit { txn }, State::Live) => {
                live_commits.insert(*txn);
            }
            _ => {}
        }
    }
    let committed = open_begins.len() == 1 && live_commits.contains(&open_begins[0]);

    let mut completed = 0_u32;
    let mut killed = 0_u32;
    for r in records.iter_mut() {
        if is_txn_marker(r.header.tag) {
            continue;
        }
        if r.header.state == State::Tentative {
            if committed {
                mark_live(dev, r.addr)?;
                r.header.state = State::Live;
                completed += 1;
            } else {
                mark_dead(dev, r.addr)?;
                r.header.state = State::Dead;
                killed += 1;
            }
        }
    }

    for r in records.iter_mut() {
        if is_txn_marker(r.header.tag) && r.header.state != State::Dead {
            mark_dead(dev, r.addr)?;
            r.header.state = State::Dead;
        }
    }

    if completed > 0 || killed > 0 {
        info!(
            target: "tofs::scan",
            completed,
            killed,
            "interrupted transaction resolved"
        );
    }
    Ok(())
}

/// Apply surviving LIVE `Delete` records: every record of the deleted file
/// dies, the delete record last.
fn resolve_deletes<D: BlockDevice>(dev: &mut D, records: &mut [Record]) -> Result<()> {
    let doomed: BTreeSet<FileId> = records
        .iter()
        .filter_map(|r| match (&r.body, r.header.state) {
            (Body::Delete { file }, State::Live) => Some(*file),
            _ => None,
        })
        .collect();
    if doomed.is_empty() {
        return Ok(());
    }

    for r in records.iter_mut() {
        if r.header.state == State::Dead {
            continue;
        }
        if body_file(&r.body).is_some_and(|f| doomed.contains(&f)) {
            mark_dead(dev, r.addr)?;
            r.header.state = State::Dead;
        }
    }
    debug!(target: "tofs::scan", files = doomed.len(), "pending deletes applied");
    Ok(())
}

impl<D: BlockDevice> Volume<D> {
    /// Erase every block and start over with an empty directory. All
    /// files are lost; the format epoch increments.
    pub fn reformat(self) -> Result<Self> {
        let (mut dev, geo, limits) = (self.dev, self.geo, self.limits);
        let epoch = self.epoch.wrapping_add(1).max(1);
        format_medium(&mut dev, geo, epoch)?;
        Self::build(dev, geo, limits, epoch)
    }

    /// Mount a volume: validate or create the superblock, replay the log,
    /// and rebuild all in-RAM state.
    pub fn mount(mut dev: D, opts: MountOptions) -> Result<Self> {
        let geo = dev.geometry();
        let epoch = match probe_superblock(&mut dev, geo)? {
            Ok(epoch) => epoch,
            Err(epoch_hint) => {
                if !opts.auto_format {
                    return Err(TofsError::BadFormat(
                        "no valid superblock on medium".to_owned(),
                    ));
                }
                let epoch = epoch_hint.wrapping_add(1).max(1);
                format_medium(&mut dev, geo, epoch)?;
                epoch
            }
        };
        Self::build(dev, geo, opts.limits, epoch)
    }

    fn build(mut dev: D, geo: Geometry, limits: Limits, epoch: u32) -> Result<Self> {
        let count = geo.block_count();
        let mut records: Vec<Record> = Vec::new();
        let mut tails: Vec<BlockTail> = Vec::with_capacity(count as usize);
        for b in 0..count {
            tails.push(walk_block(&mut dev, geo, BlockIndex(b), &mut records)?);
        }

        resolve_transactions(&mut dev, &mut records)?;
        resolve_deletes(&mut dev, &mut records)?;

        let mut volume = Self {
            dev,
            geo,
            limits,
            epoch,
            dir: Directory::default(),
            blocks: Blocks::new(count),
            txn: TxnEngine::new(),
            handles: HandleTable::default(),
        };
        volume.build_directory(&mut records)?;
        volume.build_chains(&mut records)?;
        volume.account_blocks(&records, &tails);
        volume.dev.flush()?;
        info!(
            target: "tofs::scan",
            files = volume.dir.files.len(),
            epoch,
            "volume mounted"
        );
        Ok(volume)
    }

    /// Directory entries from LIVE `FileCreate` records, flags from the
    /// newest `SetFlags`, head floor from the largest `Truncate`.
    fn build_directory(&mut self, records: &mut [Record]) -> Result<()> {
        // File creation.
        for i in 0..records.len() {
            let r = &records[i];
            if r.header.state != State::Live {
                continue;
            }
            match r.body.clone() {
                Body::Superblock(_) if r.addr != Addr::ZERO => {
                    warn!(target: "tofs::scan", addr = r.addr.0, "stray superblock");
                    mark_dead(&mut self.dev, r.addr)?;
                    records[i].header.state = State::Dead;
                }
                Body::FileCreate { file, flags, name } => {
                    if self.dir.find_by_name(&name).is_some() || self.dir.find_by_id(file).is_some()
                    {
                        warn!(target: "tofs::scan", file = file.0, "duplicate file record");
                        mark_dead(&mut self.dev, r.addr)?;
                        records[i].header.state = State::Dead;
                        continue;
                    }
                    if self.dir.files.len() >= self.limits.max_files {
                        return Err(TofsError::Exhausted("directory entries"));
                    }
                    let (addr, size) = (r.addr, r.size());
                    self.dir.insert(FileEntry {
                        id: file,
                        name,
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
                }
                _ => {}
            }
        }

        // Newest flags update wins; everything else dies.
        let mut best_flags: BTreeMap<FileId, (u32, usize)> = BTreeMap::new();
        for (i, r) in records.iter().enumerate() {
            if r.header.state != State::Live {
                continue;
            }
            if let Body::SetFlags { file, seq, .. } = r.body {
                let better = best_flags.get(&file).is_none_or(|&(s, _)| seq > s);
                if better {
                    best_flags.insert(file, (seq, i));
                }
            }
        }
        for i in 0..records.len() {
            let Body::SetFlags { file, flags, seq } = records[i].body else {
                continue;
            };
            if records[i].header.state != State::Live {
                continue;
            }
            let keep = best_flags.get(&file) == Some(&(seq, i));
            match self.dir.find_by_id(file) {
                Some(idx) if keep => {
                    let entry = &mut self.dir.files[idx];
                    entry.flags = flags;
                    entry.flags_seq = seq + 1;
                    entry.last_set_flags = Some((records[i].addr, records[i].size()));
                }
                _ => {
                    mark_dead(&mut self.dev, records[i].addr)?;
                    records[i].header.state = State::Dead;
                }
            }
        }

        // Largest head advance wins; everything else dies.
        let mut best_head: BTreeMap<FileId, (u32, usize)> = BTreeMap::new();
        for (i, r) in records.iter().enumerate() {
            if r.header.state != State::Live {
                continue;
            }
            if let Body::Truncate { file, new_head } = r.body {
                let better = best_head.get(&file).is_none_or(|&(h, _)| new_head > h);
                if better {
                    best_head.insert(file, (new_head, i));
                }
            }
        }
        for i in 0..records.len() {
            let Body::Truncate { file, new_head } = records[i].body else {
                continue;
            };
            if records[i].header.state != State::Live {
                continue;
            }
            let keep = best_head.get(&file) == Some(&(new_head, i));
            match self.dir.find_by_id(file) {
                Some(idx) if keep => {
                    let entry = &mut self.dir.files[idx];
                    entry.head = new_head;
                    entry.tail = new_head;
                    entry.last_truncate = Some((records[i].addr, records[i].size()));
                }
                _ => {
                    mark_dead(&mut self.dev, records[i].addr)?;
                    records[i].header.state = State::Dead;
                }
            }
        }

        // Ids are never reused while any trace of them remains.
        self.dir.next_id = records
            .iter()
            .filter_map(|r| body_file(&r.body))
            .map(|f| f.0 + 1)
            .max()
            .unwrap_or(0);
        Ok(())
    }

    /// Rebuild each file's append chain as the contiguous run ending at
    /// the tail; orphaned, duplicate, or below-head records die.
    fn build_chains(&mut self, records: &mut [Record]) -> Result<()> {
        let mut by_file: BTreeMap<FileId, Vec<Extent>> = BTreeMap::new();
        for r in records.iter_mut() {
            if r.header.state != State::Live {
                continue;
            }
            let Body::Append { file, start, ref data } = r.body else {
                continue;
            };
            if self.dir.find_by_id(file).is_none() {
                warn!(target: "tofs::scan", file = file.0, addr = r.addr.0, "orphan append");
                mark_dead(&mut self.dev, r.addr)?;
                r.header.state = State::Dead;
                continue;
            }
            by_file.entry(file).or_default().push(Extent {
                addr: r.addr,
                start,
                len: u32::try_from(data.len()).unwrap_or(u32::MAX),
            });
        }

        for (file, mut extents) in by_file {
            let idx = self.dir.find_by_id(file).ok_or(TofsError::NotFound)?;
            extents.sort_by_key(|e| (e.start, e.addr.0));

            // Duplicate starts cannot both be right; keep the first.
            let mut dropped: Vec<Extent> = Vec::new();
            extents.dedup_by(|b, a| {
                let dup = a.start == b.start;
                if dup {
                    dropped.push(*b);
                }
                dup
            });

            let head_floor = self.dir.files[idx].head;
            let tail = extents.iter().map(|e| Extent::end(*e)).max().unwrap_or(head_floor);

            // Contiguous suffix ending at the tail.
            let mut suffix_at = extents.len() - 1;
            while suffix_at > 0 && extents[suffix_at - 1].end() == extents[suffix_at].start {
                suffix_at -= 1;
            }
            let head = head_floor.max(extents[suffix_at].start);

            let mut chain: Vec<Extent> = Vec::new();
            for (i, e) in extents.iter().enumerate() {
                if i < suffix_at || e.end() <= head {
                    dropped.push(*e);
                } else {
                    chain.push(*e);
                }
            }

            for e in dropped {
                mark_dead(&mut self.dev, e.addr)?;
                if let Some(r) = records.iter_mut().find(|r| r.addr == e.addr) {
                    r.header.state = State::Dead;
                }
            }

            let entry = &mut self.dir.files[idx];
            entry.head = head.max(head_floor);
            entry.tail = tail.max(entry.head);
            entry.chain = chain;
        }
        Ok(())
    }

    /// Derive per-block accounting and locate the write cursor.
    fn account_blocks(&mut self, records: &[Record], tails: &[BlockTail]) {
        for r in records {
            if r.header.state != State::Live {
                continue;
            }
            match r.header.tag {
                Tag::Superblock | Tag::FileCreate | Tag::Truncate | Tag::SetFlags => {
                    let block = self.geo.block_of(r.addr);
                    self.blocks.meta_mut(block).pinned += r.size();
                }
                _ => {}
            }
        }
        for idx in 0..self.dir.files.len() {
            for e in self.dir.files[idx].chain.clone() {
                let block = self.geo.block_of(e.addr);
                self.blocks.meta_mut(block).content += e.record_size();
            }
        }

        let mut writable: Option<Writable> = None;
        for (i, tail) in tails.iter().enumerate() {
            let block = BlockIndex(u32::try_from(i).unwrap_or(u32::MAX));
            let start = self.geo.block_start(block);
            let state = match *tail {
                BlockTail::Erased(cursor) if cursor == start => BlockState::Free,
                BlockTail::Erased(cursor) => {
                    if writable.is_none() {
                        writable = Some(Writable { block, cursor });
                        BlockState::Writable
                    } else {
                        // Only one append target; stray erased tails stay
                        // sealed and return through reclamation.
                        BlockState::Sealed
                    }
                }
                BlockTail::Full | BlockTail::Torn => BlockState::Sealed,
            };
            self.blocks.meta_mut(block).state = state;
        }
        self.blocks.writable = writable;
    }
}

/// Check block 0 for a valid superblock. `Ok(Ok(epoch))` when the volume
/// is mountable, `Ok(Err(epoch_hint))` when it must be (re)formatted.
fn probe_superblock<D: BlockDevice>(
    dev: &mut D,
    geo: Geometry,
) -> Result<std::result::Result<u32, u32>> {
    match decode_at(dev, Addr::ZERO)? {
        Decoded::Record { record, .. } => match record.body {
            Body::Superblock(info) => {
                if record.header.state == State::Live
                    && info.version == FORMAT_VERSION
                    && info.geometry == geo
                {
                    Ok(Ok(info.epoch))
                } else {
                    Ok(Err(info.epoch))
                }
            }
            _ => Ok(Err(0)),
        },
        Decoded::EndOfLog | Decoded::Torn => Ok(Err(0)),
    }
}

/// Erase every block and write a fresh LIVE superblock.
fn format_medium<D: BlockDevice>(dev: &mut D, geo: Geometry, epoch: u32) -> Result<()> {
    for b in 0..geo.block_count() {
        dev.erase(BlockIndex(b))?;
    }
    let info = SuperblockInfo {
        version: FORMAT_VERSION,
        geometry: geo,
        epoch,
    };
    write_tentative(dev, Addr::ZERO, Tag::Superblock, &superblock_payload(&info))?;
    mark_live(dev, Addr::ZERO)?;
    dev.flush()?;
    info!(
        target: "tofs::scan",
        blocks = geo.block_count(),
        block_size = geo.block_size(),
        epoch,
        "volume formatted"
    );
    Ok(())
}
