//! Space allocation and reclamation.
//!
//! The write cursor advances inside one writable block at a time. When a
//! record does not fit, the block is sealed with a `Padding` record and a
//! new block is chosen: a free block at the lowest address, then a garbage
//! block (no live bytes) which is erased and reused, then priority
//! eviction. Eviction sacrifices a sealed block whose content is all of
//! strictly lower priority than the pending write, advancing each owning
//! file's head past the evicted content so no file ever observes a gap.

use crate::volume::Volume;
use tofs_device::BlockDevice;
use tofs_error::{Result, TofsError};
use tofs_record::{mark_dead, mark_live, write_padding, write_tentative, Tag, HEADER_SIZE};
use tofs_types::{Addr, BlockIndex, FileId, Priority};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Fully erased, ready for use.
    Free,
    /// Current append target.
    Writable,
    /// No erased tail available (full, padded, or torn).
    Sealed,
}

/// Derived per-block accounting.
///
/// `content` counts live `Append` record bytes still at or above their
/// file's head; `pinned` counts every other live record (superblock, file
/// metadata, transaction markers) plus tentative records of the open
/// transaction. A sealed block with both at zero is reclaimable.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockMeta {
    pub state: BlockState,
    pub content: u32,
    pub pinned: u32,
}

impl BlockMeta {
    pub const FREE: Self = Self {
        state: BlockState::Free,
        content: 0,
        pinned: 0,
    };

    #[must_use]
    pub fn reclaimable(self) -> bool {
        self.state == BlockState::Sealed && self.content == 0 && self.pinned == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Writable {
    pub block: BlockIndex,
    pub cursor: Addr,
}

#[derive(Debug)]
pub(crate) struct Blocks {
    pub meta: Vec<BlockMeta>,
    pub writable: Option<Writable>,
}

impl Blocks {
    pub fn new(count: u32) -> Self {
        Self {
            meta: vec![BlockMeta::FREE; count as usize],
            writable: None,
        }
    }

    pub fn meta(&self, block: BlockIndex) -> BlockMeta {
        self.meta[block.0 as usize]
    }

    pub fn meta_mut(&mut self, block: BlockIndex) -> &mut BlockMeta {
        &mut self.meta[block.0 as usize]
    }
}

impl<D: BlockDevice> Volume<D> {
    pub(crate) fn pin(&mut self, addr: Addr, size: u32) {
        let block = self.geo.block_of(addr);
        self.blocks.meta_mut(block).pinned += size;
    }

    pub(crate) fn unpin(&mut self, addr: Addr, size: u32) {
        let block = self.geo.block_of(addr);
        let meta = self.blocks.meta_mut(block);
        meta.pinned = meta.pinned.saturating_sub(size);
    }

    /// Reserve `size` contiguous erased bytes, erasing or evicting as
    /// needed, and return the address. The caller must program exactly one
    /// record of `size` bytes there.
    pub(crate) fn place_record(&mut self, size: u32, prio: Priority) -> Result<Addr> {
        debug_assert!(size <= self.geo.block_size());
        loop {
            if let Some(w) = self.blocks.writable {
                let end = self.geo.block_end(w.block);
                let remaining = end - u64::from(w.cursor.0);
                if u64::from(size) <= remaining {
                    if u64::from(size) == remaining {
                        // Exact fit: the block is full, seal it eagerly so
                        // only one block ever has an erased tail.
                        self.blocks.meta_mut(w.block).state = BlockState::Sealed;
                        self.blocks.writable = None;
                    } else {
                        self.blocks.writable = Some(Writable {
                            block: w.block,
                            cursor: Addr(w.cursor.0 + size),
                        });
                    }
                    return Ok(w.cursor);
                }
                // Seal the remainder; tails shorter than a header need no
                // padding record.
                if remaining >= u64::from(HEADER_SIZE) {
                    let pad = u32::try_from(remaining).unwrap_or(u32::MAX);
                    write_padding(&mut self.dev, w.cursor, pad)?;
                }
                self.blocks.meta_mut(w.block).state = BlockState::Sealed;
                self.blocks.writable = None;
                debug!(target: "tofs::alloc", block = w.block.0, "block_sealed");
            }

            if let Some(block) = self.lowest_block(|m| m.state == BlockState::Free) {
                self.open_writable(block);
                continue;
            }

            if let Some(block) = self.lowest_block(BlockMeta::reclaimable) {
                self.dev.erase(block)?;
                self.open_writable(block);
                debug!(target: "tofs::alloc", block = block.0, "garbage_reclaimed");
                continue;
            }

            let Some(victim) = self.pick_victim(prio) else {
                return Err(TofsError::NoSpace);
            };
            let affected = self.evict_block(victim)?;
            self.dev.erase(victim)?;
            self.open_writable(victim);
            self.write_eviction_truncates(&affected);
        }
    }

    fn open_writable(&mut self, block: BlockIndex) {
        *self.blocks.meta_mut(block) = BlockMeta {
            state: BlockState::Writable,
            content: 0,
            pinned: 0,
        };
        self.blocks.writable = Some(Writable {
            block,
            cursor: self.geo.block_start(block),
        });
    }

    fn lowest_block(&self, pred: impl Fn(BlockMeta) -> bool) -> Option<BlockIndex> {
        (0..self.geo.block_count())
            .map(BlockIndex)
            .find(|&b| pred(self.blocks.meta(b)))
    }

    /// Select the eviction victim for a write of priority `prio`, if any.
    ///
    /// Eligible blocks are sealed, hold no pinned records, and carry only
    /// content of strictly lower priority than the writer. Among those,
    /// prefer the lowest priority, then the fewest live bytes, then the
    /// lowest address.
    fn pick_victim(&self, prio: Priority) -> Option<BlockIndex> {
        let count = self.geo.block_count() as usize;
        let mut highest: Vec<Option<Priority>> = vec![None; count];
        let mut lowest: Vec<Option<Priority>> = vec![None; count];
        for file in &self.dir.files {
            let p = file.flags.priority();
            for extent in &file.chain {
                let b = self.geo.block_of(extent.addr).0 as usize;
                highest[b] = Some(highest[b].map_or(p, |h| h.max(p)));
                lowest[b] = Some(lowest[b].map_or(p, |l| l.min(p)));
            }
        }

        let mut best: Option<((Priority, Priority, u32, u32), BlockIndex)> = None;
        for i in 0..count {
            let block = BlockIndex(u32::try_from(i).unwrap_or(u32::MAX));
            let meta = self.blocks.meta(block);
            if meta.state != BlockState::Sealed || meta.pinned != 0 || meta.content == 0 {
                continue;
            }
            let (Some(hi), Some(lo)) = (highest[i], lowest[i]) else {
                continue;
            };
            if hi >= prio {
                continue;
            }
            let key = (hi, lo, meta.content, block.0);
            if best.is_none_or(|(k, _)| key < k) {
                best = Some((key, block));
            }
        }
        best.map(|(_, block)| block)
    }

    /// Kill every live record in `victim` and advance the owning files'
    /// heads past the evicted content. Returns the affected files with
    /// their new heads (for persisting `Truncate` records after reuse).
    fn evict_block(&mut self, victim: BlockIndex) -> Result<Vec<(FileId, u32)>> {
        let mut affected = Vec::new();
        for file in &self.dir.files {
            let evict_end = file
                .chain
                .iter()
                .filter(|e| self.geo.block_of(e.addr) == victim)
                .map(|e| e.end())
                .max();
            if let Some(end) = evict_end {
                affected.push((file.id, end));
            }
        }

        for &(id, new_head) in &affected {
            let Some(idx) = self.dir.find_by_id(id) else {
                continue;
            };
            let entry = &mut self.dir.files[idx];
            entry.head = entry.head.max(new_head);
            self.retire_extents_below_head(idx)?;
            self.clamp_read_cursors(id);
        }

        // Record the final heads (a file may appear in several passes).
        let heads = affected
            .iter()
            .filter_map(|&(id, _)| {
                let idx = self.dir.find_by_id(id)?;
                Some((id, self.dir.files[idx].head))
            })
            .collect();

        info!(
            target: "tofs::alloc",
            block = victim.0,
            files = affected.len(),
            "block_evicted"
        );
        Ok(heads)
    }

    /// Drop and mark DEAD every chain extent of `dir.files[idx]` that lies
    /// entirely below the file's head.
    pub(crate) fn retire_extents_below_head(&mut self, idx: usize) -> Result<()> {
        let head = self.dir.files[idx].head;
        while let Some(&first) = self.dir.files[idx].chain.first() {
            if first.end() > head {
                break;
            }
            self.dir.files[idx].chain.remove(0);
            mark_dead(&mut self.dev, first.addr)?;
            let block = self.geo.block_of(first.addr);
            let meta = self.blocks.meta_mut(block);
            meta.content = meta.content.saturating_sub(first.record_size());
        }
        Ok(())
    }

    /// Persist head advances caused by eviction. Best-effort: the heads
    /// are already enforced by chain healing at the next mount, so a full
    /// block here only costs the persistence shortcut, not correctness.
    fn write_eviction_truncates(&mut self, affected: &[(FileId, u32)]) {
        for &(id, head) in affected {
            let Some(idx) = self.dir.find_by_id(id) else {
                continue;
            };
            let payload = tofs_record::truncate_payload(id, head);
            let size = HEADER_SIZE + u32::try_from(payload.len()).unwrap_or(u32::MAX);
            let Some(w) = self.blocks.writable else {
                return;
            };
            let remaining = self.geo.block_end(w.block) - u64::from(w.cursor.0);
            if u64::from(size) > remaining {
                warn!(
                    target: "tofs::alloc",
                    file = id.0,
                    "eviction truncate skipped: no room in fresh block"
                );
                return;
            }
            let addr = w.cursor;
            if u64::from(size) == remaining {
                self.blocks.meta_mut(w.block).state = BlockState::Sealed;
                self.blocks.writable = None;
            } else {
                self.blocks.writable = Some(Writable {
                    block: w.block,
                    cursor: Addr(w.cursor.0 + size),
                });
            }
            let wrote = write_tentative(&mut self.dev, addr, Tag::Truncate, &payload)
                .and_then(|()| mark_live(&mut self.dev, addr));
            if let Err(err) = wrote {
                warn!(target: "tofs::alloc", file = id.0, %err, "eviction truncate failed");
                return;
            }
            self.pin(addr, size);
            self.supersede_truncate(idx, (addr, size));
        }
    }

    /// Replace a file's newest `Truncate` record, retiring the previous
    /// one.
    pub(crate) fn supersede_truncate(&mut self, idx: usize, new: (Addr, u32)) {
        if let Some((old_addr, old_size)) = self.dir.files[idx].last_truncate.replace(new) {
            let _ = mark_dead(&mut self.dev, old_addr);
            self.unpin(old_addr, old_size);
        }
    }

    /// Replace a file's newest `SetFlags` record, retiring the previous
    /// one.
    pub(crate) fn supersede_set_flags(&mut self, idx: usize, new: (Addr, u32)) {
        if let Some((old_addr, old_size)) = self.dir.files[idx].last_set_flags.replace(new) {
            let _ = mark_dead(&mut self.dev, old_addr);
            self.unpin(old_addr, old_size);
        }
    }
}
