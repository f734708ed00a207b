//! Open-handle state: append cursors, sequential readers, queue bookmarks.

use crate::txn::{Effect, Undo};
use crate::volume::Volume;
use tofs_device::BlockDevice;
use tofs_error::{Result, TofsError};
use tofs_record::{decode_at, truncate_payload, Body, Decoded, State, Tag};
use tofs_types::{FileId, Handle};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleKind {
    Append,
    Read,
    Queue,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenHandle {
    pub file: FileId,
    pub kind: HandleKind,
    /// Read cursor (logical byte offset). Unused for append handles; the
    /// file's tail is the append position.
    pub cursor: u32,
}

#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    pub slots: Vec<Option<OpenHandle>>,
}

impl HandleTable {
    /// Claim the lowest free slot, growing up to `cap`.
    pub fn claim(&mut self, state: OpenHandle, cap: usize) -> Result<Handle> {
        if let Some(idx) = self.slots.iter().position(Option::is_none) {
            self.slots[idx] = Some(state);
            return Ok(Handle(u32::try_from(idx).unwrap_or(u32::MAX)));
        }
        if self.slots.len() >= cap {
            return Err(TofsError::Exhausted("open handles"));
        }
        self.slots.push(Some(state));
        Ok(Handle(u32::try_from(self.slots.len() - 1).unwrap_or(u32::MAX)))
    }

    pub fn get(&self, handle: Handle) -> Result<OpenHandle> {
        self.slots
            .get(handle.0 as usize)
            .copied()
            .flatten()
            .ok_or(TofsError::NotFound)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut OpenHandle> {
        self.slots
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(TofsError::NotFound)
    }

    pub fn release(&mut self, handle: Handle) -> Option<OpenHandle> {
        self.slots.get_mut(handle.0 as usize)?.take()
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Snap every read cursor of `file` up to the file's head after a
    /// truncation or eviction.
    pub(crate) fn clamp_read_cursors(&mut self, file: FileId) {
        let Some(idx) = self.dir.find_by_id(file) else {
            return;
        };
        let head = self.dir.files[idx].head;
        for slot in self.handles.slots.iter_mut().flatten() {
            if slot.file == file && slot.kind != HandleKind::Append && slot.cursor < head {
                slot.cursor = head;
            }
        }
    }

    /// Release a handle. An append handle frees the file's single append
    /// slot; staged transaction writes are left for the enclosing
    /// transaction to commit.
    pub fn close(&mut self, handle: Handle) -> Result<()> {
        let state = self.handles.release(handle).ok_or(TofsError::NotFound)?;
        if state.kind == HandleKind::Append {
            if let Some(idx) = self.dir.find_by_id(state.file) {
                self.dir.files[idx].append_open = false;
            }
        }
        Ok(())
    }

    /// Consume the next record, or peek its size.
    ///
    /// With `Some(buf)`, copies at most `buf.len()` bytes of the next
    /// unread record, consumes the record whole, and returns the byte
    /// count. With `None`, returns the next record's size without
    /// consuming it. Returns 0 at end of file.
    pub fn read(&mut self, handle: Handle, buf: Option<&mut [u8]>) -> Result<usize> {
        let state = self.handles.get(handle)?;
        if state.kind == HandleKind::Append {
            return Err(TofsError::InvalidFlags("read on an append handle"));
        }
        let idx = self.dir.find_by_id(state.file).ok_or(TofsError::NotFound)?;
        let entry = &self.dir.files[idx];
        let cursor = state.cursor.max(entry.head);
        if cursor >= entry.tail {
            return Ok(0);
        }

        let extent = *entry
            .chain
            .iter()
            .find(|e| e.start <= cursor && cursor < e.end())
            .ok_or(TofsError::Corruption {
                addr: 0,
                detail: format!("no extent covers offset {cursor} of file {}", entry.id.0),
            })?;
        let avail = (extent.end() - cursor) as usize;

        let Some(buf) = buf else {
            // Size peek: clamp the cursor but consume nothing.
            self.handles.get_mut(handle)?.cursor = cursor;
            return Ok(avail);
        };

        // Tentative records are this volume's own staged writes; a reader
        // in the same session may consume them before the commit.
        let record = match decode_at(&mut self.dev, extent.addr)? {
            Decoded::Record { record, .. } if record.header.state != State::Dead => record,
            _ => {
                return Err(TofsError::Corruption {
                    addr: extent.addr.0,
                    detail: "append record unreadable".to_owned(),
                })
            }
        };
        let Body::Append { data, .. } = record.body else {
            return Err(TofsError::Corruption {
                addr: extent.addr.0,
                detail: "expected append record".to_owned(),
            });
        };

        let skip = (cursor - extent.start) as usize;
        let copied = avail.min(buf.len());
        buf[..copied].copy_from_slice(&data[skip..skip + copied]);
        let slot = self.handles.get_mut(handle)?;
        slot.cursor = extent.end();
        trace!(
            target: "tofs::handle",
            file = state.file.0,
            offset = cursor,
            copied,
            "record_read"
        );
        Ok(copied)
    }

    /// Advance the file's head to this queue handle's read cursor,
    /// persisting the progress as a `Truncate` record.
    pub fn bookmark(&mut self, handle: Handle) -> Result<()> {
        let state = self.handles.get(handle)?;
        if state.kind != HandleKind::Queue {
            return Err(TofsError::InvalidFlags("bookmark requires queue mode"));
        }
        let idx = self.dir.find_by_id(state.file).ok_or(TofsError::NotFound)?;
        let entry = &self.dir.files[idx];
        let target = state.cursor.clamp(entry.head, entry.tail);
        if target <= entry.head {
            return Ok(());
        }
        let (file, prio) = (entry.id, entry.flags.priority());

        let watermark = self.op_begin()?;
        let result = (|| -> Result<()> {
            let payload = truncate_payload(file, target);
            let addr = self.emit(Tag::Truncate, &payload, prio)?;
            let size = tofs_record::HEADER_SIZE + u32::try_from(payload.len()).unwrap_or(u32::MAX);
            // Eviction during placement may itself have advanced the head;
            // head offsets only ever move forward.
            let entry = &mut self.dir.files[idx];
            let old_head = entry.head;
            entry.head = entry.head.max(target);
            self.clamp_read_cursors(file);
            self.push_member(
                addr,
                size,
                Undo::Truncate { file, old_head },
                Effect::Truncate { file },
            );
            self.op_end()
        })();
        if let Err(err) = result {
            self.op_fail(watermark, &err);
            return Err(err);
        }
        Ok(())
    }
}
