//! In-RAM directory index: name → file-id plus per-file log state.

use tofs_types::{Addr, FileFlags, FileId, FileName};

/// One `Append` record's place in a file's logical byte space.
///
/// `len` counts data bytes only; the on-medium record additionally carries
/// the header and the (file, start) prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extent {
    pub addr: Addr,
    pub start: u32,
    pub len: u32,
}

impl Extent {
    #[must_use]
    pub fn end(self) -> u32 {
        self.start + self.len
    }

    /// Total on-medium record size.
    #[must_use]
    pub fn record_size(self) -> u32 {
        tofs_record::HEADER_SIZE + 8 + self.len
    }
}

/// Directory entry and append-chain state for one file.
#[derive(Debug, Clone)]
pub(crate) struct FileEntry {
    pub id: FileId,
    pub name: FileName,
    pub flags: FileFlags,
    /// Logical index of the first still-readable byte.
    pub head: u32,
    /// One past the last appended byte.
    pub tail: u32,
    /// Readable `Append` records, sorted by `start`, contiguous up to
    /// `tail` (the first extent may straddle `head`).
    pub chain: Vec<Extent>,
    pub create_addr: Addr,
    pub create_size: u32,
    /// Newest surviving `Truncate` record, superseded on head advance.
    pub last_truncate: Option<(Addr, u32)>,
    /// Newest surviving `SetFlags` record.
    pub last_set_flags: Option<(Addr, u32)>,
    /// Sequence number the next `SetFlags` record will carry.
    pub flags_seq: u32,
    pub append_open: bool,
}

impl FileEntry {
    #[must_use]
    pub fn size(&self) -> u32 {
        self.tail - self.head
    }
}

/// Public per-file view returned by enumeration and `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub name: FileName,
    pub id: FileId,
    pub flags: FileFlags,
    pub head: u32,
    pub tail: u32,
    pub size: u32,
}

impl FileInfo {
    pub(crate) fn of(entry: &FileEntry) -> Self {
        Self {
            name: entry.name,
            id: entry.id,
            flags: entry.flags,
            head: entry.head,
            tail: entry.tail,
            size: entry.size(),
        }
    }
}

/// Name → file-id mapping plus per-file state, ordered by ascending id
/// (which also fixes the enumeration order within a mount).
#[derive(Debug, Default)]
pub(crate) struct Directory {
    pub files: Vec<FileEntry>,
    pub next_id: u32,
}

impl Directory {
    pub fn find_by_name(&self, name: &FileName) -> Option<usize> {
        self.files.iter().position(|f| f.name == *name)
    }

    pub fn find_by_id(&self, id: FileId) -> Option<usize> {
        self.files.iter().position(|f| f.id == id)
    }

    pub fn alloc_id(&mut self) -> FileId {
        let id = FileId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Insert keeping ascending-id order.
    pub fn insert(&mut self, entry: FileEntry) {
        let at = self
            .files
            .iter()
            .position(|f| f.id > entry.id)
            .unwrap_or(self.files.len());
        self.files.insert(at, entry);
    }

    pub fn remove_by_id(&mut self, id: FileId) -> Option<FileEntry> {
        let at = self.find_by_id(id)?;
        Some(self.files.remove(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32, name: &str) -> FileEntry {
        FileEntry {
            id: FileId(id),
            name: name.parse().expect("valid name"),
            flags: FileFlags::default(),
            head: 0,
            tail: 0,
            chain: Vec::new(),
            create_addr: Addr(0),
            create_size: 20,
            last_truncate: None,
            last_set_flags: None,
            flags_seq: 1,
            append_open: false,
        }
    }

    #[test]
    fn insert_keeps_id_order() {
        let mut dir = Directory::default();
        dir.insert(entry(5, "b"));
        dir.insert(entry(2, "a"));
        dir.insert(entry(9, "c"));
        let ids: Vec<u32> = dir.files.iter().map(|f| f.id.0).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn lookup_by_name_and_id() {
        let mut dir = Directory::default();
        dir.insert(entry(1, "alpha"));
        dir.insert(entry(2, "beta"));
        let alpha: FileName = "alpha".parse().unwrap();
        assert_eq!(dir.find_by_name(&alpha), Some(0));
        assert_eq!(dir.find_by_id(FileId(2)), Some(1));
        assert!(dir.remove_by_id(FileId(1)).is_some());
        assert_eq!(dir.find_by_name(&alpha), None);
    }

    #[test]
    fn extent_math() {
        let e = Extent {
            addr: Addr(100),
            start: 40,
            len: 10,
        };
        assert_eq!(e.end(), 50);
        assert_eq!(e.record_size(), tofs_record::HEADER_SIZE + 18);
    }
}
