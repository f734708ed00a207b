#![forbid(unsafe_code)]
//! Transactional log-structured file store for erase-block media.
//!
//! A [`Volume`] manages a flat medium through the pluggable
//! [`tofs_device::BlockDevice`] adapter and exposes a small file
//! abstraction: append, sequential read, queue-style head truncation,
//! priority-based space reclamation, and ACID transactions across
//! multiple writes. All state derives from an append-only record log that
//! stays consistent across arbitrary power loss.

mod alloc;
mod dir;
mod handle;
mod scan;
mod txn;
mod volume;

pub use dir::FileInfo;
pub use volume::{MountOptions, OpenMode, OpenOptions, Volume, VolumeStats};

pub use tofs_error::{Result, TofsError};
pub use tofs_types::{
    Addr, BlockIndex, FileFlags, FileId, FileName, Geometry, Handle, Limits, Priority,
};
