#![forbid(unsafe_code)]
//! Error types for tofs.
//!
//! Defines `TofsError` and a `Result<T>` alias used throughout the
//! workspace.

use thiserror::Error;
use tofs_types::NameError;

/// Unified error type for all tofs operations.
#[derive(Debug, Error)]
pub enum TofsError {
    #[error("volume is not mounted")]
    NotMounted,

    #[error("volume is already mounted")]
    AlreadyMounted,

    #[error("invalid on-medium format: {0}")]
    BadFormat(String),

    #[error("not found")]
    NotFound,

    #[error("file exists")]
    Exists,

    #[error("file name exceeds 15 bytes")]
    NameTooLong,

    #[error("invalid file name: {0}")]
    InvalidName(&'static str),

    #[error("invalid open flags: {0}")]
    InvalidFlags(&'static str),

    #[error("resource busy")]
    Busy,

    #[error("no space left on volume")]
    NoSpace,

    #[error("static limit exhausted: {0}")]
    Exhausted(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record at {addr:#010x}: {detail}")]
    Corruption { addr: u32, detail: String },

    #[error("transaction aborted")]
    TxnAborted,
}

impl From<NameError> for TofsError {
    fn from(err: NameError) -> Self {
        match err {
            NameError::TooLong => Self::NameTooLong,
            NameError::Empty => Self::InvalidName("empty name"),
            NameError::EmbeddedNul => Self::InvalidName("embedded NUL"),
            NameError::PathSeparator => Self::InvalidName("path separator"),
        }
    }
}

/// Result alias using `TofsError`.
pub type Result<T> = std::result::Result<T, TofsError>;
