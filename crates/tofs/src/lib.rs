#![forbid(unsafe_code)]
//! tofs public API facade.
//!
//! Re-exports the volume engine from `tofs-core` and the reference block
//! device adapters from `tofs-device` through one stable interface. This
//! is the crate downstream consumers (CLI, host integrations) depend on.

pub use tofs_core::*;
pub use tofs_device::{BlockDevice, FaultDevice, FileDevice, RamDevice, ERASED};
