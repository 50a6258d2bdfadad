//! Payload handling module.
//!
//! Loading and chunking of firmware bundles sent over FFU.

pub mod firmware;

pub use firmware::{ChunkState, FirmwareError, FirmwareImage};
