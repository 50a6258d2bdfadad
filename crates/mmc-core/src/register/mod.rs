//! EXT_CSD register model.

mod ext_csd;
pub mod fields;

pub use ext_csd::{EXT_CSD_SIZE, ExtCsd, Revision, gp_size_mult_offset};
