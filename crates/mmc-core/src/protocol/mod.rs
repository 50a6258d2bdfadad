//! MMC command protocol: constants, command encoding and response decoding.

pub mod command;
pub mod constants;
pub mod status;

pub use command::{CommandBatch, CommandClass, CommandDescriptor, Direction, ResponseKind};
pub use status::{CommandResponse, DeviceState, DeviceStatus, StatusReport};
