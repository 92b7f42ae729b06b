//! Protocol implementations.

pub mod bootloader;
pub mod crc;

// Re-export common types
pub use bootloader::{Command, DeviceInfoItem, Opcode, SyncCheck};
pub use crc::{Crc32, crc32};
