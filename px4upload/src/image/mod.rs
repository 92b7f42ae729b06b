//! Firmware image formats.

pub mod px4;

pub use px4::{FirmwareImage, ImageMetadata};
