//! Error types for px4upload.

use std::io;
use thiserror::Error;

/// Result type for px4upload operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for px4upload operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Firmware document is missing a field or carries a malformed payload.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Decompressed payload length disagrees with the declared `image_size`.
    #[error("Firmware size mismatch: expected {expected} bytes, decompressed {actual} bytes")]
    ImageSizeMismatch {
        /// Declared image size.
        expected: usize,
        /// Actual decompressed size.
        actual: usize,
    },

    /// Padded image does not fit into the flash reported by the bootloader.
    #[error("Firmware image ({image} bytes) is larger than device flash ({flash} bytes)")]
    ImageTooLarge {
        /// Padded image size.
        image: usize,
        /// Flash size reported by the device.
        flash: usize,
    },

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// Checksum computed locally over the streamed bytes.
        expected: u32,
        /// Checksum reported by the bootloader.
        actual: u32,
    },

    /// Bootloader never acknowledged the chip erase.
    #[error("Erase timeout: no sync after {ticks} checks")]
    EraseTimeout {
        /// Number of erase checks performed.
        ticks: u32,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Port could not be opened within the attempt budget.
    #[error("Unable to open port {port} after {attempts} attempts")]
    PortOpen {
        /// Port name.
        port: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Operation attempted on a port that is not open.
    #[error("Port is closed")]
    PortClosed,

    /// Operation stopped by the embedding application.
    #[error("Operation cancelled")]
    Cancelled,
}
