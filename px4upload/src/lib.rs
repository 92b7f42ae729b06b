//! # px4upload
//!
//! A library for uploading firmware to PX4 autopilot boards through their
//! serial bootloader.
//!
//! This crate provides:
//!
//! - `.px4` firmware image loading (zlib payload, padding, CRC)
//! - Bootloader arrival detection by diffing serial port enumerations
//! - A non-blocking upload state machine driven by data-arrived
//!   notifications and an erase timer
//! - The bootloader's CRC32 variant used for flash verification
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//! - Any other transport by implementing [`Port`] and [`PortEnumerator`]
//!
//! ## Features
//!
//! - `native` (default): Native serial port support and [`session::upload`]
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use px4upload::{FirmwareImage, UploadEvent, UploadOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("px4fmu-v2_default.px4")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut sink = |event: UploadEvent| match event {
//!             UploadEvent::ReplugRequested => println!("Plug in your board"),
//!             UploadEvent::Progress { sent, total } => println!("{sent}/{total}"),
//!             other => println!("{other:?}"),
//!         };
//!         px4upload::session::upload(image, &UploadOptions::default(), &mut sink)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;
pub mod uploader;
pub mod watcher;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
#[cfg(feature = "native")]
pub use session::upload;
pub use {
    error::{Error, Result},
    image::{FirmwareImage, ImageMetadata},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Command, DeviceInfoItem, SyncCheck, crc32},
    session::{UploadOptions, UploadReport, drive_upload, retry_open, wait_for_bootloader},
    uploader::{
        DeviceDescriptor, EventSink, FailureKind, UploadEvent, UploadFailure, UploadOutcome,
        UploadState, Uploader,
    },
    watcher::{DeviceInfoRequest, PortArrival, PortFilter, PortWatcher},
};
