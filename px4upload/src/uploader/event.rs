//! Notifications emitted while loading, detecting, and uploading.

use crate::error::Error;
use crate::protocol::bootloader::DeviceInfoItem;

/// How an upload attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UploadOutcome {
    /// Image written, verified, and the board rebooted.
    Success,
    /// Attempt aborted; an [`UploadEvent::Error`] preceded this.
    Failure,
}

/// Failure classes callers may want to react to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureKind {
    /// Device checksum differs from the local one; retrying may help.
    CrcMismatch,
    /// Bootloader never finished erasing.
    EraseTimeout,
    /// Image does not fit the device flash.
    ImageTooLarge,
    /// Port could not be opened, read, or written.
    Transport,
    /// No bootloader showed up in time.
    Timeout,
    /// Anything else.
    Other,
}

/// Cloneable description of a fatal error, carried by [`UploadEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

impl From<&Error> for UploadFailure {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::CrcMismatch { .. } => FailureKind::CrcMismatch,
            Error::EraseTimeout { .. } => FailureKind::EraseTimeout,
            Error::ImageTooLarge { .. } => FailureKind::ImageTooLarge,
            Error::Io(_) | Error::PortOpen { .. } | Error::PortClosed => FailureKind::Transport,
            #[cfg(feature = "native")]
            Error::Serial(_) => FailureKind::Transport,
            Error::Timeout(_) => FailureKind::Timeout,
            Error::InvalidImage(_) | Error::ImageSizeMismatch { .. } | Error::Cancelled => {
                FailureKind::Other
            },
        };
        let message = match err {
            Error::CrcMismatch { .. } => {
                "CRC mismatch! Firmware write failed, please try again".to_string()
            },
            other => other.to_string(),
        };
        Self { kind, message }
    }
}

/// Notification for the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UploadEvent {
    /// Image loaded; the user should plug in (or reset) the board.
    ReplugRequested,
    /// A bootloader port appeared.
    DeviceDetected {
        /// Port name.
        port: String,
    },
    /// The upload is being started on the detected port.
    KickedOff {
        /// Port name.
        port: String,
    },
    /// Raw device info reply.
    DeviceInfo {
        /// Item that was requested.
        item: DeviceInfoItem,
        /// Decoded value.
        value: u32,
    },
    /// Bootloader protocol revision.
    BootloaderRev(u32),
    /// Board type identifier.
    BoardId(u32),
    /// Board hardware revision.
    BoardRev(u32),
    /// Flash size in bytes.
    FlashSize(u32),
    /// Board serial number as lowercase hex.
    SerialNumber(String),
    /// Human-readable phase description.
    Status(String),
    /// Erase finished, image transfer begins.
    FlashingStarted,
    /// Transfer progress in bytes.
    Progress {
        /// Bytes written so far.
        sent: usize,
        /// Padded image size.
        total: usize,
    },
    /// Fatal error; always followed by [`UploadEvent::Complete`].
    Error(UploadFailure),
    /// Terminal notification for the attempt.
    Complete(UploadOutcome),
}

/// Receiver of [`UploadEvent`]s.
pub trait EventSink {
    /// Deliver one event.
    fn emit(&mut self, event: UploadEvent);
}

impl<F> EventSink for F
where
    F: FnMut(UploadEvent),
{
    fn emit(&mut self, event: UploadEvent) {
        self(event);
    }
}

impl EventSink for Vec<UploadEvent> {
    fn emit(&mut self, event: UploadEvent) {
        self.push(event);
    }
}
