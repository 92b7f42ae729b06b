//! PX4 bootloader upload state machine.
//!
//! The [`Uploader`] owns the bootloader port for the whole attempt and is
//! driven purely by notifications:
//!
//! - [`Uploader::on_data_arrived`] whenever the port has new bytes,
//! - [`Uploader::on_erase_tick`] every 250 ms while erasing.
//!
//! No call blocks. Each phase alternates between issuing one request and
//! waiting for its reply and sync, so there is never more than one request
//! on the wire:
//!
//! ```text
//! Init ──sync──> RequestDeviceInfo ──(4 items)──> RequestSerialNumber ──(3 words)──>
//!   Erase ──sync (≤ 240 ticks)──> SendFirmware ──(all chunks)──> RequestChecksum ──> Done
//! ```
//!
//! Every fatal condition emits [`UploadEvent::Error`] followed by
//! [`UploadEvent::Complete`], closes the port, and leaves the machine in
//! [`UploadState::Failed`].

mod event;

pub use event::{EventSink, FailureKind, UploadEvent, UploadFailure, UploadOutcome};

use std::ops::Range;

use log::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::image::px4::PAD_BYTE;
use crate::port::Port;
use crate::protocol::bootloader::{
    self, Command, DeviceInfoItem, PROG_MULTI_MAX, SERIAL_NUMBER_LEN, SYNC_LEN, SyncCheck, WORD_LEN,
};
use crate::protocol::crc::Crc32;
use crate::watcher::DeviceInfoRequest;

/// Erase checks before giving up (60 s at one check per 250 ms).
pub const ERASE_TIMEOUT_TICKS: u32 = 240;

/// A progress event is emitted for every this many chunks.
pub const PROGRESS_INTERVAL_CHUNKS: usize = 50;

/// Externally visible phase of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UploadState {
    /// Created, not kicked off yet.
    Idle,
    /// Waiting for the first sync.
    Init,
    /// Querying device info items.
    RequestDeviceInfo,
    /// Reading the serial number words.
    RequestSerialNumber,
    /// Waiting for the chip erase to finish.
    Erase,
    /// Streaming the image.
    SendFirmware,
    /// Verifying the flash checksum.
    RequestChecksum,
    /// Verified and rebooted.
    Done,
    /// Aborted after an error.
    Failed,
    /// Stopped by the caller.
    Stopped,
}

/// Values reported by the bootloader during the device info phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceDescriptor {
    /// Bootloader protocol revision.
    pub bootloader_rev: Option<u32>,
    /// Board type identifier.
    pub board_id: Option<u32>,
    /// Board hardware revision.
    pub board_rev: Option<u32>,
    /// Flash size in bytes.
    pub flash_size: Option<u32>,
}

/// Collects the serial number words read at addresses 0, 4 and 8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerialNumberAccumulator {
    bytes: Vec<u8>,
    next_address: u32,
}

impl SerialNumberAccumulator {
    /// Empty accumulator starting at address 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next address to read, advancing by one word; `None` once complete.
    pub fn next_address(&mut self) -> Option<u32> {
        if self.next_address >= SERIAL_NUMBER_LEN {
            return None;
        }
        let address = self.next_address;
        self.next_address += WORD_LEN as u32;
        Some(address)
    }

    /// Append one little-endian wire word, byte-reversed.
    pub fn push_word(&mut self, reply: [u8; WORD_LEN]) {
        self.bytes
            .extend_from_slice(&bootloader::serial_word_bytes(reply));
    }

    /// Collected bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex rendering of the collected bytes.
    pub fn to_hex(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Read position in the image being streamed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCursor {
    offset: usize,
    chunks: usize,
    reported: Option<usize>,
}

impl TransferCursor {
    /// Bytes handed to the port so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Chunks handed to the port so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Claim the next chunk of at most [`PROG_MULTI_MAX`] bytes.
    pub fn next_chunk(&mut self, total: usize) -> Option<Range<usize>> {
        if self.offset >= total {
            return None;
        }
        let start = self.offset;
        let end = (start + PROG_MULTI_MAX).min(total);
        self.offset = end;
        self.chunks += 1;
        Some(start..end)
    }

    /// Whether the chunk just claimed should be reported as progress.
    fn due_for_report(&self) -> bool {
        self.chunks > 0 && (self.chunks - 1) % PROGRESS_INTERVAL_CHUNKS == 0
    }

    fn mark_reported(&mut self) {
        self.reported = Some(self.offset);
    }
}

/// Per-phase state; data only lives in the phase that uses it.
#[derive(Debug)]
enum Phase {
    Idle,
    Init {
        device_info: DeviceInfoRequest,
    },
    DeviceInfo {
        queue: DeviceInfoRequest,
        pending: DeviceInfoItem,
        awaiting_sync: bool,
    },
    SerialNumber {
        serial: SerialNumberAccumulator,
        awaiting_sync: bool,
    },
    Erase {
        ticks: u32,
    },
    SendFirmware {
        cursor: TransferCursor,
    },
    Checksum {
        streamed: usize,
        awaiting_sync: bool,
    },
    Done,
    Failed,
    Stopped,
}

/// Whether the notification handler should look at the port again.
enum Flow {
    Continue,
    Idle,
}

/// Drives one upload attempt over an exclusively owned port.
pub struct Uploader<P: Port> {
    port: Option<P>,
    image: FirmwareImage,
    phase: Phase,
    device: DeviceDescriptor,
    serial_number: Option<String>,
    erase_timeout_ticks: u32,
    error: Option<Error>,
    bytes_read: usize,
}

impl<P: Port> Uploader<P> {
    /// Take ownership of an open port and a loaded image.
    pub fn new(port: P, image: FirmwareImage) -> Self {
        Self {
            port: Some(port),
            image,
            phase: Phase::Idle,
            device: DeviceDescriptor::default(),
            serial_number: None,
            erase_timeout_ticks: ERASE_TIMEOUT_TICKS,
            error: None,
            bytes_read: 0,
        }
    }

    /// Override the number of erase checks before timing out.
    #[must_use]
    pub fn with_erase_timeout_ticks(mut self, ticks: u32) -> Self {
        self.erase_timeout_ticks = ticks.max(1);
        self
    }

    /// Reset to [`UploadState::Init`] and send the first GET_SYNC.
    pub fn kick_off<S>(&mut self, device_info: DeviceInfoRequest, sink: &mut S)
    where
        S: EventSink + ?Sized,
    {
        let Some(port) = self
            .port
            .as_mut()
        else {
            error!("Called kick_off with a closed port!");
            self.fail(Error::PortClosed, sink);
            return;
        };

        info!("Starting upload on {}", port.name());
        if let Err(e) = port.clear_buffers() {
            warn!("Failed to clear port buffers: {e}");
        }

        self.device = DeviceDescriptor::default();
        self.serial_number = None;
        self.error = None;
        self.phase = Phase::Init { device_info };

        if let Err(e) = self.send(&Command::GetSync) {
            self.fail(e, sink);
        }
    }

    /// Handle a "data arrived" notification from the port.
    ///
    /// Keeps processing while a step consumed a reply and more bytes may be
    /// pending, and returns as soon as the current sub-phase needs more data.
    pub fn on_data_arrived<S>(&mut self, sink: &mut S)
    where
        S: EventSink + ?Sized,
    {
        if self
            .port
            .is_none()
        {
            trace!("Ignoring data notification, port closed");
            return;
        }

        loop {
            match self.step(sink) {
                Ok(Flow::Continue) => {},
                Ok(Flow::Idle) => break,
                Err(e) => {
                    self.fail(e, sink);
                    break;
                },
            }
        }
    }

    /// Handle one tick of the erase timer.
    ///
    /// Outside the erase phase this does nothing.
    pub fn on_erase_tick<S>(&mut self, sink: &mut S)
    where
        S: EventSink + ?Sized,
    {
        let Phase::Erase { ticks } = self.phase else {
            return;
        };

        match self.check_sync() {
            Ok(SyncCheck::InSync) => {
                info!("Erase complete");
                sink.emit(UploadEvent::Status("Erase Complete".into()));
                match self.start_transfer(sink) {
                    Ok(phase) => self.phase = phase,
                    Err(e) => self.fail(e, sink),
                }
            },
            Ok(_) => {
                let ticks = ticks + 1;
                if ticks >= self.erase_timeout_ticks {
                    info!("Error flashing, never returned from erase");
                    sink.emit(UploadEvent::Status("Erase failed - took too long.".into()));
                    sink.emit(UploadEvent::Status(
                        "Flashing process stopped. Perhaps you should try again or use a different tool."
                            .into(),
                    ));
                    self.fail(Error::EraseTimeout { ticks }, sink);
                } else {
                    self.phase = Phase::Erase { ticks };
                }
            },
            Err(e) => self.fail(e, sink),
        }
    }

    /// Abandon the attempt: close the port and ignore further notifications.
    pub fn stop(&mut self) {
        if self.is_finished() {
            return;
        }
        info!("Upload stopped");
        self.close_port();
        self.phase = Phase::Stopped;
        self.error = Some(Error::Cancelled);
    }

    /// Abort the attempt with `err`, emitting the terminal events.
    pub fn abort<S>(&mut self, err: Error, sink: &mut S)
    where
        S: EventSink + ?Sized,
    {
        if self.is_finished() {
            return;
        }
        self.fail(err, sink);
    }

    /// Unread bytes waiting on the port; 0 once the port is closed.
    pub fn bytes_waiting(&mut self) -> Result<usize> {
        match self
            .port
            .as_mut()
        {
            Some(port) => port.bytes_to_read(),
            None => Ok(0),
        }
    }

    /// Total reply bytes consumed from the port since construction.
    ///
    /// Unchanged across a notification means the bytes waiting could not be
    /// used yet.
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Current phase.
    pub fn state(&self) -> UploadState {
        match self.phase {
            Phase::Idle => UploadState::Idle,
            Phase::Init { .. } => UploadState::Init,
            Phase::DeviceInfo { .. } => UploadState::RequestDeviceInfo,
            Phase::SerialNumber { .. } => UploadState::RequestSerialNumber,
            Phase::Erase { .. } => UploadState::Erase,
            Phase::SendFirmware { .. } => UploadState::SendFirmware,
            Phase::Checksum { .. } => UploadState::RequestChecksum,
            Phase::Done => UploadState::Done,
            Phase::Failed => UploadState::Failed,
            Phase::Stopped => UploadState::Stopped,
        }
    }

    /// Whether a request is on the wire and only its sync is still expected.
    pub fn awaiting_sync(&self) -> bool {
        match self.phase {
            Phase::Init { .. } | Phase::Erase { .. } | Phase::SendFirmware { .. } => true,
            Phase::DeviceInfo { awaiting_sync, .. }
            | Phase::SerialNumber { awaiting_sync, .. }
            | Phase::Checksum { awaiting_sync, .. } => awaiting_sync,
            Phase::Idle | Phase::Done | Phase::Failed | Phase::Stopped => false,
        }
    }

    /// Whether the erase timer should be ticking.
    pub fn erase_timer_active(&self) -> bool {
        matches!(self.phase, Phase::Erase { .. })
    }

    /// Number of erase checks that failed so far.
    pub fn erase_ticks(&self) -> Option<u32> {
        match self.phase {
            Phase::Erase { ticks } => Some(ticks),
            _ => None,
        }
    }

    /// Whether the attempt has ended (successfully or not).
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Failed | Phase::Stopped)
    }

    /// Device info gathered so far.
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Serial number, once read.
    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number
            .as_deref()
    }

    /// Image being uploaded.
    pub fn image(&self) -> &FirmwareImage {
        &self.image
    }

    /// Error that ended the attempt, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error
            .as_ref()
    }

    /// Take the error that ended the attempt.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error
            .take()
    }

    fn step<S>(&mut self, sink: &mut S) -> Result<Flow>
    where
        S: EventSink + ?Sized,
    {
        let phase = std::mem::replace(&mut self.phase, Phase::Failed);
        let (next, flow) = match phase {
            Phase::Init { device_info } => self.step_init(device_info, sink)?,
            Phase::DeviceInfo {
                queue,
                pending,
                awaiting_sync,
            } => self.step_device_info(queue, pending, awaiting_sync, sink)?,
            Phase::SerialNumber {
                serial,
                awaiting_sync,
            } => self.step_serial_number(serial, awaiting_sync, sink)?,
            Phase::SendFirmware { cursor } => self.step_send_firmware(cursor, sink)?,
            Phase::Checksum {
                streamed,
                awaiting_sync,
            } => self.step_checksum(streamed, awaiting_sync, sink)?,
            // Erase is driven by its timer, the rest are idle or terminal
            other @ (Phase::Idle
            | Phase::Erase { .. }
            | Phase::Done
            | Phase::Failed
            | Phase::Stopped) => (other, Flow::Idle),
        };
        self.phase = next;
        Ok(flow)
    }

    fn step_init<S>(&mut self, device_info: DeviceInfoRequest, sink: &mut S) -> Result<(Phase, Flow)>
    where
        S: EventSink + ?Sized,
    {
        if !self
            .check_sync()?
            .is_in_sync()
        {
            return Ok((Phase::Init { device_info }, Flow::Idle));
        }

        debug!("Bootloader in sync");
        Ok((self.request_next_info(device_info, sink)?, Flow::Idle))
    }

    fn step_device_info<S>(
        &mut self,
        queue: DeviceInfoRequest,
        pending: DeviceInfoItem,
        awaiting_sync: bool,
        sink: &mut S,
    ) -> Result<(Phase, Flow)>
    where
        S: EventSink + ?Sized,
    {
        if awaiting_sync {
            if self
                .check_sync()?
                .is_in_sync()
            {
                return Ok((self.request_next_info(queue, sink)?, Flow::Idle));
            }
            return Ok((
                Phase::DeviceInfo {
                    queue,
                    pending,
                    awaiting_sync,
                },
                Flow::Idle,
            ));
        }

        match self.read_word()? {
            Some(reply) => {
                self.record_device_info(pending, bootloader::decode_word(reply), sink);
                Ok((
                    Phase::DeviceInfo {
                        queue,
                        pending,
                        awaiting_sync: true,
                    },
                    Flow::Continue,
                ))
            },
            None => Ok((
                Phase::DeviceInfo {
                    queue,
                    pending,
                    awaiting_sync,
                },
                Flow::Idle,
            )),
        }
    }

    fn step_serial_number<S>(
        &mut self,
        mut serial: SerialNumberAccumulator,
        awaiting_sync: bool,
        sink: &mut S,
    ) -> Result<(Phase, Flow)>
    where
        S: EventSink + ?Sized,
    {
        if awaiting_sync {
            if self
                .check_sync()?
                .is_in_sync()
            {
                return Ok((self.request_next_serial_word(serial, sink)?, Flow::Idle));
            }
            return Ok((
                Phase::SerialNumber {
                    serial,
                    awaiting_sync,
                },
                Flow::Idle,
            ));
        }

        match self.read_word()? {
            Some(reply) => {
                serial.push_word(reply);
                Ok((
                    Phase::SerialNumber {
                        serial,
                        awaiting_sync: true,
                    },
                    Flow::Continue,
                ))
            },
            None => Ok((
                Phase::SerialNumber {
                    serial,
                    awaiting_sync,
                },
                Flow::Idle,
            )),
        }
    }

    fn step_send_firmware<S>(&mut self, mut cursor: TransferCursor, sink: &mut S) -> Result<(Phase, Flow)>
    where
        S: EventSink + ?Sized,
    {
        if !self
            .check_sync()?
            .is_in_sync()
        {
            return Ok((Phase::SendFirmware { cursor }, Flow::Idle));
        }

        if self.send_next_chunk(&mut cursor, sink)? {
            Ok((Phase::SendFirmware { cursor }, Flow::Idle))
        } else {
            Ok((self.finish_transfer(cursor, sink)?, Flow::Idle))
        }
    }

    fn step_checksum<S>(&mut self, streamed: usize, awaiting_sync: bool, sink: &mut S) -> Result<(Phase, Flow)>
    where
        S: EventSink + ?Sized,
    {
        if awaiting_sync {
            if !self
                .check_sync()?
                .is_in_sync()
            {
                return Ok((
                    Phase::Checksum {
                        streamed,
                        awaiting_sync,
                    },
                    Flow::Idle,
                ));
            }

            info!("Rebooting board");
            self.send(&Command::Reboot)?;
            self.close_port();
            sink.emit(UploadEvent::Complete(UploadOutcome::Success));
            return Ok((Phase::Done, Flow::Idle));
        }

        let Some(reply) = self.read_word()? else {
            return Ok((
                Phase::Checksum {
                    streamed,
                    awaiting_sync,
                },
                Flow::Idle,
            ));
        };

        debug!("Got checksum bytes: {reply:02x?}");
        let device_crc = bootloader::decode_word(reply);
        let local_crc = self.local_checksum(streamed);

        if local_crc != device_crc {
            info!("Error with checksum: local {local_crc:#010x}, device {device_crc:#010x}");
            sink.emit(UploadEvent::Status(
                "CRC mismatch! Firmware write failed, please try again".into(),
            ));
            return Err(Error::CrcMismatch {
                expected: local_crc,
                actual: device_crc,
            });
        }

        info!("everything's happy!");
        sink.emit(UploadEvent::Status("Verify successful, rebooting".into()));
        Ok((
            Phase::Checksum {
                streamed,
                awaiting_sync: true,
            },
            Flow::Continue,
        ))
    }

    fn request_next_info<S>(&mut self, mut queue: DeviceInfoRequest, sink: &mut S) -> Result<Phase>
    where
        S: EventSink + ?Sized,
    {
        if let Some(item) = queue.pop_next() {
            self.send(&Command::GetDevice(item))?;
            return Ok(Phase::DeviceInfo {
                queue,
                pending: item,
                awaiting_sync: false,
            });
        }

        info!("Device Info read complete");
        self.check_device_compatibility(sink)?;
        sink.emit(UploadEvent::Status("Requesting board Serial Number".into()));
        self.request_next_serial_word(SerialNumberAccumulator::new(), sink)
    }

    fn request_next_serial_word<S>(&mut self, mut serial: SerialNumberAccumulator, sink: &mut S) -> Result<Phase>
    where
        S: EventSink + ?Sized,
    {
        if let Some(address) = serial.next_address() {
            self.send(&Command::ReadMulti(address))?;
            return Ok(Phase::SerialNumber {
                serial,
                awaiting_sync: false,
            });
        }

        let hex = serial.to_hex();
        info!("SN read complete {hex}");
        sink.emit(UploadEvent::Status(format!("Serial Number: 0x{hex}")));
        sink.emit(UploadEvent::SerialNumber(hex.clone()));
        self.serial_number = Some(hex);

        sink.emit(UploadEvent::Status(
            "Erasing board. This may take a while - do not disconnect or power off!".into(),
        ));
        info!("Requesting erase");
        self.send(&Command::Erase)?;
        Ok(Phase::Erase { ticks: 0 })
    }

    fn start_transfer<S>(&mut self, sink: &mut S) -> Result<Phase>
    where
        S: EventSink + ?Sized,
    {
        info!("Flash requested, flashing firmware");
        sink.emit(UploadEvent::Status("Flashing Firmware".into()));
        sink.emit(UploadEvent::FlashingStarted);

        let mut cursor = TransferCursor::default();
        if self.send_next_chunk(&mut cursor, sink)? {
            Ok(Phase::SendFirmware { cursor })
        } else {
            self.finish_transfer(cursor, sink)
        }
    }

    /// Write the next PROG_MULTI; `false` once the whole image is out.
    fn send_next_chunk<S>(&mut self, cursor: &mut TransferCursor, sink: &mut S) -> Result<bool>
    where
        S: EventSink + ?Sized,
    {
        let total = self
            .image
            .len();
        let Some(range) = cursor.next_chunk(total) else {
            return Ok(false);
        };

        let chunk = &self
            .image
            .data()[range];
        Self::write_command(&mut self.port, &Command::ProgMulti(chunk))?;

        if cursor.due_for_report() {
            let sent = cursor.offset();
            info!("flashing: {sent}/{total}");
            sink.emit(UploadEvent::Progress { sent, total });
            cursor.mark_reported();
        }
        Ok(true)
    }

    fn finish_transfer<S>(&mut self, mut cursor: TransferCursor, sink: &mut S) -> Result<Phase>
    where
        S: EventSink + ?Sized,
    {
        info!("finished writing firmware");
        let total = self
            .image
            .len();
        if cursor.reported != Some(total) {
            sink.emit(UploadEvent::Progress { sent: total, total });
            cursor.mark_reported();
        }

        sink.emit(UploadEvent::Status(
            "Flashing complete, verifying firmware".into(),
        ));
        self.send(&Command::GetCrc)?;
        Ok(Phase::Checksum {
            streamed: cursor.offset(),
            awaiting_sync: false,
        })
    }

    /// CRC over the streamed bytes, filled with 0xFF up to the flash size.
    fn local_checksum(&self, streamed: usize) -> u32 {
        let mut crc = Crc32::new();
        crc.update(&self.image.data()[..streamed]);
        if let Some(flash) = self.device.flash_size {
            let flash = flash as usize;
            if flash > streamed {
                crc.update_fill(PAD_BYTE, flash - streamed);
            }
        }
        crc.value()
    }

    fn record_device_info<S>(&mut self, item: DeviceInfoItem, value: u32, sink: &mut S)
    where
        S: EventSink + ?Sized,
    {
        debug!("{item}: {value}");
        sink.emit(UploadEvent::DeviceInfo { item, value });
        sink.emit(UploadEvent::Status(format!("{item}: {value}")));

        match item {
            DeviceInfoItem::BootloaderRev => {
                self.device.bootloader_rev = Some(value);
                sink.emit(UploadEvent::BootloaderRev(value));
            },
            DeviceInfoItem::BoardId => {
                self.device.board_id = Some(value);
                sink.emit(UploadEvent::BoardId(value));
            },
            DeviceInfoItem::BoardRev => {
                self.device.board_rev = Some(value);
                sink.emit(UploadEvent::BoardRev(value));
            },
            DeviceInfoItem::FlashSize => {
                self.device.flash_size = Some(value);
                sink.emit(UploadEvent::FlashSize(value));
            },
        }
    }

    /// Board mismatch only warns; an image that cannot fit aborts before erase.
    fn check_device_compatibility<S>(&self, sink: &mut S) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        let image_board = self
            .image
            .board_id();
        if let Some(board) = self.device.board_id {
            if board != image_board {
                warn!("Firmware targets board {image_board}, device reports board {board}");
                sink.emit(UploadEvent::Status(format!(
                    "Warning: firmware is for board {image_board} but the device is board {board}"
                )));
            }
        }

        if let Some(flash) = self.device.flash_size {
            let flash = flash as usize;
            if self.image.len() > flash {
                return Err(Error::ImageTooLarge {
                    image: self.image.len(),
                    flash,
                });
            }
        }
        Ok(())
    }

    /// Consume a sync if exactly two bytes are waiting.
    fn check_sync(&mut self) -> Result<SyncCheck> {
        let Some(port) = self
            .port
            .as_mut()
        else {
            error!("Called check_sync with a closed port!");
            return Ok(SyncCheck::NotYet);
        };

        if port.bytes_to_read()? != SYNC_LEN {
            return Ok(SyncCheck::NotYet);
        }

        let mut reply = [0u8; SYNC_LEN];
        port.read_exact(&mut reply)?;
        self.bytes_read += SYNC_LEN;
        let check = SyncCheck::classify(reply);
        if let SyncCheck::Bad(bad) = check {
            warn!("Bad sync return: {}", bootloader::describe_bad_sync(bad));
        }
        Ok(check)
    }

    /// Read a 4-byte reply if one is waiting.
    fn read_word(&mut self) -> Result<Option<[u8; WORD_LEN]>> {
        let Some(port) = self
            .port
            .as_mut()
        else {
            error!("Called read_word with a closed port!");
            return Ok(None);
        };

        if port.bytes_to_read()? < WORD_LEN {
            return Ok(None);
        }

        let mut reply = [0u8; WORD_LEN];
        port.read_exact(&mut reply)?;
        self.bytes_read += WORD_LEN;
        trace!("Received word {reply:02x?}");
        Ok(Some(reply))
    }

    fn send(&mut self, command: &Command<'_>) -> Result<()> {
        Self::write_command(&mut self.port, command)
    }

    fn write_command(port: &mut Option<P>, command: &Command<'_>) -> Result<()> {
        let Some(port) = port.as_mut() else {
            error!("Called {:?} with a closed port!", command.opcode());
            return Ok(());
        };

        let frame = command.encode();
        trace!("Sending {:?}: {} bytes", command.opcode(), frame.len());
        port.write_all_bytes(&frame)
    }

    fn close_port(&mut self) {
        if let Some(mut port) = self
            .port
            .take()
        {
            if let Err(e) = port.close() {
                warn!("Failed to close {}: {e}", port.name());
            }
        }
    }

    fn fail<S>(&mut self, err: Error, sink: &mut S)
    where
        S: EventSink + ?Sized,
    {
        error!("Upload failed: {err}");
        sink.emit(UploadEvent::Error(UploadFailure::from(&err)));
        self.close_port();
        self.phase = Phase::Failed;
        self.error = Some(err);
        sink.emit(UploadEvent::Complete(UploadOutcome::Failure));
    }
}
