//! PX4 bootloader serial protocol commands and replies.
//!
//! Every request is a command byte, an optional argument, and the
//! end-of-command marker. The bootloader answers each request with an optional
//! little-endian payload followed by a 2-byte sync:
//!
//! ```text
//! host   -> | CMD | args ... | EOC (0x20) |
//! device <- | reply (0 or 4 bytes, LE)    | INSYNC (0x12) | OK (0x10) |
//! ```
//!
//! Only one request may be outstanding at a time; the host must consume the
//! sync of the previous request before writing the next one.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;

/// First byte of every sync reply.
pub const INSYNC: u8 = 0x12;

/// Second sync byte: command succeeded.
pub const OK: u8 = 0x10;

/// Second sync byte: command failed.
pub const FAILED: u8 = 0x11;

/// Second sync byte: command not understood.
pub const INVALID: u8 = 0x13;

/// End-of-command marker.
pub const EOC: u8 = 0x20;

/// Expected sync reply.
pub const SYNC_OK: [u8; 2] = [INSYNC, OK];

/// Length of a sync reply.
pub const SYNC_LEN: usize = 2;

/// Length of a numeric reply (device info, serial word, checksum).
pub const WORD_LEN: usize = 4;

/// Largest payload a single PROG_MULTI may carry.
pub const PROG_MULTI_MAX: usize = 60;

/// Byte length of the board serial number (three words at 0, 4, 8).
pub const SERIAL_NUMBER_LEN: u32 = 12;

/// Bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Request a sync (0x21).
    GetSync = 0x21,
    /// Query a device info item (0x22).
    GetDevice = 0x22,
    /// Erase the application flash (0x23).
    ChipErase = 0x23,
    /// Program up to [`PROG_MULTI_MAX`] bytes (0x27).
    ProgMulti = 0x27,
    /// Read the CRC of the whole flash (0x29).
    GetCrc = 0x29,
    /// Read one word of the serial number area (0x2B).
    ReadMulti = 0x2B,
    /// Leave the bootloader and boot the application (0x30).
    Reboot = 0x30,
}

/// Device info items that can be requested with GET_DEVICE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum DeviceInfoItem {
    /// Bootloader protocol revision (0x01).
    BootloaderRev = 0x01,
    /// Board type identifier (0x02).
    BoardId = 0x02,
    /// Board hardware revision (0x03).
    BoardRev = 0x03,
    /// Usable flash size in bytes (0x04).
    FlashSize = 0x04,
}

impl DeviceInfoItem {
    /// Items queried after sync, in wire order.
    pub const QUERY_ORDER: [Self; 4] = [
        Self::BootloaderRev,
        Self::BoardId,
        Self::BoardRev,
        Self::FlashSize,
    ];

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::BootloaderRev => "Bootloader Rev",
            Self::BoardId => "Board ID",
            Self::BoardRev => "Board Rev",
            Self::FlashSize => "Flash rom Size",
        }
    }
}

impl fmt::Display for DeviceInfoItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A request ready to be written to the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// GET_SYNC.
    GetSync,
    /// GET_DEVICE for one info item.
    GetDevice(DeviceInfoItem),
    /// CHIP_ERASE.
    Erase,
    /// PROG_MULTI with a chunk of at most [`PROG_MULTI_MAX`] bytes.
    ProgMulti(&'a [u8]),
    /// READ_MULTI at a serial number address.
    ReadMulti(u32),
    /// GET_CRC.
    GetCrc,
    /// REBOOT.
    Reboot,
}

impl Command<'_> {
    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::GetSync => Opcode::GetSync,
            Self::GetDevice(_) => Opcode::GetDevice,
            Self::Erase => Opcode::ChipErase,
            Self::ProgMulti(_) => Opcode::ProgMulti,
            Self::ReadMulti(_) => Opcode::ReadMulti,
            Self::GetCrc => Opcode::GetCrc,
            Self::Reboot => Opcode::Reboot,
        }
    }

    /// Encode the command into its wire bytes.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PROG_MULTI_MAX + 3);
        buf.push(self.opcode() as u8);

        match self {
            Self::GetDevice(item) => buf.push(*item as u8),
            Self::ProgMulti(chunk) => {
                debug_assert!(chunk.len() <= PROG_MULTI_MAX);
                // Safe cast: chunks never exceed PROG_MULTI_MAX
                buf.push(chunk.len() as u8);
                buf.extend_from_slice(chunk);
            },
            Self::ReadMulti(address) => {
                buf.write_u32::<LittleEndian>(*address).unwrap();
            },
            Self::GetSync | Self::Erase | Self::GetCrc | Self::Reboot => {},
        }

        buf.push(EOC);
        buf
    }
}

/// Outcome of checking the receive buffer for a sync reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCheck {
    /// `INSYNC OK` received.
    InSync,
    /// Exactly two bytes were available but they were not `INSYNC OK`.
    Bad([u8; 2]),
    /// Not exactly two bytes available yet.
    NotYet,
}

impl SyncCheck {
    /// Classify a two-byte reply.
    pub fn classify(reply: [u8; 2]) -> Self {
        if reply == SYNC_OK {
            Self::InSync
        } else {
            Self::Bad(reply)
        }
    }

    /// Whether the sync succeeded.
    pub fn is_in_sync(self) -> bool {
        matches!(self, Self::InSync)
    }
}

/// Describe a bad sync reply for logging.
pub fn describe_bad_sync(reply: [u8; 2]) -> String {
    match reply {
        [INSYNC, FAILED] => "bootloader reported FAILED".to_string(),
        [INSYNC, INVALID] => "bootloader reported INVALID command".to_string(),
        [a, b] => format!("{a:02x} {b:02x}"),
    }
}

/// Decode a 4-byte little-endian reply word.
pub fn decode_word(reply: [u8; WORD_LEN]) -> u32 {
    LittleEndian::read_u32(&reply)
}

/// Reverse a little-endian serial number word into big-endian order.
pub fn serial_word_bytes(reply: [u8; WORD_LEN]) -> [u8; WORD_LEN] {
    let mut word = reply;
    word.reverse();
    word
}
