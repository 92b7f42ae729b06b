//! Simulated PX4 bootloader shared by the integration tests.
//!
//! [`SimPort`] answers the bootloader protocol from an in-memory flash. The
//! test keeps a clone as a handle to inspect what the host sent and to tweak
//! the device behaviour mid-run.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use px4upload::port::Port;
use px4upload::{Result, UploadEvent, Uploader, crc32};

pub const INSYNC: u8 = 0x12;
pub const OK: u8 = 0x10;
pub const FAILED: u8 = 0x11;
pub const INVALID: u8 = 0x13;

pub const GET_SYNC: u8 = 0x21;
pub const GET_DEVICE: u8 = 0x22;
pub const CHIP_ERASE: u8 = 0x23;
pub const PROG_MULTI: u8 = 0x27;
pub const GET_CRC: u8 = 0x29;
pub const READ_MULTI: u8 = 0x2B;
pub const REBOOT: u8 = 0x30;

/// Device behaviour knobs.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub bootloader_rev: u32,
    pub board_id: u32,
    pub board_rev: u32,
    pub flash_size: u32,
    /// Serial number area as it sits on the wire (three LE words).
    pub serial_area: [u8; 12],
    /// Erase checks answered with nothing before the sync shows up.
    /// `None` never finishes erasing.
    pub erase_checks: Option<u32>,
    /// Report a checksum that differs from the flash contents.
    pub corrupt_crc: bool,
    /// Release replies one byte per poll.
    pub dribble: bool,
    /// Release replies in pseudo-random pieces of 0 to 6 bytes per poll,
    /// seeded with this value.
    pub fragment_seed: Option<u64>,
    /// Sync bytes sent in answer to the first GET_SYNC.
    pub first_sync: [u8; 2],
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bootloader_rev: 5,
            board_id: 9,
            board_rev: 0,
            flash_size: 4096,
            serial_area: [
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C,
            ],
            erase_checks: Some(3),
            corrupt_crc: false,
            dribble: false,
            fragment_seed: None,
            first_sync: [INSYNC, OK],
        }
    }
}

#[derive(Debug)]
pub struct SimState {
    pub config: SimConfig,
    pub flash: Vec<u8>,
    write_offset: usize,
    /// Bytes the host can read right now.
    rx: VecDeque<u8>,
    /// Bytes not yet released in dribble mode.
    pending: VecDeque<u8>,
    /// Every frame the host wrote.
    pub frames: Vec<Vec<u8>>,
    /// Commands written while a previous reply was still unread.
    pub violations: usize,
    erasing: bool,
    /// Polls observed while erasing.
    pub erase_polls: u32,
    pub reboots: usize,
    pub open: bool,
    synced_once: bool,
    rng: u64,
}

/// In-memory bootloader implementing [`Port`].
#[derive(Debug, Clone)]
pub struct SimPort {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl SimPort {
    pub fn new(config: SimConfig) -> Self {
        let flash = vec![0xFF; config.flash_size as usize];
        // xorshift state must be non-zero
        let rng = config
            .fragment_seed
            .map_or(1, |seed| seed.max(1));
        Self {
            name: "/dev/ttyACM0".to_string(),
            state: Arc::new(Mutex::new(SimState {
                config,
                flash,
                write_offset: 0,
                rx: VecDeque::new(),
                pending: VecDeque::new(),
                frames: Vec::new(),
                violations: 0,
                erasing: false,
                erase_polls: 0,
                reboots: 0,
                open: true,
                synced_once: false,
                rng,
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap()
    }

    /// Opcodes of every frame sent so far.
    pub fn opcodes(&self) -> Vec<u8> {
        self.state()
            .frames
            .iter()
            .map(|f| f[0])
            .collect()
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.opcodes()
            .into_iter()
            .filter(|o| *o == opcode)
            .count()
    }

    /// Push raw bytes as if the device sent them.
    pub fn inject(&self, bytes: &[u8]) {
        self.state()
            .rx
            .extend(bytes);
    }
}

impl SimState {
    fn reply(&mut self, bytes: &[u8]) {
        if self.config.dribble || self.config.fragment_seed.is_some() {
            self.pending.extend(bytes);
        } else {
            self.rx.extend(bytes);
        }
    }

    fn sync(&mut self) {
        self.reply(&[INSYNC, OK]);
    }

    fn word(&mut self, value: u32) {
        self.reply(&value.to_le_bytes());
    }

    fn handle(&mut self, frame: &[u8]) {
        if !self.rx.is_empty() || !self.pending.is_empty() || self.erasing {
            self.violations += 1;
        }
        self.frames.push(frame.to_vec());

        match frame[0] {
            GET_SYNC => {
                if self.synced_once {
                    self.sync();
                } else {
                    self.synced_once = true;
                    let first = self.config.first_sync;
                    self.reply(&first);
                }
            },
            GET_DEVICE => {
                let value = match frame[1] {
                    1 => Some(self.config.bootloader_rev),
                    2 => Some(self.config.board_id),
                    3 => Some(self.config.board_rev),
                    4 => Some(self.config.flash_size),
                    _ => None,
                };
                match value {
                    Some(v) => {
                        self.word(v);
                        self.sync();
                    },
                    None => self.reply(&[INSYNC, INVALID]),
                }
            },
            CHIP_ERASE => {
                self.flash.fill(0xFF);
                self.write_offset = 0;
                self.erasing = true;
                self.erase_polls = 0;
            },
            PROG_MULTI => {
                let len = frame[1] as usize;
                let data = &frame[2..2 + len];
                let end = self.write_offset + len;
                if end > self.flash.len() {
                    self.reply(&[INSYNC, FAILED]);
                    return;
                }
                self.flash[self.write_offset..end].copy_from_slice(data);
                self.write_offset = end;
                self.sync();
            },
            GET_CRC => {
                let mut crc = crc32(&self.flash);
                if self.config.corrupt_crc {
                    crc ^= 0x0000_0001;
                }
                self.word(crc);
                self.sync();
            },
            READ_MULTI => {
                let address = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
                let mut word = [0u8; 4];
                word.copy_from_slice(&self.config.serial_area[address..address + 4]);
                self.reply(&word);
                self.sync();
            },
            REBOOT => {
                self.reboots += 1;
                self.sync();
            },
            _ => self.reply(&[INSYNC, INVALID]),
        }
    }

    fn poll(&mut self) -> usize {
        if self.erasing {
            self.erase_polls += 1;
            if let Some(limit) = self.config.erase_checks {
                if self.erase_polls > limit {
                    self.erasing = false;
                    self.sync();
                }
            }
        }
        let release = if self.config.fragment_seed.is_some() {
            (self.next_random() % 7) as usize
        } else {
            1
        };
        for _ in 0..release {
            match self.pending.pop_front() {
                Some(b) => self.rx.push_back(b),
                None => break,
            }
        }
        self.rx.len()
    }

    fn next_random(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state();
        if state.rx.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for b in buf.iter_mut().take(n) {
            *b = state.rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state();
        if !state.open {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"));
        }
        state.handle(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for SimPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        Ok(self.state().poll())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = self.state();
        state.rx.clear();
        state.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state().open = false;
        Ok(())
    }
}

/// Deliver notifications the way the session driver would, without sleeping.
///
/// Returns the number of rounds it took. Panics if the upload does not finish
/// within `max_rounds`.
pub fn pump<P: Port>(uploader: &mut Uploader<P>, events: &mut Vec<UploadEvent>, max_rounds: usize) -> usize {
    for round in 0..max_rounds {
        if uploader.is_finished() {
            return round;
        }
        uploader.on_data_arrived(events);
        if uploader.erase_timer_active() {
            uploader.on_erase_tick(events);
        }
    }
    assert!(uploader.is_finished(), "upload still in {:?}", uploader.state());
    max_rounds
}

/// Image of `len` bytes with a recognisable pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8)
        .collect()
}
