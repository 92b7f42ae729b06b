//! CRC32 as computed by the PX4 bootloader.
//!
//! Reflected polynomial `0xEDB88320` with a 256-entry table, processed one
//! byte at a time. The bootloader starts from state `0` and applies no final
//! XOR, so [`crc32`] is *not* the zlib checksum of the same data. The zlib
//! value can still be obtained from [`crc32_update`] by seeding with
//! `0xFFFF_FFFF` and inverting the result.

/// Reflected CRC-32 polynomial.
pub const CRC32_POLY: u32 = 0xEDB8_8320;

/// Precomputed lookup table.
pub static CRC32_TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        #[allow(clippy::cast_possible_truncation)]
        let mut c = i as u32;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 != 0 {
                CRC32_POLY ^ (c >> 1)
            } else {
                c >> 1
            };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// Continue a CRC computation from `state` over `data`.
#[must_use]
pub fn crc32_update(mut state: u32, data: &[u8]) -> u32 {
    for &byte in data {
        state = CRC32_TABLE[((state ^ u32::from(byte)) & 0xFF) as usize] ^ (state >> 8);
    }
    state
}

/// Bootloader checksum of `data` (initial state 0, no final XOR).
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(0, data)
}

/// Incremental bootloader checksum.
///
/// Lets the verifier fold in the streamed image and then the `0xFF` fill up to
/// the device flash size without materializing the padded buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `data` into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        self.state = crc32_update(self.state, data);
    }

    /// Fold `count` copies of `byte` into the checksum.
    pub fn update_fill(&mut self, byte: u8, count: usize) {
        let chunk = [byte; 64];
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            self.update(&chunk[..n]);
            remaining -= n;
        }
    }

    /// Current checksum value.
    pub fn value(&self) -> u32 {
        self.state
    }
}
