//! PX4 firmware document (`.px4`) loading.
//!
//! A `.px4` file is a JSON document describing one firmware image:
//!
//! ```text
//! {
//!     "board_id": 9,
//!     "image_size": 1048576,
//!     "description": "Firmware for the PX4FMUv2 board",
//!     "image": "eJzs3Xl8VNX5...",
//!     ...
//! }
//! ```
//!
//! `image` is the base64 text of a zlib stream. The loader prefixes the
//! decoded stream with `image_size` as a 4-byte big-endian length, inflates
//! the framed buffer, checks the inflated length against `image_size`, and
//! pads the result with `0xFF` up to a multiple of 4 bytes for flash writes.
//!
//! Fields are located textually rather than by a strict JSON parser, so
//! documents with trailing junk or unusual whitespace still load. Any missing
//! required field aborts loading.

use crate::error::{Error, Result};
use crate::protocol::crc::crc32;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use flate2::read::ZlibDecoder;
use log::{debug, info};
use std::fs;
use std::io::Read;
use std::path::Path;

/// Flash writes are performed in whole 32-bit words.
pub const IMAGE_ALIGNMENT: usize = 4;

/// Fill byte used for alignment and for unused flash.
pub const PAD_BYTE: u8 = 0xFF;

/// Upper bound on the preallocation taken from the size prefix.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

/// Optional descriptive fields of a `.px4` document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageMetadata {
    /// Short board summary (e.g. "PX4FMUv2").
    pub summary: Option<String>,
    /// Firmware version string.
    pub version: Option<String>,
    /// Source revision the image was built from.
    pub git_identity: Option<String>,
    /// Board hardware revision the image targets.
    pub board_revision: Option<u32>,
    /// Largest image the target board accepts.
    pub image_maxsize: Option<usize>,
}

/// A decoded, padded firmware image ready for upload.
///
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    board_id: u32,
    image_size: usize,
    description: String,
    metadata: ImageMetadata,
    data: Vec<u8>,
    crc: u32,
}

impl FirmwareImage {
    /// Load a firmware document from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        debug!("Loaded {} bytes from {}", bytes.len(), path.display());
        Self::from_document(&String::from_utf8_lossy(&bytes))
    }

    /// Decode a firmware document.
    pub fn from_document(doc: &str) -> Result<Self> {
        let board_id = u32_field(doc, "board_id")?;
        let image_size = usize_field(doc, "image_size")?;
        let description = string_field(doc, "description")?;
        let payload = string_field(doc, "image")?;

        let metadata = ImageMetadata {
            summary: optional_string_field(doc, "summary"),
            version: optional_string_field(doc, "version"),
            git_identity: optional_string_field(doc, "git_identity"),
            board_revision: optional_number_field(doc, "board_revision")
                .and_then(|v| u32::try_from(v).ok()),
            image_maxsize: optional_number_field(doc, "image_maxsize")
                .and_then(|v| usize::try_from(v).ok()),
        };

        let compressed = decode_base64(&payload)?;
        let declared = u32::try_from(image_size).map_err(|_| {
            Error::InvalidImage(format!("image_size {image_size} does not fit in 32 bits"))
        })?;

        let mut frame = Vec::with_capacity(4 + compressed.len());
        frame.write_u32::<BigEndian>(declared)?;
        frame.extend_from_slice(&compressed);

        let inflated = inflate_sized(&frame)?;
        info!(
            "Firmware size: {} expected {} bytes",
            inflated.len(),
            image_size
        );
        if inflated.len() != image_size {
            return Err(Error::ImageSizeMismatch {
                expected: image_size,
                actual: inflated.len(),
            });
        }

        let mut image = Self::from_raw(board_id, description, inflated);
        image.metadata = metadata;
        Ok(image)
    }

    /// Build an image from an already decompressed binary.
    pub fn from_raw(board_id: u32, description: impl Into<String>, mut data: Vec<u8>) -> Self {
        let image_size = data.len();
        pad_to_alignment(&mut data);
        let crc = crc32(&data);

        Self {
            board_id,
            image_size,
            description: description.into(),
            metadata: ImageMetadata::default(),
            data,
            crc,
        }
    }

    /// Board type this image is built for.
    pub fn board_id(&self) -> u32 {
        self.board_id
    }

    /// Declared (unpadded) image size.
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Optional document metadata.
    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    /// Padded image bytes; the length is a multiple of [`IMAGE_ALIGNMENT`].
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Padded image length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bootloader CRC32 over the padded image.
    pub fn crc(&self) -> u32 {
        self.crc
    }
}

/// Right-pad `data` with [`PAD_BYTE`] to a multiple of [`IMAGE_ALIGNMENT`].
pub fn pad_to_alignment(data: &mut Vec<u8>) {
    let rem = data.len() % IMAGE_ALIGNMENT;
    if rem != 0 {
        data.resize(data.len() + IMAGE_ALIGNMENT - rem, PAD_BYTE);
    }
}

/// Inflate a buffer framed as `len (u32 BE) || zlib stream`.
///
/// Output stops one byte past the prefixed length, so an oversized stream is
/// reported as longer than declared without being fully expanded. The caller
/// validates the real length.
pub fn inflate_sized(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 4 {
        return Err(Error::InvalidImage(
            "compressed frame shorter than its size prefix".into(),
        ));
    }

    let declared = BigEndian::read_u32(&frame[..4]);
    let mut out = Vec::with_capacity((declared as usize).min(MAX_PREALLOC));
    ZlibDecoder::new(&frame[4..])
        .take(u64::from(declared) + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::InvalidImage(format!("decompression failed: {e}")))?;
    Ok(out)
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(cleaned)
        .map_err(|e| Error::InvalidImage(format!("image payload is not valid base64: {e}")))
}

/// Locate the raw text following `"key":`, using the last occurrence.
fn find_field<'a>(doc: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("\"{key}\"");
    doc.rmatch_indices(&marker)
        .find_map(|(pos, _)| {
            doc[pos + marker.len()..]
                .trim_start()
                .strip_prefix(':')
                .map(str::trim_start)
        })
}

fn parse_number(raw: &str) -> Option<u64> {
    let end = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    raw[..end].parse().ok()
}

/// Read a string value, handling the JSON escapes a description may carry.
fn parse_string(raw: &str) -> Option<String> {
    let body = raw.strip_prefix('"')?;
    let mut out = String::new();
    let mut chars = body.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                other => out.push(other),
            },
            c => out.push(c),
        }
    }

    // Unterminated string
    None
}

fn number_field(doc: &str, key: &str) -> Result<u64> {
    let raw = find_field(doc, key)
        .ok_or_else(|| Error::InvalidImage(format!("missing field `{key}`")))?;
    parse_number(raw).ok_or_else(|| Error::InvalidImage(format!("field `{key}` is not a number")))
}

fn u32_field(doc: &str, key: &str) -> Result<u32> {
    let value = number_field(doc, key)?;
    u32::try_from(value).map_err(|_| Error::InvalidImage(format!("field `{key}` out of range")))
}

fn usize_field(doc: &str, key: &str) -> Result<usize> {
    let value = number_field(doc, key)?;
    usize::try_from(value).map_err(|_| Error::InvalidImage(format!("field `{key}` out of range")))
}

fn string_field(doc: &str, key: &str) -> Result<String> {
    let raw = find_field(doc, key)
        .ok_or_else(|| Error::InvalidImage(format!("missing field `{key}`")))?;
    parse_string(raw).ok_or_else(|| Error::InvalidImage(format!("field `{key}` is not a string")))
}

fn optional_string_field(doc: &str, key: &str) -> Option<String> {
    find_field(doc, key).and_then(parse_string)
}

fn optional_number_field(doc: &str, key: &str) -> Option<u64> {
    find_field(doc, key).and_then(parse_number)
}
