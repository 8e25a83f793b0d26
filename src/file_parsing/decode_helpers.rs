use std::io;
use std::ops::{BitOr, Range, Shl};
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot read '{}': {source}", path.display())]
    FileUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Well-formed PCM, but a width/channel pairing the engine cannot stream.
    #[error("unsupported format: {bit_depth}-bit, {channel_count} channel(s)")]
    UnsupportedFormat { bit_depth: u16, channel_count: u16 },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

pub(crate) fn malformed(msg: impl Into<String>) -> DecodeError {
    DecodeError::MalformedHeader(msg.into())
}

/// Decoded description of a WAV stream and where its samples live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamDescriptor {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub bit_depth: u16,
    pub data_byte_offset: u64,
    pub data_byte_length: u64,
}

impl AudioStreamDescriptor {
    pub fn bytes_per_frame(&self) -> usize {
        self.channel_count as usize * (self.bit_depth as usize / 8)
    }

    pub fn total_frames(&self) -> u64 {
        match self.bytes_per_frame() {
            0 => 0,
            bpf => self.data_byte_length / bpf as u64,
        }
    }

    /// Byte range of the sample region within the file, as memory offsets.
    pub fn data_range(&self) -> DecodeResult<Range<usize>> {
        let start = usize::try_from(self.data_byte_offset).ok();
        let len = usize::try_from(self.data_byte_length).ok();
        start
            .zip(len)
            .and_then(|(start, len)| Some(start..start.checked_add(len)?))
            .ok_or_else(|| {
                malformed(format!(
                    "sample region of {} bytes at {} is not addressable",
                    self.data_byte_length, self.data_byte_offset
                ))
            })
    }
}

/// Raw sample bytes copied out of the file's data chunk. Never mutated
/// once loaded; playback only moves a cursor over it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleBuffer {
    bytes: Vec<u8>,
}

impl SampleBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for SampleBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

// field readers for chunked headers
//
// parse `num` little-endian bytes starting at `at`
//
pub fn parse_bytes<T>(bytes: &[u8], at: usize, num: usize) -> DecodeResult<T>
where
    T: From<u8> + Shl<u32, Output = T> + BitOr<Output = T> + Copy + Default,
{
    let field = at
        .checked_add(num)
        .and_then(|end| bytes.get(at..end))
        .ok_or_else(|| {
            malformed(format!("header ends before byte {}", at.saturating_add(num)))
        })?;

    let mut value = T::default();
    for (i, &b) in field.iter().enumerate() {
        value = value | (T::from(b) << (i as u32 * 8));
    }

    Ok(value)
}

pub fn u16_le(bytes: &[u8], at: usize) -> DecodeResult<u16> {
    parse_bytes(bytes, at, 2)
}

pub fn u32_le(bytes: &[u8], at: usize) -> DecodeResult<u32> {
    parse_bytes(bytes, at, 4)
}

pub fn read_id(bytes: &[u8], at: usize) -> DecodeResult<[u8; 4]> {
    at.checked_add(4)
        .and_then(|end| bytes.get(at..end))
        .and_then(|id| id.try_into().ok())
        .ok_or_else(|| malformed(format!("header ends before chunk id at byte {at}")))
}

/// Printable form of a chunk id for logs and errors.
pub fn id_str(id: &[u8; 4]) -> String {
    id.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { char::from(b) } else { '?' })
        .collect()
}
