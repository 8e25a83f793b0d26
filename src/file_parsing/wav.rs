//! RIFF/WAVE header decoding and sample-region loading.
//!
//! Only the first [`HEADER_PREFIX_LEN`] bytes of a file are scanned for the
//! `fmt ` and `data` chunks; the sample payload itself may extend past them.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use super::decode_helpers::{
    AudioStreamDescriptor, DecodeError, DecodeResult, SampleBuffer, id_str, malformed, read_id,
    u16_le, u32_le,
};

pub const HEADER_PREFIX_LEN: usize = 1024;

const RIFF: &[u8; 4] = b"RIFF";
const WAVE: &[u8; 4] = b"WAVE";
const FMT: &[u8; 4] = b"fmt ";
const DATA: &[u8; 4] = b"data";

// chunk id + chunk length
const CHUNK_HEADER_LEN: usize = 8;
const MIN_FMT_LEN: u32 = 16;
// cbSize, valid bits, channel mask, then the sub-format GUID
const EXTENSIBLE_SUBFORMAT_OFFSET: usize = 24;

// format codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatCode {
    WaveFormatPcm = 0x0001,
    WaveFormatIeeeFloat = 0x0003,
    WaveFormatAlaw = 0x0006,
    WaveFormatMulaw = 0x0007,
    WaveFormatExtensible = 0xFFFE,
}

impl FormatCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::WaveFormatPcm),
            0x0003 => Some(Self::WaveFormatIeeeFloat),
            0x0006 => Some(Self::WaveFormatAlaw),
            0x0007 => Some(Self::WaveFormatMulaw),
            0xFFFE => Some(Self::WaveFormatExtensible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FmtChunk {
    channel_count: u16,
    sample_rate: u32,
    bit_depth: u16,
}

/// Decode the header found in `prefix`, which should hold at least the
/// first [`HEADER_PREFIX_LEN`] bytes of the file (or the whole file if it
/// is shorter). Bytes past that limit are ignored.
pub fn parse_header(prefix: &[u8]) -> DecodeResult<AudioStreamDescriptor> {
    let prefix = &prefix[..prefix.len().min(HEADER_PREFIX_LEN)];

    if read_id(prefix, 0)? != *RIFF {
        return Err(malformed("missing RIFF container tag"));
    }
    if read_id(prefix, 8)? != *WAVE {
        return Err(malformed("missing WAVE format tag"));
    }

    let mut fmt: Option<FmtChunk> = None;
    let mut pos: usize = 12;

    loop {
        if pos.saturating_add(CHUNK_HEADER_LEN) > prefix.len() {
            return Err(malformed(format!(
                "no data chunk within the first {} bytes",
                prefix.len()
            )));
        }

        let id = read_id(prefix, pos)?;
        let len = u32_le(prefix, pos + 4)?;
        let body = pos + CHUNK_HEADER_LEN;

        match &id {
            DATA => {
                let Some(fmt) = fmt else {
                    return Err(malformed("data chunk precedes fmt chunk"));
                };
                debug!(offset = body, length = len, "found data chunk");
                return Ok(AudioStreamDescriptor {
                    sample_rate: fmt.sample_rate,
                    channel_count: fmt.channel_count,
                    bit_depth: fmt.bit_depth,
                    data_byte_offset: body as u64,
                    data_byte_length: len as u64,
                });
            }
            FMT => {
                let chunk = parse_fmt(prefix, body, len)?;
                debug!(
                    channels = chunk.channel_count,
                    sample_rate = chunk.sample_rate,
                    bits_per_sample = chunk.bit_depth,
                    "parsed fmt chunk"
                );
                fmt = Some(chunk);
            }
            other => {
                debug!(id = %id_str(other), length = len, "skipping chunk");
            }
        }

        // chunks are word aligned
        pos = usize::try_from(len)
            .ok()
            .and_then(|len| len.checked_add(len & 1))
            .and_then(|padded| body.checked_add(padded))
            .ok_or_else(|| malformed("chunk length overflows"))?;
    }
}

fn parse_fmt(prefix: &[u8], body: usize, len: u32) -> DecodeResult<FmtChunk> {
    if len < MIN_FMT_LEN {
        return Err(malformed(format!("fmt chunk too short ({len} bytes)")));
    }

    let code = u16_le(prefix, body)?;
    let channel_count = u16_le(prefix, body + 2)?;
    let sample_rate = u32_le(prefix, body + 4)?;
    let block_align = u16_le(prefix, body + 12)?;
    let bit_depth = u16_le(prefix, body + 14)?;

    match FormatCode::from_u16(code) {
        Some(FormatCode::WaveFormatPcm) => {}
        Some(FormatCode::WaveFormatExtensible) => {
            // the first two bytes of the sub-format GUID hold the real code
            let sub_code = u16_le(prefix, body + EXTENSIBLE_SUBFORMAT_OFFSET)?;
            if sub_code != FormatCode::WaveFormatPcm as u16 {
                return Err(malformed(format!(
                    "extensible sub-format {sub_code:#06x} is not linear PCM"
                )));
            }
        }
        Some(other) => {
            return Err(malformed(format!("{other:?} is not linear PCM")));
        }
        None => {
            return Err(malformed(format!("unrecognized format code {code:#06x}")));
        }
    }

    if !matches!(bit_depth, 8 | 16) || !matches!(channel_count, 1 | 2) {
        return Err(DecodeError::UnsupportedFormat {
            bit_depth,
            channel_count,
        });
    }

    let expected_align = channel_count * (bit_depth / 8);
    if block_align != expected_align {
        return Err(malformed(format!(
            "block align {block_align} does not match {channel_count} x {bit_depth}-bit frames"
        )));
    }

    if sample_rate == 0 {
        return Err(malformed("sample rate is zero"));
    }

    Ok(FmtChunk {
        channel_count,
        sample_rate,
        bit_depth,
    })
}

fn check_region(descriptor: &AudioStreamDescriptor, file_len: u64) -> DecodeResult<()> {
    let end = descriptor
        .data_byte_offset
        .checked_add(descriptor.data_byte_length)
        .ok_or_else(|| malformed("data region overflows"))?;

    if end > file_len {
        return Err(malformed(format!(
            "data chunk claims {} bytes at offset {} but file is {} bytes",
            descriptor.data_byte_length, descriptor.data_byte_offset, file_len
        )));
    }

    Ok(())
}

/// Decode a complete in-memory WAV file and copy out its sample region.
pub fn decode_bytes(file: &[u8]) -> DecodeResult<(AudioStreamDescriptor, SampleBuffer)> {
    let descriptor = parse_header(file)?;
    check_region(&descriptor, file.len() as u64)?;

    let region = descriptor.data_range()?;
    let samples = file
        .get(region)
        .ok_or_else(|| malformed("sample region runs past the end of the file"))?;
    Ok((descriptor, SampleBuffer::new(samples.to_vec())))
}

/// Open `path`, decode its header and load the sample region into memory.
pub fn load(path: impl AsRef<Path>) -> DecodeResult<(AudioStreamDescriptor, SampleBuffer)> {
    let path = path.as_ref();
    let unavailable = |source: std::io::Error| DecodeError::FileUnavailable {
        path: path.to_path_buf(),
        source,
    };

    let mut f = File::open(path).map_err(unavailable)?;
    let file_len = f.metadata().map_err(unavailable)?.len();

    let mut prefix = Vec::with_capacity(HEADER_PREFIX_LEN);
    f.by_ref()
        .take(HEADER_PREFIX_LEN as u64)
        .read_to_end(&mut prefix)
        .map_err(unavailable)?;

    let descriptor = parse_header(&prefix)?;
    check_region(&descriptor, file_len)?;

    let mut samples = vec![0u8; descriptor.data_range()?.len()];
    f.seek(SeekFrom::Start(descriptor.data_byte_offset))
        .map_err(unavailable)?;
    f.read_exact(&mut samples).map_err(unavailable)?;

    debug!(
        path = %path.display(),
        bytes = samples.len(),
        frames = descriptor.total_frames(),
        "loaded sample region"
    );

    Ok((descriptor, SampleBuffer::new(samples)))
}
