use crate::file_parsing::decode_helpers::{
    AudioStreamDescriptor, DecodeError, DecodeResult, SampleBuffer,
};

/// Sample format handed to the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// unsigned 8-bit, silence at 0x80
    U8,
    /// signed 16-bit
    I16,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::I16 => 2,
        }
    }
}

/// Layout of one interleaved frame, taken from the decoded
/// (bit depth, channel count) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub sample_format: SampleFormat,
    pub channels: usize,
}

impl FrameFormat {
    pub fn from_descriptor(descriptor: &AudioStreamDescriptor) -> DecodeResult<Self> {
        let sample_format = match descriptor.bit_depth {
            8 => SampleFormat::U8,
            16 => SampleFormat::I16,
            _ => return Err(unsupported(descriptor)),
        };
        let channels = match descriptor.channel_count {
            1 | 2 => descriptor.channel_count as usize,
            _ => return Err(unsupported(descriptor)),
        };

        Ok(Self {
            sample_format,
            channels,
        })
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels * self.sample_format.bytes_per_sample()
    }
}

fn unsupported(descriptor: &AudioStreamDescriptor) -> DecodeError {
    DecodeError::UnsupportedFormat {
        bit_depth: descriptor.bit_depth,
        channel_count: descriptor.channel_count,
    }
}

/// Interleaved output slots supplied by the driver for one callback.
#[derive(Debug)]
pub enum Destination<'a> {
    U8(&'a mut [u8]),
    I16(&'a mut [i16]),
}

impl Destination<'_> {
    pub fn sample_format(&self) -> SampleFormat {
        match self {
            Destination::U8(_) => SampleFormat::U8,
            Destination::I16(_) => SampleFormat::I16,
        }
    }

    /// Number of individual samples (not frames) the slice can hold.
    pub fn len(&self) -> usize {
        match self {
            Destination::U8(out) => out.len(),
            Destination::I16(out) => out.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write silence into every sample from `from` onwards.
    pub fn fill_silence(&mut self, from: usize) {
        match self {
            Destination::U8(out) => {
                if let Some(tail) = out.get_mut(from..) {
                    tail.fill(0x80);
                }
            }
            Destination::I16(out) => {
                if let Some(tail) = out.get_mut(from..) {
                    tail.fill(0);
                }
            }
        }
    }
}

/// Read position over a [`SampleBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingCursor {
    pub remaining_bytes: usize,
    pub read_position: usize,
}

impl StreamingCursor {
    pub fn new(data_byte_length: usize) -> Self {
        Self {
            remaining_bytes: data_byte_length,
            read_position: 0,
        }
    }

    pub fn is_exhausted(&self, format: &FrameFormat) -> bool {
        self.remaining_bytes < format.bytes_per_frame()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Production {
    pub frames_written: usize,
    pub exhausted: bool,
}

/// Copy up to `frame_capacity` frames from `samples` at the cursor into
/// `dest`, converting to the output sample type. Never allocates or
/// blocks; unwritten slots past the returned frame count are untouched.
pub fn produce(
    dest: &mut Destination<'_>,
    frame_capacity: usize,
    format: &FrameFormat,
    samples: &[u8],
    cursor: &mut StreamingCursor,
) -> Production {
    let bpf = format.bytes_per_frame();

    // a mismatched buffer is a driver bug; stop rather than play garbage
    let needed = frame_capacity.saturating_mul(format.channels);
    if dest.sample_format() != format.sample_format || dest.len() < needed {
        return Production {
            frames_written: 0,
            exhausted: true,
        };
    }

    // never trust the cursor past the end of the buffer
    let in_buffer = samples.len().saturating_sub(cursor.read_position);
    let frames_available = cursor.remaining_bytes.min(in_buffer) / bpf;
    let n = frame_capacity.min(frames_available);

    let start = cursor.read_position;
    let src = samples.get(start..start + n * bpf).unwrap_or_default();
    let out_len = n * format.channels;

    match dest {
        Destination::U8(out) => out[..out_len].copy_from_slice(src),
        Destination::I16(out) => {
            for (slot, bytes) in out[..out_len].iter_mut().zip(src.chunks_exact(2)) {
                *slot = i16::from_le_bytes([bytes[0], bytes[1]]);
            }
        }
    }

    cursor.read_position += n * bpf;
    cursor.remaining_bytes -= n * bpf;

    Production {
        frames_written: n,
        exhausted: n < frame_capacity,
    }
}

/// Per-session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// samples loaded, no callback yet
    Priming,
    Streaming,
    /// the last audio-bearing callback has been served
    Draining,
    Stopped,
}

/// Owns one session's samples and cursor and serves driver callbacks.
#[derive(Debug)]
pub struct StreamingEngine {
    format: FrameFormat,
    samples: SampleBuffer,
    cursor: StreamingCursor,
    state: SessionState,
    frames_played: u64,
}

impl StreamingEngine {
    /// Fails fast on a (bit depth, channel count) pair it cannot stream.
    pub fn new(descriptor: &AudioStreamDescriptor, samples: SampleBuffer) -> DecodeResult<Self> {
        let format = FrameFormat::from_descriptor(descriptor)?;
        // a length past the address space cannot be backed by the buffer anyway
        let length = usize::try_from(descriptor.data_byte_length)
            .unwrap_or(usize::MAX)
            .min(samples.len());

        Ok(Self {
            format,
            samples,
            cursor: StreamingCursor::new(length),
            state: SessionState::Priming,
            frames_played: 0,
        })
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cursor(&self) -> StreamingCursor {
        self.cursor
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played
    }

    pub fn frames_remaining(&self) -> usize {
        self.cursor.remaining_bytes / self.format.bytes_per_frame()
    }

    /// Serve one driver request. Once a call has reported exhaustion every
    /// later call writes nothing and reports exhaustion again.
    pub fn produce(&mut self, mut dest: Destination<'_>, frame_capacity: usize) -> Production {
        if matches!(self.state, SessionState::Draining | SessionState::Stopped) {
            return Production {
                frames_written: 0,
                exhausted: true,
            };
        }

        let result = produce(
            &mut dest,
            frame_capacity,
            &self.format,
            self.samples.as_bytes(),
            &mut self.cursor,
        );

        self.frames_played += result.frames_written as u64;
        self.state = if result.exhausted {
            SessionState::Draining
        } else {
            SessionState::Streaming
        };

        result
    }

    /// The driver has drained and will not call again.
    pub fn finish(&mut self) {
        self.state = SessionState::Stopped;
    }
}
