//! Stream uncompressed PCM WAV files to an audio output device.
//!
//! [`file_parsing::wav`] decodes the RIFF/WAVE header and loads the sample
//! region; [`audio_processing::engine`] feeds those samples to the device
//! callback one request at a time; [`audio_processing::runtime::play`] ties
//! the two to an [`OutputDevice`].

pub mod audio_processing;
pub mod file_parsing;

pub use audio_processing::{
    device::{CallbackResult, DeviceError, OutputDevice, OutputStream, Producer, StreamParams},
    engine::{
        Destination, FrameFormat, Production, SampleFormat, SessionState, StreamingCursor,
        StreamingEngine,
    },
    runtime::{PlaybackError, PlaybackReport, play},
};
pub use file_parsing::decode_helpers::{
    AudioStreamDescriptor, DecodeError, DecodeResult, SampleBuffer,
};
