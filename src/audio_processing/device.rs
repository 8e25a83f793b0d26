//! What the playback runtime needs from an audio output driver.

use std::thread::JoinHandle;

use thiserror::Error;

use super::engine::{Destination, FrameFormat, SampleFormat};

/// Driver failure with the driver's own diagnostic code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{context}: {message} (code {code})")]
pub struct DeviceError {
    pub context: String,
    pub code: i32,
    pub message: String,
}

impl DeviceError {
    pub fn new(context: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: usize,
    pub sample_format: SampleFormat,
    /// frames the driver should ask for per callback
    pub frames_per_buffer: usize,
}

impl StreamParams {
    pub fn new(sample_rate: u32, format: FrameFormat, frames_per_buffer: usize) -> Self {
        Self {
            sample_rate,
            channels: format.channels,
            sample_format: format.sample_format,
            frames_per_buffer,
        }
    }
}

/// Returned by the producer after each callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    /// play out what has been written, then stop calling
    Complete,
}

/// Callback run on the driver's thread: fill `Destination` with up to
/// `frame_capacity` frames. Returns frames written and whether to go on.
pub type Producer = Box<dyn FnMut(Destination<'_>, usize) -> (usize, CallbackResult) + Send>;

pub trait OutputDevice {
    type Stream: OutputStream;

    fn open(&mut self, params: &StreamParams, producer: Producer)
    -> Result<Self::Stream, DeviceError>;
}

/// An opened stream. Dropping it releases the device.
pub trait OutputStream {
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Let already-queued audio play out, then stop.
    fn stop(&mut self) -> Result<(), DeviceError>;
}

/// Join a stream's driver thread, then drain the device. A failed or
/// panicked thread is reported as is and the drain is skipped.
pub fn join_then_drain(
    worker: Option<JoinHandle<Result<(), DeviceError>>>,
    drain: impl FnOnce() -> Result<(), DeviceError>,
) -> Result<(), DeviceError> {
    if let Some(worker) = worker {
        worker
            .join()
            .unwrap_or_else(|_| Err(DeviceError::new("playback thread", -1, "panicked")))?;
    }
    drain()
}
