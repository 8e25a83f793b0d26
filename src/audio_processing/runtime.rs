use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, RecvTimeoutError},
};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::audio_processing::{
    device::{CallbackResult, DeviceError, OutputDevice, OutputStream, Producer, StreamParams},
    engine::{Destination, SessionState, StreamingEngine},
};
use crate::file_parsing::decode_helpers::{AudioStreamDescriptor, DecodeError, SampleBuffer};

// how often the completion wait looks at the interrupt flag
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("audio device error: {0}")]
    Device(#[from] DeviceError),

    /// The driver stopped calling back before the samples ran out.
    #[error("stream ended after {frames_played} of {total_frames} frames")]
    Aborted { frames_played: u64, total_frames: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub frames_played: u64,
    pub total_frames: u64,
    pub elapsed: Duration,
    pub interrupted: bool,
    pub final_state: SessionState,
}

// why the completion wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    RanDry,
    Interrupted,
    Released,
}

// the engine lives inside the producer while the driver owns it, and is
// sent back to the runtime when the driver drops the producer
struct EngineLease {
    engine: Option<StreamingEngine>,
    home: mpsc::Sender<StreamingEngine>,
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            let _ = self.home.send(engine);
        }
    }
}

/// Stream `samples` to a stream opened on `device` and block until the
/// engine runs dry or `interrupt` is raised. The stream is stopped
/// (drained) before returning.
pub fn play<D: OutputDevice>(
    device: &mut D,
    descriptor: &AudioStreamDescriptor,
    samples: SampleBuffer,
    frames_per_buffer: usize,
    interrupt: &AtomicBool,
) -> Result<PlaybackReport, PlaybackError> {
    // nothing reaches the driver unless the engine accepted the format
    let engine = StreamingEngine::new(descriptor, samples)?;
    let params = StreamParams::new(descriptor.sample_rate, engine.format(), frames_per_buffer);
    let total_frames = engine.frames_remaining() as u64;

    let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
    let (home_tx, home_rx) = mpsc::channel();
    let mut lease = EngineLease {
        engine: Some(engine),
        home: home_tx,
    };

    let producer: Producer = Box::new(move |dest: Destination<'_>, frame_capacity: usize| {
        let Some(engine) = lease.engine.as_mut() else {
            return (0, CallbackResult::Complete);
        };
        let p = engine.produce(dest, frame_capacity);

        if p.exhausted {
            // bounded and pre-sized; never blocks the driver thread
            let _ = done_tx.try_send(());
            (p.frames_written, CallbackResult::Complete)
        } else {
            (p.frames_written, CallbackResult::Continue)
        }
    });

    let mut stream = device.open(&params, producer)?;
    info!(
        sample_rate = params.sample_rate,
        channels = params.channels,
        format = ?params.sample_format,
        frames = total_frames,
        "starting playback"
    );

    let started = Instant::now();
    stream.start()?;

    let outcome = loop {
        match done_rx.recv_timeout(INTERRUPT_POLL) {
            Ok(()) => break WaitOutcome::RanDry,
            Err(RecvTimeoutError::Disconnected) => break WaitOutcome::Released,
            Err(RecvTimeoutError::Timeout) => {
                if interrupt.load(Ordering::Relaxed) {
                    break WaitOutcome::Interrupted;
                }
            }
        }
    };

    stream.stop()?;
    drop(stream);

    // a closed stream has dropped its producer
    let mut engine = home_rx.try_recv().map_err(|_| {
        DeviceError::new("close", -1, "producer still held after the stream closed")
    })?;
    engine.finish();
    let frames_played = engine.frames_played();

    if outcome == WaitOutcome::Released && frames_played < total_frames {
        warn!(
            played = frames_played,
            total = total_frames,
            "device released the producer before the stream ran dry"
        );
        return Err(PlaybackError::Aborted {
            frames_played,
            total_frames,
        });
    }

    let report = PlaybackReport {
        frames_played,
        total_frames,
        elapsed: started.elapsed(),
        interrupted: outcome == WaitOutcome::Interrupted,
        final_state: engine.state(),
    };
    info!(
        played = report.frames_played,
        total = report.total_frames,
        interrupted = report.interrupted,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "playback finished"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_processing::engine::SampleFormat;
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Behaviour {
        /// pull until the producer completes
        Drain,
        FailOpen,
        /// start, but never call the producer
        Idle,
        /// call the producer this many times, then drop it
        GiveUpAfter(usize),
        /// keep the producer alive past the stream
        Hoard,
    }

    /// Pulls from the producer on its own thread until told to stop.
    struct FakeDevice {
        behaviour: Behaviour,
        opened: Option<StreamParams>,
        captured: Arc<Mutex<Vec<u8>>>,
        hoard: Arc<Mutex<Option<Producer>>>,
    }

    impl FakeDevice {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                opened: None,
                captured: Arc::new(Mutex::new(Vec::new())),
                hoard: Arc::new(Mutex::new(None)),
            }
        }
    }

    struct FakeStream {
        behaviour: Behaviour,
        params: StreamParams,
        producer: Option<Producer>,
        captured: Arc<Mutex<Vec<u8>>>,
        hoard: Arc<Mutex<Option<Producer>>>,
        worker: Option<JoinHandle<()>>,
        halt: Arc<AtomicBool>,
    }

    impl OutputDevice for FakeDevice {
        type Stream = FakeStream;

        fn open(
            &mut self,
            params: &StreamParams,
            producer: Producer,
        ) -> Result<FakeStream, DeviceError> {
            if self.behaviour == Behaviour::FailOpen {
                return Err(DeviceError::new("open", -19, "no such device"));
            }
            self.opened = Some(*params);
            Ok(FakeStream {
                behaviour: self.behaviour,
                params: *params,
                producer: Some(producer),
                captured: Arc::clone(&self.captured),
                hoard: Arc::clone(&self.hoard),
                worker: None,
                halt: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    impl OutputStream for FakeStream {
        fn start(&mut self) -> Result<(), DeviceError> {
            match self.behaviour {
                Behaviour::Idle => return Ok(()),
                Behaviour::Hoard => {
                    *self.hoard.lock().unwrap() = self.producer.take();
                    return Ok(());
                }
                _ => {}
            }

            let mut producer = self
                .producer
                .take()
                .ok_or_else(|| DeviceError::new("start", -16, "busy"))?;
            let captured = Arc::clone(&self.captured);
            let halt = Arc::clone(&self.halt);
            let frames = self.params.frames_per_buffer;
            let limit = match self.behaviour {
                Behaviour::GiveUpAfter(calls) => calls,
                _ => usize::MAX,
            };
            assert_eq!(self.params.sample_format, SampleFormat::U8);

            self.worker = Some(thread::spawn(move || {
                let mut period = vec![0u8; frames];
                for _ in 0..limit {
                    if halt.load(Ordering::Relaxed) {
                        break;
                    }
                    let (written, result) = producer(Destination::U8(&mut period), frames);
                    captured.lock().unwrap().extend_from_slice(&period[..written]);
                    if result == CallbackResult::Complete {
                        break;
                    }
                }
            }));
            Ok(())
        }

        fn stop(&mut self) -> Result<(), DeviceError> {
            self.halt.store(true, Ordering::Relaxed);
            if let Some(worker) = self.worker.take() {
                worker.join().unwrap();
            }
            Ok(())
        }
    }

    fn mono8(bytes: &[u8]) -> (AudioStreamDescriptor, SampleBuffer) {
        let d = AudioStreamDescriptor {
            sample_rate: 8000,
            channel_count: 1,
            bit_depth: 8,
            data_byte_offset: 44,
            data_byte_length: bytes.len() as u64,
        };
        (d, SampleBuffer::new(bytes.to_vec()))
    }

    #[test]
    fn plays_to_completion() {
        let source: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let (d, samples) = mono8(&source);
        let mut device = FakeDevice::new(Behaviour::Drain);

        let report = play(&mut device, &d, samples, 64, &AtomicBool::new(false)).unwrap();

        assert_eq!(report.frames_played, 1000);
        assert_eq!(report.total_frames, 1000);
        assert!(!report.interrupted);
        assert_eq!(report.final_state, SessionState::Stopped);
        assert_eq!(*device.captured.lock().unwrap(), source);

        let params = device.opened.unwrap();
        assert_eq!(params.frames_per_buffer, 64);
        assert_eq!(params.channels, 1);
        assert_eq!(params.sample_rate, 8000);
    }

    #[test]
    fn interrupted_before_any_callback_reports_the_engine() {
        let (d, samples) = mono8(&[7; 100]);
        let mut device = FakeDevice::new(Behaviour::Idle);

        let report = play(&mut device, &d, samples, 16, &AtomicBool::new(true)).unwrap();

        assert!(report.interrupted);
        assert_eq!(report.frames_played, 0);
        assert_eq!(report.total_frames, 100);
        assert_eq!(report.final_state, SessionState::Stopped);
        assert!(device.captured.lock().unwrap().is_empty());
    }

    #[test]
    fn early_release_is_an_abort() {
        let (d, samples) = mono8(&[1; 100]);
        let mut device = FakeDevice::new(Behaviour::GiveUpAfter(1));

        let err = play(&mut device, &d, samples, 2, &AtomicBool::new(false)).unwrap_err();

        match err {
            PlaybackError::Aborted {
                frames_played,
                total_frames,
            } => assert_eq!((frames_played, total_frames), (2, 100)),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(device.captured.lock().unwrap().len(), 2);
    }

    #[test]
    fn release_after_last_frame_is_not_an_abort() {
        // all 8 frames go out in two full periods; the device never makes
        // the call that would report exhaustion
        let (d, samples) = mono8(&[3; 8]);
        let mut device = FakeDevice::new(Behaviour::GiveUpAfter(2));

        let report = play(&mut device, &d, samples, 4, &AtomicBool::new(false)).unwrap();

        assert_eq!(report.frames_played, 8);
        assert!(!report.interrupted);
        assert_eq!(report.final_state, SessionState::Stopped);
    }

    #[test]
    fn producer_outliving_the_stream_is_a_device_error() {
        let (d, samples) = mono8(&[0; 32]);
        let mut device = FakeDevice::new(Behaviour::Hoard);

        let err = play(&mut device, &d, samples, 8, &AtomicBool::new(true)).unwrap_err();

        assert!(matches!(err, PlaybackError::Device(ref e) if e.context == "close"), "{err}");
        assert!(device.hoard.lock().unwrap().is_some());
    }

    #[test]
    fn open_failure_is_reported() {
        let (d, samples) = mono8(&[1, 2, 3]);
        let mut device = FakeDevice::new(Behaviour::FailOpen);

        let err = play(&mut device, &d, samples, 16, &AtomicBool::new(false)).unwrap_err();

        match err {
            PlaybackError::Device(e) => assert_eq!(e.code, -19),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unsupported_format_never_opens_device() {
        let d = AudioStreamDescriptor {
            sample_rate: 8000,
            channel_count: 4,
            bit_depth: 8,
            data_byte_offset: 44,
            data_byte_length: 8,
        };
        let mut device = FakeDevice::new(Behaviour::Drain);

        let err = play(&mut device, &d, SampleBuffer::new(vec![0; 8]), 16, &AtomicBool::new(false));

        assert!(matches!(err, Err(PlaybackError::Decode(DecodeError::UnsupportedFormat { .. }))));
        assert!(device.opened.is_none());
    }
}
