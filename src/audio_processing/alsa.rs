//! ALSA playback through the mmap interleaved interface.
//!
//! The fill loop runs on its own thread and hands each mmap area to the
//! producer as a typed [`Destination`], one period at a time.

use alsa_sys::*;
use libc::{EAGAIN, EBUSY, EINVAL, EPIPE, c_int};
use std::{
    ffi::{CStr, CString},
    ptr, slice,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};

use crate::audio_processing::{
    device::{
        CallbackResult, DeviceError, OutputDevice, OutputStream, Producer, StreamParams,
        join_then_drain,
    },
    engine::{Destination, SampleFormat},
};

// ms to block in snd_pcm_wait before looking at the run flag again
const WAIT_MS: c_int = 100;

pub struct AlsaDevice {
    name: String,
    periods: usize,
}

impl AlsaDevice {
    /// `name` is an ALSA PCM name such as `default` or `hw:0,0`;
    /// `periods` is how many callback-sized periods the hardware buffer holds.
    pub fn new(name: impl Into<String>, periods: usize) -> Self {
        Self {
            name: name.into(),
            periods: periods.max(2),
        }
    }
}

#[derive(Clone, Copy)]
struct PcmHandle(*mut snd_pcm_t);

// the handle is only touched by the fill thread while it runs, and by
// the owning stream after that thread has been joined
unsafe impl Send for PcmHandle {}

#[derive(Debug, Clone, Copy)]
struct Layout {
    channels: usize,
    sample_format: SampleFormat,
    period_size: snd_pcm_uframes_t,
}

pub struct AlsaStream {
    pcm: PcmHandle,
    layout: Layout,
    producer: Option<Producer>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<(), DeviceError>>>,
}

impl AlsaStream {
    /// Period size the hardware settled on.
    pub fn period_size(&self) -> usize {
        self.layout.period_size as usize
    }
}

impl OutputDevice for AlsaDevice {
    type Stream = AlsaStream;

    fn open(
        &mut self,
        params: &StreamParams,
        producer: Producer,
    ) -> Result<AlsaStream, DeviceError> {
        let dev = CString::new(self.name.as_str())
            .map_err(|_| DeviceError::new("snd_pcm_open", -EINVAL, "device name contains NUL"))?;

        let mut handle: *mut snd_pcm_t = ptr::null_mut();
        check_code(
            unsafe { snd_pcm_open(&mut handle, dev.as_ptr(), SND_PCM_STREAM_PLAYBACK, 0) },
            "snd_pcm_open",
        )?;
        let pcm = PcmHandle(handle);

        let period_size = match configure(pcm, params, self.periods) {
            Ok(size) => size,
            Err(error) => {
                unsafe { snd_pcm_close(handle) };
                return Err(error);
            }
        };

        debug!(
            device = %self.name,
            period_size,
            periods = self.periods,
            "opened ALSA stream"
        );

        Ok(AlsaStream {
            pcm,
            layout: Layout {
                channels: params.channels,
                sample_format: params.sample_format,
                period_size,
            },
            producer: Some(producer),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }
}

impl OutputStream for AlsaStream {
    fn start(&mut self) -> Result<(), DeviceError> {
        let producer = self
            .producer
            .take()
            .ok_or_else(|| DeviceError::new("start", -EBUSY, "stream already started"))?;

        self.running.store(true, Ordering::Release);

        let pcm = self.pcm;
        let layout = self.layout;
        let running = Arc::clone(&self.running);
        let worker = thread::Builder::new()
            .name("wavstream-alsa".into())
            .spawn(move || fill_loop(pcm, producer, layout, running))
            .map_err(|e| {
                let code = -e.raw_os_error().unwrap_or(1);
                DeviceError::new("spawn playback thread", code, e.to_string())
            })?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.running.store(false, Ordering::Release);

        // play out whatever is queued, unless the fill thread already
        // left the PCM in a failed state
        let handle = self.pcm.0;
        join_then_drain(self.worker.take(), || {
            ensure_running(handle)?;
            check_code(unsafe { snd_pcm_drain(handle) }, "snd_pcm_drain")
        })
    }
}

impl Drop for AlsaStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        unsafe {
            snd_pcm_close(self.pcm.0);
        }
    }
}

// frees hw/sw param blocks however configure() returns
struct HwParams(*mut snd_pcm_hw_params_t);

impl Drop for HwParams {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { snd_pcm_hw_params_free(self.0) };
        }
    }
}

struct SwParams(*mut snd_pcm_sw_params_t);

impl Drop for SwParams {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { snd_pcm_sw_params_free(self.0) };
        }
    }
}

fn configure(
    pcm: PcmHandle,
    params: &StreamParams,
    periods: usize,
) -> Result<snd_pcm_uframes_t, DeviceError> {
    let handle = pcm.0;
    let format = match params.sample_format {
        SampleFormat::U8 => SND_PCM_FORMAT_U8,
        SampleFormat::I16 => SND_PCM_FORMAT_S16_LE,
    };

    unsafe {
        // config hardware
        let mut hw = HwParams(ptr::null_mut());
        check_code(snd_pcm_hw_params_malloc(&mut hw.0), "hw_params_malloc")?;
        check_code(snd_pcm_hw_params_any(handle, hw.0), "hw_params_any")?;

        check_code(
            snd_pcm_hw_params_set_access(handle, hw.0, SND_PCM_ACCESS_MMAP_INTERLEAVED),
            "set_access",
        )?;
        check_code(snd_pcm_hw_params_set_format(handle, hw.0, format), "set_format")?;
        check_code(
            snd_pcm_hw_params_set_channels(handle, hw.0, params.channels as u32),
            "set_channels",
        )?;
        check_code(
            snd_pcm_hw_params_set_rate(handle, hw.0, params.sample_rate, 0),
            "set_rate",
        )?;

        let mut period_size = params.frames_per_buffer as snd_pcm_uframes_t;
        check_code(
            snd_pcm_hw_params_set_period_size_near(handle, hw.0, &mut period_size, ptr::null_mut()),
            "set_period_size",
        )?;

        let mut buffer_size = period_size * periods as snd_pcm_uframes_t;
        check_code(
            snd_pcm_hw_params_set_buffer_size_near(handle, hw.0, &mut buffer_size),
            "set_buffer_size",
        )?;

        check_code(snd_pcm_hw_params(handle, hw.0), "snd_pcm_hw_params")?;
        drop(hw);

        // config software params
        let mut sw = SwParams(ptr::null_mut());
        check_code(snd_pcm_sw_params_malloc(&mut sw.0), "sw_params_malloc")?;
        check_code(snd_pcm_sw_params_current(handle, sw.0), "sw_params_current")?;

        let mut boundary: snd_pcm_uframes_t = 0;
        check_code(snd_pcm_sw_params_get_boundary(sw.0, &mut boundary), "get_boundary")?;
        // underruns are recovered by the fill loop, never auto-stopped
        check_code(
            snd_pcm_sw_params_set_stop_threshold(handle, sw.0, boundary),
            "set_stop_threshold",
        )?;
        // start once one period is queued
        check_code(
            snd_pcm_sw_params_set_start_threshold(handle, sw.0, period_size),
            "set_start_threshold",
        )?;
        // wake when a period is available
        check_code(
            snd_pcm_sw_params_set_avail_min(handle, sw.0, period_size),
            "set_avail_min",
        )?;
        check_code(snd_pcm_sw_params(handle, sw.0), "snd_pcm_sw_params")?;
        drop(sw);

        // prepare device
        check_code(snd_pcm_prepare(handle), "snd_pcm_prepare")?;

        Ok(period_size)
    }
}

fn fill_loop(
    pcm: PcmHandle,
    mut producer: Producer,
    layout: Layout,
    running: Arc<AtomicBool>,
) -> Result<(), DeviceError> {
    let handle = pcm.0;

    while running.load(Ordering::Acquire) {
        let avail = unsafe { snd_pcm_avail_update(handle) };
        if avail < 0 {
            recover(handle, avail as c_int, "snd_pcm_avail_update")?;
            continue;
        }
        if (avail as snd_pcm_uframes_t) < layout.period_size {
            let r = unsafe { snd_pcm_wait(handle, WAIT_MS) };
            if r < 0 {
                recover(handle, r, "snd_pcm_wait")?;
            }
            continue;
        }

        // get remaining frames to write
        let mut remaining = avail as snd_pcm_uframes_t;

        while remaining > 0 {
            let mut areas: *const snd_pcm_channel_area_t = ptr::null();
            let mut offset: snd_pcm_uframes_t = 0;
            let mut frames: snd_pcm_uframes_t = remaining;

            let r = unsafe { snd_pcm_mmap_begin(handle, &mut areas, &mut offset, &mut frames) };
            if r == -EAGAIN {
                break; // hardware not ready
            }
            if r < 0 {
                recover(handle, r, "snd_pcm_mmap_begin")?;
                break;
            }

            // one callback per period at most
            let request = frames.min(layout.period_size);
            let (written, result) =
                producer(unsafe { destination(areas, offset, request, &layout) }, request as usize);

            if result == CallbackResult::Complete {
                // pad the final period so the tail plays as silence
                unsafe { destination(areas, offset, request, &layout) }
                    .fill_silence(written * layout.channels);
            }

            let committed = unsafe { snd_pcm_mmap_commit(handle, offset, request) };
            if committed < 0 {
                recover(handle, committed as c_int, "snd_pcm_mmap_commit")?;
                break;
            }

            if result == CallbackResult::Complete {
                return ensure_running(handle);
            }

            remaining = remaining.saturating_sub(committed as snd_pcm_uframes_t);
        }

        ensure_running(handle)?;
    }

    Ok(())
}

/// View the mmap area at `offset` as `frames` interleaved frames.
///
/// # Safety
/// `areas` must come from a successful `snd_pcm_mmap_begin` that granted at
/// least `frames` frames at `offset`, with the stream's negotiated layout.
unsafe fn destination<'a>(
    areas: *const snd_pcm_channel_area_t,
    offset: snd_pcm_uframes_t,
    frames: snd_pcm_uframes_t,
    layout: &Layout,
) -> Destination<'a> {
    unsafe {
        // interleaved: channel 0's area addresses the whole frame
        let area = &*areas;
        let bit_offset = area.first as usize + offset as usize * area.step as usize;
        let base = (area.addr as *mut u8).add(bit_offset / 8);
        let len = frames as usize * layout.channels;

        match layout.sample_format {
            SampleFormat::U8 => Destination::U8(slice::from_raw_parts_mut(base, len)),
            SampleFormat::I16 => {
                Destination::I16(slice::from_raw_parts_mut(base as *mut i16, len))
            }
        }
    }
}

fn ensure_running(handle: *mut snd_pcm_t) -> Result<(), DeviceError> {
    unsafe {
        if snd_pcm_state(handle) == SND_PCM_STATE_PREPARED {
            check_code(snd_pcm_start(handle), "snd_pcm_start")?;
        }
    }
    Ok(())
}

fn recover(handle: *mut snd_pcm_t, err: c_int, ctx: &str) -> Result<(), DeviceError> {
    if err == -EPIPE {
        warn!("{ctx}: underrun, recovering");
    }
    check_code(unsafe { snd_pcm_recover(handle, err, 1) }, ctx)
}

// check error codes for alsa
//
fn check_code(code: c_int, ctx: &str) -> Result<(), DeviceError> {
    if code < 0 {
        let msg = unsafe { CStr::from_ptr(snd_strerror(code)) };
        return Err(DeviceError::new(ctx, code, msg.to_string_lossy()));
    }
    Ok(())
}
