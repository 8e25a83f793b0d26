use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wavstream::{audio_processing::alsa::AlsaDevice, file_parsing::wav, play};

/// Play a PCM WAV file (8/16-bit, mono/stereo) through ALSA.
#[derive(Parser, Debug)]
#[command(name = "wavstream")]
#[command(version)]
struct Args {
    /// WAV file to play
    path: PathBuf,

    /// ALSA PCM device
    #[arg(short, long, default_value = "default", env = "WAVSTREAM_DEVICE")]
    device: String,

    /// Frames requested from the engine per callback
    #[arg(short, long, default_value_t = 256, env = "WAVSTREAM_FRAMES_PER_BUFFER")]
    frames_per_buffer: usize,

    /// Periods in the hardware buffer
    #[arg(long, default_value_t = 4)]
    periods: usize,
}

// signal handlers
//
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);

        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wavstream=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let (descriptor, samples) = wav::load(&args.path)
        .with_context(|| format!("Failed to load {}", args.path.display()))?;
    info!(
        path = %args.path.display(),
        sample_rate = descriptor.sample_rate,
        channels = descriptor.channel_count,
        bits = descriptor.bit_depth,
        frames = descriptor.total_frames(),
        "decoded header"
    );

    install_signal_handlers();

    let mut device = AlsaDevice::new(args.device.clone(), args.periods);
    let report = play(
        &mut device,
        &descriptor,
        samples,
        args.frames_per_buffer.max(1),
        &INTERRUPTED,
    )
    .with_context(|| format!("Playback on '{}' failed", args.device))?;

    if report.interrupted {
        info!(played = report.frames_played, "interrupted");
    }

    Ok(())
}
