pub mod device;
pub mod engine;
pub mod runtime;

#[cfg(feature = "alsa")]
pub mod alsa;
