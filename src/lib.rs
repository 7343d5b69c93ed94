//! Fixed-point, pull-model audio mixing.
//!
//! A [`SampleBuffer`] holds decoded PCM. [`SourcePlayback`] plays a buffer through a linear-interpolating
//! resampler with per-channel volume, a [`Mixer`] sums any number of [`AudioSource`]s (including other mixers), and
//! an [`OutputPump`] pulls from a root source and feeds the hardware, either from its own thread or from explicit
//! ticks issued by the render loop.
//!
//! Everything on the mixing path works in interleaved stereo `i16` at [`OUTPUT_SAMPLE_RATE`], with positions and
//! gains in 12-bit fixed point.

mod config;
mod error;
mod mixer;
mod source;
mod stream;

pub use config::{PumpConfig, PumpMode};
pub use error::{DecodeError, OutputError, SinkError};
pub use mixer::{Mixer, SummingMode, VolumeChange};
pub use source::{
    buffer::{select_reader, AudioFormat, SampleBuffer, SampleReader},
    playback::{SourcePlayback, LOOP_FOREVER},
    wav::{read_header, WavHeader, FORMAT_EXTENSIBLE, FORMAT_IEEE_FLOAT, FORMAT_PCM},
    AudioSource, FinishedNotice, SharedSource,
};
pub use stream::{
    device::{open_default_output, CpalDevice, CpalSink},
    AudioSink, OutputDevice, OutputPump, PumpState, TickPhase,
};

use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// The rate every source is resampled to, in Hz.
pub const OUTPUT_SAMPLE_RATE: u32 = 22_050;

/// The mixing path is always interleaved stereo.
pub const OUTPUT_CHANNELS: u16 = 2;

/// Fractional bits used for positions, rate increments and gains.
pub const FIXED_SHIFT: u32 = 12;

/// 1.0 in fixed point: full volume, or a rate increment of one frame.
pub const FIXED_ONE: i32 = 1 << FIXED_SHIFT;

/// Converts a gain in `[0, 1]` to fixed point, clamping anything outside that range.
pub(crate) fn to_fixed_gain(volume: f32) -> i32 {
    if volume.is_nan() {
        return 0;
    }
    (volume.clamp(0.0, 1.0) * FIXED_ONE as f32).round() as i32
}

pub(crate) fn from_fixed_gain(volume: i32) -> f32 {
    volume as f32 / FIXED_ONE as f32
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("audio mutex poisoned; continuing");
        let guard = poisoned.into_inner();
        mutex.clear_poison();
        guard
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gains_clamp_to_unit_range() {
        assert_eq!(to_fixed_gain(1.0), FIXED_ONE);
        assert_eq!(to_fixed_gain(0.5), 2048);
        assert_eq!(to_fixed_gain(7.0), FIXED_ONE);
        assert_eq!(to_fixed_gain(-1.0), 0);
        assert_eq!(to_fixed_gain(f32::NAN), 0);
        assert_eq!(from_fixed_gain(1024), 0.25);
    }

    #[test]
    fn recovered_mutex_is_no_longer_poisoned() {
        let mutex = std::sync::Arc::new(Mutex::new(5));
        let held = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert!(mutex.is_poisoned());

        assert_eq!(*lock(&mutex), 5);
        assert!(!mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 5);
    }
}
