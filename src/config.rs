use crate::{OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE};
use std::time::Duration;

// Hardware buffer and per-tick send buffer, in bytes and samples respectively
const HARDWARE_BUFFER_BYTES: usize = 4096 * 4;
const SEND_BUFFER_SAMPLES: usize = 4096 * 2;

const THREAD_SLEEP: Duration = Duration::from_millis(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// How an [`OutputPump`](crate::OutputPump) is driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpMode {
    /// A dedicated thread ticks the pump continuously.
    Threaded,

    /// The render loop ticks the pump explicitly, twice per frame.
    Manual,
}

impl PumpMode {
    /// Threaded wherever the target can spawn threads, manual otherwise.
    pub fn detect() -> Self {
        if cfg!(target_arch = "wasm32") {
            PumpMode::Manual
        } else {
            PumpMode::Threaded
        }
    }
}

impl Default for PumpMode {
    fn default() -> Self {
        Self::detect()
    }
}

/// Output configuration, fixed for the lifetime of a pump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PumpConfig {
    /// Output sample rate in Hz. Sources are resampled to this rate.
    pub sample_rate: u32,

    /// Channel count requested from the hardware. The mixing path itself is always stereo and is spread or folded
    /// onto whatever the device actually runs with.
    pub channels: u16,

    /// Size of the hardware-facing buffer in bytes.
    pub hardware_buffer_bytes: usize,

    /// Largest number of samples pulled from the root source in one tick.
    pub send_buffer_samples: usize,

    /// How long the pump thread sleeps between ticks.
    pub thread_sleep: Duration,

    /// Poll interval while waiting for the pump thread to exit.
    pub shutdown_poll: Duration,

    pub mode: PumpMode,
}

impl PumpConfig {
    pub fn with_mode(mut self, mode: PumpMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_hardware_buffer_bytes(mut self, bytes: usize) -> Self {
        self.hardware_buffer_bytes = bytes;
        self
    }

    pub fn with_send_buffer_samples(mut self, samples: usize) -> Self {
        self.send_buffer_samples = samples;
        self
    }

    pub fn with_thread_sleep(mut self, sleep: Duration) -> Self {
        self.thread_sleep = sleep;
        self
    }

    pub fn with_shutdown_poll(mut self, poll: Duration) -> Self {
        self.shutdown_poll = poll;
        self
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            sample_rate: OUTPUT_SAMPLE_RATE,
            channels: OUTPUT_CHANNELS,
            hardware_buffer_bytes: HARDWARE_BUFFER_BYTES,
            send_buffer_samples: SEND_BUFFER_SAMPLES,
            thread_sleep: THREAD_SLEEP,
            shutdown_poll: SHUTDOWN_POLL,
            mode: PumpMode::detect(),
        }
    }
}
