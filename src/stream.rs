pub mod device;

use crate::{
    lock,
    source::{notify_all, FinishedNotice},
    AudioSource, OutputError, PumpConfig, PumpMode, SinkError, OUTPUT_CHANNELS,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, trace, warn};

// One interleaved stereo frame of 16-bit samples
const BYTES_PER_FRAME: usize = OUTPUT_CHANNELS as usize * 2;

/// The hardware-facing end of an [`OutputPump`].
pub trait AudioSink: Send {
    /// Free space in the hardware buffer, in bytes of interleaved stereo 16-bit audio.
    fn bytes_free(&self) -> usize;

    /// Queues interleaved stereo samples for playback, returning how many were accepted.
    fn write(&mut self, samples: &[i16]) -> Result<usize, SinkError>;
}

/// Control over the device stream behind a sink.
pub trait OutputDevice {
    fn suspend(&self) -> Result<(), OutputError>;
    fn resume(&self) -> Result<(), OutputError>;

    /// The rate the device actually runs at.
    fn sample_rate(&self) -> u32;
}

/// Lifecycle of the pump thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PumpState {
    NotRunning = 0,
    Running = 1,
    ExitRequested = 2,
}

impl PumpState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PumpState::Running,
            2 => PumpState::ExitRequested,
            _ => PumpState::NotRunning,
        }
    }
}

/// Where in the frame a manual tick happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickPhase {
    BeforeUpdate,
    AfterUpdate,
}

/// State shared between the pump and its thread.
struct Control {
    state: AtomicU8,
    paused: AtomicBool,
    samples_mixed: AtomicU64,
}

impl Control {
    fn state(&self) -> PumpState {
        PumpState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PumpState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Everything one tick touches. Locked by whichever context is ticking.
struct Core {
    source: Box<dyn AudioSource>,
    sink: Box<dyn AudioSink>,
    send_buffer: Vec<i16>,
    notices: Vec<FinishedNotice>,
}

impl Core {
    /// Fills the sink with as much audio as it has room for. Returns the number of samples delivered.
    fn tick(&mut self) -> usize {
        let samples_to_write = (self.sink.bytes_free() / BYTES_PER_FRAME * 2).min(self.send_buffer.len());
        if samples_to_write == 0 {
            return 0;
        }

        let mixed = self.source.pull_audio(&mut self.send_buffer[..samples_to_write]).min(samples_to_write);

        // The root source holds no locks now, so its completion callbacks are free to touch the mixer
        self.source.take_finished(&mut self.notices);
        notify_all(&mut self.notices);

        if mixed == 0 {
            return 0;
        }

        match self.sink.write(&self.send_buffer[..mixed]) {
            Ok(written) => {
                if written < mixed {
                    trace!("short write to audio sink: {} of {} samples", written, mixed);
                }
                written
            }
            Err(err) => {
                warn!("an error occurred on the audio sink: {}", err);
                0
            }
        }
    }
}

/// Pulls mixed audio from a root source and delivers it to an [`AudioSink`].
///
/// In [`PumpMode::Threaded`] a dedicated thread ticks continuously. In [`PumpMode::Manual`] the render loop drives
/// delivery by calling [`tick_before_update`](Self::tick_before_update) and
/// [`tick_after_update`](Self::tick_after_update) around its per-frame update, or [`frame`](Self::frame) which does
/// both.
///
/// Dropping the pump stops the thread and waits for it to exit before the device and sink are released.
pub struct OutputPump {
    core: Arc<Mutex<Core>>,
    control: Arc<Control>,
    thread: Option<JoinHandle<()>>,
    device: Option<Box<dyn OutputDevice>>,
    config: PumpConfig,
    output_rate: u32,
}

impl OutputPump {
    /// Opens the default output device and starts pumping `source` into it.
    ///
    /// This is the only place hardware failures surface; once running, sink faults are logged and absorbed.
    pub fn open_default(source: Box<dyn AudioSource>, config: PumpConfig) -> Result<Self, OutputError> {
        let (device, sink) = device::open_default_output(&config)?;
        Self::with_sink(source, sink, Some(Box::new(device)), config)
    }

    /// Pumps `source` into a caller-supplied sink. `device`, if given, is suspended and resumed along with the pump.
    ///
    /// The output rate is fixed here: the device's actual rate if there is a device, the configured rate otherwise.
    /// `source` is told that rate, and a root [`Mixer`](crate::Mixer) passes it on to everything registered with it.
    pub fn with_sink(
        mut source: Box<dyn AudioSource>,
        sink: impl AudioSink + 'static,
        device: Option<Box<dyn OutputDevice>>,
        config: PumpConfig,
    ) -> Result<Self, OutputError> {
        let output_rate = device.as_ref().map_or(config.sample_rate, |device| device.sample_rate());
        source.set_output_rate(output_rate);
        debug!("audio output at {} Hz, send buffer: {} samples", output_rate, config.send_buffer_samples);

        let mut pump = Self {
            core: Arc::new(Mutex::new(Core {
                source,
                sink: Box::new(sink),
                send_buffer: vec![0; config.send_buffer_samples],
                notices: Vec::new(),
            })),
            control: Arc::new(Control {
                state: AtomicU8::new(PumpState::NotRunning as u8),
                paused: AtomicBool::new(false),
                samples_mixed: AtomicU64::new(0),
            }),
            thread: None,
            device,
            config,
            output_rate,
        };

        if pump.config.mode == PumpMode::Threaded {
            pump.start()?;
        }
        Ok(pump)
    }

    /// Starts the pump thread if it isn't running. Does nothing in manual mode.
    pub fn start(&mut self) -> Result<(), OutputError> {
        if self.config.mode != PumpMode::Threaded || self.thread.is_some() {
            return Ok(());
        }

        // Running is set before the thread exists so a stop issued straight away can't be missed
        self.control.set_state(PumpState::Running);

        let core = self.core.clone();
        let control = self.control.clone();
        let sleep = self.config.thread_sleep;
        let handle = thread::Builder::new()
            .name("audio-pump".into())
            .spawn(move || run(core, control, sleep))
            .map_err(|err| {
                self.control.set_state(PumpState::NotRunning);
                OutputError::ThreadSpawn(err)
            })?;

        self.thread = Some(handle);
        Ok(())
    }

    /// Asks the pump thread to exit and blocks until it has.
    pub fn stop(&mut self) {
        let _ = self.control.state.compare_exchange(
            PumpState::Running as u8,
            PumpState::ExitRequested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if let Some(handle) = self.thread.take() {
            while self.control.state() != PumpState::NotRunning && !handle.is_finished() {
                thread::sleep(self.config.shutdown_poll);
            }
            if handle.join().is_err() {
                warn!("audio pump thread panicked");
            }
        }

        self.control.set_state(PumpState::NotRunning);
    }

    /// One manual tick. Only does anything in manual mode and while not paused.
    pub fn tick(&self, phase: TickPhase) -> usize {
        if self.uses_thread() || self.is_paused() {
            return 0;
        }

        let written = lock(&self.core).tick();
        self.control.samples_mixed.fetch_add(written as u64, Ordering::Relaxed);
        trace!("manual tick ({:?}): {} samples", phase, written);
        written
    }

    /// Tick issued by the render loop right before the application's per-frame update.
    pub fn tick_before_update(&self) -> usize {
        self.tick(TickPhase::BeforeUpdate)
    }

    /// Tick issued by the render loop right after the application's per-frame update.
    pub fn tick_after_update(&self) -> usize {
        self.tick(TickPhase::AfterUpdate)
    }

    /// Runs one frame's `update` between the two manual ticks.
    pub fn frame<R>(&self, update: impl FnOnce() -> R) -> R {
        self.tick_before_update();
        let result = update();
        self.tick_after_update();
        result
    }

    /// Stops delivering audio and suspends the device.
    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::Release);
        if let Some(device) = &self.device {
            if let Err(err) = device.suspend() {
                warn!("failed to suspend output device: {}", err);
            }
        }
    }

    /// Resumes the device and audio delivery.
    pub fn resume(&self) {
        if let Some(device) = &self.device {
            if let Err(err) = device.resume() {
                warn!("failed to resume output device: {}", err);
            }
        }
        self.control.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PumpState {
        self.control.state()
    }

    pub fn mode(&self) -> PumpMode {
        self.config.mode
    }

    /// Whether a dedicated thread delivers audio. When it doesn't, the owner must tick the pump every frame.
    pub fn uses_thread(&self) -> bool {
        self.config.mode == PumpMode::Threaded
    }

    /// Total samples delivered to the sink so far.
    pub fn samples_mixed(&self) -> u64 {
        self.control.samples_mixed.load(Ordering::Relaxed)
    }

    /// The rate audio is mixed at, fixed when the pump was built.
    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    /// The device's actual sample rate, if there is a device.
    pub fn device_sample_rate(&self) -> Option<u32> {
        self.device.as_ref().map(|device| device.sample_rate())
    }
}

impl Drop for OutputPump {
    fn drop(&mut self) {
        // The thread must be gone before the device and sink are released
        self.stop();

        if let Some(device) = self.device.take() {
            if let Err(err) = device.suspend() {
                warn!("failed to suspend output device: {}", err);
            }
        }
    }
}

fn run(core: Arc<Mutex<Core>>, control: Arc<Control>, sleep: Duration) {
    debug!("starting audio pump thread");

    // Checked every iteration, so an exit request is seen within one tick
    while control.state() == PumpState::Running {
        if !control.paused.load(Ordering::Acquire) {
            let written = lock(&core).tick();
            control.samples_mixed.fetch_add(written as u64, Ordering::Relaxed);
        }
        thread::sleep(sleep);
    }

    debug!("exiting audio pump thread");
    control.set_state(PumpState::NotRunning);
}
