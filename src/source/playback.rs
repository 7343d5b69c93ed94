use super::{buffer::SampleBuffer, AudioSource, FinishedNotice, SharedSource};
use crate::{to_fixed_gain, Mixer, FIXED_ONE, FIXED_SHIFT, OUTPUT_SAMPLE_RATE};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const DEFAULT_VOLUME: f32 = 1.0;
const DEFAULT_SPEED: f32 = 1.0;

/// Frames held back at the end of a buffer so interpolation never reads past it.
const GUARD_FRAMES: i64 = 2;

const FIXED_MASK: i64 = FIXED_ONE as i64 - 1;

/// Loop count meaning "repeat forever".
pub const LOOP_FOREVER: i32 = -1;

/// Plays one [`SampleBuffer`], resampled to the output rate with linear interpolation and scaled by independent
/// left/right volumes.
///
/// Position, rate increment and volumes are all 12-bit fixed point. A playback is not synchronised by itself; share
/// it as `Arc<Mutex<SourcePlayback>>` and register it with a [`Mixer`], which serialises access while mixing.
pub struct SourcePlayback {
    buffer: Option<Arc<SampleBuffer>>,
    finished: bool,
    destroy_when_finished: bool,
    fixed_pos: i64,
    fixed_inc: i64,
    fixed_left_volume: i32,
    fixed_right_volume: i32,
    speed: f32,
    output_rate: u32,
    loop_count: i32,
    on_finished: Option<FinishedNotice>,
    finish_pending: bool,
}

impl SourcePlayback {
    /// Constructs an idle playback. Attach a buffer with [`play`](Self::play) or [`play_buffer`](Self::play_buffer).
    pub fn new() -> Self {
        Self {
            buffer: None,
            finished: false,
            destroy_when_finished: true,
            fixed_pos: 0,
            fixed_inc: 0,
            fixed_left_volume: FIXED_ONE,
            fixed_right_volume: FIXED_ONE,
            speed: DEFAULT_SPEED,
            output_rate: OUTPUT_SAMPLE_RATE,
            loop_count: 0,
            on_finished: None,
            finish_pending: false,
        }
    }

    /// Constructs a playback that immediately starts playing `buffer` once, at full volume and normal speed.
    pub fn with_buffer(buffer: Arc<SampleBuffer>) -> Self {
        let mut playback = Self::new();
        playback.play(buffer, DEFAULT_VOLUME, DEFAULT_SPEED, 0);
        playback
    }

    /// Like [`with_buffer`](Self::with_buffer), wrapped for sharing with a mixer.
    pub fn shared(buffer: Arc<SampleBuffer>) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::with_buffer(buffer)))
    }

    /// Starts playing `buffer` through `mixer`, at the mixer's output rate. The mixer releases the playback once it
    /// finishes.
    ///
    /// Returns a handle for controlling the playback, or `None` if the mixer refused it.
    pub fn play_with_mixer(buffer: Arc<SampleBuffer>, mixer: &Mixer) -> Option<Arc<Mutex<Self>>> {
        let playback = Self::shared(buffer);
        let source: SharedSource = playback.clone();
        if !mixer.add_source(source) {
            debug!("failed to add the new playback to mixer");
            return None;
        }
        Some(playback)
    }

    /// Plays `buffer` from the start.
    ///
    /// `loop_count` is how many times to play it: 0 and 1 both play once, and [`LOOP_FOREVER`] repeats until stopped.
    pub fn play_buffer(&mut self, buffer: Arc<SampleBuffer>, loop_count: i32) {
        self.buffer = Some(buffer);
        self.loop_count = loop_count;
        self.fixed_pos = 0;
        self.finished = false;
        self.update_increment();
    }

    /// Plays `buffer` from the start with the given volume (both channels, `0.0..=1.0`) and speed (1.0 is the
    /// buffer's natural pitch).
    pub fn play(&mut self, buffer: Arc<SampleBuffer>, volume: f32, speed: f32, loop_count: i32) {
        self.set_volume(volume);
        self.speed = speed;
        self.play_buffer(buffer, loop_count);
    }

    /// Detaches the buffer and marks the playback finished.
    pub fn stop(&mut self) {
        self.buffer = None;
        if !self.finished {
            self.finished = true;
            self.finish_pending = self.on_finished.is_some();
        }
    }

    /// Registers a callback to run whenever the playback finishes or is stopped.
    ///
    /// The callback is not run by [`stop`](Self::stop) itself. The mixer (or pump) driving this playback collects it
    /// through [`AudioSource::take_finished`] and runs it on the mixing thread after releasing its locks, so the
    /// callback may add or remove sources. It must not block on this playback's own lock.
    pub fn on_finished(&mut self, callback: impl FnMut() + Send + 'static) {
        self.on_finished = Some(FinishedNotice::new(callback));
    }

    /// Whether a buffer is attached.
    pub fn is_playing(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether a mixer may release this playback once it has finished. Defaults to `true`.
    pub fn set_destroy_when_finished(&mut self, destroy: bool) {
        self.destroy_when_finished = destroy;
    }

    pub fn destroy_when_finished(&self) -> bool {
        self.destroy_when_finished
    }

    pub fn loop_count(&self) -> i32 {
        self.loop_count
    }

    /// Sets the remaining loop count. [`LOOP_FOREVER`] loops until stopped.
    pub fn set_loop_count(&mut self, count: i32) {
        debug!("setting the loop count to {}", count);
        self.loop_count = count;
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    /// Sets the playback speed. 1.0 plays at the buffer's own rate, 2.0 an octave up.
    pub fn set_speed(&mut self, speed: f32) {
        self.speed = speed;
        self.update_increment();
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Changes the rate this playback resamples to. Defaults to [`OUTPUT_SAMPLE_RATE`]; a mixer sets it to its own
    /// rate on registration.
    pub fn set_output_rate(&mut self, rate: u32) {
        self.output_rate = rate;
        self.update_increment();
    }

    pub fn set_left_volume(&mut self, volume: f32) {
        self.fixed_left_volume = to_fixed_gain(volume);
    }

    pub fn set_right_volume(&mut self, volume: f32) {
        self.fixed_right_volume = to_fixed_gain(volume);
    }

    /// Sets both channel volumes.
    pub fn set_volume(&mut self, volume: f32) {
        self.set_left_volume(volume);
        self.fixed_right_volume = self.fixed_left_volume;
    }

    /// The current rate increment, in fixed-point frames per output frame.
    pub fn rate_increment(&self) -> i64 {
        self.fixed_inc
    }

    fn update_increment(&mut self) {
        self.fixed_inc = match &self.buffer {
            Some(buffer) if self.output_rate > 0 => {
                (f64::from(buffer.sample_rate()) * f64::from(FIXED_ONE) * f64::from(self.speed)
                    / f64::from(self.output_rate))
                .round() as i64
            }
            _ => 0,
        };
    }

    /// Writes `target.len() / 2` frames starting at `fixed_pos`. Does no bounds checking of its own; the caller
    /// limits the block so every read stays inside the buffer.
    fn mix_block(&mut self, buffer: &SampleBuffer, target: &mut [i16]) {
        let read = buffer.reader();
        let data = buffer.data();

        if buffer.channel_count() == 2 {
            for frame in target.chunks_exact_mut(2) {
                let pos = (self.fixed_pos >> FIXED_SHIFT) as usize;
                let frac = (self.fixed_pos & FIXED_MASK) as i32;

                let left = interpolate(read(data, pos, 0), read(data, pos + 1, 0), frac);
                let right = interpolate(read(data, pos, 1), read(data, pos + 1, 1), frac);
                frame[0] = apply_volume(left, self.fixed_left_volume);
                frame[1] = apply_volume(right, self.fixed_right_volume);

                self.fixed_pos += self.fixed_inc;
            }
        } else {
            for frame in target.chunks_exact_mut(2) {
                let pos = (self.fixed_pos >> FIXED_SHIFT) as usize;
                let frac = (self.fixed_pos & FIXED_MASK) as i32;

                let sample = interpolate(read(data, pos, 0), read(data, pos + 1, 0), frac);
                frame[0] = apply_volume(sample, self.fixed_left_volume);
                frame[1] = apply_volume(sample, self.fixed_right_volume);

                self.fixed_pos += self.fixed_inc;
            }
        }
    }
}

impl Default for SourcePlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SourcePlayback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePlayback")
            .field("buffer", &self.buffer)
            .field("finished", &self.finished)
            .field("fixed_pos", &self.fixed_pos)
            .field("fixed_inc", &self.fixed_inc)
            .field("loop_count", &self.loop_count)
            .finish()
    }
}

impl AudioSource for SourcePlayback {
    fn pull_audio(&mut self, target: &mut [i16]) -> usize {
        let buffer = match &self.buffer {
            Some(buffer) => Arc::clone(buffer),
            None => return 0,
        };

        let channel_length = buffer.frame_count() as i64 - GUARD_FRAMES;
        if channel_length < 1 {
            warn!("buffer too short to play ({} frames)", buffer.frame_count());
            self.stop();
            return 0;
        }

        if self.fixed_inc <= 0 {
            // A zero increment would divide by zero below
            warn!("invalid rate increment {}, falling back to default speed", self.fixed_inc);
            self.speed = DEFAULT_SPEED;
            self.update_increment();
            if self.fixed_inc <= 0 {
                self.fixed_inc = i64::from(FIXED_ONE);
            }
        }

        let mut frames_to_write = target.len() / 2;
        let mut total_mixed = 0;
        let mut idle_wraps = 0;

        while frames_to_write > 0 {
            let frames_left = channel_length - (self.fixed_pos >> FIXED_SHIFT);

            // How many output frames fit before the end of the buffer at the current rate
            let max_mix = ((frames_left << FIXED_SHIFT) / self.fixed_inc).min(frames_to_write as i64);

            let amount = if max_mix > 0 {
                let amount = max_mix as usize;
                let start = total_mixed * 2;
                self.mix_block(&buffer, &mut target[start..start + amount * 2]);
                total_mixed += amount;
                idle_wraps = 0;
                amount
            } else {
                self.fixed_pos = channel_length << FIXED_SHIFT;
                idle_wraps += 1;
                0
            };

            // The buffer ended. Check the loop count and see what to do.
            if (self.fixed_pos >> FIXED_SHIFT) >= channel_length {
                self.fixed_pos -= channel_length << FIXED_SHIFT;

                if self.loop_count > 0 {
                    self.loop_count -= 1;
                }

                if self.loop_count == 0 {
                    self.stop();
                    return total_mixed * 2;
                }
            }

            // An increment larger than the whole buffer never produces a frame
            if idle_wraps > 1 {
                break;
            }

            frames_to_write -= amount;
        }

        total_mixed * 2
    }

    fn can_be_destroyed(&self) -> bool {
        self.finished && self.destroy_when_finished
    }

    fn set_output_rate(&mut self, rate: u32) {
        SourcePlayback::set_output_rate(self, rate);
    }

    fn take_finished(&mut self, notices: &mut Vec<FinishedNotice>) {
        if std::mem::take(&mut self.finish_pending) {
            notices.extend(self.on_finished.clone());
        }
    }
}

#[inline]
fn interpolate(from: i16, to: i16, frac: i32) -> i32 {
    (i32::from(from) * (FIXED_ONE - frac) + i32::from(to) * frac) >> FIXED_SHIFT
}

#[inline]
fn apply_volume(sample: i32, volume: i32) -> i16 {
    ((sample * volume) >> FIXED_SHIFT) as i16
}
