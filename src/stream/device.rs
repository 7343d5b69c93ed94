//! Hardware output through cpal.
//!
//! The pump writes into a ring buffer owned by [`CpalSink`]; the device callback drains it on the audio thread,
//! filling any shortfall with silence.

use super::{AudioSink, OutputDevice};
use crate::{OutputError, PumpConfig, SinkError};
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig, SupportedStreamConfig,
    SupportedStreamConfigRange,
};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, info, trace, warn};

/// Opens the default output device and returns its stream handle along with a sink feeding it.
///
/// The device is asked for the configured rate and channel count; if it can't do either exactly, the closest
/// configuration it supports is used instead.
pub fn open_default_output(config: &PumpConfig) -> Result<(CpalDevice, CpalSink), OutputError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(OutputError::NoOutputDevice)?;
    if let Ok(name) = device.name() {
        info!("opening audio output device \"{}\"", name);
    }

    let supported = choose_config(&device, config)?;
    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();
    if stream_config.sample_rate.0 != config.sample_rate || stream_config.channels != config.channels {
        warn!(
            "requested {} Hz, {} channel(s); device will run at {} Hz, {} channel(s)",
            config.sample_rate, config.channels, stream_config.sample_rate.0, stream_config.channels
        );
    }

    let (sink, feed) = CpalSink::with_capacity(config.hardware_buffer_bytes / 2);
    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, feed)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, feed)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, feed)?,
        _ => return Err(OutputError::DeviceNotUsable),
    };
    stream.play()?;

    debug!("audio output running: {:?}, {:?}", stream_config, sample_format);
    let device = CpalDevice { stream, sample_rate: stream_config.sample_rate.0, channels: stream_config.channels };
    Ok((device, sink))
}

fn build_stream<T>(device: &cpal::Device, config: &StreamConfig, mut feed: Feed) -> Result<cpal::Stream, OutputError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = usize::from(config.channels);
    let err_fn = |err: cpal::StreamError| warn!("an error occurred on the output audio stream: {}", err);
    let data_fn = move |data: &mut [T], _: &cpal::OutputCallbackInfo| feed.fill(data, channels);
    Ok(device.build_output_stream(config, data_fn, err_fn, None)?)
}

/// Picks the supported configuration closest to what was asked for.
fn choose_config(device: &cpal::Device, config: &PumpConfig) -> Result<SupportedStreamConfig, OutputError> {
    let ranges: Vec<SupportedStreamConfigRange> = device.supported_output_configs()?.collect();

    let best = ranges
        .iter()
        .filter(|range| format_rank(range.sample_format()).is_some())
        .min_by_key(|range| {
            (
                range.channels() != config.channels,
                rate_distance(range, config.sample_rate),
                format_rank(range.sample_format()),
            )
        });

    match best {
        Some(range) => {
            let rate = config.sample_rate.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
            Ok(range.clone().with_sample_rate(SampleRate(rate)))
        }
        None => {
            // Some backends report nothing here but still have a working default
            let default = device.default_output_config()?;
            match format_rank(default.sample_format()) {
                Some(_) => Ok(default),
                None => Err(OutputError::DeviceNotUsable),
            }
        }
    }
}

fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::I16 => Some(0),
        SampleFormat::F32 => Some(1),
        SampleFormat::U16 => Some(2),
        _ => None,
    }
}

fn rate_distance(range: &SupportedStreamConfigRange, rate: u32) -> u32 {
    let (min, max) = (range.min_sample_rate().0, range.max_sample_rate().0);
    if rate < min {
        min - rate
    } else if rate > max {
        rate - max
    } else {
        0
    }
}

/// A running cpal output stream.
///
/// Not `Send` on every platform, so it stays with whoever opened it; only the [`CpalSink`] crosses to the pump
/// thread.
pub struct CpalDevice {
    stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
}

impl CpalDevice {
    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl OutputDevice for CpalDevice {
    fn suspend(&self) -> Result<(), OutputError> {
        Ok(self.stream.pause()?)
    }

    fn resume(&self) -> Result<(), OutputError> {
        Ok(self.stream.play()?)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Producer end of the ring buffer the device callback drains.
pub struct CpalSink {
    producer: HeapProd<i16>,
    connected: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
}

impl CpalSink {
    fn with_capacity(samples: usize) -> (Self, Feed) {
        // Whole stereo frames only
        let capacity = (samples & !1).max(2);
        let (producer, consumer) = HeapRb::<i16>::new(capacity).split();

        let connected = Arc::new(AtomicBool::new(true));
        let underruns = Arc::new(AtomicU64::new(0));
        let sink = Self { producer, connected: connected.clone(), underruns: underruns.clone() };
        let feed = Feed { consumer, scratch: vec![0; capacity], connected, underruns };
        (sink, feed)
    }

    /// How many device callbacks found less audio queued than they needed.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

impl AudioSink for CpalSink {
    fn bytes_free(&self) -> usize {
        self.producer.vacant_len() * 2
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize, SinkError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SinkError::Disconnected);
        }

        let written = self.producer.push_slice(samples);
        if written == 0 && !samples.is_empty() {
            return Err(SinkError::Overrun { dropped: samples.len() });
        }
        Ok(written)
    }
}

/// Consumer end, moved into the device callback.
struct Feed {
    consumer: HeapCons<i16>,
    scratch: Vec<i16>,
    connected: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
}

impl Feed {
    fn fill<T>(&mut self, data: &mut [T], channels: usize)
    where
        T: Sample + FromSample<i16>,
    {
        if channels == 0 {
            return;
        }

        let wanted = data.len() / channels * 2;
        if self.scratch.len() < wanted {
            self.scratch.resize(wanted, 0);
        }

        let stereo = &mut self.scratch[..wanted];
        let got = self.consumer.pop_slice(stereo);
        if got < wanted {
            stereo[got..].fill(0);
            self.underruns.fetch_add(1, Ordering::Relaxed);
            trace!("audio underrun: {} of {} samples queued", got, wanted);
        }

        spread_frames(data, channels, stereo);
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// Writes interleaved stereo into a device buffer of `channels` channels. Mono gets the average of left and right;
/// anything past the first two channels gets silence.
fn spread_frames<T>(data: &mut [T], channels: usize, stereo: &[i16])
where
    T: Sample + FromSample<i16>,
{
    for (frame, pair) in data.chunks_exact_mut(channels).zip(stereo.chunks_exact(2)) {
        let (left, right) = (pair[0], pair[1]);
        if channels == 1 {
            frame[0] = T::from_sample(((i32::from(left) + i32::from(right)) / 2) as i16);
            continue;
        }

        frame[0] = T::from_sample(left);
        frame[1] = T::from_sample(right);
        frame[2..].iter_mut().for_each(|s| *s = T::EQUILIBRIUM);
    }
}
