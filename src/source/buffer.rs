use crate::DecodeError;
use std::time::Duration;

/// Reads one sample, normalised to signed 16-bit, from raw PCM bytes.
///
/// Arguments are the raw data, the frame index and the channel. Reads past the end of the data return silence.
pub type SampleReader = fn(&[u8], usize, usize) -> i16;

/// Format of the PCM data held by a [`SampleBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// 1 (mono) or 2 (stereo)
    pub channels: u16,

    /// 8, 16 or 32. 32-bit data is IEEE float.
    pub bits_per_sample: u16,

    /// Frames per second
    pub sample_rate: u32,

    /// Whether the raw samples are signed. 8-bit PCM is unsigned, everything else is signed.
    pub signed: bool,
}

impl AudioFormat {
    pub fn new(channels: u16, bits_per_sample: u16, sample_rate: u32) -> Self {
        Self { channels, bits_per_sample, sample_rate, signed: bits_per_sample != 8 }
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Size of one frame (one sample for every channel) in bytes.
    pub fn block_align(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.channels)
    }
}

/// Decoded PCM audio, immutable once constructed.
///
/// Playback instances share a buffer through an `Arc`, so a buffer stays alive for as long as anything is playing it.
pub struct SampleBuffer {
    data: Vec<u8>,
    format: AudioFormat,
    reader: SampleReader,
}

impl SampleBuffer {
    /// Wraps raw PCM bytes that are already in memory.
    ///
    /// Fails with [`DecodeError::EmptyData`] if `data` is empty and [`DecodeError::UnsupportedFormat`] if no
    /// sample reader exists for the format.
    pub fn from_pcm(format: AudioFormat, data: impl Into<Vec<u8>>) -> Result<Self, DecodeError> {
        let data = data.into();
        if data.is_empty() {
            return Err(DecodeError::EmptyData);
        }

        let reader = select_reader(format.channels, format.bits_per_sample).ok_or(DecodeError::UnsupportedFormat {
            channels: format.channels,
            bits_per_sample: format.bits_per_sample,
            format_tag: if format.bits_per_sample == 32 { 3 } else { 1 },
        })?;

        Ok(Self { data, format, reader })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// The raw PCM bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Length of the raw PCM data in bytes.
    pub fn data_length(&self) -> usize {
        self.data.len()
    }

    pub fn channel_count(&self) -> u16 {
        self.format.channels
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.format.bits_per_sample
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.format.bytes_per_sample()
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    /// Number of whole frames in the buffer.
    pub fn frame_count(&self) -> usize {
        match self.format.block_align() {
            0 => 0,
            align => self.data.len() / align,
        }
    }

    /// Playing time at the buffer's own sample rate.
    pub fn duration(&self) -> Duration {
        if self.format.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / f64::from(self.format.sample_rate))
    }

    /// Reads the sample at `frame` for `channel`, normalised to signed 16-bit.
    ///
    /// Mono buffers ignore `channel`.
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> i16 {
        (self.reader)(&self.data, frame, channel)
    }

    /// The reader chosen for this buffer's format.
    pub fn reader(&self) -> SampleReader {
        self.reader
    }
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("format", &self.format)
            .field("data_length", &self.data.len())
            .finish()
    }
}

/// Picks the sample reader for a channel count and bit depth, or `None` if the combination isn't supported.
pub fn select_reader(channels: u16, bits_per_sample: u16) -> Option<SampleReader> {
    let reader: SampleReader = match (channels, bits_per_sample) {
        (1, 8) => sample_u8_mono,
        (1, 16) => sample_i16_mono,
        (1, 32) => sample_f32_mono,
        (2, 8) => sample_u8_stereo,
        (2, 16) => sample_i16_stereo,
        (2, 32) => sample_f32_stereo,
        _ => return None,
    };
    Some(reader)
}

#[inline]
fn read_u8(data: &[u8], index: usize) -> i16 {
    data.get(index).map(|&b| (i16::from(b) - 0x80) << 8).unwrap_or(0)
}

#[inline]
fn read_i16(data: &[u8], index: usize) -> i16 {
    let offset = index * 2;
    match data.get(offset..offset + 2) {
        Some(b) => i16::from_le_bytes([b[0], b[1]]),
        None => 0,
    }
}

#[inline]
fn read_f32(data: &[u8], index: usize) -> i16 {
    let offset = index * 4;
    match data.get(offset..offset + 4) {
        // float -> int casts saturate, so 1.0 lands on i16::MAX
        Some(b) => (f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * 32768.0) as i16,
        None => 0,
    }
}

fn sample_u8_mono(data: &[u8], frame: usize, _channel: usize) -> i16 {
    read_u8(data, frame)
}

fn sample_i16_mono(data: &[u8], frame: usize, _channel: usize) -> i16 {
    read_i16(data, frame)
}

fn sample_f32_mono(data: &[u8], frame: usize, _channel: usize) -> i16 {
    read_f32(data, frame)
}

fn sample_u8_stereo(data: &[u8], frame: usize, channel: usize) -> i16 {
    read_u8(data, frame * 2 + channel)
}

fn sample_i16_stereo(data: &[u8], frame: usize, channel: usize) -> i16 {
    read_i16(data, frame * 2 + channel)
}

fn sample_f32_stereo(data: &[u8], frame: usize, channel: usize) -> i16 {
    read_f32(data, frame * 2 + channel)
}
