use thiserror::Error;

/// Reasons a sample buffer could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The file could not be opened or read
    #[error("failed to read audio data: {0}")]
    Io(#[from] std::io::Error),

    /// One of the fixed header tags ("RIFF", "WAVE", "fmt ") is missing or wrong
    #[error("malformed container header")]
    MalformedHeader,

    /// The stream ended before a "data" chunk was found
    #[error("no data chunk found")]
    NoDataChunk,

    /// The data chunk declares zero bytes of audio
    #[error("data chunk is empty")]
    EmptyData,

    /// The audio data in this file is encoded in a way we don't support
    #[error("unsupported format: {channels} channel(s), {bits_per_sample} bits, format tag {format_tag:#06x}")]
    UnsupportedFormat { channels: u16, bits_per_sample: u16, format_tag: u16 },

    /// The data chunk declares more bytes than the stream holds
    #[error("data chunk truncated: declared {declared} bytes, got {available}")]
    TruncatedData { declared: usize, available: usize },
}

/// Errors raised while setting up the hardware output.
///
/// These only surface during construction. Once an output is running, faults are logged and absorbed.
#[derive(Debug, Error)]
pub enum OutputError {
    /// There is no output device available
    #[error("no output device available")]
    NoOutputDevice,

    /// The device doesn't support any of the playback configurations we can use
    #[error("output device has no usable configuration")]
    DeviceNotUsable,

    #[error(transparent)]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error(transparent)]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error(transparent)]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error(transparent)]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error(transparent)]
    PauseStream(#[from] cpal::PauseStreamError),

    /// The dedicated pump thread could not be spawned
    #[error("failed to spawn audio pump thread: {0}")]
    ThreadSpawn(std::io::Error),
}

/// Faults reported by an [`AudioSink`](crate::AudioSink) while writing.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The hardware ran dry before this write arrived
    #[error("sink buffer underrun")]
    Underrun,

    /// The sink had no room for part of the write
    #[error("sink buffer overrun, {dropped} samples dropped")]
    Overrun { dropped: usize },

    /// The consuming side of the sink has gone away
    #[error("sink disconnected")]
    Disconnected,
}
