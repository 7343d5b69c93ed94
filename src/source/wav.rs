use super::buffer::{select_reader, AudioFormat, SampleBuffer};
use crate::DecodeError;
use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};
use tracing::{debug, warn};

const RIFF_TAG: [u8; 4] = *b"RIFF";
const WAVE_TAG: [u8; 4] = *b"WAVE";
const FMT_TAG: [u8; 4] = *b"fmt ";
const DATA_TAG: [u8; 4] = *b"data";

/// Bytes of the "fmt " subchunk we actually read. Anything past this is skipped.
const FMT_CHUNK_LEN: u32 = 16;

pub const FORMAT_PCM: u16 = 0x0001;
pub const FORMAT_IEEE_FLOAT: u16 = 0x0003;
pub const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

// Upper bound on the up-front allocation for the data chunk, so a bogus size field can't reserve gigabytes
const MAX_PREALLOC: usize = 1 << 20;

/// Contents of the "fmt " subchunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WavHeader {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

impl SampleBuffer {
    /// Loads a .wav file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            warn!("failed to open {}: {}", path.display(), err);
            DecodeError::Io(err)
        })?;

        let buffer = Self::from_reader(BufReader::new(file)).map_err(|err| {
            warn!("failed to load data from {}: {}", path.display(), err);
            err
        })?;
        debug!("loaded {}: {:?}", path.display(), buffer);
        Ok(buffer)
    }

    /// Decodes a .wav file that is already in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_reader(bytes)
    }

    /// Decodes a .wav stream.
    ///
    /// The header must start with the "RIFF", "WAVE" and "fmt " tags in that order. Chunks between the format
    /// description and the "data" chunk are skipped.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, DecodeError> {
        let header = read_header(&mut reader)?;
        let data_len = find_data_chunk(&mut reader)? as usize;
        if data_len < 1 {
            return Err(DecodeError::EmptyData);
        }

        let mut data = Vec::with_capacity(data_len.min(MAX_PREALLOC));
        reader.take(data_len as u64).read_to_end(&mut data)?;
        if data.len() < data_len {
            return Err(DecodeError::TruncatedData { declared: data_len, available: data.len() });
        }

        let unsupported = DecodeError::UnsupportedFormat {
            channels: header.channels,
            bits_per_sample: header.bits_per_sample,
            format_tag: header.format_tag,
        };
        let tag_matches_depth = match header.format_tag {
            FORMAT_PCM => header.bits_per_sample != 32,
            FORMAT_IEEE_FLOAT => header.bits_per_sample == 32,
            FORMAT_EXTENSIBLE => true,
            _ => false,
        };
        if !tag_matches_depth || select_reader(header.channels, header.bits_per_sample).is_none() {
            return Err(unsupported);
        }

        let format = AudioFormat::new(header.channels, header.bits_per_sample, header.sample_rate);
        SampleBuffer::from_pcm(format, data)
    }
}

/// Reads and validates everything up to the end of the "fmt " subchunk.
pub fn read_header<R: Read>(reader: &mut R) -> Result<WavHeader, DecodeError> {
    let riff: [u8; 4] = read_array(reader).map_err(header_error)?;
    if riff != RIFF_TAG {
        return Err(DecodeError::MalformedHeader);
    }
    let _riff_len: [u8; 4] = read_array(reader).map_err(header_error)?;
    let wave: [u8; 4] = read_array(reader).map_err(header_error)?;
    if wave != WAVE_TAG {
        return Err(DecodeError::MalformedHeader);
    }
    let fmt_tag: [u8; 4] = read_array(reader).map_err(header_error)?;
    if fmt_tag != FMT_TAG {
        return Err(DecodeError::MalformedHeader);
    }

    let fmt_len = u32::from_le_bytes(read_array(reader).map_err(header_error)?);
    if fmt_len < FMT_CHUNK_LEN {
        return Err(DecodeError::MalformedHeader);
    }

    let fmt: [u8; 16] = read_array(reader).map_err(header_error)?;
    let header = WavHeader {
        format_tag: u16::from_le_bytes([fmt[0], fmt[1]]),
        channels: u16::from_le_bytes([fmt[2], fmt[3]]),
        sample_rate: u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]),
        byte_rate: u32::from_le_bytes([fmt[8], fmt[9], fmt[10], fmt[11]]),
        block_align: u16::from_le_bytes([fmt[12], fmt[13]]),
        bits_per_sample: u16::from_le_bytes([fmt[14], fmt[15]]),
    };

    // Extended format descriptions carry extra bytes we have no use for
    let extra = u64::from(fmt_len - FMT_CHUNK_LEN);
    if skip(reader, extra).map_err(header_error)? < extra {
        return Err(DecodeError::MalformedHeader);
    }

    Ok(header)
}

/// Walks chunk headers until the "data" chunk, returning its declared length.
/// The reader is left positioned at the first byte of audio data.
fn find_data_chunk<R: Read>(reader: &mut R) -> Result<u32, DecodeError> {
    loop {
        let chunk_header: [u8; 8] = read_array(reader).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => DecodeError::NoDataChunk,
            _ => DecodeError::Io(err),
        })?;
        let chunk_len = u32::from_le_bytes([chunk_header[4], chunk_header[5], chunk_header[6], chunk_header[7]]);

        if chunk_header[0..4] == DATA_TAG {
            return Ok(chunk_len);
        }

        // This was not the data chunk. Skip it.
        if skip(reader, u64::from(chunk_len))? < u64::from(chunk_len) {
            return Err(DecodeError::NoDataChunk);
        }
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn skip<R: Read>(reader: &mut R, len: u64) -> io::Result<u64> {
    io::copy(&mut reader.by_ref().take(len), &mut io::sink())
}

fn header_error(err: io::Error) -> DecodeError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => DecodeError::MalformedHeader,
        _ => DecodeError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Container {
        riff: [u8; 4],
        wave: [u8; 4],
        fmt: [u8; 4],
        fmt_extra: Vec<u8>,
        header: WavHeader,
        chunks: Vec<([u8; 4], Vec<u8>)>,
    }

    impl Container {
        fn new(channels: u16, bits_per_sample: u16, sample_rate: u32) -> Self {
            let block_align = channels * bits_per_sample / 8;
            Self {
                riff: RIFF_TAG,
                wave: WAVE_TAG,
                fmt: FMT_TAG,
                fmt_extra: Vec::new(),
                header: WavHeader {
                    format_tag: if bits_per_sample == 32 { FORMAT_IEEE_FLOAT } else { FORMAT_PCM },
                    channels,
                    sample_rate,
                    byte_rate: sample_rate * u32::from(block_align),
                    block_align,
                    bits_per_sample,
                },
                chunks: Vec::new(),
            }
        }

        fn chunk(mut self, tag: [u8; 4], body: Vec<u8>) -> Self {
            self.chunks.push((tag, body));
            self
        }

        fn build(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(&self.riff);
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&self.wave);
            out.extend_from_slice(&self.fmt);
            out.extend_from_slice(&(16 + self.fmt_extra.len() as u32).to_le_bytes());
            out.extend_from_slice(&self.header.format_tag.to_le_bytes());
            out.extend_from_slice(&self.header.channels.to_le_bytes());
            out.extend_from_slice(&self.header.sample_rate.to_le_bytes());
            out.extend_from_slice(&self.header.byte_rate.to_le_bytes());
            out.extend_from_slice(&self.header.block_align.to_le_bytes());
            out.extend_from_slice(&self.header.bits_per_sample.to_le_bytes());
            out.extend_from_slice(&self.fmt_extra);
            for (tag, body) in &self.chunks {
                out.extend_from_slice(tag);
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(body);
            }
            let riff_len = (out.len() - 8) as u32;
            out[4..8].copy_from_slice(&riff_len.to_le_bytes());
            out
        }
    }

    #[test]
    fn decodes_canonical_container() {
        let payload: Vec<u8> = (0..64u8).collect();
        let bytes = Container::new(2, 16, 22050).chunk(DATA_TAG, payload.clone()).build();

        let buffer = SampleBuffer::from_bytes(&bytes).unwrap();
        assert_eq!(buffer.data_length(), 64);
        assert_eq!(buffer.data(), &payload[..]);
        assert_eq!(buffer.format(), AudioFormat { channels: 2, bits_per_sample: 16, sample_rate: 22050, signed: true });
        assert_eq!(buffer.frame_count(), 16);
    }

    #[test]
    fn wrong_master_tag() {
        let mut container = Container::new(1, 16, 22050).chunk(DATA_TAG, vec![0; 4]);
        container.riff = *b"RIFX";
        assert!(matches!(SampleBuffer::from_bytes(&container.build()), Err(DecodeError::MalformedHeader)));
    }

    #[test]
    fn wrong_format_tag() {
        let mut container = Container::new(1, 16, 22050).chunk(DATA_TAG, vec![0; 4]);
        container.wave = *b"AVI ";
        assert!(matches!(SampleBuffer::from_bytes(&container.build()), Err(DecodeError::MalformedHeader)));
    }

    #[test]
    fn wrong_subchunk_tag() {
        let mut container = Container::new(1, 16, 22050).chunk(DATA_TAG, vec![0; 4]);
        container.fmt = *b"fmt\0";
        assert!(matches!(SampleBuffer::from_bytes(&container.build()), Err(DecodeError::MalformedHeader)));
    }

    #[test]
    fn header_cut_short() {
        let bytes = Container::new(1, 16, 22050).build();
        assert!(matches!(SampleBuffer::from_bytes(&bytes[..30]), Err(DecodeError::MalformedHeader)));
    }

    #[test]
    fn missing_data_chunk() {
        let bytes = Container::new(1, 16, 22050).chunk(*b"LIST", vec![1, 2, 3, 4]).build();
        assert!(matches!(SampleBuffer::from_bytes(&bytes), Err(DecodeError::NoDataChunk)));
    }

    #[test]
    fn skipped_chunk_runs_past_end() {
        let mut bytes = Container::new(1, 16, 22050).chunk(*b"LIST", vec![1, 2, 3, 4]).build();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(SampleBuffer::from_bytes(&bytes), Err(DecodeError::NoDataChunk)));
    }

    #[test]
    fn zero_length_data_chunk() {
        let bytes = Container::new(1, 16, 22050).chunk(DATA_TAG, Vec::new()).build();
        assert!(matches!(SampleBuffer::from_bytes(&bytes), Err(DecodeError::EmptyData)));
    }

    #[test]
    fn unsupported_bit_depth() {
        let bytes = Container::new(2, 24, 44100).chunk(DATA_TAG, vec![0; 12]).build();
        assert!(matches!(
            SampleBuffer::from_bytes(&bytes),
            Err(DecodeError::UnsupportedFormat { channels: 2, bits_per_sample: 24, .. })
        ));
    }

    #[test]
    fn unsupported_format_tag() {
        let mut container = Container::new(1, 16, 22050).chunk(DATA_TAG, vec![0; 4]);
        container.header.format_tag = 0x0055;
        assert!(matches!(
            SampleBuffer::from_bytes(&container.build()),
            Err(DecodeError::UnsupportedFormat { format_tag: 0x0055, .. })
        ));
    }

    #[test]
    fn skips_chunks_before_data() {
        let bytes = Container::new(1, 8, 11025)
            .chunk(*b"LIST", b"INFOsome metadata".to_vec())
            .chunk(*b"fact", vec![0; 4])
            .chunk(DATA_TAG, vec![128, 255, 0])
            .build();

        let buffer = SampleBuffer::from_bytes(&bytes).unwrap();
        assert_eq!(buffer.data_length(), 3);
        assert_eq!(buffer.sample(0, 0), 0);
        assert_eq!(buffer.sample(1, 0), 127 << 8);
        assert_eq!(buffer.sample(2, 0), -32768);
        assert!(!buffer.format().signed);
    }

    #[test]
    fn extended_format_description_is_skipped() {
        let mut container = Container::new(1, 16, 22050).chunk(DATA_TAG, 1234i16.to_le_bytes().to_vec());
        container.fmt_extra = vec![0, 0];
        let buffer = SampleBuffer::from_bytes(&container.build()).unwrap();
        assert_eq!(buffer.sample(0, 0), 1234);
    }

    #[test]
    fn truncated_data() {
        let mut bytes = Container::new(1, 16, 22050).chunk(DATA_TAG, vec![0; 10]).build();
        bytes.truncate(bytes.len() - 4);
        assert!(matches!(
            SampleBuffer::from_bytes(&bytes),
            Err(DecodeError::TruncatedData { declared: 10, available: 6 })
        ));
    }

    #[test]
    fn float_data() {
        let data: Vec<u8> = [0.25f32, -0.25].iter().flat_map(|s| s.to_le_bytes()).collect();
        let bytes = Container::new(2, 32, 48000).chunk(DATA_TAG, data).build();
        let buffer = SampleBuffer::from_bytes(&bytes).unwrap();
        assert_eq!(buffer.sample(0, 0), 8192);
        assert_eq!(buffer.sample(0, 1), -8192);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(SampleBuffer::load(dir.path().join("nope.wav")), Err(DecodeError::Io(_))));
    }
}
