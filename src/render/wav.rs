//! Canonical 24-bit stereo WAV output.
//!
//! The header is the plain 44-byte RIFF layout: a 16-byte `fmt ` chunk
//! (PCM, tag 1) followed directly by `data`. hound is used for reading
//! because it accepts every layout; it is not used for writing because it
//! emits an extensible `fmt ` chunk for 24-bit output.

use crate::error::{EngineError, EngineResult};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

pub const BITS_PER_SAMPLE: u16 = 24;
pub const CHANNELS: u16 = 2;
const BYTES_PER_FRAME: u32 = 6;
const HEADER_LEN: u32 = 44;
const FULL_SCALE: f32 = 8_388_607.0;

/// Converts a float sample to a 24-bit integer, clipping at full scale.
pub fn quantize(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) * FULL_SCALE).round() as i32
}

fn header(sample_rate: u32, data_len: u32) -> [u8; HEADER_LEN as usize] {
    let mut h = [0u8; HEADER_LEN as usize];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(data_len + HEADER_LEN - 8).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&1u16.to_le_bytes());
    h[22..24].copy_from_slice(&CHANNELS.to_le_bytes());
    h[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&(sample_rate * BYTES_PER_FRAME).to_le_bytes());
    h[32..34].copy_from_slice(&(BYTES_PER_FRAME as u16).to_le_bytes());
    h[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}

/// Streams planar blocks into a WAV file and patches the sizes on finish.
pub struct Wav24Writer<W: Write + Seek> {
    inner: W,
    sample_rate: u32,
    frames: u64,
    scratch: Vec<u8>,
}

impl<W: Write + Seek> Wav24Writer<W> {
    /// Writes a provisional header.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the header cannot be written.
    pub fn new(mut inner: W, sample_rate: u32) -> EngineResult<Self> {
        inner
            .write_all(&header(sample_rate, 0))
            .map_err(EngineError::io)?;
        Ok(Self {
            inner,
            sample_rate,
            frames: 0,
            scratch: Vec::new(),
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Appends `left.len()` frames.
    pub fn write_block(&mut self, left: &[f32], right: &[f32]) -> EngineResult<()> {
        let frames = left.len().min(right.len());
        let projected = (self.frames + frames as u64) * BYTES_PER_FRAME as u64;
        if projected > (u32::MAX - HEADER_LEN) as u64 {
            return Err(EngineError::Unsupported("WAV output larger than 4 GiB".into()));
        }
        self.scratch.clear();
        for (&l, &r) in left.iter().zip(right.iter()) {
            self.scratch.extend_from_slice(&quantize(l).to_le_bytes()[..3]);
            self.scratch.extend_from_slice(&quantize(r).to_le_bytes()[..3]);
        }
        self.inner.write_all(&self.scratch).map_err(EngineError::io)?;
        self.frames += frames as u64;
        Ok(())
    }

    /// Patches the chunk sizes and returns the sink.
    pub fn finish(mut self) -> EngineResult<W> {
        let data_len = u32::try_from(self.frames * BYTES_PER_FRAME as u64)
            .ok()
            .filter(|len| *len <= u32::MAX - HEADER_LEN)
            .ok_or_else(|| EngineError::Unsupported("WAV output larger than 4 GiB".into()))?;
        self.patch_header(data_len).map_err(EngineError::io)?;
        Ok(self.inner)
    }

    fn patch_header(&mut self, data_len: u32) -> std::io::Result<()> {
        self.inner.seek(SeekFrom::Start(0))?;
        self.inner.write_all(&header(self.sample_rate, data_len))?;
        self.inner.seek(SeekFrom::End(0))?;
        self.inner.flush()
    }
}

/// Decoded 24-bit stereo PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wav24 {
    pub sample_rate: u32,
    /// Interleaved left/right samples.
    pub samples: Vec<i32>,
}

impl Wav24 {
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }
}

/// Reads a 24-bit stereo PCM WAV.
///
/// # Errors
///
/// Returns `Decode` for a malformed file and `Unsupported` for any other
/// sample format or channel count.
pub fn decode_wav<R: Read>(reader: R) -> EngineResult<Wav24> {
    let reader =
        hound::WavReader::new(reader).map_err(|e| EngineError::Decode(format!("wav: {}", e)))?;
    let spec = reader.spec();
    if spec.channels != CHANNELS
        || spec.bits_per_sample != BITS_PER_SAMPLE
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(EngineError::Unsupported(format!(
            "{} channels, {}-bit {:?}",
            spec.channels, spec.bits_per_sample, spec.sample_format
        )));
    }
    let samples = reader
        .into_samples::<i32>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Decode(format!("wav: {}", e)))?;
    Ok(Wav24 {
        sample_rate: spec.sample_rate,
        samples,
    })
}

/// Encodes PCM in the canonical layout.
pub fn encode_wav(wav: &Wav24) -> Vec<u8> {
    let data_len = (wav.frames() as u32) * BYTES_PER_FRAME;
    let mut out = Vec::with_capacity((HEADER_LEN + data_len) as usize);
    out.extend_from_slice(&header(wav.sample_rate, data_len));
    for frame in wav.samples.chunks_exact(2) {
        out.extend_from_slice(&frame[0].to_le_bytes()[..3]);
        out.extend_from_slice(&frame[1].to_le_bytes()[..3]);
    }
    out
}

/// Renders planar float buffers into WAV bytes.
pub fn wav_bytes(sample_rate: u32, left: &[f32], right: &[f32]) -> EngineResult<Vec<u8>> {
    let mut writer = Wav24Writer::new(Cursor::new(Vec::new()), sample_rate)?;
    writer.write_block(left, right)?;
    Ok(writer.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_header() {
        let bytes = wav_bytes(44_100, &[0.0; 10], &[0.0; 10]).unwrap();
        assert_eq!(bytes.len(), 44 + 60);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 36 + 60);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 16);
        assert_eq!(u16::from_le_bytes(bytes[20..22].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[28..32].try_into().unwrap()), 44_100 * 6);
        assert_eq!(u16::from_le_bytes(bytes[34..36].try_into().unwrap()), 24);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 60);
    }

    #[test]
    fn test_decode_then_encode_is_identity() {
        let left: Vec<f32> = (0..500).map(|i| (i as f32 * 0.05).sin() * 0.9).collect();
        let right: Vec<f32> = left.iter().map(|s| -s * 0.5).collect();
        let bytes = wav_bytes(48_000, &left, &right).unwrap();

        let wav = decode_wav(Cursor::new(&bytes)).unwrap();
        assert_eq!(wav.sample_rate, 48_000);
        assert_eq!(wav.frames(), 500);
        assert_eq!(wav.samples[0], 0);
        assert_eq!(encode_wav(&wav), bytes);
    }

    #[test]
    fn test_clipping_and_extremes() {
        assert_eq!(quantize(1.0), 8_388_607);
        assert_eq!(quantize(4.0), 8_388_607);
        assert_eq!(quantize(-1.0), -8_388_607);
        assert_eq!(quantize(0.0), 0);
    }

    #[test]
    fn test_streamed_blocks_match_single_write() {
        let left: Vec<f32> = (0..300).map(|i| i as f32 / 300.0).collect();
        let right = vec![0.25; 300];
        let whole = wav_bytes(22_050, &left, &right).unwrap();

        let mut writer = Wav24Writer::new(Cursor::new(Vec::new()), 22_050).unwrap();
        for (l, r) in left.chunks(64).zip(right.chunks(64)) {
            writer.write_block(l, r).unwrap();
        }
        assert_eq!(writer.frames(), 300);
        assert_eq!(writer.finish().unwrap().into_inner(), whole);
    }

    #[test]
    fn test_oversized_data_rejected_on_finish() {
        let mut writer = Wav24Writer::new(Cursor::new(Vec::new()), 44_100).unwrap();
        writer.frames = u32::MAX as u64 / BYTES_PER_FRAME as u64;
        let err = writer.finish().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
    }

    /// A sink whose device is full.
    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FullDisk {
        fn seek(&mut self, _: SeekFrom) -> std::io::Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_write_failure_is_io() {
        let err = Wav24Writer::new(FullDisk, 44_100).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(err.to_string().contains("no space left"));
    }

    #[test]
    fn test_sixteen_bit_rejected() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(0i16).unwrap();
            writer.write_sample(0i16).unwrap();
            writer.finalize().unwrap();
        }
        cursor.set_position(0);
        let err = decode_wav(cursor).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
    }
}
