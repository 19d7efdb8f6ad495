//! Audio file decoding.
//!
//! WAV goes through hound; compressed formats (MP3, OGG, FLAC, M4A/AAC) go
//! through rodio's symphonia-backed decoder. Decoded clips are resampled to
//! the engine rate with rubato so the audio thread never converts rates.

use super::AudioBuffer;
use crate::error::{EngineError, EngineResult};
use rodio::Source;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// File extensions the decoder accepts (lowercase).
pub const SUPPORTED_AUDIO_EXTENSIONS: [&str; 7] = ["wav", "mp3", "ogg", "flac", "m4a", "aac", "mp4"];

/// Decodes an audio file into a stereo buffer, resampled to `target_rate`.
///
/// # Arguments
///
/// * `path` - Audio file; the format is chosen by extension
/// * `target_rate` - Engine sample rate
///
/// # Errors
///
/// Returns `NotFound` for a missing file, `Unsupported` for an unknown
/// extension and `Decode` when the content cannot be read.
pub fn decode_audio_file<P: AsRef<Path>>(path: P, target_rate: u32) -> EngineResult<AudioBuffer> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(EngineError::not_found(path));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        return Err(EngineError::Unsupported(format!(
            "audio format '{}' ({})",
            ext,
            path.display()
        )));
    }

    let decoded = if ext == "wav" {
        decode_wav(path)?
    } else {
        decode_compressed(path)?
    };
    tracing::info!(
        "Decoded {} ({} frames at {} Hz)",
        path.display(),
        decoded.frames(),
        decoded.sample_rate()
    );
    resample(&decoded, target_rate)
}

fn decode_wav(path: &Path) -> EngineResult<AudioBuffer> {
    let reader = hound::WavReader::open(path).map_err(|e| EngineError::decode(path, e))?;
    let spec = reader.spec();

    let data: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| EngineError::decode(path, e))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(|e| EngineError::decode(path, e))?
        }
    };
    Ok(AudioBuffer::from_interleaved(
        spec.sample_rate,
        spec.channels,
        &data,
    ))
}

fn decode_compressed(path: &Path) -> EngineResult<AudioBuffer> {
    let file = File::open(path).map_err(|e| EngineError::decode(path, e))?;
    let decoder =
        rodio::Decoder::new(BufReader::new(file)).map_err(|e| EngineError::decode(path, e))?;
    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let data: Vec<f32> = decoder.convert_samples::<f32>().collect();
    if data.is_empty() {
        return Err(EngineError::decode(path, "no audio frames"));
    }
    Ok(AudioBuffer::from_interleaved(sample_rate, channels, &data))
}

/// Resamples a buffer to `target_rate` (a clone when the rates match).
///
/// # Errors
///
/// Returns `Decode` if the resampler rejects the conversion.
pub fn resample(buffer: &AudioBuffer, target_rate: u32) -> EngineResult<AudioBuffer> {
    if buffer.sample_rate() == target_rate || buffer.frames() == 0 {
        return Ok(buffer.clone());
    }
    if buffer.sample_rate() == 0 || target_rate == 0 {
        return Err(EngineError::InvalidArgument("zero sample rate".into()));
    }

    let ratio = target_rate as f64 / buffer.sample_rate() as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let [left, right] = buffer.to_planar();
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, left.len(), 2)
        .map_err(|e| EngineError::Decode(format!("resampler: {}", e)))?;

    let mut out = resampler
        .process(&[left, right], None)
        .map_err(|e| EngineError::Decode(format!("resample: {}", e)))?;
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .map_err(|e| EngineError::Decode(format!("resample: {}", e)))?;
    for (channel, rest) in out.iter_mut().zip(tail) {
        channel.extend(rest);
    }

    // Drop the filter delay and trim to the exact converted length.
    let delay = resampler.output_delay();
    let expected = buffer.frames_at_rate(target_rate) as usize;
    let slice = |ch: &[f32]| -> Vec<f32> {
        let mut v: Vec<f32> = ch.iter().skip(delay).take(expected).copied().collect();
        v.resize(expected, 0.0);
        v
    };
    let left = slice(&out[0]);
    let right = slice(&out[1]);
    Ok(AudioBuffer::from_planar(target_rate, &left, &right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for _ in 0..channels {
                let v = ((i as f32 * 0.05).sin() * 16_000.0) as i16;
                writer.write_sample(v).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_decode_wav_same_rate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 44_100, 1, 1_000);
        let buf = decode_audio_file(&path, 44_100).unwrap();
        assert_eq!(buf.frames(), 1_000);
        assert_eq!(buf.sample_rate(), 44_100);
        let (l, r) = buf.frame(10);
        assert_eq!(l, r);
        assert!(buf.peak() > 0.4 && buf.peak() < 0.5);
    }

    #[test]
    fn test_decode_wav_resampled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 22_050, 2, 2_205);
        let buf = decode_audio_file(&path, 44_100).unwrap();
        assert_eq!(buf.sample_rate(), 44_100);
        assert_eq!(buf.frames(), 4_410);
    }

    #[test]
    fn test_missing_and_unsupported() {
        let dir = tempdir().unwrap();
        let missing = decode_audio_file(dir.path().join("nope.wav"), 44_100).unwrap_err();
        assert!(matches!(missing, EngineError::NotFound(_)));

        let odd = dir.path().join("notes.txt");
        std::fs::write(&odd, b"hello").unwrap();
        let err = decode_audio_file(&odd, 44_100).unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[test]
    fn test_corrupt_wav_is_decode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"RIFF0000WAVEjunk").unwrap();
        let err = decode_audio_file(&path, 44_100).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }
}
