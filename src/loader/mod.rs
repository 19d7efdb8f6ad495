//! Resource loading.
//!
//! Everything that touches the filesystem lives here and runs off the audio
//! thread: decoding audio files, parsing soundfonts, opening plugin
//! libraries. Loaded resources are shared by reference count through
//! [`ResourceCache`]; a worker [`LoaderPool`] runs the slow parts in the
//! background.

mod audio;
mod cache;
mod plugin;
mod pool;
mod soundfont;

pub use audio::{decode_audio_file, resample, SUPPORTED_AUDIO_EXTENSIONS};
pub use cache::{CacheKey, ResourceCache};
pub use plugin::{
    load_processor, scan_plugins, PluginDescriptor, PluginInfo, Processor, SimpleSynth,
    BUILTIN_PREFIX, BUILTIN_SIMPLE_SYNTH, PLUGIN_ABI_VERSION, PLUGIN_ENTRY_SYMBOL,
};
pub use pool::{AudioPurpose, LoadJob, LoadOutcome, LoaderPool};
pub use soundfont::{load_soundfont, SfEnvelope, SfPreset, SfZone, SoundfontBank, ZoneLoop};

#[cfg(test)]
pub(crate) use soundfont::test_support;

/// Decoded audio: interleaved stereo `f32` frames.
#[derive(Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    /// `L, R, L, R, ...`
    samples: Vec<f32>,
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("sample_rate", &self.sample_rate)
            .field("frames", &self.frames())
            .finish()
    }
}

impl AudioBuffer {
    /// Wraps interleaved stereo samples; a trailing odd sample is dropped.
    pub fn new(sample_rate: u32, mut samples: Vec<f32>) -> Self {
        if samples.len() % 2 != 0 {
            samples.pop();
        }
        Self {
            sample_rate,
            samples,
        }
    }

    /// Builds a stereo buffer from interleaved data with any channel count.
    /// Mono is duplicated; extra channels beyond the first two are dropped.
    pub fn from_interleaved(sample_rate: u32, channels: u16, data: &[f32]) -> Self {
        let channels = channels.max(1) as usize;
        let frames = data.len() / channels;
        let mut samples = Vec::with_capacity(frames * 2);
        for frame in data.chunks_exact(channels) {
            let left = frame[0];
            let right = if channels > 1 { frame[1] } else { left };
            samples.push(left);
            samples.push(right);
        }
        Self {
            sample_rate,
            samples,
        }
    }

    /// A silent buffer of `frames` frames.
    pub fn silence(sample_rate: u32, frames: usize) -> Self {
        Self {
            sample_rate,
            samples: vec![0.0; frames * 2],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Frame count once played at `rate`.
    pub fn frames_at_rate(&self, rate: u32) -> u64 {
        if rate == self.sample_rate || self.sample_rate == 0 {
            return self.frames() as u64;
        }
        (self.frames() as f64 * rate as f64 / self.sample_rate as f64).round() as u64
    }

    /// Stereo frame `i`, or silence past the end.
    #[inline]
    pub fn frame(&self, i: usize) -> (f32, f32) {
        match self.samples.get(2 * i..2 * i + 2) {
            Some(f) => (f[0], f[1]),
            None => (0.0, 0.0),
        }
    }

    /// Linearly interpolated frame at fractional position `pos`.
    #[inline]
    pub fn frame_lerp(&self, pos: f64) -> (f32, f32) {
        let i = pos.floor();
        let t = (pos - i) as f32;
        let i = i as usize;
        let (l0, r0) = self.frame(i);
        let (l1, r1) = self.frame(i + 1);
        (l0 + (l1 - l0) * t, r0 + (r1 - r0) * t)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    /// Splits into planar left/right channels.
    pub fn to_planar(&self) -> [Vec<f32>; 2] {
        let mut left = Vec::with_capacity(self.frames());
        let mut right = Vec::with_capacity(self.frames());
        for frame in self.samples.chunks_exact(2) {
            left.push(frame[0]);
            right.push(frame[1]);
        }
        [left, right]
    }

    /// Joins planar channels back into a buffer.
    pub fn from_planar(sample_rate: u32, left: &[f32], right: &[f32]) -> Self {
        let frames = left.len().min(right.len());
        let mut samples = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            samples.push(left[i]);
            samples.push(right[i]);
        }
        Self {
            sample_rate,
            samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_is_duplicated() {
        let buf = AudioBuffer::from_interleaved(44_100, 1, &[0.5, -0.25]);
        assert_eq!(buf.frames(), 2);
        assert_eq!(buf.frame(1), (-0.25, -0.25));
        assert_eq!(buf.frame(5), (0.0, 0.0));
    }

    #[test]
    fn test_extra_channels_dropped() {
        let buf = AudioBuffer::from_interleaved(48_000, 3, &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        assert_eq!(buf.frames(), 2);
        assert_eq!(buf.frame(1), (0.4, 0.5));
    }

    #[test]
    fn test_lerp_between_frames() {
        let buf = AudioBuffer::new(48_000, vec![0.0, 0.0, 1.0, -1.0]);
        assert_eq!(buf.frame_lerp(0.5), (0.5, -0.5));
    }

    #[test]
    fn test_duration_and_rate_conversion() {
        let buf = AudioBuffer::silence(48_000, 24_000);
        assert_eq!(buf.duration_seconds(), 0.5);
        assert_eq!(buf.frames_at_rate(96_000), 48_000);
        assert_eq!(buf.frames_at_rate(48_000), 24_000);
    }
}
