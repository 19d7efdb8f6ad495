//! One-shot sample playback.
//!
//! A [`SamplerSource`] serves two kinds of track:
//!
//! - sampler tracks: one buffer, pitched per note by `2^((midi − base) / 12)`
//! - beat tracks: one buffer per pattern row, fired by sample triggers
//!
//! Voices play to the end of their buffer. A note-off fades the matching
//! voices out over 5 ms instead of cutting them.

use super::VoiceSource;
use crate::engine::EventKind;
use crate::loader::AudioBuffer;
use std::sync::Arc;

/// Voices per sampler source.
pub const SAMPLER_VOICES: usize = 32;

/// Length of the note-off fade.
pub const RELEASE_FADE_SECONDS: f64 = 0.005;

#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    active: bool,
    /// Index into `SamplerSource::buffers`.
    buffer: usize,
    /// Triggering note, for note-offs; `None` for row triggers.
    key: Option<u8>,
    pos: f64,
    step: f64,
    gain: f32,
    /// Samples left in the release fade.
    fade_left: Option<u32>,
    serial: u64,
}

pub struct SamplerSource {
    /// Slot 0 is the pitched sample, slot `1 + row` a beat row.
    buffers: Vec<Option<Arc<AudioBuffer>>>,
    base_midi_note: u8,
    voices: [Voice; SAMPLER_VOICES],
    fade_len: u32,
    serial: u64,
    stolen: u32,
}

impl SamplerSource {
    /// A pitched sampler around `base_midi_note`.
    pub fn pitched(sample: Option<Arc<AudioBuffer>>, base_midi_note: u8) -> Self {
        Self::with_buffers(vec![sample], base_midi_note)
    }

    /// A beat sampler; `rows[i]` plays for triggers on row `i`.
    pub fn rows(rows: Vec<Option<Arc<AudioBuffer>>>) -> Self {
        let mut buffers = Vec::with_capacity(rows.len() + 1);
        buffers.push(None);
        buffers.extend(rows);
        Self::with_buffers(buffers, 60)
    }

    fn with_buffers(buffers: Vec<Option<Arc<AudioBuffer>>>, base_midi_note: u8) -> Self {
        Self {
            buffers,
            base_midi_note,
            voices: [Voice::default(); SAMPLER_VOICES],
            fade_len: (RELEASE_FADE_SECONDS * 44_100.0).round() as u32,
            serial: 0,
            stolen: 0,
        }
    }

    /// Rows that have a sample.
    pub fn loaded_rows(&self) -> usize {
        self.buffers.iter().skip(1).filter(|b| b.is_some()).count()
    }

    fn allocate(&mut self) -> usize {
        if let Some(i) = self.voices.iter().position(|v| !v.active) {
            return i;
        }
        self.stolen += 1;
        // Fading voices go first, then the oldest.
        let fading = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.fade_left.is_some())
            .min_by_key(|(_, v)| v.serial)
            .map(|(i, _)| i);
        fading.unwrap_or_else(|| {
            self.voices
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.serial)
                .map(|(i, _)| i)
                .unwrap_or(0)
        })
    }

    fn start(&mut self, buffer: usize, key: Option<u8>, step: f64, gain: f32) {
        if !matches!(self.buffers.get(buffer), Some(Some(_))) {
            return;
        }
        let slot = self.allocate();
        self.serial += 1;
        self.voices[slot] = Voice {
            active: true,
            buffer,
            key,
            pos: 0.0,
            step,
            gain,
            fade_left: None,
            serial: self.serial,
        };
    }

    fn fade(&mut self, key: Option<u8>) {
        let fade_len = self.fade_len;
        for v in self.voices.iter_mut().filter(|v| v.active) {
            if (key.is_none() || v.key == key) && v.fade_left.is_none() {
                v.fade_left = Some(fade_len);
            }
        }
    }
}

impl VoiceSource for SamplerSource {
    fn name(&self) -> &'static str {
        "sampler"
    }

    fn prepare(&mut self, sample_rate: u32, _max_block: usize) {
        self.fade_len = ((RELEASE_FADE_SECONDS * sample_rate as f64).round() as u32).max(1);
    }

    fn handle_event(&mut self, event: &EventKind) {
        match *event {
            EventKind::NoteOn { midi, velocity } => {
                let semitones = midi as f64 - self.base_midi_note as f64;
                let step = 2f64.powf(semitones / 12.0);
                self.start(0, Some(midi), step, velocity.clamp(0.0, 1.0));
            }
            EventKind::NoteOff { midi } => self.fade(Some(midi)),
            EventKind::SampleTrigger { row, gain } => {
                self.start(1 + row as usize, None, 1.0, gain.max(0.0));
            }
            EventKind::AllNotesOff => self.fade(None),
            _ => {}
        }
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        left.fill(0.0);
        right.fill(0.0);
        let fade_len = self.fade_len as f32;
        for voice in self.voices.iter_mut().filter(|v| v.active) {
            let Some(Some(buffer)) = self.buffers.get(voice.buffer) else {
                voice.active = false;
                continue;
            };
            let end = buffer.frames() as f64;
            for (l, r) in left.iter_mut().zip(right.iter_mut()) {
                if voice.pos >= end {
                    voice.active = false;
                    break;
                }
                let mut gain = voice.gain;
                if let Some(left_in_fade) = voice.fade_left {
                    if left_in_fade == 0 {
                        voice.active = false;
                        break;
                    }
                    gain *= left_in_fade as f32 / fade_len;
                    voice.fade_left = Some(left_in_fade - 1);
                }
                let (sl, sr) = buffer.frame_lerp(voice.pos);
                *l += sl * gain;
                *r += sr * gain;
                voice.pos += voice.step;
            }
        }
    }

    fn reset(&mut self) {
        for v in &mut self.voices {
            v.active = false;
        }
    }

    fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    fn take_stolen(&mut self) -> u32 {
        std::mem::take(&mut self.stolen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(frames: usize, value: f32) -> Arc<AudioBuffer> {
        Arc::new(AudioBuffer::new(44_100, vec![value; frames * 2]))
    }

    fn ramp(frames: usize) -> Arc<AudioBuffer> {
        let samples: Vec<f32> = (0..frames).flat_map(|i| [i as f32, i as f32]).collect();
        Arc::new(AudioBuffer::new(44_100, samples))
    }

    #[test]
    fn test_octave_up_plays_twice_as_fast() {
        let mut src = SamplerSource::pitched(Some(ramp(100)), 60);
        src.prepare(44_100, 64);
        src.handle_event(&EventKind::NoteOn {
            midi: 72,
            velocity: 1.0,
        });
        let mut l = [0.0; 4];
        let mut r = [0.0; 4];
        src.render(&mut l, &mut r);
        assert_eq!(l, [0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_note_off_fades_over_five_ms() {
        let mut src = SamplerSource::pitched(Some(constant(44_100, 1.0)), 60);
        src.prepare(44_100, 512);
        src.handle_event(&EventKind::NoteOn {
            midi: 60,
            velocity: 1.0,
        });
        src.handle_event(&EventKind::NoteOff { midi: 60 });
        let mut l = vec![0.0; 512];
        let mut r = vec![0.0; 512];
        src.render(&mut l, &mut r);
        // 5 ms at 44.1 kHz is 221 samples (rounded 220.5).
        assert_eq!(l[0], 1.0);
        assert!(l[100] < 1.0 && l[100] > 0.0);
        assert!(l[230..].iter().all(|&s| s == 0.0));
        assert_eq!(src.active_voices(), 0);
    }

    #[test]
    fn test_rows_fire_with_trigger_gain() {
        let mut src = SamplerSource::rows(vec![Some(constant(10, 0.5)), None]);
        src.prepare(44_100, 64);
        assert_eq!(src.loaded_rows(), 1);

        src.handle_event(&EventKind::SampleTrigger { row: 1, gain: 1.0 });
        assert_eq!(src.active_voices(), 0);

        src.handle_event(&EventKind::SampleTrigger { row: 0, gain: 0.5 });
        let mut l = [0.0; 12];
        let mut r = [0.0; 12];
        src.render(&mut l, &mut r);
        assert_eq!(l[0], 0.25);
        assert_eq!(l[9], 0.25);
        assert_eq!(l[10], 0.0);
        assert_eq!(src.active_voices(), 0);
    }

    #[test]
    fn test_voices_bounded() {
        let mut src = SamplerSource::pitched(Some(constant(1000, 0.1)), 60);
        src.prepare(44_100, 64);
        for i in 0..(SAMPLER_VOICES as u8 + 4) {
            src.handle_event(&EventKind::NoteOn {
                midi: 40 + i,
                velocity: 1.0,
            });
        }
        assert_eq!(src.active_voices(), SAMPLER_VOICES);
        assert_eq!(src.take_stolen(), 4);
    }

    #[test]
    fn test_empty_sampler_is_silent() {
        let mut src = SamplerSource::pitched(None, 60);
        src.prepare(44_100, 64);
        src.handle_event(&EventKind::NoteOn {
            midi: 60,
            velocity: 1.0,
        });
        assert_eq!(src.active_voices(), 0);
    }
}
