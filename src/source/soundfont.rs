//! Soundfont synthesis.
//!
//! Each note-on starts one voice per matching zone (stereo samples are two
//! zones panned apart). A voice walks its zone's PCM with linear
//! interpolation, loops when the zone says so and is shaped by the zone's
//! volume envelope. Voices are reclaimed once their release falls below
//! -80 dBFS.

use super::envelope::Envelope;
use super::VoiceSource;
use crate::engine::EventKind;
use crate::loader::{SfZone, SoundfontBank, ZoneLoop};
use crate::mix::constant_power_pan;
use std::sync::Arc;

/// Voices per soundfont source.
pub const SOUNDFONT_VOICES: usize = 256;

#[derive(Debug, Clone)]
struct Voice {
    active: bool,
    key: u8,
    zone: SfZone,
    /// Read position in the PCM pool.
    pos: f64,
    step: f64,
    gain_l: f32,
    gain_r: f32,
    env: Envelope,
    released: bool,
    /// Start order, for stealing.
    serial: u64,
}

impl Voice {
    fn idle(zone: SfZone, sample_rate: u32) -> Self {
        Self {
            active: false,
            key: 0,
            env: Envelope::new(&zone.envelope, sample_rate),
            zone,
            pos: 0.0,
            step: 0.0,
            gain_l: 0.0,
            gain_r: 0.0,
            released: false,
            serial: 0,
        }
    }

    fn release(&mut self) {
        if self.active && !self.released {
            self.released = true;
            self.env.release();
        }
    }

    /// Adds this voice into the output. Returns false once the voice ends.
    #[inline]
    fn render_into(&mut self, pcm: &[f32], left: &mut [f32], right: &mut [f32]) -> bool {
        let zone = &self.zone;
        let looping = zone
            .loop_range()
            .filter(|_| zone.loop_mode == ZoneLoop::Continuous || !self.released);

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let idx = self.pos as usize;
            if looping.is_none() && idx + 1 >= zone.end {
                return false;
            }
            let next_idx = match looping {
                Some((ls, le)) if idx + 1 >= le => ls,
                _ => idx + 1,
            };
            let frac = (self.pos - idx as f64) as f32;
            let a = pcm[idx.min(zone.end - 1)];
            let b = pcm[next_idx.min(zone.end - 1)];
            let s = a + (b - a) * frac;

            let g = self.env.next_gain();
            *l += s * g * self.gain_l;
            *r += s * g * self.gain_r;

            self.pos += self.step;
            if let Some((ls, le)) = looping {
                let len = (le - ls) as f64;
                while self.pos >= le as f64 {
                    self.pos -= len;
                }
            }
            if self.env.is_done() {
                return false;
            }
        }
        true
    }
}

/// Soundfont-backed instrument for one MIDI track.
pub struct SoundfontSource {
    bank: Arc<SoundfontBank>,
    preset: usize,
    sample_rate: u32,
    voices: Vec<Voice>,
    serial: u64,
    stolen: u32,
}

impl SoundfontSource {
    /// Creates a source playing `bank`/`program`, falling back to the first
    /// preset when that pair does not exist.
    ///
    /// # Returns
    ///
    /// The source and whether the fallback was taken
    pub fn new(bank: Arc<SoundfontBank>, bank_number: u16, program: u16) -> (Self, bool) {
        let (preset, fallback) = match bank
            .presets()
            .iter()
            .position(|p| p.bank == bank_number && p.program == program)
        {
            Some(i) => (i, false),
            None => (0, true),
        };
        let source = Self {
            bank,
            preset,
            sample_rate: 44_100,
            voices: Vec::new(),
            serial: 0,
            stolen: 0,
        };
        (source, fallback)
    }

    pub fn preset_name(&self) -> &str {
        &self.bank.presets()[self.preset].name
    }

    fn allocate(&mut self) -> usize {
        if let Some(i) = self.voices.iter().position(|v| !v.active) {
            return i;
        }
        self.stolen += 1;
        // Oldest releasing voice first, then the oldest of all.
        let oldest = |released: bool| {
            self.voices
                .iter()
                .enumerate()
                .filter(|(_, v)| !released || v.released)
                .min_by_key(|(_, v)| v.serial)
                .map(|(i, _)| i)
        };
        oldest(true).or_else(|| oldest(false)).unwrap_or(0)
    }

    fn note_on(&mut self, key: u8, velocity: f32) {
        if self.voices.is_empty() {
            return;
        }
        let vel7 = (velocity * 127.0).round().clamp(1.0, 127.0) as u8;
        let bank = Arc::clone(&self.bank);
        let preset = &bank.presets()[self.preset];
        for zone in preset.zones.iter().filter(|z| z.matches(key, vel7)) {
            let slot = self.allocate();
            self.serial += 1;

            let amp = velocity.clamp(0.0, 1.0) * 10f32.powf(-zone.attenuation_db / 20.0);
            let (pan_l, pan_r) = constant_power_pan(zone.pan);
            let mut env = Envelope::new(&zone.envelope, self.sample_rate);
            env.trigger();

            self.voices[slot] = Voice {
                active: true,
                key,
                zone: *zone,
                pos: zone.start as f64,
                step: zone.pitch_ratio(key, self.sample_rate),
                gain_l: amp * pan_l,
                gain_r: amp * pan_r,
                env,
                released: false,
                serial: self.serial,
            };
        }
    }
}

impl VoiceSource for SoundfontSource {
    fn name(&self) -> &'static str {
        "soundfont"
    }

    fn prepare(&mut self, sample_rate: u32, _max_block: usize) {
        self.sample_rate = sample_rate;
        let template = self.bank.presets()[self.preset]
            .zones
            .first()
            .copied()
            .unwrap_or(SfZone {
                key_lo: 0,
                key_hi: 0,
                vel_lo: 0,
                vel_hi: 0,
                start: 0,
                end: 1,
                loop_start: 0,
                loop_end: 0,
                loop_mode: ZoneLoop::None,
                sample_rate,
                root_key: 60,
                tune_cents: 0.0,
                scale_tuning: 100.0,
                attenuation_db: 0.0,
                pan: 0.0,
                envelope: Default::default(),
            });
        self.voices = vec![Voice::idle(template, sample_rate); SOUNDFONT_VOICES];
    }

    fn handle_event(&mut self, event: &EventKind) {
        match *event {
            EventKind::NoteOn { midi, velocity } => self.note_on(midi, velocity),
            EventKind::NoteOff { midi } => {
                for v in self.voices.iter_mut().filter(|v| v.key == midi) {
                    v.release();
                }
            }
            EventKind::AllNotesOff => {
                for v in &mut self.voices {
                    v.release();
                }
            }
            _ => {}
        }
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        left.fill(0.0);
        right.fill(0.0);
        let pcm = self.bank.pcm();
        for voice in self.voices.iter_mut().filter(|v| v.active) {
            if !voice.render_into(pcm, left, right) {
                voice.active = false;
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
    use crate::loader::test_support::sine_bank;

    fn source(sample_rate: u32) -> SoundfontSource {
        let (mut src, fallback) = SoundfontSource::new(Arc::new(sine_bank(sample_rate)), 0, 0);
        assert!(!fallback);
        src.prepare(sample_rate, 512);
        src
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn test_note_sounds_and_releases() {
        let mut src = source(44_100);
        let mut l = vec![0.0; 4410];
        let mut r = vec![0.0; 4410];

        src.handle_event(&EventKind::NoteOn {
            midi: 69,
            velocity: 1.0,
        });
        src.render(&mut l, &mut r);
        assert!(peak(&l) > 0.3);
        assert_eq!(src.active_voices(), 1);

        src.handle_event(&EventKind::NoteOff { midi: 69 });
        // 0.2 s release covers 100 dB; one second is plenty.
        for _ in 0..10 {
            src.render(&mut l, &mut r);
        }
        assert_eq!(src.active_voices(), 0);
        assert!(peak(&l) == 0.0);
    }

    #[test]
    fn test_centre_pan_is_equal_power() {
        let mut src = source(44_100);
        let mut l = vec![0.0; 1000];
        let mut r = vec![0.0; 1000];
        src.handle_event(&EventKind::NoteOn {
            midi: 60,
            velocity: 0.8,
        });
        src.render(&mut l, &mut r);
        assert_eq!(l, r);
    }

    #[test]
    fn test_voice_stealing_bounded() {
        let mut src = source(44_100);
        for i in 0..(SOUNDFONT_VOICES + 10) {
            src.handle_event(&EventKind::NoteOn {
                midi: (i % 128) as u8,
                velocity: 0.5,
            });
        }
        assert_eq!(src.active_voices(), SOUNDFONT_VOICES);
        assert_eq!(src.take_stolen(), 10);
        assert_eq!(src.take_stolen(), 0);
    }

    #[test]
    fn test_preset_fallback_reported() {
        let (src, fallback) = SoundfontSource::new(Arc::new(sine_bank(44_100)), 128, 0);
        assert!(fallback);
        assert_eq!(src.preset_name(), "Sine");
    }

    #[test]
    fn test_reset_silences() {
        let mut src = source(44_100);
        src.handle_event(&EventKind::NoteOn {
            midi: 64,
            velocity: 1.0,
        });
        src.reset();
        let mut l = vec![1.0; 64];
        let mut r = vec![1.0; 64];
        src.render(&mut l, &mut r);
        assert!(l.iter().chain(r.iter()).all(|&s| s == 0.0));
    }
}
