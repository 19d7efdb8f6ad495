//! SoundFont (SF2) loading.
//!
//! rustysynth parses the RIFF structure; this module flattens each preset
//! into playable zones: a slice of the shared PCM pool plus the key and
//! velocity range, loop points, tuning and volume envelope taken from the
//! instrument-level generators.

use crate::error::{EngineError, EngineResult};
use rustysynth::{LoopMode, SoundFont};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a zone's sample loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneLoop {
    /// Plays once to the sample end.
    None,
    /// Loops for the whole life of the voice.
    Continuous,
    /// Loops until note-off, then plays through to the end.
    UntilRelease,
}

/// Volume envelope generators, times in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SfEnvelope {
    pub delay: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    /// Sustain attenuation in dB (0 = full level).
    pub sustain_db: f32,
    pub release: f32,
}

impl Default for SfEnvelope {
    fn default() -> Self {
        Self {
            delay: 0.0,
            attack: 0.001,
            hold: 0.0,
            decay: 0.001,
            sustain_db: 0.0,
            release: 0.1,
        }
    }
}

/// One playable zone of a preset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SfZone {
    pub key_lo: u8,
    pub key_hi: u8,
    pub vel_lo: u8,
    pub vel_hi: u8,
    /// Sample range in the bank's PCM pool, end exclusive.
    pub start: usize,
    pub end: usize,
    pub loop_start: usize,
    pub loop_end: usize,
    pub loop_mode: ZoneLoop,
    pub sample_rate: u32,
    pub root_key: u8,
    /// Coarse and fine tuning combined, in cents.
    pub tune_cents: f32,
    /// Cents per key (100 = equal temperament).
    pub scale_tuning: f32,
    pub attenuation_db: f32,
    /// -1 (left) to 1 (right).
    pub pan: f32,
    pub envelope: SfEnvelope,
}

impl SfZone {
    pub fn matches(&self, key: u8, velocity: u8) -> bool {
        (self.key_lo..=self.key_hi).contains(&key) && (self.vel_lo..=self.vel_hi).contains(&velocity)
    }

    /// Playback increment for `key` at engine rate `output_rate`.
    pub fn pitch_ratio(&self, key: u8, output_rate: u32) -> f64 {
        let cents = (key as f64 - self.root_key as f64) * self.scale_tuning as f64
            + self.tune_cents as f64;
        2f64.powf(cents / 1200.0) * self.sample_rate as f64 / output_rate as f64
    }

    fn loop_valid(&self) -> bool {
        self.loop_mode != ZoneLoop::None
            && self.loop_start < self.loop_end
            && self.loop_end <= self.end
            && self.loop_start >= self.start
    }

    /// Loop points when the zone loops and they are usable.
    pub fn loop_range(&self) -> Option<(usize, usize)> {
        self.loop_valid().then_some((self.loop_start, self.loop_end))
    }
}

/// A bank/program entry with its zones.
#[derive(Debug, Clone, PartialEq)]
pub struct SfPreset {
    pub name: String,
    pub bank: u16,
    pub program: u16,
    pub zones: Vec<SfZone>,
}

/// A loaded soundfont: PCM pool plus presets.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundfontBank {
    pub path: PathBuf,
    pcm: Arc<[f32]>,
    presets: Vec<SfPreset>,
}

impl SoundfontBank {
    /// Builds a bank from already decoded parts.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if there are no presets or a zone points outside the
    /// PCM pool.
    pub fn from_parts(path: PathBuf, pcm: Vec<f32>, presets: Vec<SfPreset>) -> EngineResult<Self> {
        if presets.is_empty() {
            return Err(EngineError::decode(&path, "soundfont has no presets"));
        }
        if let Some(bad) = presets
            .iter()
            .flat_map(|p| p.zones.iter())
            .find(|z| z.start >= z.end || z.end > pcm.len())
        {
            return Err(EngineError::decode(
                &path,
                format!("zone sample range {}..{} out of bounds", bad.start, bad.end),
            ));
        }
        Ok(Self {
            path,
            pcm: pcm.into(),
            presets,
        })
    }

    pub fn pcm(&self) -> &Arc<[f32]> {
        &self.pcm
    }

    pub fn presets(&self) -> &[SfPreset] {
        &self.presets
    }

    /// Exact bank/program match.
    pub fn preset(&self, bank: u16, program: u16) -> Option<&SfPreset> {
        self.presets
            .iter()
            .find(|p| p.bank == bank && p.program == program)
    }

    /// Resolves a preset, falling back to the first one.
    ///
    /// # Returns
    ///
    /// The preset and whether the fallback was taken
    pub fn resolve(&self, bank: u16, program: u16) -> (&SfPreset, bool) {
        match self.preset(bank, program) {
            Some(p) => (p, false),
            // `from_parts` guarantees at least one preset.
            None => (&self.presets[0], true),
        }
    }
}

/// Loads and flattens an SF2 file.
///
/// # Errors
///
/// Returns `NotFound` for a missing file and `Decode` for a malformed one.
pub fn load_soundfont<P: AsRef<Path>>(path: P) -> EngineResult<SoundfontBank> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::not_found(path),
        _ => EngineError::decode(path, e),
    })?;
    let mut reader = BufReader::new(file);
    let sf = SoundFont::new(&mut reader)
        .map_err(|e| EngineError::decode(path, format!("{:?}", e)))?;

    let pcm: Vec<f32> = sf
        .get_wave_data()
        .iter()
        .map(|&s| s as f32 / 32_768.0)
        .collect();

    let instruments = sf.get_instruments();
    let mut presets = Vec::new();
    for preset in sf.get_presets().iter() {
        let mut zones = Vec::new();
        for pr in preset.get_regions().iter() {
            let Some(instrument) = instruments.get(pr.get_instrument_id()) else {
                continue;
            };
            for ir in instrument.get_regions().iter() {
                let key_lo = ir.get_key_range_start().max(pr.get_key_range_start());
                let key_hi = ir.get_key_range_end().min(pr.get_key_range_end());
                let vel_lo = ir.get_velocity_range_start().max(pr.get_velocity_range_start());
                let vel_hi = ir.get_velocity_range_end().min(pr.get_velocity_range_end());
                if key_lo > key_hi || vel_lo > vel_hi {
                    continue;
                }
                let start = ir.get_sample_start().max(0) as usize;
                let end = (ir.get_sample_end().max(0) as usize).min(pcm.len());
                if start >= end {
                    continue;
                }
                zones.push(SfZone {
                    key_lo: key_lo.clamp(0, 127) as u8,
                    key_hi: key_hi.clamp(0, 127) as u8,
                    vel_lo: vel_lo.clamp(0, 127) as u8,
                    vel_hi: vel_hi.clamp(0, 127) as u8,
                    start,
                    end,
                    loop_start: ir.get_sample_start_loop().max(0) as usize,
                    loop_end: ir.get_sample_end_loop().max(0) as usize,
                    loop_mode: match ir.get_sample_modes() {
                        LoopMode::Continuous => ZoneLoop::Continuous,
                        LoopMode::LoopUntilNoteOff => ZoneLoop::UntilRelease,
                        _ => ZoneLoop::None,
                    },
                    sample_rate: sf.get_sample_headers()[ir.get_sample_id()].get_sample_rate().max(1) as u32,
                    root_key: ir.get_root_key().clamp(0, 127) as u8,
                    tune_cents: (ir.get_coarse_tune() * 100 + ir.get_fine_tune()) as f32,
                    scale_tuning: ir.get_scale_tuning() as f32,
                    attenuation_db: ir.get_initial_attenuation().max(0.0),
                    pan: (ir.get_pan() / 50.0).clamp(-1.0, 1.0),
                    envelope: SfEnvelope {
                        delay: ir.get_delay_volume_envelope(),
                        attack: ir.get_attack_volume_envelope(),
                        hold: ir.get_hold_volume_envelope(),
                        decay: ir.get_decay_volume_envelope(),
                        sustain_db: ir.get_sustain_volume_envelope().clamp(0.0, 144.0),
                        release: ir.get_release_volume_envelope(),
                    },
                });
            }
        }
        presets.push(SfPreset {
            name: preset.get_name().to_string(),
            bank: preset.get_bank_number().clamp(0, u16::MAX as i32) as u16,
            program: preset.get_patch_number().clamp(0, u16::MAX as i32) as u16,
            zones,
        });
    }
    presets.sort_by_key(|p| (p.bank, p.program));

    let bank = SoundfontBank::from_parts(path.to_path_buf(), pcm, presets)?;
    tracing::info!(
        "Loaded soundfont {} ({} presets)",
        path.display(),
        bank.presets().len()
    );
    Ok(bank)
}


#[cfg(test)]
mod tests {
    use super::test_support::sine_bank;
    use super::*;

    #[test]
    fn test_preset_fallback() {
        let bank = sine_bank(44_100);
        let (preset, fallback) = bank.resolve(0, 0);
        assert_eq!(preset.name, "Sine");
        assert!(!fallback);
        let (preset, fallback) = bank.resolve(128, 5);
        assert_eq!(preset.name, "Sine");
        assert!(fallback);
    }

    #[test]
    fn test_pitch_ratio() {
        let bank = sine_bank(44_100);
        let zone = &bank.presets()[0].zones[0];
        assert!((zone.pitch_ratio(69, 44_100) - 1.0).abs() < 1e-12);
        assert!((zone.pitch_ratio(81, 44_100) - 2.0).abs() < 1e-12);
        assert!((zone.pitch_ratio(69, 88_200) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_zone_bounds_checked() {
        let mut zone = sine_bank(44_100).presets()[0].zones[0];
        zone.end = 10_000_000;
        let preset = SfPreset {
            name: "Bad".into(),
            bank: 0,
            program: 0,
            zones: vec![zone],
        };
        assert!(SoundfontBank::from_parts("bad.sf2".into(), vec![0.0; 16], vec![preset]).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_soundfont("/definitely/not/here.sf2").unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.sf2");
        std::fs::write(&path, b"RIFF\x04\x00\x00\x00sfbk").unwrap();
        let err = load_soundfont(&path).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }
}
