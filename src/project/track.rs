//! Track representation.
//!
//! A track is one of four variants (MIDI, beat, audio, sampler) sharing a
//! common header of identity and mixer settings. Tracks own their notes,
//! patterns and instrument bindings exclusively.

use super::automation::Automation;
use super::note::{Note, NoteId};
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::loader::AudioBuffer;

/// Maximum volume percent accepted by the mixer.
pub const MAX_VOLUME_PERCENT: f32 = 150.0;

/// Step counts a beat pattern may use.
pub const VALID_STEP_COUNTS: [u32; 4] = [8, 16, 24, 32];

/// Stable identifier for a track, also used as the protocol token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    /// Generates a new random track ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TrackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instrument driving a MIDI track.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum InstrumentBinding {
    #[default]
    None,
    Soundfont {
        path: PathBuf,
        bank: u16,
        preset: u16,
    },
    Plugin {
        /// Library path, or a `builtin:` processor name.
        path: String,
        /// Opaque processor state.
        preset: Vec<u8>,
    },
}

/// One row of a step pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatRow {
    pub row_id: String,
    #[serde(default)]
    pub sample_path: Option<PathBuf>,
    /// Enabled steps, one entry per pattern step.
    pub steps: Vec<bool>,
}

/// A bar-long step pattern repeated every 4 beats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatPattern {
    pub step_count: u32,
    pub rows: Vec<BeatRow>,
}

impl BeatPattern {
    /// Creates an empty pattern.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless `step_count` is 8, 16, 24 or 32.
    pub fn new(step_count: u32) -> EngineResult<Self> {
        if !VALID_STEP_COUNTS.contains(&step_count) {
            return Err(EngineError::InvalidArgument(format!(
                "step count {} not in {:?}",
                step_count, VALID_STEP_COUNTS
            )));
        }
        Ok(Self {
            step_count,
            rows: Vec::new(),
        })
    }

    /// Appends a row with every step disabled and returns its index.
    pub fn add_row(&mut self, row_id: impl Into<String>, sample_path: Option<PathBuf>) -> usize {
        self.rows.push(BeatRow {
            row_id: row_id.into(),
            sample_path,
            steps: vec![false; self.step_count as usize],
        });
        self.rows.len() - 1
    }

    /// Index of the row with `row_id`.
    pub fn row_index(&self, row_id: &str) -> Option<usize> {
        self.rows.iter().position(|r| r.row_id == row_id)
    }

    /// Enables or disables one step.
    pub fn set_step(&mut self, row: usize, step: usize, enabled: bool) -> EngineResult<()> {
        let count = self.step_count as usize;
        let row = self
            .rows
            .get_mut(row)
            .ok_or_else(|| EngineError::InvalidArgument(format!("no row {}", row)))?;
        if step >= count {
            return Err(EngineError::InvalidArgument(format!(
                "step {} outside pattern of {}",
                step, count
            )));
        }
        row.steps[step] = enabled;
        Ok(())
    }

    /// Beat offset of step `k` inside its bar.
    pub fn step_beat(&self, k: usize) -> f64 {
        k as f64 * 4.0 / self.step_count as f64
    }

    /// Pads or truncates every row so its bitmap matches `step_count`.
    pub fn normalize(&mut self) {
        let count = self.step_count as usize;
        for row in &mut self.rows {
            row.steps.resize(count, false);
        }
    }

    /// True when every row's bitmap length equals the step count.
    pub fn is_consistent(&self) -> bool {
        VALID_STEP_COUNTS.contains(&self.step_count)
            && self
                .rows
                .iter()
                .all(|r| r.steps.len() == self.step_count as usize)
    }

    pub fn has_enabled_steps(&self) -> bool {
        self.rows.iter().any(|r| r.steps.iter().any(|&s| s))
    }
}

/// Notes driving an instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct MidiTrack {
    pub notes: Vec<Note>,
    pub length_beats: f64,
    pub instrument: InstrumentBinding,
}

/// A step-sequenced drum track.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatTrack {
    pub pattern: BeatPattern,
    /// Always a positive multiple of 4.
    pub length_beats: f64,
}

/// A track playing one audio file from its offset.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub clip_path: PathBuf,
    /// Decoded clip, filled in by the loader.
    pub clip: Option<Arc<AudioBuffer>>,
}

/// A track playing one sample pitched per note.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerTrack {
    pub notes: Vec<Note>,
    pub sample_path: Option<PathBuf>,
    pub base_midi_note: u8,
    pub length_beats: f64,
}

/// Variant-specific track content.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackKind {
    Midi(MidiTrack),
    Beat(BeatTrack),
    Audio(AudioTrack),
    Sampler(SamplerTrack),
}

impl TrackKind {
    /// Short tag used by the project file.
    pub fn tag(&self) -> &'static str {
        match self {
            TrackKind::Midi(_) => "midi",
            TrackKind::Beat(_) => "beat",
            TrackKind::Audio(_) => "audio",
            TrackKind::Sampler(_) => "sampler",
        }
    }
}

/// A track in the arrangement.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    /// Stable identifier.
    pub id: TrackId,
    /// Human-readable name.
    pub name: String,
    /// Display hint, e.g. `#4fa3ff`.
    pub color: String,
    /// Start of the track region in beats.
    pub offset_beats: f64,
    /// Volume percent (0-150).
    volume: f32,
    pub muted: bool,
    pub soloed: bool,
    pub automation: Automation,
    pub kind: TrackKind,
}

/// Rounds a length up to a positive multiple of 4 beats.
pub fn round_up_to_bar(beats: f64) -> f64 {
    ((beats / 4.0).ceil() * 4.0).max(4.0)
}

impl Track {
    fn with_kind(name: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: TrackId::new(),
            name: name.into(),
            color: "#4fa3ff".to_string(),
            offset_beats: 0.0,
            volume: 100.0,
            muted: false,
            soloed: false,
            automation: Automation::default(),
            kind,
        }
    }

    /// Creates an empty MIDI track with no instrument and a one-bar region.
    pub fn new_midi(name: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            TrackKind::Midi(MidiTrack {
                notes: Vec::new(),
                length_beats: 4.0,
                instrument: InstrumentBinding::None,
            }),
        )
    }

    /// Creates a one-bar beat track.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unsupported step count.
    pub fn new_beat(name: impl Into<String>, step_count: u32) -> EngineResult<Self> {
        Ok(Self::with_kind(
            name,
            TrackKind::Beat(BeatTrack {
                pattern: BeatPattern::new(step_count)?,
                length_beats: 4.0,
            }),
        ))
    }

    /// Creates an audio track for a clip file; the clip is decoded later.
    pub fn new_audio(name: impl Into<String>, clip_path: impl Into<PathBuf>) -> Self {
        Self::with_kind(
            name,
            TrackKind::Audio(AudioTrack {
                clip_path: clip_path.into(),
                clip: None,
            }),
        )
    }

    /// Creates a sampler track pitched around `base_midi_note`.
    pub fn new_sampler(
        name: impl Into<String>,
        sample_path: Option<PathBuf>,
        base_midi_note: u8,
    ) -> Self {
        Self::with_kind(
            name,
            TrackKind::Sampler(SamplerTrack {
                notes: Vec::new(),
                sample_path,
                base_midi_note: base_midi_note.min(127),
                length_beats: 4.0,
            }),
        )
    }

    /// Volume percent, always within [0, 150].
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the volume percent, clamping into [0, 150].
    pub fn set_volume(&mut self, percent: f32) {
        self.volume = if percent.is_finite() {
            percent.clamp(0.0, MAX_VOLUME_PERCENT)
        } else {
            100.0
        };
    }

    /// Notes for MIDI and sampler tracks.
    pub fn notes(&self) -> Option<&[Note]> {
        match &self.kind {
            TrackKind::Midi(t) => Some(&t.notes),
            TrackKind::Sampler(t) => Some(&t.notes),
            _ => None,
        }
    }

    /// Region length in beats; audio tracks need the bpm and sample rate of
    /// the decoded clip.
    pub fn length_beats(&self, bpm: f64) -> f64 {
        match &self.kind {
            TrackKind::Midi(t) => t.length_beats,
            TrackKind::Beat(t) => t.length_beats,
            TrackKind::Sampler(t) => t.length_beats,
            TrackKind::Audio(t) => t
                .clip
                .as_ref()
                .map(|c| c.duration_seconds() * bpm / 60.0)
                .unwrap_or(0.0),
        }
    }

    /// Declared length for tracks that persist one.
    pub fn declared_length(&self) -> Option<f64> {
        match &self.kind {
            TrackKind::Midi(t) => Some(t.length_beats),
            TrackKind::Beat(t) => Some(t.length_beats),
            TrackKind::Sampler(t) => Some(t.length_beats),
            TrackKind::Audio(_) => None,
        }
    }

    /// True when rendering this track can produce no sound at all.
    pub fn is_empty_region(&self) -> bool {
        match &self.kind {
            TrackKind::Midi(t) => t.notes.is_empty(),
            TrackKind::Sampler(t) => t.notes.is_empty(),
            TrackKind::Beat(t) => !t.pattern.has_enabled_steps(),
            TrackKind::Audio(t) => t.clip.as_ref().map(|c| c.frames() == 0).unwrap_or(true),
        }
    }

    /// Sets the declared length of a MIDI, beat or sampler track.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a note would end past the new length, if a
    /// beat track length is not a positive multiple of 4, or for audio tracks.
    pub fn set_length_beats(&mut self, beats: f64) -> EngineResult<()> {
        if !beats.is_finite() || beats <= 0.0 {
            return Err(EngineError::InvalidArgument(format!("length {}", beats)));
        }
        let latest_end = self
            .notes()
            .map(|n| n.iter().map(Note::end_beat).fold(0.0, f64::max))
            .unwrap_or(0.0);
        if latest_end > beats {
            return Err(EngineError::InvalidArgument(format!(
                "length {} shorter than last note end {}",
                beats, latest_end
            )));
        }
        match &mut self.kind {
            TrackKind::Midi(t) => t.length_beats = beats,
            TrackKind::Sampler(t) => t.length_beats = beats,
            TrackKind::Beat(t) => {
                if beats % 4.0 != 0.0 {
                    return Err(EngineError::InvalidArgument(format!(
                        "beat track length {} is not a multiple of 4",
                        beats
                    )));
                }
                t.length_beats = beats;
            }
            TrackKind::Audio(_) => {
                return Err(EngineError::InvalidArgument(
                    "audio track length follows its clip".into(),
                ))
            }
        }
        Ok(())
    }

    /// Adds a note to a MIDI or sampler track, growing the region to a whole
    /// number of bars when the note ends past it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an invalid note or a track without notes.
    pub fn add_note(&mut self, note: Note) -> EngineResult<NoteId> {
        if !note.is_valid() {
            return Err(EngineError::InvalidArgument(format!(
                "invalid note {:?}",
                note
            )));
        }
        let (notes, length) = match &mut self.kind {
            TrackKind::Midi(t) => (&mut t.notes, &mut t.length_beats),
            TrackKind::Sampler(t) => (&mut t.notes, &mut t.length_beats),
            _ => {
                return Err(EngineError::InvalidArgument(format!(
                    "track {} does not hold notes",
                    self.id
                )))
            }
        };
        if note.end_beat() > *length {
            *length = round_up_to_bar(note.end_beat());
        }
        let id = note.id;
        let pos = notes.partition_point(|n| n.start_beat <= note.start_beat);
        notes.insert(pos, note);
        Ok(id)
    }

    /// Removes a note by its ID.
    pub fn remove_note(&mut self, id: NoteId) -> Option<Note> {
        let notes = match &mut self.kind {
            TrackKind::Midi(t) => &mut t.notes,
            TrackKind::Sampler(t) => &mut t.notes,
            _ => return None,
        };
        let pos = notes.iter().position(|n| n.id == id)?;
        Some(notes.remove(pos))
    }

    /// The MIDI instrument binding, if this is a MIDI track.
    pub fn instrument(&self) -> Option<&InstrumentBinding> {
        match &self.kind {
            TrackKind::Midi(t) => Some(&t.instrument),
            _ => None,
        }
    }

    /// Replaces the instrument binding of a MIDI track, returning the prior one.
    pub fn bind_instrument(&mut self, binding: InstrumentBinding) -> EngineResult<InstrumentBinding> {
        match &mut self.kind {
            TrackKind::Midi(t) => Ok(std::mem::replace(&mut t.instrument, binding)),
            _ => Err(EngineError::InvalidArgument(format!(
                "track {} is not a MIDI track",
                self.id
            ))),
        }
    }

    /// Checks the per-track data-model invariants.
    pub fn validate(&self) -> EngineResult<()> {
        if !self.offset_beats.is_finite() || self.offset_beats < 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "track {} offset {}",
                self.id, self.offset_beats
            )));
        }
        if let Some(length) = self.declared_length() {
            if let Some(notes) = self.notes() {
                if let Some(bad) = notes.iter().find(|n| !n.is_valid() || n.end_beat() > length) {
                    return Err(EngineError::InvalidArgument(format!(
                        "note {} on track {} ends past {}",
                        bad.id.as_u64(),
                        self.id,
                        length
                    )));
                }
            }
        }
        if let TrackKind::Beat(beat) = &self.kind {
            if beat.length_beats <= 0.0 || beat.length_beats % 4.0 != 0.0 {
                return Err(EngineError::InvalidArgument(format!(
                    "beat track {} length {}",
                    self.id, beat.length_beats
                )));
            }
            if !beat.pattern.is_consistent() {
                return Err(EngineError::InvalidArgument(format!(
                    "beat track {} pattern bitmaps disagree with step count",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_clamped() {
        let mut track = Track::new_midi("Lead");
        track.set_volume(400.0);
        assert_eq!(track.volume(), 150.0);
        track.set_volume(-3.0);
        assert_eq!(track.volume(), 0.0);
        track.set_volume(f32::NAN);
        assert_eq!(track.volume(), 100.0);
    }

    #[test]
    fn test_add_note_grows_region() {
        let mut track = Track::new_midi("Lead");
        track.add_note(Note::new(60, 5.0, 1.0, 0.8)).unwrap();
        assert_eq!(track.declared_length(), Some(8.0));
        assert!(track.validate().is_ok());
    }

    #[test]
    fn test_notes_kept_sorted() {
        let mut track = Track::new_sampler("Keys", None, 60);
        track.add_note(Note::new(64, 2.0, 1.0, 0.8)).unwrap();
        track.add_note(Note::new(60, 0.0, 1.0, 0.8)).unwrap();
        let starts: Vec<f64> = track.notes().unwrap().iter().map(|n| n.start_beat).collect();
        assert_eq!(starts, vec![0.0, 2.0]);
    }

    #[test]
    fn test_beat_track_rejects_notes() {
        let mut track = Track::new_beat("Drums", 16).unwrap();
        assert!(track.add_note(Note::new(36, 0.0, 1.0, 1.0)).is_err());
    }

    #[test]
    fn test_beat_length_multiple_of_four() {
        let mut track = Track::new_beat("Drums", 16).unwrap();
        assert!(track.set_length_beats(6.0).is_err());
        assert!(track.set_length_beats(8.0).is_ok());
        assert_eq!(track.length_beats(120.0), 8.0);
    }

    #[test]
    fn test_invalid_step_count() {
        assert!(BeatPattern::new(12).is_err());
        assert!(Track::new_beat("Drums", 32).is_ok());
    }

    #[test]
    fn test_pattern_steps() {
        let mut pattern = BeatPattern::new(16).unwrap();
        let row = pattern.add_row("kick", None);
        pattern.set_step(row, 4, true).unwrap();
        assert!(pattern.set_step(row, 16, true).is_err());
        assert_eq!(pattern.step_beat(4), 1.0);
        assert!(pattern.has_enabled_steps());
        assert_eq!(pattern.row_index("kick"), Some(0));
    }

    #[test]
    fn test_normalize_bitmaps() {
        let mut pattern = BeatPattern::new(8).unwrap();
        pattern.rows.push(BeatRow {
            row_id: "hat".into(),
            sample_path: None,
            steps: vec![true; 3],
        });
        assert!(!pattern.is_consistent());
        pattern.normalize();
        assert!(pattern.is_consistent());
        assert_eq!(pattern.rows[0].steps.len(), 8);
    }

    #[test]
    fn test_shrink_below_note_rejected() {
        let mut track = Track::new_midi("Lead");
        track.add_note(Note::new(60, 2.0, 1.0, 0.8)).unwrap();
        assert!(track.set_length_beats(2.5).is_err());
        assert!(track.set_length_beats(3.0).is_ok());
    }

    #[test]
    fn test_round_up_to_bar() {
        assert_eq!(round_up_to_bar(0.5), 4.0);
        assert_eq!(round_up_to_bar(4.0), 4.0);
        assert_eq!(round_up_to_bar(9.0), 12.0);
    }

    #[test]
    fn test_bind_instrument_returns_prior() {
        let mut track = Track::new_midi("Lead");
        let prior = track
            .bind_instrument(InstrumentBinding::Soundfont {
                path: "piano.sf2".into(),
                bank: 0,
                preset: 0,
            })
            .unwrap();
        assert_eq!(prior, InstrumentBinding::None);
        assert!(matches!(
            track.instrument(),
            Some(InstrumentBinding::Soundfont { .. })
        ));
    }
}
