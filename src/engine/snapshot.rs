//! Immutable project snapshots for the audio thread.
//!
//! The UI side flattens a [`Project`] into a [`ProjectSnapshot`] whenever the
//! arrangement changes and hands it over through the command ring. The audio
//! thread only ever reads a snapshot; it never mutates or frees one.

use crate::error::{EngineError, EngineResult};
use crate::project::{
    samples_per_beat, Automation, InstrumentBinding, LoopRegion, Project, TrackId, TrackKind,
};
use std::collections::HashMap;

/// Gain-staging policy of the source feeding a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    /// MIDI track bound to a soundfont (+3 dB boost).
    Soundfont,
    /// MIDI track bound to a plugin processor.
    Plugin,
    /// MIDI track with no instrument; renders silence.
    Unbound,
    /// Audio clip, already near full scale (no pre-gain).
    Clip,
    /// Pitched one-shot sampler.
    Sampler,
    /// Step-sequenced one-shots; volume travels with each trigger.
    Beat,
}

/// A note with absolute beat positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapNote {
    pub start: f64,
    pub end: f64,
    pub midi: u8,
    pub velocity: f32,
}

/// Step bitmaps of a beat track.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapPattern {
    pub step_count: u32,
    /// One bitmap per row, in row order.
    pub rows: Vec<Vec<bool>>,
}

/// One track as the audio thread sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSnapshot {
    pub id: TrackId,
    /// Source slot on the audio thread.
    pub slot: usize,
    pub role: SourceRole,
    pub offset_beats: f64,
    pub length_beats: f64,
    /// Volume percent, already clamped to [0, 150].
    pub volume: f32,
    pub muted: bool,
    pub soloed: bool,
    /// Notes sorted by start.
    pub notes: Vec<SnapNote>,
    /// Longest note duration, used to bound note searches.
    pub max_note_beats: f64,
    pub pattern: Option<SnapPattern>,
    /// Decoded clip length in engine frames (audio tracks only).
    pub clip_frames: u64,
    pub automation: Automation,
}

impl TrackSnapshot {
    /// True when rendering can produce no sound.
    pub fn is_empty_region(&self) -> bool {
        match self.role {
            SourceRole::Clip => self.clip_frames == 0,
            SourceRole::Beat => self
                .pattern
                .as_ref()
                .map(|p| !p.rows.iter().any(|r| r.iter().any(|&s| s)))
                .unwrap_or(true),
            _ => self.notes.is_empty(),
        }
    }

    /// Exclusive end of the track region in absolute samples from beat 0.
    pub fn region_end_sample(&self, bpm: f64, sample_rate: u32) -> u64 {
        let spb = samples_per_beat(bpm, sample_rate);
        let start = (self.offset_beats * spb).round() as u64;
        match self.role {
            SourceRole::Clip => start + self.clip_frames,
            _ => ((self.offset_beats + self.length_beats) * spb).round() as u64,
        }
    }
}

/// An immutable view of the whole arrangement.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSnapshot {
    /// Monotonic build counter, for diagnostics.
    pub generation: u64,
    pub bpm: f64,
    pub loop_region: Option<LoopRegion>,
    pub tracks: Vec<TrackSnapshot>,
}

impl Default for ProjectSnapshot {
    fn default() -> Self {
        Self {
            generation: 0,
            bpm: 120.0,
            loop_region: None,
            tracks: Vec::new(),
        }
    }
}

impl ProjectSnapshot {
    /// Flattens a project.
    ///
    /// # Arguments
    ///
    /// * `project` - The arrangement to capture
    /// * `slots` - Source slot assigned to each track
    /// * `sample_rate` - Engine rate, used to size audio regions
    /// * `generation` - Build counter stored in the snapshot
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a track has no slot.
    pub fn build(
        project: &Project,
        slots: &HashMap<TrackId, usize>,
        sample_rate: u32,
        generation: u64,
    ) -> EngineResult<Self> {
        let bpm = project.bpm() as f64;
        let mut tracks = Vec::with_capacity(project.track_count());

        for track in project.tracks() {
            let slot = *slots.get(&track.id).ok_or_else(|| {
                EngineError::InvalidArgument(format!("track {} has no source slot", track.id))
            })?;

            let offset = track.offset_beats;
            let mut notes: Vec<SnapNote> = track
                .notes()
                .unwrap_or(&[])
                .iter()
                .map(|n| SnapNote {
                    start: offset + n.start_beat,
                    end: offset + n.end_beat(),
                    midi: n.midi,
                    velocity: n.velocity,
                })
                .collect();
            notes.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.midi.cmp(&b.midi)));
            let max_note_beats = notes.iter().map(|n| n.end - n.start).fold(0.0, f64::max);

            let (role, pattern, clip_frames) = match &track.kind {
                TrackKind::Midi(midi) => {
                    let role = match midi.instrument {
                        InstrumentBinding::None => SourceRole::Unbound,
                        InstrumentBinding::Soundfont { .. } => SourceRole::Soundfont,
                        InstrumentBinding::Plugin { .. } => SourceRole::Plugin,
                    };
                    (role, None, 0)
                }
                TrackKind::Beat(beat) => (
                    SourceRole::Beat,
                    Some(SnapPattern {
                        step_count: beat.pattern.step_count,
                        rows: beat.pattern.rows.iter().map(|r| r.steps.clone()).collect(),
                    }),
                    0,
                ),
                TrackKind::Audio(audio) => {
                    let frames = audio
                        .clip
                        .as_ref()
                        .map(|c| c.frames_at_rate(sample_rate))
                        .unwrap_or(0);
                    (SourceRole::Clip, None, frames)
                }
                TrackKind::Sampler(_) => (SourceRole::Sampler, None, 0),
            };

            tracks.push(TrackSnapshot {
                id: track.id.clone(),
                slot,
                role,
                offset_beats: offset,
                length_beats: track.length_beats(bpm),
                volume: track.volume(),
                muted: track.muted,
                soloed: track.soloed,
                notes,
                max_note_beats,
                pattern,
                clip_frames,
                automation: track.automation.clone(),
            });
        }

        Ok(Self {
            generation,
            bpm,
            loop_region: project.loop_region,
            tracks,
        })
    }

    pub fn any_solo(&self) -> bool {
        self.tracks.iter().any(|t| t.soloed)
    }

    /// Index of the track in `slot`.
    pub fn track_for_slot(&self, slot: usize) -> Option<usize> {
        self.tracks.iter().position(|t| t.slot == slot)
    }

    /// End of the last non-empty region in samples (0 for an empty project).
    pub fn end_sample(&self, sample_rate: u32) -> u64 {
        self.tracks
            .iter()
            .filter(|t| !t.is_empty_region())
            .map(|t| t.region_end_sample(self.bpm, sample_rate))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{Note, Track};

    fn slots_for(project: &Project) -> HashMap<TrackId, usize> {
        project
            .tracks()
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect()
    }

    #[test]
    fn test_notes_absolute_and_sorted() {
        let mut project = Project::new();
        let mut track = Track::new_midi("Lead");
        track.offset_beats = 4.0;
        track.add_note(Note::new(64, 1.0, 0.5, 0.5)).unwrap();
        track.add_note(Note::new(60, 0.0, 2.0, 0.5)).unwrap();
        project.add_track(track).unwrap();

        let snap = ProjectSnapshot::build(&project, &slots_for(&project), 44_100, 1).unwrap();
        let notes = &snap.tracks[0].notes;
        assert_eq!(notes[0].start, 4.0);
        assert_eq!(notes[1].start, 5.0);
        assert_eq!(notes[1].end, 5.5);
        assert_eq!(snap.tracks[0].max_note_beats, 2.0);
        assert_eq!(snap.tracks[0].role, SourceRole::Unbound);
    }

    #[test]
    fn test_end_sample_covers_regions() {
        let mut project = Project::new();
        let mut track = Track::new_midi("Lead");
        track.add_note(Note::new(60, 0.0, 1.0, 0.8)).unwrap();
        project.add_track(track).unwrap();
        project.add_track(Track::new_midi("Empty")).unwrap();

        let snap = ProjectSnapshot::build(&project, &slots_for(&project), 44_100, 1).unwrap();
        // One 4-beat bar at 120 bpm.
        assert_eq!(snap.end_sample(44_100), 88_200);
    }

    #[test]
    fn test_missing_slot_rejected() {
        let mut project = Project::new();
        project.add_track(Track::new_midi("Lead")).unwrap();
        assert!(ProjectSnapshot::build(&project, &HashMap::new(), 44_100, 1).is_err());
    }
}
