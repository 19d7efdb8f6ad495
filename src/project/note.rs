//! Note representation.
//!
//! A note is a pitched event on a MIDI or sampler track, positioned in beats
//! relative to the start of its track region.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique note IDs.
static NOTE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a note within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub struct NoteId(u64);

impl NoteId {
    /// Generates a new unique note ID.
    ///
    /// Thread-safe: uses atomic increment internally.
    pub fn new() -> Self {
        Self(NOTE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a persisted ID and makes sure freshly generated IDs never collide with it.
    pub fn from_raw(raw: u64) -> Self {
        NOTE_ID_COUNTER.fetch_max(raw.saturating_add(1), Ordering::Relaxed);
        Self(raw)
    }

    /// Returns the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NoteId {
    fn from(raw: u64) -> Self {
        Self::from_raw(raw)
    }
}

impl From<NoteId> for u64 {
    fn from(id: NoteId) -> Self {
        id.0
    }
}

impl Default for NoteId {
    fn default() -> Self {
        Self::new()
    }
}

/// A single note with beat-based timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Unique identifier for this note instance.
    #[serde(rename = "noteId")]
    pub id: NoteId,

    /// MIDI note number (0-127). 60 = Middle C (C4).
    pub midi: u8,

    /// Start position in beats from the track's offset.
    pub start_beat: f64,

    /// Length in beats, always positive.
    pub duration_beats: f64,

    /// Normalized velocity (0.0-1.0).
    pub velocity: f32,
}

impl Note {
    /// Creates a new note, clamping pitch and velocity into range.
    ///
    /// # Arguments
    ///
    /// * `midi` - MIDI note number (0-127)
    /// * `start_beat` - Start position in beats, negative values become 0
    /// * `duration_beats` - Length in beats
    /// * `velocity` - Velocity in 0.0-1.0
    ///
    /// # Examples
    ///
    /// ```
    /// use beatline::project::Note;
    ///
    /// // Middle C, one beat long, starting on the downbeat
    /// let note = Note::new(60, 0.0, 1.0, 0.8);
    /// assert_eq!(note.end_beat(), 1.0);
    /// ```
    pub fn new(midi: u8, start_beat: f64, duration_beats: f64, velocity: f32) -> Self {
        Self {
            id: NoteId::new(),
            midi: midi.min(127),
            start_beat: start_beat.max(0.0),
            duration_beats,
            velocity: velocity.clamp(0.0, 1.0),
        }
    }

    /// Returns the end of this note in track-relative beats.
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }

    /// Checks if this note is sounding at a track-relative beat.
    pub fn is_active_at(&self, beat: f64) -> bool {
        beat >= self.start_beat && beat < self.end_beat()
    }

    /// True when every field is inside its documented range.
    pub fn is_valid(&self) -> bool {
        self.midi <= 127
            && self.start_beat.is_finite()
            && self.start_beat >= 0.0
            && self.duration_beats.is_finite()
            && self.duration_beats > 0.0
            && (0.0..=1.0).contains(&self.velocity)
    }

    /// Snaps the start to a grid of `division` beats (e.g. 0.25 for sixteenths).
    pub fn quantize(&mut self, division: f64) {
        if division > 0.0 {
            self.start_beat = (self.start_beat / division).round() * division;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_creation() {
        let note = Note::new(60, 0.0, 1.0, 0.8);
        assert_eq!(note.midi, 60);
        assert_eq!(note.start_beat, 0.0);
        assert_eq!(note.duration_beats, 1.0);
        assert!(note.is_valid());
    }

    #[test]
    fn test_note_clamping() {
        let note = Note::new(200, -1.0, 1.0, 3.0);
        assert_eq!(note.midi, 127);
        assert_eq!(note.start_beat, 0.0);
        assert_eq!(note.velocity, 1.0);
    }

    #[test]
    fn test_note_active() {
        let note = Note::new(60, 1.0, 0.5, 0.5);
        assert!(!note.is_active_at(0.99));
        assert!(note.is_active_at(1.0));
        assert!(note.is_active_at(1.25));
        assert!(!note.is_active_at(1.5));
    }

    #[test]
    fn test_quantize() {
        let mut note = Note::new(60, 1.13, 0.5, 0.5);
        note.quantize(0.25);
        assert_eq!(note.start_beat, 1.25);
    }

    #[test]
    fn test_from_raw_advances_counter() {
        let persisted = NoteId::from_raw(1_000_000);
        let fresh = NoteId::new();
        assert!(fresh.as_u64() > persisted.as_u64());
    }

    #[test]
    fn test_zero_duration_invalid() {
        let mut note = Note::new(60, 0.0, 1.0, 0.5);
        note.duration_beats = 0.0;
        assert!(!note.is_valid());
    }
}
