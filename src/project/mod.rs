//! Arrangement data model.
//!
//! This module provides the types the engine plays: projects, the four
//! track variants, notes, step patterns, instrument bindings and automation
//! curves. Beats are the unit of musical time throughout; the engine converts
//! them to samples with [`beats_to_samples`].

mod arrangement;
mod automation;
mod file;
mod midi_import;
mod note;
mod track;

pub use arrangement::{is_audible, LoopRegion, Project, DEFAULT_BPM, MAX_BPM, MIN_BPM};
pub use automation::{Automation, AutomationCurve, AutomationPoint, ParamKind};
pub use file::{load_project, project_from_json, project_to_json, save_project, CURRENT_VERSION};
pub use midi_import::{import_midi_bytes, import_midi_file};
pub use note::{Note, NoteId};
pub use track::{
    round_up_to_bar, AudioTrack, BeatPattern, BeatRow, BeatTrack, InstrumentBinding, MidiTrack,
    SamplerTrack, Track, TrackId, TrackKind, MAX_VOLUME_PERCENT, VALID_STEP_COUNTS,
};

/// Samples in one beat at a given tempo.
///
/// # Examples
///
/// ```
/// use beatline::project::samples_per_beat;
///
/// assert_eq!(samples_per_beat(120.0, 48_000), 24_000.0);
/// ```
pub fn samples_per_beat(bpm: f64, sample_rate: u32) -> f64 {
    60.0 * sample_rate as f64 / bpm
}

/// Converts beats to (fractional) samples: `beats × 60 × sampleRate ÷ bpm`.
pub fn beats_to_samples(beats: f64, bpm: f64, sample_rate: u32) -> f64 {
    beats * samples_per_beat(bpm, sample_rate)
}

/// Converts a sample count back to beats.
pub fn samples_to_beats(samples: f64, bpm: f64, sample_rate: u32) -> f64 {
    samples / samples_per_beat(bpm, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beat_conversion() {
        assert_eq!(beats_to_samples(2.0, 120.0, 44_100), 44_100.0);
        assert_eq!(samples_to_beats(24_000.0, 120.0, 48_000), 1.0);
        assert_eq!(beats_to_samples(1.0, 60.0, 48_000), 48_000.0);
    }
}
