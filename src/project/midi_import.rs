//! Standard MIDI File (SMF) import.
//!
//! Merges the notes of a .mid file into an existing MIDI or sampler track.
//! Supports SMF Format 0 (single track) and Format 1 (multi-track) with
//! metrical (PPQ) timing.
//!
//! # Limitations
//!
//! - Only note on/off pairs become notes; every channel is merged
//! - Tempo, program and controller events are ignored
//! - SMPTE timecode timing and Format 2 files are rejected

use super::note::Note;
use super::track::Track;
use crate::error::{EngineError, EngineResult};
use midly::{Format, Smf, Timing, TrackEventKind};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Notes still held while walking a track.
/// Key is (channel, pitch), value is (start_tick, velocity).
type ActiveNotes = HashMap<(u8, u8), (u64, u8)>;

/// Imports a MIDI file into `track`.
///
/// # Arguments
///
/// * `track` - A MIDI or sampler track receiving the notes
/// * `path` - Path to the .mid or .midi file
///
/// # Returns
///
/// The number of notes merged
///
/// # Errors
///
/// Returns `NotFound`/`Decode` if the file cannot be read or parsed and
/// `Unsupported` for SMPTE timing or Format 2 files.
pub fn import_midi_file<P: AsRef<Path>>(track: &mut Track, path: P) -> EngineResult<usize> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::not_found(path),
        _ => EngineError::decode(path, e),
    })?;
    let count = import_midi_bytes(track, &data)?;
    tracing::info!("Imported {} notes from {}", count, path.display());
    Ok(count)
}

/// Imports an in-memory SMF into `track`; see [`import_midi_file`].
pub fn import_midi_bytes(track: &mut Track, data: &[u8]) -> EngineResult<usize> {
    if track.notes().is_none() {
        return Err(EngineError::InvalidArgument(format!(
            "track {} does not hold notes",
            track.id
        )));
    }

    let smf = Smf::parse(data).map_err(|e| EngineError::Decode(format!("MIDI parse error: {}", e)))?;

    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int() as u64,
        Timing::Timecode(_, _) => {
            return Err(EngineError::Unsupported(
                "SMPTE timecode timing not supported".to_string(),
            ))
        }
    };
    if ticks_per_beat == 0 {
        return Err(EngineError::Decode("MIDI header has zero ticks per beat".into()));
    }

    if smf.header.format == Format::Sequential {
        return Err(EngineError::Unsupported(
            "Format 2 (sequential) MIDI files not supported".to_string(),
        ));
    }

    let mut notes = Vec::new();
    for events in &smf.tracks {
        collect_notes(events, ticks_per_beat, &mut notes);
    }
    notes.sort_by(|a, b| a.start_beat.total_cmp(&b.start_beat));

    let count = notes.len();
    for note in notes {
        track.add_note(note)?;
    }
    Ok(count)
}

/// Walks one SMF track and appends its completed notes.
fn collect_notes(events: &[midly::TrackEvent], ticks_per_beat: u64, out: &mut Vec<Note>) {
    let mut active: ActiveNotes = HashMap::new();
    let mut current_tick: u64 = 0;
    let to_beats = |ticks: u64| ticks as f64 / ticks_per_beat as f64;

    for event in events {
        current_tick += event.delta.as_int() as u64;

        if let TrackEventKind::Midi { channel, message } = event.kind {
            let ch = channel.as_int();
            let (pitch, velocity, is_on) = match message {
                midly::MidiMessage::NoteOn { key, vel } => {
                    (key.as_int(), vel.as_int(), vel.as_int() > 0)
                }
                midly::MidiMessage::NoteOff { key, vel } => (key.as_int(), vel.as_int(), false),
                _ => continue,
            };

            if is_on {
                // A retrigger without note-off closes the held note first.
                if let Some((start, vel)) = active.insert((ch, pitch), (current_tick, velocity)) {
                    push_note(out, pitch, vel, start, current_tick, &to_beats);
                }
            } else if let Some((start, vel)) = active.remove(&(ch, pitch)) {
                push_note(out, pitch, vel, start, current_tick, &to_beats);
            }
        }
    }

    // Unterminated notes last one beat.
    for ((_, pitch), (start, velocity)) in active {
        push_note(out, pitch, velocity, start, start + ticks_per_beat, &to_beats);
    }
}

fn push_note(
    out: &mut Vec<Note>,
    pitch: u8,
    velocity: u8,
    start_tick: u64,
    end_tick: u64,
    to_beats: &impl Fn(u64) -> f64,
) {
    let start = to_beats(start_tick);
    let end = to_beats(end_tick.max(start_tick + 1));
    out.push(Note::new(pitch, start, end - start, velocity as f32 / 127.0));
}
