//! Block scheduler.
//!
//! Turns a [`ProjectSnapshot`] and a transport anchor into sample-accurate
//! events for one segment of an output block. Every event position is
//! computed as an absolute sample, `round(origin + beat × samplesPerBeat)`,
//! and kept only if it falls inside the segment. Because the rounding never
//! depends on where block boundaries land, the same arrangement yields the
//! same event samples at any block size.
//!
//! Nothing in here allocates; events go into a preallocated [`EventBuffer`].

use super::event::{Event, EventBuffer, EventKind};
use super::snapshot::{ProjectSnapshot, SourceRole, TrackSnapshot};

/// Spacing of automation control ticks, in absolute samples.
pub const CONTROL_INTERVAL: i64 = 64;

/// Per-track audibility and trigger gain for the current block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackGate {
    pub audible: bool,
    /// Gain carried by sample triggers (volume ÷ 100).
    pub gain: f32,
}

impl TrackGate {
    pub fn for_track(track: &TrackSnapshot, any_solo: bool) -> Self {
        Self {
            audible: crate::project::is_audible(track.muted, track.soloed, any_solo),
            gain: track.volume / 100.0,
        }
    }
}

/// Beat-to-sample mapping frozen for one segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeline {
    /// Absolute sample of beat 0.
    pub origin: f64,
    pub samples_per_beat: f64,
}

impl Timeline {
    /// Absolute sample at which `beat` falls.
    pub fn sample(&self, beat: f64) -> i64 {
        (self.origin + beat * self.samples_per_beat).round() as i64
    }

    /// Beat at absolute sample `s`.
    pub fn beat(&self, s: i64) -> f64 {
        (s as f64 - self.origin) / self.samples_per_beat
    }

    /// Note-on and note-off samples; the off always follows the on.
    fn note_span(&self, start: f64, end: f64) -> (i64, i64) {
        let on = self.sample(start);
        let off = self.sample(end).max(on + 1);
        (on, off)
    }
}

/// Half-open absolute sample range inside one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Absolute sample of the block's first frame.
    pub block_start: i64,
    pub start: i64,
    pub end: i64,
}

impl Segment {
    fn contains(&self, s: i64) -> bool {
        s >= self.start && s < self.end
    }

    fn offset(&self, s: i64) -> u32 {
        (s - self.block_start) as u32
    }
}

/// Emits every event whose absolute sample lies in `seg`.
pub fn schedule_segment(
    snapshot: &ProjectSnapshot,
    gates: &[TrackGate],
    timeline: &Timeline,
    seg: Segment,
    out: &mut EventBuffer,
) {
    if seg.end <= seg.start {
        return;
    }
    for (i, track) in snapshot.tracks.iter().enumerate() {
        let gate = match gates.get(i) {
            Some(g) if g.audible => *g,
            _ => continue,
        };
        match track.role {
            SourceRole::Beat => schedule_steps(i, track, gate, timeline, seg, out),
            SourceRole::Clip => {
                let begin = timeline.sample(track.offset_beats);
                if track.clip_frames > 0 && seg.contains(begin) {
                    out.push(Event::new(
                        i,
                        seg.offset(begin),
                        EventKind::AudioRegionBegin { clip_offset: 0 },
                    ));
                }
            }
            _ => schedule_notes(i, track, timeline, seg, out),
        }
        schedule_automation(i, track, timeline, seg, out);
    }
}

fn schedule_notes(
    index: usize,
    track: &TrackSnapshot,
    timeline: &Timeline,
    seg: Segment,
    out: &mut EventBuffer,
) {
    // Two samples of slack on each side cover rounding.
    let slack = 2.0 / timeline.samples_per_beat;
    let first_beat = timeline.beat(seg.start) - slack;
    let last_beat = timeline.beat(seg.end) + slack;

    let from = track
        .notes
        .partition_point(|n| n.start < first_beat - track.max_note_beats);
    for note in &track.notes[from..] {
        if note.start > last_beat {
            break;
        }
        let (on, off) = timeline.note_span(note.start, note.end);
        if seg.contains(on) {
            out.push(Event::new(
                index,
                seg.offset(on),
                EventKind::NoteOn {
                    midi: note.midi,
                    velocity: note.velocity,
                },
            ));
        }
        if seg.contains(off) {
            out.push(Event::new(
                index,
                seg.offset(off),
                EventKind::NoteOff { midi: note.midi },
            ));
        }
    }
}

fn schedule_steps(
    index: usize,
    track: &TrackSnapshot,
    gate: TrackGate,
    timeline: &Timeline,
    seg: Segment,
    out: &mut EventBuffer,
) {
    let pattern = match &track.pattern {
        Some(p) if p.step_count > 0 => p,
        _ => return,
    };
    let bars = (track.length_beats / 4.0).floor() as i64;
    if bars <= 0 {
        return;
    }
    let rel_start = timeline.beat(seg.start) - track.offset_beats;
    let rel_end = timeline.beat(seg.end) - track.offset_beats;
    let first_bar = ((rel_start / 4.0).floor() as i64 - 1).max(0);
    let last_bar = ((rel_end / 4.0).ceil() as i64).min(bars - 1);

    let step_beats = 4.0 / pattern.step_count as f64;
    for bar in first_bar..=last_bar {
        let bar_beat = track.offset_beats + bar as f64 * 4.0;
        for (row, steps) in pattern.rows.iter().enumerate() {
            for (k, _) in steps.iter().enumerate().filter(|(_, &on)| on) {
                let at = timeline.sample(bar_beat + k as f64 * step_beats);
                if seg.contains(at) {
                    out.push(Event::new(
                        index,
                        seg.offset(at),
                        EventKind::SampleTrigger {
                            row: row as u16,
                            gain: gate.gain,
                        },
                    ));
                }
            }
        }
    }
}

/// Parameter values on the absolute control grid plus every knot.
fn schedule_automation(
    index: usize,
    track: &TrackSnapshot,
    timeline: &Timeline,
    seg: Segment,
    out: &mut EventBuffer,
) {
    if track.automation.is_empty() {
        return;
    }
    let first_tick = seg.start.div_euclid(CONTROL_INTERVAL) * CONTROL_INTERVAL;
    let first_tick = if first_tick < seg.start {
        first_tick + CONTROL_INTERVAL
    } else {
        first_tick
    };

    for (param, curve) in track.automation.lanes() {
        let mut tick = first_tick;
        while tick < seg.end {
            let beat = timeline.beat(tick) - track.offset_beats;
            out.push(Event::new(
                index,
                seg.offset(tick),
                EventKind::ParameterChange {
                    param,
                    value: curve.value_at(beat),
                },
            ));
            tick += CONTROL_INTERVAL;
        }
        for knot in curve.points() {
            let at = timeline.sample(track.offset_beats + knot.beat);
            if seg.contains(at) && at % CONTROL_INTERVAL != 0 {
                out.push(Event::new(
                    index,
                    seg.offset(at),
                    EventKind::ParameterChange {
                        param,
                        value: curve.value_at(knot.beat),
                    },
                ));
            }
        }
    }
}

/// Restarts whatever should already be sounding at absolute sample `at`:
/// notes that began earlier and end later, audio regions in progress, and
/// current automation values. `only` limits the chase to one track.
pub fn chase(
    snapshot: &ProjectSnapshot,
    gates: &[TrackGate],
    timeline: &Timeline,
    at: i64,
    block_start: i64,
    only: Option<usize>,
    out: &mut EventBuffer,
) {
    let offset = (at - block_start) as u32;
    for (i, track) in snapshot.tracks.iter().enumerate() {
        if only.is_some_and(|o| o != i) {
            continue;
        }
        if !gates.get(i).is_some_and(|g| g.audible) {
            continue;
        }
        match track.role {
            SourceRole::Beat => {}
            SourceRole::Clip => {
                let begin = timeline.sample(track.offset_beats);
                let end = begin + track.clip_frames as i64;
                if begin < at && at < end {
                    out.push(Event::new(
                        i,
                        offset,
                        EventKind::AudioRegionBegin {
                            clip_offset: (at - begin) as u64,
                        },
                    ));
                }
            }
            _ => {
                for note in &track.notes {
                    let (on, off) = timeline.note_span(note.start, note.end);
                    if on >= at {
                        break;
                    }
                    if off > at {
                        out.push(Event::new(
                            i,
                            offset,
                            EventKind::NoteOn {
                                midi: note.midi,
                                velocity: note.velocity,
                            },
                        ));
                    }
                }
            }
        }
        let beat = timeline.beat(at) - track.offset_beats;
        for (param, curve) in track.automation.lanes() {
            out.push(Event::new(
                i,
                offset,
                EventKind::ParameterChange {
                    param,
                    value: curve.value_at(beat),
                },
            ));
        }
    }
}

/// Ends everything a loop wrap at absolute sample `at` cuts short: note-offs
/// for notes still held past the loop end and a stop for running clips.
pub fn loop_cut(
    snapshot: &ProjectSnapshot,
    gates: &[TrackGate],
    timeline: &Timeline,
    at: i64,
    block_start: i64,
    out: &mut EventBuffer,
) {
    let offset = (at - block_start) as u32;
    for (i, track) in snapshot.tracks.iter().enumerate() {
        if !gates.get(i).is_some_and(|g| g.audible) {
            continue;
        }
        match track.role {
            SourceRole::Beat => {}
            SourceRole::Clip => out.push(Event::new(i, offset, EventKind::AllNotesOff)),
            _ => {
                for note in &track.notes {
                    let (on, off) = timeline.note_span(note.start, note.end);
                    if on >= at {
                        break;
                    }
                    if off >= at {
                        out.push(Event::new(i, offset, EventKind::NoteOff { midi: note.midi }));
                    }
                }
            }
        }
    }
}

/// An `AllNotesOff` at `offset` for every track.
pub fn release_all(track_count: usize, offset: u32, out: &mut EventBuffer) {
    for i in 0..track_count {
        out.push(Event::new(i, offset, EventKind::AllNotesOff));
    }
}
