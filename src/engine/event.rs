//! Timestamped per-track events.
//!
//! Events are plain `Copy` records so the scheduler can fill a preallocated
//! buffer on the audio thread.

use crate::project::ParamKind;
use std::cmp::Ordering;

/// What happens at an event's sample offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    NoteOn { midi: u8, velocity: f32 },
    NoteOff { midi: u8 },
    /// Release every sounding voice of the track.
    AllNotesOff,
    SampleTrigger { row: u16, gain: f32 },
    ParameterChange { param: ParamKind, value: f32 },
    /// Start an audio region `clip_offset` frames into the clip.
    AudioRegionBegin { clip_offset: u64 },
}

impl EventKind {
    /// Tie-break rank for events at the same sample.
    pub fn priority(&self) -> u8 {
        match self {
            EventKind::NoteOff { .. } | EventKind::AllNotesOff => 0,
            EventKind::ParameterChange { .. } => 1,
            EventKind::NoteOn { .. } => 2,
            EventKind::SampleTrigger { .. } => 3,
            EventKind::AudioRegionBegin { .. } => 4,
        }
    }

    /// Secondary key inside one priority class.
    fn detail(&self) -> u32 {
        match self {
            EventKind::NoteOn { midi, .. } | EventKind::NoteOff { midi } => *midi as u32,
            EventKind::SampleTrigger { row, .. } => *row as u32,
            EventKind::ParameterChange { param, .. } => *param as u32,
            EventKind::AllNotesOff | EventKind::AudioRegionBegin { .. } => 0,
        }
    }
}

/// An event for one track inside one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// Position of the track in the current snapshot.
    pub track: usize,
    /// Sample offset inside the block, always `< block length`.
    pub offset: u32,
    pub kind: EventKind,
}

impl Event {
    pub fn new(track: usize, offset: u32, kind: EventKind) -> Self {
        Self {
            track,
            offset,
            kind,
        }
    }

    /// Total order: offset, then kind priority, then track, then pitch/row.
    pub fn schedule_cmp(&self, other: &Event) -> Ordering {
        self.offset
            .cmp(&other.offset)
            .then(self.kind.priority().cmp(&other.kind.priority()))
            .then(self.track.cmp(&other.track))
            .then(self.kind.detail().cmp(&other.kind.detail()))
    }
}

/// Fixed-capacity event list that never reallocates once built.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<Event>,
    overflow: u32,
}

impl EventBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            overflow: 0,
        }
    }

    /// Appends an event, counting it as overflow when full.
    pub fn push(&mut self, event: Event) {
        if self.events.len() < self.events.capacity() {
            self.events.push(event);
        } else {
            self.overflow += 1;
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Sorts into dispatch order (in place, no allocation).
    pub fn sort(&mut self) {
        self.events.sort_unstable_by(|a, b| a.schedule_cmp(b));
    }

    pub fn as_slice(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns and resets the overflow counter.
    pub fn take_overflow(&mut self) -> u32 {
        std::mem::take(&mut self.overflow)
    }
}
