//! Project container.
//!
//! A project is the arrangement the engine plays: global tempo and loop
//! settings plus an ordered list of tracks.

use super::track::{Track, TrackId};
use crate::error::{EngineError, EngineResult};

/// Lowest accepted tempo.
pub const MIN_BPM: u32 = 40;

/// Highest accepted tempo.
pub const MAX_BPM: u32 = 300;

/// Default tempo in beats per minute.
pub const DEFAULT_BPM: u32 = 120;

/// A loop between two beat positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopRegion {
    pub start: f64,
    pub end: f64,
}

impl LoopRegion {
    /// Creates a loop region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless `0 <= start < end`.
    pub fn new(start: f64, end: f64) -> EngineResult<Self> {
        if !start.is_finite() || !end.is_finite() || start < 0.0 || end <= start {
            return Err(EngineError::InvalidArgument(format!(
                "loop region [{}, {})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn length(&self) -> f64 {
        self.end - self.start
    }
}

/// The arrangement: tempo, grid, loop and tracks.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    /// Tempo in beats per minute (40-300).
    bpm: u32,
    /// Visible timeline width in beats.
    pub grid_width: u32,
    /// Editor zoom factor, persisted for the UI only.
    pub zoom: f64,
    /// Optional playback loop.
    pub loop_region: Option<LoopRegion>,
    tracks: Vec<Track>,
}

impl Default for Project {
    fn default() -> Self {
        Self::new()
    }
}

impl Project {
    /// Creates an empty project at 120 BPM with a 32-beat grid.
    pub fn new() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            grid_width: 32,
            zoom: 1.0,
            loop_region: None,
            tracks: Vec::new(),
        }
    }

    pub fn bpm(&self) -> u32 {
        self.bpm
    }

    /// Sets the tempo.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` outside 40-300 BPM.
    pub fn set_bpm(&mut self, bpm: u32) -> EngineResult<()> {
        if !(MIN_BPM..=MAX_BPM).contains(&bpm) {
            return Err(EngineError::InvalidArgument(format!(
                "bpm {} outside {}-{}",
                bpm, MIN_BPM, MAX_BPM
            )));
        }
        self.bpm = bpm;
        Ok(())
    }

    /// Adds a track at the end and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the track breaks an invariant or its ID
    /// is already used.
    pub fn add_track(&mut self, track: Track) -> EngineResult<TrackId> {
        track.validate()?;
        if self.get_track(&track.id).is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "duplicate track id {}",
                track.id
            )));
        }
        let id = track.id.clone();
        self.tracks.push(track);
        Ok(id)
    }

    /// Removes a track by ID.
    pub fn remove_track(&mut self, id: &TrackId) -> Option<Track> {
        let pos = self.tracks.iter().position(|t| &t.id == id)?;
        Some(self.tracks.remove(pos))
    }

    pub fn get_track(&self, id: &TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| &t.id == id)
    }

    pub fn get_track_mut(&mut self, id: &TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| &t.id == id)
    }

    /// Position of a track in the arrangement.
    pub fn track_index(&self, id: &TrackId) -> Option<usize> {
        self.tracks.iter().position(|t| &t.id == id)
    }

    /// Returns all tracks in arrangement order.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.iter_mut()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// True when at least one track is soloed.
    pub fn any_solo(&self) -> bool {
        self.tracks.iter().any(|t| t.soloed)
    }

    /// Whether a track should be heard given every track's mute and solo flags.
    pub fn is_audible(&self, track: &Track) -> bool {
        is_audible(track.muted, track.soloed, self.any_solo())
    }

    /// Iterator over audible tracks.
    pub fn playable_tracks(&self) -> impl Iterator<Item = &Track> {
        let any_solo = self.any_solo();
        self.tracks
            .iter()
            .filter(move |t| is_audible(t.muted, t.soloed, any_solo))
    }

    /// End of the last non-empty track region in beats.
    pub fn end_beat(&self) -> f64 {
        let bpm = self.bpm as f64;
        self.tracks
            .iter()
            .filter(|t| !t.is_empty_region())
            .map(|t| t.offset_beats + t.length_beats(bpm))
            .fold(0.0, f64::max)
    }

    /// Checks every project and track invariant.
    pub fn validate(&self) -> EngineResult<()> {
        if !(MIN_BPM..=MAX_BPM).contains(&self.bpm) {
            return Err(EngineError::InvalidArgument(format!("bpm {}", self.bpm)));
        }
        if self.grid_width == 0 {
            return Err(EngineError::InvalidArgument("grid width must be positive".into()));
        }
        for (i, track) in self.tracks.iter().enumerate() {
            track.validate()?;
            if self.tracks[..i].iter().any(|t| t.id == track.id) {
                return Err(EngineError::InvalidArgument(format!(
                    "duplicate track id {}",
                    track.id
                )));
            }
        }
        Ok(())
    }
}

/// Audibility rule: solo overrides everything, mute silences otherwise.
pub fn is_audible(muted: bool, soloed: bool, any_solo: bool) -> bool {
    if any_solo {
        soloed
    } else {
        !muted
    }
}
