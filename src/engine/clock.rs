//! Transport clock.
//!
//! Maps beats to absolute engine samples through a single anchor: the
//! (fractional) sample index at which beat 0 would fall. Start, seek and
//! tempo changes only move that anchor, so the mapping stays continuous at
//! the sample where a change is observed.

use crate::error::{EngineError, EngineResult};
use crate::project::samples_per_beat;

/// Represents the current playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Not playing, position reset to start.
    Stopped,
    /// Currently playing.
    Playing,
    /// Paused at current position.
    Paused,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Stopped => "stopped",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
        }
    }
}

/// Beat/sample conversion plus play state.
#[derive(Debug, Clone)]
pub struct Clock {
    sample_rate: u32,
    bpm: f64,
    /// Absolute sample index of beat 0 while playing.
    origin: f64,
    state: TransportState,
    /// Position while not playing.
    held_beat: f64,
}

impl Clock {
    pub fn new(sample_rate: u32, bpm: f64) -> Self {
        Self {
            sample_rate,
            bpm,
            origin: 0.0,
            state: TransportState::Stopped,
            held_beat: 0.0,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn origin(&self) -> f64 {
        self.origin
    }

    pub fn samples_per_beat(&self) -> f64 {
        samples_per_beat(self.bpm, self.sample_rate)
    }

    /// Beat at absolute sample `s` under the current anchor.
    pub fn current_beat(&self, s: u64) -> f64 {
        (s as f64 - self.origin) / self.samples_per_beat()
    }

    /// Fractional absolute sample at which `beat` falls.
    pub fn sample_at_beat(&self, beat: f64) -> f64 {
        self.origin + beat * self.samples_per_beat()
    }

    /// Transport position at sample `now`, frozen while not playing.
    pub fn position(&self, now: u64) -> f64 {
        if self.is_playing() {
            self.current_beat(now)
        } else {
            self.held_beat
        }
    }

    /// Starts playback from `from_beat`, or resumes from the held position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a negative or non-finite beat.
    pub fn start(&mut self, from_beat: Option<f64>, now: u64) -> EngineResult<f64> {
        let beat = from_beat.unwrap_or_else(|| self.position(now));
        check_beat(beat)?;
        self.anchor(beat, now);
        self.state = TransportState::Playing;
        Ok(beat)
    }

    /// Freezes the position.
    pub fn pause(&mut self, now: u64) {
        if self.is_playing() {
            self.held_beat = self.current_beat(now);
            self.state = TransportState::Paused;
        }
    }

    /// Stops and rewinds to beat 0.
    pub fn stop(&mut self) {
        self.held_beat = 0.0;
        self.state = TransportState::Stopped;
    }

    /// Moves the position to `beat`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `beat < 0`.
    pub fn seek(&mut self, beat: f64, now: u64) -> EngineResult<()> {
        check_beat(beat)?;
        if self.is_playing() {
            self.anchor(beat, now);
        } else {
            self.held_beat = beat;
        }
        Ok(())
    }

    /// Changes tempo while keeping the position at `now` unchanged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a non-positive or non-finite tempo.
    pub fn set_bpm(&mut self, bpm: f64, now: u64) -> EngineResult<()> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(EngineError::InvalidArgument(format!("bpm {}", bpm)));
        }
        let beat = self.position(now);
        self.bpm = bpm;
        if self.is_playing() {
            self.anchor(beat, now);
        }
        Ok(())
    }

    /// Re-anchors so that `beat` falls exactly on absolute sample `at`.
    pub fn anchor(&mut self, beat: f64, at: u64) {
        self.origin = at as f64 - beat * self.samples_per_beat();
    }
}

fn check_beat(beat: f64) -> EngineResult<()> {
    if !beat.is_finite() || beat < 0.0 {
        return Err(EngineError::InvalidArgument(format!("beat {}", beat)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_anchors_origin() {
        let mut clock = Clock::new(48_000, 120.0);
        clock.start(Some(2.0), 100_000).unwrap();
        assert_eq!(clock.origin(), 100_000.0 - 48_000.0);
        assert_eq!(clock.current_beat(100_000), 2.0);
        assert_eq!(clock.current_beat(124_000), 3.0);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut clock = Clock::new(48_000, 120.0);
        clock.start(Some(0.0), 0).unwrap();
        clock.pause(36_000);
        assert_eq!(clock.state(), TransportState::Paused);
        assert_eq!(clock.position(90_000), 1.5);

        clock.start(None, 90_000).unwrap();
        assert_eq!(clock.current_beat(90_000), 1.5);
        assert_eq!(clock.current_beat(114_000), 2.5);
    }

    #[test]
    fn test_seek_negative_rejected() {
        let mut clock = Clock::new(44_100, 120.0);
        assert!(clock.seek(-0.5, 0).is_err());
        assert!(clock.start(Some(-1.0), 0).is_err());
        assert_eq!(clock.state(), TransportState::Stopped);
    }

    #[test]
    fn test_seek_while_playing() {
        let mut clock = Clock::new(44_100, 120.0);
        clock.start(Some(0.0), 0).unwrap();
        clock.seek(1.0, 66_150).unwrap();
        assert_eq!(clock.current_beat(66_150), 1.0);
    }

    #[test]
    fn test_tempo_change_continuity() {
        let mut clock = Clock::new(48_000, 120.0);
        clock.start(Some(0.0), 0).unwrap();
        let change_at = 48_000; // beat 2.0 at 120 bpm
        let before = clock.current_beat(change_at);
        clock.set_bpm(60.0, change_at).unwrap();
        let after = clock.current_beat(change_at);
        assert_eq!(before, 2.0);
        assert_eq!(before, after);

        // Beat 2.5 lands half a second (24,000 samples) after the change.
        assert_eq!(clock.sample_at_beat(2.5), (change_at + 24_000) as f64);
    }

    #[test]
    fn test_tempo_change_while_paused_keeps_position() {
        let mut clock = Clock::new(48_000, 120.0);
        clock.start(Some(0.0), 0).unwrap();
        clock.pause(48_000);
        clock.set_bpm(90.0, 60_000).unwrap();
        assert_eq!(clock.position(70_000), 2.0);
    }

    #[test]
    fn test_stop_rewinds() {
        let mut clock = Clock::new(48_000, 120.0);
        clock.start(Some(3.0), 0).unwrap();
        clock.stop();
        assert_eq!(clock.position(10), 0.0);
        assert_eq!(clock.state(), TransportState::Stopped);
    }
}
