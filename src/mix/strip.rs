//! Per-track channel strip.
//!
//! One gain-staging policy per source role:
//!
//! | Role      | Pre-gain | Track gain   | Boost |
//! |-----------|----------|--------------|-------|
//! | Soundfont | +5 dB    | volume ÷ 100 | +3 dB |
//! | Plugin    | +5 dB    | volume ÷ 100 |       |
//! | Sampler   | +5 dB    | volume ÷ 100 |       |
//! | Clip      |          | volume ÷ 100 |       |
//! | Beat      | +5 dB    | unity        |       |
//!
//! Beat tracks get unity because every trigger already carries the volume.
//! Automation then scales the gain (Volume), places the track (Pan) and, for
//! sources without their own filter, drives a low-pass (Cutoff, Resonance).

use super::{constant_power_pan, db_to_gain};
use crate::engine::{SourceRole, TrackSnapshot};
use crate::project::ParamKind;
use crate::source::StateVariableFilter;
use std::f32::consts::SQRT_2;

const PRE_GAIN_DB: f32 = 5.0;
const SOUNDFONT_BOOST_DB: f32 = 3.0;
/// Time constant of gain smoothing.
const SMOOTHING_SECONDS: f32 = 0.005;

/// Static gain for a role at a volume percent.
pub fn role_gain(role: SourceRole, volume_percent: f32) -> f32 {
    let pre = match role {
        SourceRole::Clip => 1.0,
        _ => db_to_gain(PRE_GAIN_DB),
    };
    let track = match role {
        SourceRole::Beat => 1.0,
        _ => volume_percent / 100.0,
    };
    let boost = match role {
        SourceRole::Soundfont => db_to_gain(SOUNDFONT_BOOST_DB),
        _ => 1.0,
    };
    pre * track * boost
}

#[derive(Debug, Clone)]
pub struct ChannelStrip {
    static_gain: f32,
    volume: f32,
    pan: f32,
    cutoff: f32,
    resonance: f32,
    filter: StateVariableFilter,
    filter_enabled: bool,
    filter_dirty: bool,
    gain_l: f32,
    gain_r: f32,
    smoothing: f32,
    /// Jump straight to the target on the next block.
    snap: bool,
}

impl ChannelStrip {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            static_gain: 0.0,
            volume: ParamKind::Volume.neutral_value(),
            pan: ParamKind::Pan.neutral_value(),
            cutoff: ParamKind::Cutoff.neutral_value(),
            resonance: ParamKind::Resonance.neutral_value(),
            filter: StateVariableFilter::new(sample_rate),
            filter_enabled: false,
            filter_dirty: false,
            gain_l: 0.0,
            gain_r: 0.0,
            smoothing: 1.0 - (-1.0 / (SMOOTHING_SECONDS * sample_rate as f32)).exp(),
            snap: true,
        }
    }

    /// Applies a track's static settings. Parameters without a lane go back
    /// to their neutral values; automated ones keep their last value until
    /// the next event.
    pub fn configure(&mut self, track: &TrackSnapshot) {
        self.set_static(track.role, track.volume);
        for param in ParamKind::ALL {
            if track.automation.lane(param).is_none() {
                self.set_param(param, param.neutral_value());
            }
        }
        let has_filter_lane = track.automation.lane(ParamKind::Cutoff).is_some()
            || track.automation.lane(ParamKind::Resonance).is_some();
        let enable = has_filter_lane && track.role != SourceRole::Plugin;
        if enable && !self.filter_enabled {
            self.filter.reset();
            self.filter_dirty = true;
        }
        self.filter_enabled = enable;
    }

    /// Changes the volume without touching automation state.
    pub fn set_static(&mut self, role: SourceRole, volume_percent: f32) {
        self.static_gain = role_gain(role, volume_percent);
    }

    pub fn set_param(&mut self, param: ParamKind, value: f32) {
        let value = value.clamp(0.0, 1.0);
        match param {
            ParamKind::Volume => self.volume = value,
            ParamKind::Pan => self.pan = value,
            ParamKind::Cutoff => {
                self.filter_dirty |= self.cutoff != value;
                self.cutoff = value;
            }
            ParamKind::Resonance => {
                self.filter_dirty |= self.resonance != value;
                self.resonance = value;
            }
        }
    }

    fn targets(&self) -> (f32, f32) {
        let (pl, pr) = constant_power_pan(2.0 * self.pan - 1.0);
        let g = self.static_gain * self.volume * SQRT_2;
        (g * pl, g * pr)
    }

    /// Filters and scales a track's block in place.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        if self.filter_enabled {
            if self.filter_dirty {
                self.filter.set(self.cutoff, self.resonance);
                self.filter_dirty = false;
            }
            self.filter.process(left, right);
        }

        let (tl, tr) = self.targets();
        if self.snap {
            self.gain_l = tl;
            self.gain_r = tr;
            self.snap = false;
        }
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            self.gain_l += (tl - self.gain_l) * self.smoothing;
            self.gain_r += (tr - self.gain_r) * self.smoothing;
            *l *= self.gain_l;
            *r *= self.gain_r;
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
        self.snap = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{AutomationCurve, Automation, TrackId};

    fn track(role: SourceRole, volume: f32) -> TrackSnapshot {
        TrackSnapshot {
            id: TrackId::from("t"),
            slot: 0,
            role,
            offset_beats: 0.0,
            length_beats: 4.0,
            volume,
            muted: false,
            soloed: false,
            notes: Vec::new(),
            max_note_beats: 0.0,
            pattern: None,
            clip_frames: 0,
            automation: Automation::default(),
        }
    }

    #[test]
    fn test_role_gain_policy() {
        assert_eq!(role_gain(SourceRole::Clip, 100.0), 1.0);
        assert_eq!(role_gain(SourceRole::Clip, 50.0), 0.5);
        let pre = db_to_gain(5.0);
        assert_eq!(role_gain(SourceRole::Beat, 30.0), pre);
        assert_eq!(role_gain(SourceRole::Plugin, 100.0), pre);
        assert!((role_gain(SourceRole::Soundfont, 100.0) - db_to_gain(8.0)).abs() < 1e-5);
    }

    #[test]
    fn test_clip_at_unity_passes_through() {
        let mut strip = ChannelStrip::new(44_100);
        strip.configure(&track(SourceRole::Clip, 100.0));
        let mut l = vec![0.5; 64];
        let mut r = vec![-0.5; 64];
        strip.process(&mut l, &mut r);
        assert!(l.iter().all(|&s| (s - 0.5).abs() < 1e-5));
        assert!(r.iter().all(|&s| (s + 0.5).abs() < 1e-5));
    }

    #[test]
    fn test_pan_hard_left() {
        let mut strip = ChannelStrip::new(44_100);
        strip.configure(&track(SourceRole::Clip, 100.0));
        strip.set_param(ParamKind::Pan, 0.0);
        // Let the smoother settle.
        let mut l = vec![0.5; 4410];
        let mut r = vec![0.5; 4410];
        strip.process(&mut l, &mut r);
        assert!(r[4409].abs() < 1e-3);
        assert!((l[4409] - 0.5 * SQRT_2).abs() < 1e-3);
    }

    #[test]
    fn test_unautomated_lane_returns_to_neutral() {
        let mut strip = ChannelStrip::new(44_100);
        let mut automated = track(SourceRole::Clip, 100.0);
        automated
            .automation
            .set_lane(ParamKind::Volume, Some(AutomationCurve::constant(0.0)));
        strip.configure(&automated);
        strip.set_param(ParamKind::Volume, 0.0);
        let mut l = vec![1.0; 8];
        let mut r = vec![1.0; 8];
        strip.process(&mut l, &mut r);
        assert!(l.iter().all(|&s| s == 0.0));

        strip.configure(&track(SourceRole::Clip, 100.0));
        strip.reset();
        let mut l = vec![1.0; 8];
        let mut r = vec![1.0; 8];
        strip.process(&mut l, &mut r);
        assert!((l[0] - 1.0).abs() < 1e-5);
    }
}
