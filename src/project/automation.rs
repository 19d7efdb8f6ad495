//! Point-based automation curves.
//!
//! A curve is an ordered list of `(beat, value)` knots with at least one
//! point. Values between knots are linearly interpolated; outside the curve's
//! domain the nearest knot's value holds.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};

/// Parameter a curve drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamKind {
    Volume,
    Pan,
    Cutoff,
    Resonance,
}

impl ParamKind {
    /// All parameter kinds in scheduling order.
    pub const ALL: [ParamKind; 4] = [
        ParamKind::Volume,
        ParamKind::Pan,
        ParamKind::Cutoff,
        ParamKind::Resonance,
    ];

    /// Value the parameter takes when no curve is present.
    pub fn neutral_value(&self) -> f32 {
        match self {
            ParamKind::Volume => 1.0,
            ParamKind::Pan => 0.5,
            ParamKind::Cutoff => 1.0,
            ParamKind::Resonance => 0.0,
        }
    }
}

/// One knot of a curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    /// Position in beats relative to the track offset.
    pub beat: f64,
    /// Normalized value in [0, 1].
    pub value: f32,
}

/// A non-empty, beat-ordered list of knots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<AutomationPoint>", into = "Vec<AutomationPoint>")]
pub struct AutomationCurve {
    points: Vec<AutomationPoint>,
}

impl AutomationCurve {
    /// Builds a curve, sorting knots by beat and clamping values into [0, 1].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty list or a non-finite knot.
    pub fn new(mut points: Vec<AutomationPoint>) -> Result<Self, EngineError> {
        if points.is_empty() {
            return Err(EngineError::InvalidArgument(
                "automation curve needs at least one point".into(),
            ));
        }
        if points
            .iter()
            .any(|p| !p.beat.is_finite() || !p.value.is_finite())
        {
            return Err(EngineError::InvalidArgument(
                "automation point is not finite".into(),
            ));
        }
        for p in &mut points {
            p.value = p.value.clamp(0.0, 1.0);
        }
        points.sort_by(|a, b| a.beat.total_cmp(&b.beat));
        Ok(Self { points })
    }

    /// A single-point curve holding `value` everywhere.
    pub fn constant(value: f32) -> Self {
        Self {
            points: vec![AutomationPoint {
                beat: 0.0,
                value: value.clamp(0.0, 1.0),
            }],
        }
    }

    /// Knots in beat order.
    pub fn points(&self) -> &[AutomationPoint] {
        &self.points
    }

    /// Interpolated value at a track-relative beat.
    pub fn value_at(&self, beat: f64) -> f32 {
        let first = self.points[0];
        if beat <= first.beat {
            return first.value;
        }
        let last = self.points[self.points.len() - 1];
        if beat >= last.beat {
            return last.value;
        }
        // First knot strictly after `beat`; guaranteed in 1..len here.
        let idx = self.points.partition_point(|p| p.beat <= beat);
        let a = self.points[idx - 1];
        let b = self.points[idx];
        let span = b.beat - a.beat;
        if span <= 0.0 {
            return b.value;
        }
        let t = ((beat - a.beat) / span) as f32;
        a.value + (b.value - a.value) * t
    }
}

impl TryFrom<Vec<AutomationPoint>> for AutomationCurve {
    type Error = EngineError;

    fn try_from(points: Vec<AutomationPoint>) -> Result<Self, Self::Error> {
        AutomationCurve::new(points)
    }
}

impl From<AutomationCurve> for Vec<AutomationPoint> {
    fn from(curve: AutomationCurve) -> Self {
        curve.points
    }
}

/// Per-track automation lanes, at most one curve per parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Automation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<AutomationCurve>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pan: Option<AutomationCurve>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<AutomationCurve>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resonance: Option<AutomationCurve>,
}

impl Automation {
    /// The curve for a parameter, if any.
    pub fn lane(&self, kind: ParamKind) -> Option<&AutomationCurve> {
        match kind {
            ParamKind::Volume => self.volume.as_ref(),
            ParamKind::Pan => self.pan.as_ref(),
            ParamKind::Cutoff => self.cutoff.as_ref(),
            ParamKind::Resonance => self.resonance.as_ref(),
        }
    }

    /// Replaces (or clears) the curve for a parameter.
    pub fn set_lane(&mut self, kind: ParamKind, curve: Option<AutomationCurve>) {
        match kind {
            ParamKind::Volume => self.volume = curve,
            ParamKind::Pan => self.pan = curve,
            ParamKind::Cutoff => self.cutoff = curve,
            ParamKind::Resonance => self.resonance = curve,
        }
    }

    /// Present lanes in [`ParamKind::ALL`] order.
    pub fn lanes(&self) -> impl Iterator<Item = (ParamKind, &AutomationCurve)> {
        ParamKind::ALL
            .into_iter()
            .filter_map(move |kind| self.lane(kind).map(|c| (kind, c)))
    }

    pub fn is_empty(&self) -> bool {
        self.lanes().next().is_none()
    }

    /// Value of a parameter at a beat, falling back to its neutral value.
    pub fn value_at(&self, kind: ParamKind, beat: f64) -> f32 {
        self.lane(kind)
            .map(|c| c.value_at(beat))
            .unwrap_or_else(|| kind.neutral_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(beat: f64, value: f32) -> AutomationPoint {
        AutomationPoint { beat, value }
    }

    #[test]
    fn test_interpolation() {
        let curve = AutomationCurve::new(vec![pt(0.0, 0.0), pt(4.0, 1.0)]).unwrap();
        assert_eq!(curve.value_at(2.0), 0.5);
        assert_eq!(curve.value_at(1.0), 0.25);
    }

    #[test]
    fn test_clamped_outside_domain() {
        let curve = AutomationCurve::new(vec![pt(2.0, 0.2), pt(4.0, 0.8)]).unwrap();
        assert_eq!(curve.value_at(0.0), 0.2);
        assert_eq!(curve.value_at(10.0), 0.8);
    }

    #[test]
    fn test_unsorted_points_sorted() {
        let curve = AutomationCurve::new(vec![pt(4.0, 1.0), pt(0.0, 0.0)]).unwrap();
        assert_eq!(curve.points()[0].beat, 0.0);
        assert_eq!(curve.value_at(3.0), 0.75);
    }

    #[test]
    fn test_empty_curve_rejected() {
        assert!(AutomationCurve::new(Vec::new()).is_err());
        let parsed: Result<AutomationCurve, _> = serde_json::from_str("[]");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_step_at_same_beat() {
        let curve =
            AutomationCurve::new(vec![pt(0.0, 0.0), pt(1.0, 0.0), pt(1.0, 1.0), pt(2.0, 1.0)])
                .unwrap();
        assert_eq!(curve.value_at(1.5), 1.0);
        assert_eq!(curve.value_at(0.5), 0.0);
    }

    #[test]
    fn test_lanes_neutral_values() {
        let mut automation = Automation::default();
        assert!(automation.is_empty());
        assert_eq!(automation.value_at(ParamKind::Pan, 3.0), 0.5);

        automation.set_lane(ParamKind::Volume, Some(AutomationCurve::constant(0.25)));
        assert_eq!(automation.value_at(ParamKind::Volume, 3.0), 0.25);
        assert_eq!(automation.lanes().count(), 1);
    }
}
