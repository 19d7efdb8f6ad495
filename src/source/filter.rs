//! Stereo low-pass state-variable filter for automated cutoff/resonance.
//!
//! Trapezoidal-integrated SVF, stable under per-sample coefficient changes.

use std::f32::consts::PI;

/// Lowest cutoff, reached at automation value 0.
pub const MIN_CUTOFF_HZ: f32 = 20.0;

/// Maps a normalized cutoff value to Hz: `20 × 1000^v`.
pub fn cutoff_hz(value: f32) -> f32 {
    MIN_CUTOFF_HZ * 1000f32.powf(value.clamp(0.0, 1.0))
}

/// Maps a normalized resonance value to Q in [0.5, 10].
pub fn resonance_q(value: f32) -> f32 {
    0.5 + 9.5 * value.clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct StateVariableFilter {
    sample_rate: u32,
    a1: f32,
    a2: f32,
    a3: f32,
    /// Integrator states, `[channel][stage]`.
    ic: [[f32; 2]; 2],
}

impl StateVariableFilter {
    /// A filter wide open at the top of the cutoff range.
    pub fn new(sample_rate: u32) -> Self {
        let mut filter = Self {
            sample_rate,
            a1: 1.0,
            a2: 0.0,
            a3: 0.0,
            ic: [[0.0; 2]; 2],
        };
        filter.set(1.0, 0.0);
        filter
    }

    /// Sets cutoff and resonance from normalized automation values.
    pub fn set(&mut self, cutoff: f32, resonance: f32) {
        let nyquist_guard = self.sample_rate as f32 * 0.45;
        let fc = cutoff_hz(cutoff).min(nyquist_guard);
        let g = (PI * fc / self.sample_rate as f32).tan();
        let k = 1.0 / resonance_q(resonance);
        self.a1 = 1.0 / (1.0 + g * (g + k));
        self.a2 = g * self.a1;
        self.a3 = g * self.a2;
    }

    #[inline]
    fn tick(&mut self, channel: usize, v0: f32) -> f32 {
        let [ic1, ic2] = self.ic[channel];
        let v3 = v0 - ic2;
        let v1 = self.a1 * ic1 + self.a2 * v3;
        let v2 = ic2 + self.a2 * ic1 + self.a3 * v3;
        self.ic[channel] = [2.0 * v1 - ic1, 2.0 * v2 - ic2];
        v2
    }

    /// Filters both channels in place.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            *l = self.tick(0, *l);
            *r = self.tick(1, *r);
        }
    }

    pub fn reset(&mut self) {
        self.ic = [[0.0; 2]; 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(buf: &[f32]) -> f32 {
        (buf.iter().map(|s| s * s).sum::<f32>() / buf.len() as f32).sqrt()
    }

    fn sine(freq: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| (i as f32 * 2.0 * PI * freq / 48_000.0).sin())
            .collect()
    }

    #[test]
    fn test_value_mapping() {
        assert_eq!(cutoff_hz(0.0), 20.0);
        assert!((cutoff_hz(1.0) - 20_000.0).abs() < 1.0);
        assert_eq!(resonance_q(0.0), 0.5);
        assert_eq!(resonance_q(1.0), 10.0);
    }

    #[test]
    fn test_low_cutoff_attenuates_highs() {
        let mut filter = StateVariableFilter::new(48_000);
        filter.set(0.2, 0.0);
        let mut l = sine(8_000.0, 4800);
        let mut r = l.clone();
        filter.process(&mut l, &mut r);
        assert!(rms(&l[2400..]) < 0.05);
        assert_eq!(l, r);
    }

    #[test]
    fn test_open_filter_passes_lows() {
        let mut filter = StateVariableFilter::new(48_000);
        let mut l = sine(200.0, 4800);
        let mut r = l.clone();
        filter.process(&mut l, &mut r);
        let out = rms(&l[2400..]);
        assert!((out - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.05);
    }
}
