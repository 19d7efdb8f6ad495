//! Master bus limiter.
//!
//! A stereo-linked peak compressor with a soft knee, used as a brickwall-ish
//! safety stage before the output. Gain reduction is computed in dB and
//! smoothed with separate attack and release coefficients.

/// Threshold in dBFS.
pub const LIMITER_THRESHOLD_DB: f32 = -1.0;

const RATIO: f32 = 20.0;
const KNEE_DB: f32 = 6.0;
const ATTACK_SECONDS: f32 = 0.003;
const RELEASE_SECONDS: f32 = 0.250;

/// Smoothing coefficient for a one-pole follower with time constant `seconds`.
fn follower_coeff(seconds: f32, sample_rate: u32) -> f32 {
    (-1.0 / (seconds * sample_rate as f32)).exp()
}

#[derive(Debug, Clone)]
pub struct Limiter {
    attack: f32,
    release: f32,
    /// Current gain reduction in dB (zero or negative).
    reduction_db: f32,
}

impl Limiter {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            attack: follower_coeff(ATTACK_SECONDS, sample_rate),
            release: follower_coeff(RELEASE_SECONDS, sample_rate),
            reduction_db: 0.0,
        }
    }

    /// Static gain curve: reduction in dB for an input level in dB.
    fn target_reduction(level_db: f32) -> f32 {
        let over = level_db - LIMITER_THRESHOLD_DB;
        let slope = 1.0 / RATIO - 1.0;
        if 2.0 * over < -KNEE_DB {
            0.0
        } else if 2.0 * over.abs() <= KNEE_DB {
            let x = over + KNEE_DB / 2.0;
            slope * x * x / (2.0 * KNEE_DB)
        } else {
            slope * over
        }
    }

    /// Limits the bus in place.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let peak = l.abs().max(r.abs());
            let target = if peak > 0.0 {
                Self::target_reduction(20.0 * peak.log10())
            } else {
                0.0
            };
            let coeff = if target < self.reduction_db {
                self.attack
            } else {
                self.release
            };
            self.reduction_db = target + coeff * (self.reduction_db - target);
            if self.reduction_db < 0.0 {
                let gain = 10f32.powf(self.reduction_db / 20.0);
                *l *= gain;
                *r *= gain;
            }
        }
    }

    /// Current gain reduction in dB.
    pub fn reduction_db(&self) -> f32 {
        self.reduction_db
    }

    pub fn reset(&mut self) {
        self.reduction_db = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| amplitude * (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 44_100.0).sin())
            .collect()
    }

    #[test]
    fn test_quiet_signal_untouched() {
        let mut limiter = Limiter::new(44_100);
        let input = sine(0.1, 4410);
        let mut l = input.clone();
        let mut r = input.clone();
        limiter.process(&mut l, &mut r);
        assert_eq!(l, input);
        assert_eq!(limiter.reduction_db(), 0.0);
    }

    #[test]
    fn test_hot_signal_held_near_threshold() {
        let mut limiter = Limiter::new(44_100);
        let mut l = sine(2.0, 44_100);
        let mut r = l.clone();
        limiter.process(&mut l, &mut r);
        // After 100 ms the reduction has settled.
        let settled = l[4410..].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(settled < 1.0, "settled peak {}", settled);
        assert!(settled > 0.5);
    }

    #[test]
    fn test_knee_is_continuous() {
        let below = Limiter::target_reduction(LIMITER_THRESHOLD_DB - KNEE_DB / 2.0);
        assert_eq!(below, 0.0);
        let above = Limiter::target_reduction(LIMITER_THRESHOLD_DB + KNEE_DB / 2.0);
        let linear = (1.0 / RATIO - 1.0) * KNEE_DB / 2.0;
        assert!((above - linear).abs() < 1e-4);
    }

    #[test]
    fn test_reset_clears_reduction() {
        let mut limiter = Limiter::new(48_000);
        let mut l = vec![4.0; 480];
        let mut r = vec![4.0; 480];
        limiter.process(&mut l, &mut r);
        assert!(limiter.reduction_db() < 0.0);
        limiter.reset();
        assert_eq!(limiter.reduction_db(), 0.0);
    }
}
