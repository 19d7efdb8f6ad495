//! Volume envelope for soundfont voices.
//!
//! Delay, attack, hold, decay, sustain, release. The attack is a linear
//! gain ramp; decay and release are linear in decibels, falling 100 dB over
//! the generator's time value. Every stage lasts at least 1 ms. A released
//! voice is finished once it drops below -80 dBFS.

use crate::loader::SfEnvelope;

/// Gain below which a released voice is reclaimed (-80 dBFS).
pub const SILENCE_GAIN: f32 = 1.0e-4;

const MIN_STAGE_SECONDS: f32 = 0.001;
const RAMP_DB: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Delay,
    Attack,
    Hold,
    Decay,
    Sustain,
    Release,
    Done,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    stage: Stage,
    gain: f32,
    /// Samples left in a timed stage.
    remaining: u32,
    delay_samples: u32,
    attack_step: f32,
    hold_samples: u32,
    decay_factor: f32,
    sustain_gain: f32,
    release_factor: f32,
}

fn samples(seconds: f32, sample_rate: f32) -> u32 {
    (seconds.max(MIN_STAGE_SECONDS) * sample_rate).round().max(1.0) as u32
}

/// Per-sample multiplier that falls `RAMP_DB` over `seconds`.
fn db_ramp_factor(seconds: f32, sample_rate: f32) -> f32 {
    let n = samples(seconds, sample_rate) as f32;
    10f32.powf(-RAMP_DB / 20.0 / n)
}

impl Envelope {
    pub fn new(params: &SfEnvelope, sample_rate: u32) -> Self {
        let sr = sample_rate as f32;
        Self {
            stage: Stage::Done,
            gain: 0.0,
            remaining: 0,
            delay_samples: if params.delay > 0.0 {
                (params.delay * sr).round() as u32
            } else {
                0
            },
            attack_step: 1.0 / samples(params.attack, sr) as f32,
            hold_samples: if params.hold > 0.0 {
                samples(params.hold, sr)
            } else {
                0
            },
            decay_factor: db_ramp_factor(params.decay, sr),
            sustain_gain: 10f32.powf(-params.sustain_db.max(0.0) / 20.0),
            release_factor: db_ramp_factor(params.release, sr),
        }
    }

    /// Starts the envelope from silence.
    pub fn trigger(&mut self) {
        self.gain = 0.0;
        if self.delay_samples > 0 {
            self.stage = Stage::Delay;
            self.remaining = self.delay_samples;
        } else {
            self.stage = Stage::Attack;
        }
    }

    /// Enters the release stage from wherever the envelope is.
    pub fn release(&mut self) {
        if self.stage != Stage::Done {
            self.stage = if self.gain <= SILENCE_GAIN {
                Stage::Done
            } else {
                Stage::Release
            };
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn is_releasing(&self) -> bool {
        self.stage == Stage::Release
    }

    /// Advances one sample and returns the gain to apply.
    #[inline]
    pub fn next_gain(&mut self) -> f32 {
        match self.stage {
            Stage::Delay => {
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining == 0 {
                    self.stage = Stage::Attack;
                }
                0.0
            }
            Stage::Attack => {
                self.gain += self.attack_step;
                if self.gain >= 1.0 {
                    self.gain = 1.0;
                    if self.hold_samples > 0 {
                        self.stage = Stage::Hold;
                        self.remaining = self.hold_samples;
                    } else {
                        self.stage = Stage::Decay;
                    }
                }
                self.gain
            }
            Stage::Hold => {
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining == 0 {
                    self.stage = Stage::Decay;
                }
                self.gain
            }
            Stage::Decay => {
                self.gain *= self.decay_factor;
                if self.gain <= self.sustain_gain {
                    self.gain = self.sustain_gain;
                    self.stage = Stage::Sustain;
                }
                self.gain
            }
            Stage::Sustain => self.gain,
            Stage::Release => {
                self.gain *= self.release_factor;
                if self.gain < SILENCE_GAIN {
                    self.gain = 0.0;
                    self.stage = Stage::Done;
                }
                self.gain
            }
            Stage::Done => 0.0,
        }
    }
}
