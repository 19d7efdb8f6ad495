//! Mixing stages between the sources and the output.
//!
//! Each track runs through a [`ChannelStrip`] that applies the gain-staging
//! policy of its source, automation and pan. Strips are summed onto the
//! master bus, which feeds the [`Limiter`] and then an optional
//! [`CaptureTap`].

mod limiter;
mod strip;
mod tap;

pub use limiter::{Limiter, LIMITER_THRESHOLD_DB};
pub use strip::{role_gain, ChannelStrip};
pub use tap::{capture_ring, CaptureTap};

/// Constant-power pan gains for a position in [-1, 1].
///
/// The centre gives equal gains of `sqrt(0.5)` on both sides.
#[inline]
pub fn constant_power_pan(position: f32) -> (f32, f32) {
    let p = position.clamp(-1.0, 1.0);
    (((1.0 - p) * 0.5).sqrt(), ((1.0 + p) * 0.5).sqrt())
}

/// Linear gain for a level in decibels.
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}
