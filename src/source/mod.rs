//! Voice sources.
//!
//! Every track renders through one [`VoiceSource`]: a soundfont synth, a
//! plugin processor, an audio-clip player or a one-shot sampler. The mix
//! graph drives them all the same way: apply the events due at the current
//! offset, then render up to the next event.
//!
//! Sources are built off the audio thread and preallocate everything in
//! [`VoiceSource::prepare`]; `handle_event` and `render` never allocate.

mod clip;
mod envelope;
mod filter;
mod plugin;
mod sampler;
mod soundfont;

pub use clip::AudioClipSource;
pub use envelope::{Envelope, Stage, SILENCE_GAIN};
pub use filter::StateVariableFilter;
pub use plugin::PluginSource;
pub use sampler::{SamplerSource, RELEASE_FADE_SECONDS, SAMPLER_VOICES};
pub use soundfont::{SoundfontSource, SOUNDFONT_VOICES};

use crate::engine::EventKind;

/// The uniform pull interface of all sources.
pub trait VoiceSource: Send {
    /// Short label for diagnostics.
    fn name(&self) -> &'static str;

    /// Sizes internal buffers; called before the source is installed.
    fn prepare(&mut self, sample_rate: u32, max_block: usize);

    /// Applies an event at the current render position.
    fn handle_event(&mut self, event: &EventKind);

    /// Overwrites `left` and `right` with the next `left.len()` frames.
    fn render(&mut self, left: &mut [f32], right: &mut [f32]);

    /// Hard-stops every voice and returns to idle.
    fn reset(&mut self);

    /// Voices currently sounding.
    fn active_voices(&self) -> usize;

    /// Voices stolen since the last call.
    fn take_stolen(&mut self) -> u32 {
        0
    }
}
