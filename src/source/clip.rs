//! Audio clip playback.

use super::VoiceSource;
use crate::engine::EventKind;
use crate::loader::AudioBuffer;
use std::sync::Arc;

/// Plays one decoded clip from a region-begin event until it runs out.
pub struct AudioClipSource {
    clip: Arc<AudioBuffer>,
    /// Next frame to play, or `None` while idle.
    position: Option<usize>,
}

impl AudioClipSource {
    /// The clip must already be at the engine rate.
    pub fn new(clip: Arc<AudioBuffer>) -> Self {
        Self {
            clip,
            position: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.position.is_some()
    }
}

impl VoiceSource for AudioClipSource {
    fn name(&self) -> &'static str {
        "clip"
    }

    fn prepare(&mut self, _sample_rate: u32, _max_block: usize) {}

    fn handle_event(&mut self, event: &EventKind) {
        match *event {
            EventKind::AudioRegionBegin { clip_offset } => {
                let start = clip_offset as usize;
                self.position = (start < self.clip.frames()).then_some(start);
            }
            EventKind::AllNotesOff => self.position = None,
            _ => {}
        }
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        left.fill(0.0);
        right.fill(0.0);
        let Some(start) = self.position else {
            return;
        };
        let frames = self.clip.frames();
        let n = left.len().min(frames - start);
        for i in 0..n {
            let (l, r) = self.clip.frame(start + i);
            left[i] = l;
            right[i] = r;
        }
        let next = start + n;
        self.position = (next < frames).then_some(next);
    }

    fn reset(&mut self) {
        self.position = None;
    }

    fn active_voices(&self) -> usize {
        usize::from(self.is_playing())
    }
}
