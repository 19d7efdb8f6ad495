//! Plugin-hosted instrument.
//!
//! Engine events become 3-byte MIDI messages queued for the processor; the
//! mix graph renders up to each event offset, so a message queued before a
//! `render` call applies at the first frame of that call.

use super::VoiceSource;
use crate::engine::EventKind;
use crate::loader::Processor;
use crate::project::ParamKind;

/// Messages buffered between two renders.
const MIDI_QUEUE: usize = 512;

const NOTE_OFF: u8 = 0x80;
const NOTE_ON: u8 = 0x90;
const CONTROL_CHANGE: u8 = 0xB0;
const CC_RESONANCE: u8 = 71;
const CC_CUTOFF: u8 = 74;
const CC_ALL_NOTES_OFF: u8 = 123;

/// Converts a normalized value to a 7-bit MIDI data byte.
fn to_7bit(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 127.0).round() as u8
}

pub struct PluginSource {
    processor: Box<dyn Processor>,
    midi: Vec<[u8; 3]>,
    dropped: u32,
    /// Notes currently held, for the voice count.
    held: [bool; 128],
}

impl PluginSource {
    pub fn new(processor: Box<dyn Processor>) -> Self {
        Self {
            processor,
            midi: Vec::with_capacity(MIDI_QUEUE),
            dropped: 0,
            held: [false; 128],
        }
    }

    pub fn processor_name(&self) -> &str {
        self.processor.name()
    }

    /// Hands the processor back, e.g. to read its state.
    pub fn into_processor(self) -> Box<dyn Processor> {
        self.processor
    }

    fn queue(&mut self, msg: [u8; 3]) {
        if self.midi.len() < self.midi.capacity() {
            self.midi.push(msg);
        } else {
            self.dropped += 1;
        }
    }
}

impl VoiceSource for PluginSource {
    fn name(&self) -> &'static str {
        "plugin"
    }

    fn prepare(&mut self, sample_rate: u32, max_block: usize) {
        self.processor.prepare(sample_rate, max_block);
    }

    fn handle_event(&mut self, event: &EventKind) {
        match *event {
            EventKind::NoteOn { midi, velocity } => {
                let key = midi & 0x7F;
                self.held[key as usize] = true;
                self.queue([NOTE_ON, key, to_7bit(velocity).max(1)]);
            }
            EventKind::NoteOff { midi } => {
                let key = midi & 0x7F;
                self.held[key as usize] = false;
                self.queue([NOTE_OFF, key, 0]);
            }
            EventKind::AllNotesOff => {
                self.held = [false; 128];
                self.queue([CONTROL_CHANGE, CC_ALL_NOTES_OFF, 0]);
            }
            EventKind::ParameterChange { param, value } => match param {
                ParamKind::Cutoff => self.queue([CONTROL_CHANGE, CC_CUTOFF, to_7bit(value)]),
                ParamKind::Resonance => {
                    self.queue([CONTROL_CHANGE, CC_RESONANCE, to_7bit(value)])
                }
                // Volume and pan are handled by the channel strip.
                ParamKind::Volume | ParamKind::Pan => {}
            },
            EventKind::SampleTrigger { .. } | EventKind::AudioRegionBegin { .. } => {}
        }
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        self.processor.process(&self.midi, left, right);
        self.midi.clear();
    }

    fn reset(&mut self) {
        self.midi.clear();
        self.held = [false; 128];
        self.processor.reset();
    }

    fn active_voices(&self) -> usize {
        self.held.iter().filter(|&&h| h).count()
    }

    fn take_stolen(&mut self) -> u32 {
        std::mem::take(&mut self.dropped)
    }
}
