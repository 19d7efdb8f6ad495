//! Block processing.
//!
//! One call to [`Engine::process_block`] runs the whole pipeline for one
//! output buffer:
//!
//! 1. apply queued control commands (source swaps, snapshot swaps, transport)
//! 2. compute which tracks are audible and release the ones that went silent
//! 3. schedule events, splitting the block at a loop wrap
//! 4. render each track's source in sub-blocks split at its event offsets,
//!    through the track's channel strip, into the master bus
//! 5. limit the bus and feed the capture tap
//!
//! Everything the block needs is preallocated when the engine is built.
//! After construction the engine performs no I/O and no locking, and it
//! allocates only if a snapshot has more tracks than `max_tracks`.

use super::clock::{Clock, TransportState};
use super::event::{Event, EventBuffer, EventKind};
use super::scheduler::{chase, loop_cut, release_all, schedule_segment, Segment, Timeline, TrackGate};
use super::snapshot::ProjectSnapshot;
use crate::control::{AudioEndpoint, Command, EngineEvent, Garbage};
use crate::error::ErrorKind;
use crate::mix::{CaptureTap, ChannelStrip, Limiter};
use crate::project::is_audible;
use crate::source::VoiceSource;

/// Events one block can hold before overflow is reported.
pub const EVENT_CAPACITY: usize = 8192;

/// Pending live-note releases.
pub const LIVE_NOTE_CAPACITY: usize = 256;

/// Live mixer state of one snapshot track; commands can change it between
/// snapshots.
#[derive(Debug, Clone, Copy)]
struct TrackMix {
    volume: f32,
    muted: bool,
    soloed: bool,
}

/// A previewed note waiting for its note-off.
#[derive(Debug, Clone, Copy)]
struct LiveNote {
    slot: usize,
    midi: u8,
    /// Absolute engine sample of the release.
    off_at: u64,
}

pub struct Engine {
    sample_rate: u32,
    max_block: usize,
    clock: Clock,
    snapshot: Box<ProjectSnapshot>,
    sources: Vec<Option<Box<dyn VoiceSource>>>,
    strips: Vec<ChannelStrip>,
    mix: Vec<TrackMix>,
    gates: Vec<TrackGate>,
    was_audible: Vec<bool>,
    /// Tracks that need a release and a chase at the next block start.
    rechase: Vec<usize>,
    events: EventBuffer,
    live: Vec<LiveNote>,
    scratch_l: Vec<f32>,
    scratch_r: Vec<f32>,
    limiter: Limiter,
    tap: Option<CaptureTap>,
    endpoint: Option<AudioEndpoint>,
    /// Absolute sample index of the next block.
    now: u64,
    /// True while the play position is before the loop end.
    loop_armed: bool,
    chase_pending: bool,
    release_pending: bool,
    /// Set after a non-finite sample; everything is reset next block.
    needs_reset: bool,
    ready_posted: bool,
}

impl Engine {
    /// Builds an engine with no sources and an empty arrangement.
    ///
    /// # Arguments
    ///
    /// * `sample_rate` - Output rate in Hz
    /// * `max_block` - Largest block processed in one pass; longer buffers
    ///   are split
    /// * `max_tracks` - Number of source slots
    pub fn new(sample_rate: u32, max_block: usize, max_tracks: usize) -> Self {
        let max_block = max_block.max(1);
        let max_tracks = max_tracks.max(1);
        Self {
            sample_rate,
            max_block,
            clock: Clock::new(sample_rate, 120.0),
            snapshot: Box::default(),
            sources: (0..max_tracks).map(|_| None).collect(),
            strips: (0..max_tracks).map(|_| ChannelStrip::new(sample_rate)).collect(),
            mix: Vec::with_capacity(max_tracks),
            gates: Vec::with_capacity(max_tracks),
            was_audible: Vec::with_capacity(max_tracks),
            rechase: Vec::with_capacity(max_tracks),
            events: EventBuffer::with_capacity(EVENT_CAPACITY),
            live: Vec::with_capacity(LIVE_NOTE_CAPACITY),
            scratch_l: vec![0.0; max_block],
            scratch_r: vec![0.0; max_block],
            limiter: Limiter::new(sample_rate),
            tap: None,
            endpoint: None,
            now: 0,
            loop_armed: false,
            chase_pending: false,
            release_pending: false,
            needs_reset: false,
            ready_posted: false,
        }
    }

    /// Connects the command and event rings.
    pub fn with_endpoint(mut self, endpoint: AudioEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Absolute sample index of the next block.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Transport position in beats.
    pub fn position(&self) -> f64 {
        self.clock.position(self.now)
    }

    pub fn snapshot(&self) -> &ProjectSnapshot {
        &self.snapshot
    }

    /// Voices sounding across every slot.
    pub fn active_voices(&self) -> usize {
        self.sources
            .iter()
            .flatten()
            .map(|s| s.active_voices())
            .sum()
    }

    fn post(&mut self, event: EngineEvent) {
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.post(event);
        }
    }

    fn discard(&mut self, item: Garbage) {
        match self.endpoint.as_mut() {
            Some(endpoint) => endpoint.discard(item),
            // Offline engines own their garbage.
            None => drop(item),
        }
    }

    fn post_state(&mut self) {
        let state = self.clock.state();
        let beat = self.position();
        self.post(EngineEvent::State { state, beat });
    }

    fn post_error(&mut self, kind: ErrorKind, slot: Option<usize>) {
        self.post(EngineEvent::Error { kind, slot });
    }

    fn track_of_slot(&self, slot: usize) -> Option<usize> {
        self.snapshot.track_for_slot(slot)
    }

    /// Applies one command. The realtime driver calls this for every
    /// command drained from the ring; offline renders call it directly.
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::InstallSource { slot, source } => {
                let Some(entry) = self.sources.get_mut(slot) else {
                    self.discard(Garbage::Source(source));
                    self.post_error(ErrorKind::InvalidArgument, Some(slot));
                    return;
                };
                if let Some(old) = entry.replace(source) {
                    self.discard(Garbage::Source(old));
                }
                self.strips[slot].reset();
                if let Some(track) = self.track_of_slot(slot) {
                    self.push_rechase(track);
                }
                self.post(EngineEvent::SourceInstalled { slot });
            }
            Command::UnloadSource { slot } => {
                if let Some(old) = self.sources.get_mut(slot).and_then(Option::take) {
                    self.discard(Garbage::Source(old));
                }
                self.live.retain(|n| n.slot != slot);
                self.post(EngineEvent::SourceUnloaded { slot });
            }
            Command::UpdateSnapshot(snapshot) => self.install_snapshot(snapshot),
            Command::TransportStart(from) => {
                let was_playing = self.clock.is_playing();
                match self.clock.start(from, self.now) {
                    Ok(_) => {
                        self.release_pending |= was_playing;
                        self.chase_pending = true;
                        self.loop_armed = false;
                        self.post_state();
                    }
                    Err(e) => self.post_error(e.kind(), None),
                }
            }
            Command::TransportPause => {
                if self.clock.is_playing() {
                    self.clock.pause(self.now);
                    self.release_pending = true;
                }
                self.post_state();
            }
            Command::TransportStop => {
                self.clock.stop();
                self.reset_sources();
                self.chase_pending = false;
                self.release_pending = false;
                self.post_state();
            }
            Command::Seek(beat) => match self.clock.seek(beat, self.now) {
                Ok(()) => {
                    if self.clock.is_playing() {
                        self.release_pending = true;
                        self.chase_pending = true;
                        self.loop_armed = false;
                    }
                    self.post_state();
                }
                Err(e) => self.post_error(e.kind(), None),
            },
            Command::SetBpm(bpm) => match self.clock.set_bpm(bpm, self.now) {
                Ok(()) => self.post_state(),
                Err(e) => self.post_error(e.kind(), None),
            },
            Command::SetVolume { slot, percent } => {
                if !percent.is_finite() {
                    self.post_error(ErrorKind::InvalidArgument, Some(slot));
                    return;
                }
                let percent = percent.clamp(0.0, crate::project::MAX_VOLUME_PERCENT);
                if let Some(i) = self.track_of_slot(slot) {
                    self.mix[i].volume = percent;
                    let role = self.snapshot.tracks[i].role;
                    self.strips[slot].set_static(role, percent);
                }
            }
            Command::SetMute { slot, muted } => {
                if let Some(i) = self.track_of_slot(slot) {
                    self.mix[i].muted = muted;
                }
            }
            Command::SetSolo { slot, soloed } => {
                if let Some(i) = self.track_of_slot(slot) {
                    self.mix[i].soloed = soloed;
                }
            }
            Command::Panic(slot) => {
                for (i, source) in self.sources.iter_mut().enumerate() {
                    if slot.is_none_or(|s| s == i) {
                        if let Some(source) = source {
                            source.handle_event(&EventKind::AllNotesOff);
                        }
                    }
                }
                self.live.retain(|n| slot.is_some_and(|s| s != n.slot));
            }
            Command::LiveNote {
                slot,
                midi,
                velocity,
                duration_samples,
            } => {
                if self.live.len() == self.live.capacity() {
                    self.post_error(ErrorKind::VoiceStarvation, Some(slot));
                    return;
                }
                let Some(Some(source)) = self.sources.get_mut(slot) else {
                    self.post_error(ErrorKind::NotFound, Some(slot));
                    return;
                };
                source.handle_event(&EventKind::NoteOn { midi, velocity });
                self.live.push(LiveNote {
                    slot,
                    midi,
                    off_at: self.now + duration_samples.max(1),
                });
            }
            Command::LiveNoteOff { slot, midi } => {
                if let Some(Some(source)) = self.sources.get_mut(slot) {
                    source.handle_event(&EventKind::NoteOff { midi });
                }
                self.live.retain(|n| !(n.slot == slot && n.midi == midi));
            }
            Command::LiveTrigger { slot, row, gain } => {
                if let Some(Some(source)) = self.sources.get_mut(slot) {
                    source.handle_event(&EventKind::SampleTrigger { row, gain });
                }
            }
            Command::SetCaptureTap(tap) => {
                if let Some(old) = std::mem::replace(&mut self.tap, tap) {
                    self.discard(Garbage::Tap(old));
                }
            }
        }
    }

    fn push_rechase(&mut self, track: usize) {
        if !self.rechase.contains(&track) && self.rechase.len() < self.rechase.capacity() {
            self.rechase.push(track);
        }
    }

    fn install_snapshot(&mut self, snapshot: Box<ProjectSnapshot>) {
        let old = std::mem::replace(&mut self.snapshot, snapshot);

        self.mix.clear();
        self.rechase.clear();
        for (i, track) in self.snapshot.tracks.iter().enumerate() {
            self.mix.push(TrackMix {
                volume: track.volume,
                muted: track.muted,
                soloed: track.soloed,
            });
            if let Some(strip) = self.strips.get_mut(track.slot) {
                strip.configure(track);
            }
            // Edited notes on a playing track are released and chased.
            let changed = old
                .tracks
                .iter()
                .find(|t| t.slot == track.slot)
                .is_none_or(|t| t.notes != track.notes);
            if changed && self.rechase.len() < self.rechase.capacity() {
                self.rechase.push(i);
            }
        }
        self.refresh_gates();
        self.was_audible.clear();
        self.was_audible.extend(self.gates.iter().map(|g| g.audible));

        if self.snapshot.bpm != self.clock.bpm() {
            if let Err(e) = self.clock.set_bpm(self.snapshot.bpm, self.now) {
                self.post_error(e.kind(), None);
            }
        }
        let generation = self.snapshot.generation;
        self.discard(Garbage::Snapshot(old));
        self.post(EngineEvent::SnapshotApplied { generation });
    }

    fn refresh_gates(&mut self) {
        let any_solo = self.mix.iter().any(|m| m.soloed);
        self.gates.clear();
        self.gates.extend(self.mix.iter().map(|m| TrackGate {
            audible: is_audible(m.muted, m.soloed, any_solo),
            gain: m.volume / 100.0,
        }));
    }

    fn reset_sources(&mut self) {
        for source in self.sources.iter_mut().flatten() {
            source.reset();
        }
        for strip in &mut self.strips {
            strip.reset();
        }
        self.live.clear();
    }

    fn timeline(&self) -> Timeline {
        Timeline {
            origin: self.clock.origin(),
            samples_per_beat: self.clock.samples_per_beat(),
        }
    }

    /// Renders `left.len()` frames into `left` and `right`.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len().min(right.len());
        let mut done = 0;
        while done < frames {
            let n = (frames - done).min(self.max_block);
            self.process_chunk(&mut left[done..done + n], &mut right[done..done + n]);
            done += n;
        }
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.endpoint.as_mut().and_then(AudioEndpoint::next_command) {
            self.apply(command);
        }
    }

    fn process_chunk(&mut self, left: &mut [f32], right: &mut [f32]) {
        let n = left.len();
        if !self.ready_posted {
            self.ready_posted = true;
            let sample_rate = self.sample_rate;
            self.post(EngineEvent::Ready { sample_rate });
        }
        if self.needs_reset {
            self.needs_reset = false;
            self.reset_sources();
            self.limiter.reset();
            if self.clock.is_playing() {
                self.chase_pending = true;
            }
        }

        self.drain_commands();
        self.events.clear();
        self.schedule(n);
        self.render(left, right);

        self.limiter.process(left, right);
        if left.iter().chain(right.iter()).any(|s| !s.is_finite()) {
            left.fill(0.0);
            right.fill(0.0);
            self.needs_reset = true;
            self.post_error(ErrorKind::Fatal, None);
        }
        if let Some(tap) = self.tap.as_mut() {
            tap.write(left, right);
            let frames = tap.take_dropped();
            if frames > 0 {
                self.post(EngineEvent::CaptureOverflow { frames });
            }
        }
        self.now += n as u64;
    }

    /// Fills the event buffer for the next `n` frames.
    fn schedule(&mut self, n: usize) {
        let block_start = self.now as i64;
        let block_end = block_start + n as i64;

        self.refresh_gates();
        for i in 0..self.gates.len() {
            let audible = self.gates[i].audible;
            let was = self.was_audible.get(i).copied().unwrap_or(audible);
            if was && !audible {
                self.events.push(Event::new(i, 0, EventKind::AllNotesOff));
            } else if !was && audible {
                self.push_rechase(i);
            }
        }
        self.was_audible.clear();
        self.was_audible.extend(self.gates.iter().map(|g| g.audible));

        if self.release_pending {
            self.release_pending = false;
            release_all(self.snapshot.tracks.len(), 0, &mut self.events);
        }

        if self.clock.is_playing() {
            let timeline = self.timeline();
            if self.chase_pending {
                self.chase_pending = false;
                self.rechase.clear();
                chase(
                    &self.snapshot,
                    &self.gates,
                    &timeline,
                    block_start,
                    block_start,
                    None,
                    &mut self.events,
                );
            }
            for k in 0..self.rechase.len() {
                let track = self.rechase[k];
                self.events.push(Event::new(track, 0, EventKind::AllNotesOff));
                chase(
                    &self.snapshot,
                    &self.gates,
                    &timeline,
                    block_start,
                    block_start,
                    Some(track),
                    &mut self.events,
                );
            }
            self.schedule_with_loop(block_start, block_end);
        }
        self.rechase.clear();

        self.schedule_live_offs(block_start, block_end);
        self.events.sort();

        let dropped = self.events.take_overflow();
        if dropped > 0 {
            self.post(EngineEvent::EventOverflow { dropped });
        }
    }

    /// Schedules `[block_start, block_end)`, wrapping at the loop end.
    fn schedule_with_loop(&mut self, block_start: i64, block_end: i64) {
        let mut seg_start = block_start;
        loop {
            let timeline = self.timeline();
            let region = self
                .snapshot
                .loop_region
                .filter(|r| r.length() * timeline.samples_per_beat >= 1.0);
            if let Some(region) = region {
                let wrap_at = timeline.sample(region.end);
                if self.loop_armed && wrap_at <= seg_start {
                    loop_cut(
                        &self.snapshot,
                        &self.gates,
                        &timeline,
                        seg_start,
                        block_start,
                        &mut self.events,
                    );
                    self.clock.anchor(region.start, seg_start as u64);
                    let rewound = self.timeline();
                    chase(
                        &self.snapshot,
                        &self.gates,
                        &rewound,
                        seg_start,
                        block_start,
                        None,
                        &mut self.events,
                    );
                    self.loop_armed = false;
                    continue;
                }
                if wrap_at > seg_start && wrap_at < block_end {
                    let seg = Segment {
                        block_start,
                        start: seg_start,
                        end: wrap_at,
                    };
                    schedule_segment(&self.snapshot, &self.gates, &timeline, seg, &mut self.events);
                    seg_start = wrap_at;
                    self.loop_armed = true;
                    continue;
                }
                self.loop_armed = wrap_at > seg_start;
            }
            let seg = Segment {
                block_start,
                start: seg_start,
                end: block_end,
            };
            schedule_segment(&self.snapshot, &self.gates, &timeline, seg, &mut self.events);
            break;
        }
    }

    /// Note-offs for previewed notes that end inside this block.
    fn schedule_live_offs(&mut self, block_start: i64, block_end: i64) {
        let mut k = 0;
        while k < self.live.len() {
            let note = self.live[k];
            if (note.off_at as i64) >= block_end {
                k += 1;
                continue;
            }
            let offset = (note.off_at as i64 - block_start).max(0) as u32;
            let off = EventKind::NoteOff { midi: note.midi };
            match self.snapshot.track_for_slot(note.slot) {
                Some(track) => self.events.push(Event::new(track, offset, off)),
                None => {
                    if let Some(Some(source)) = self.sources.get_mut(note.slot) {
                        source.handle_event(&off);
                    }
                }
            }
            self.live.swap_remove(k);
        }
    }

    /// Renders every track into the bus, splitting at event offsets.
    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        let n = left.len();
        left.fill(0.0);
        right.fill(0.0);

        let Self {
            snapshot,
            sources,
            strips,
            gates,
            events,
            scratch_l,
            scratch_r,
            endpoint,
            ..
        } = self;
        let events = events.as_slice();

        for (i, track) in snapshot.tracks.iter().enumerate() {
            let slot = track.slot;
            let Some(Some(source)) = sources.get_mut(slot) else {
                continue;
            };
            let Some(strip) = strips.get_mut(slot) else {
                continue;
            };
            let audible = gates.get(i).is_some_and(|g| g.audible);
            let sl = &mut scratch_l[..n];
            let sr = &mut scratch_r[..n];

            let mut pos = 0usize;
            for event in events.iter().filter(|e| e.track == i) {
                let at = (event.offset as usize).min(n);
                if at > pos {
                    source.render(&mut sl[pos..at], &mut sr[pos..at]);
                    strip.process(&mut sl[pos..at], &mut sr[pos..at]);
                    pos = at;
                }
                if let EventKind::ParameterChange { param, value } = event.kind {
                    strip.set_param(param, value);
                }
                source.handle_event(&event.kind);
            }
            if pos < n {
                source.render(&mut sl[pos..n], &mut sr[pos..n]);
                strip.process(&mut sl[pos..n], &mut sr[pos..n]);
            }

            if audible {
                for (out, s) in left.iter_mut().zip(sl.iter()) {
                    *out += *s;
                }
                for (out, s) in right.iter_mut().zip(sr.iter()) {
                    *out += *s;
                }
            }

            let stolen = source.take_stolen();
            if stolen > 0 {
                if let Some(endpoint) = endpoint.as_mut() {
                    endpoint.post(EngineEvent::VoiceOverflow { slot, stolen });
                }
            }
        }
    }

    /// Transport state, for drivers that need to refuse work while playing.
    pub fn transport(&self) -> TransportState {
        self.clock.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::test_support::sine_bank;
    use crate::loader::AudioBuffer;
    use crate::project::{LoopRegion, Note, Project, Track, TrackId};
    use crate::source::{AudioClipSource, SoundfontSource};
    use std::collections::HashMap;
    use std::sync::Arc;

    const SR: u32 = 48_000;

    fn snapshot_of(project: &Project) -> Box<ProjectSnapshot> {
        let slots: HashMap<TrackId, usize> = project
            .tracks()
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Box::new(ProjectSnapshot::build(project, &slots, SR, 1).unwrap())
    }

    fn soundfont_source() -> Box<dyn VoiceSource> {
        let (mut src, _) = SoundfontSource::new(Arc::new(sine_bank(SR)), 0, 0);
        src.prepare(SR, 512);
        Box::new(src)
    }

    fn bound_track(name: &str, notes: &[(u8, f64, f64)]) -> Track {
        let mut track = Track::new_midi(name);
        track
            .bind_instrument(crate::project::InstrumentBinding::Soundfont {
                path: "sine.sf2".into(),
                bank: 0,
                preset: 0,
            })
            .unwrap();
        for &(midi, start, duration) in notes {
            track.add_note(Note::new(midi, start, duration, 0.8)).unwrap();
        }
        track
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    /// Runs `blocks` blocks of `size` frames; returns the left channel.
    fn run(engine: &mut Engine, blocks: usize, size: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(blocks * size);
        let mut l = vec![0.0; size];
        let mut r = vec![0.0; size];
        for _ in 0..blocks {
            engine.process_block(&mut l, &mut r);
            out.extend_from_slice(&l);
        }
        out
    }

    fn engine_with(project: &Project) -> Engine {
        let mut engine = Engine::new(SR, 512, 8);
        for (slot, _) in project.tracks().iter().enumerate() {
            engine.apply(Command::InstallSource {
                slot,
                source: soundfont_source(),
            });
        }
        engine.apply(Command::UpdateSnapshot(snapshot_of(project)));
        engine
    }

    #[test]
    fn test_silent_when_stopped() {
        let mut project = Project::new();
        project.add_track(bound_track("a", &[(69, 0.0, 1.0)])).unwrap();
        let mut engine = engine_with(&project);
        let out = run(&mut engine, 4, 512);
        assert_eq!(peak(&out), 0.0);
        assert_eq!(engine.now(), 2048);
    }

    #[test]
    fn test_plays_note_from_start() {
        let mut project = Project::new();
        project.add_track(bound_track("a", &[(69, 0.0, 1.0)])).unwrap();
        let mut engine = engine_with(&project);
        engine.apply(Command::TransportStart(Some(0.0)));
        let out = run(&mut engine, 4, 512);
        assert!(peak(&out) > 0.1);
    }

    #[test]
    fn test_solo_silences_other_track_next_block() {
        let mut project = Project::new();
        project.add_track(bound_track("a", &[(69, 0.0, 4.0)])).unwrap();
        project.add_track(bound_track("b", &[(57, 0.0, 4.0)])).unwrap();
        let mut engine = engine_with(&project);
        engine.apply(Command::TransportStart(Some(0.0)));
        run(&mut engine, 8, 512);

        engine.apply(Command::SetSolo {
            slot: 0,
            soloed: true,
        });
        run(&mut engine, 1, 512);
        // Track b no longer reaches the bus; a keeps sounding.
        assert!(engine.sources[0].as_ref().unwrap().active_voices() > 0);
        let solo_out = run(&mut engine, 1, 512);
        assert!(peak(&solo_out) > 0.0);

        engine.apply(Command::SetSolo {
            slot: 0,
            soloed: false,
        });
        run(&mut engine, 1, 512);
        assert!(engine.sources[1].as_ref().unwrap().active_voices() > 0);
    }

    #[test]
    fn test_seek_releases_then_chases() {
        let mut project = Project::new();
        project
            .add_track(bound_track("a", &[(60, 0.5, 1.0), (72, 3.0, 1.0)]))
            .unwrap();
        let mut engine = engine_with(&project);
        engine.apply(Command::TransportStart(Some(3.0)));
        run(&mut engine, 1, 512);
        assert_eq!(engine.active_voices(), 1);

        engine.apply(Command::Seek(1.0));
        run(&mut engine, 1, 512);
        // Note 72 is releasing, note 60 was retriggered.
        let sf = engine.sources[0].as_ref().unwrap();
        assert_eq!(sf.active_voices(), 2);
        assert!((engine.position() - (1.0 + 512.0 / 24_000.0)).abs() < 1e-9);
    }

    #[test]
    fn test_tempo_change_keeps_position() {
        let mut project = Project::new();
        project.add_track(bound_track("a", &[])).unwrap();
        let mut engine = engine_with(&project);
        engine.apply(Command::TransportStart(Some(0.0)));
        // 96 blocks of 500 frames is one second: beat 2.0 at 120 bpm.
        run(&mut engine, 96, 500);
        assert_eq!(engine.position(), 2.0);
        engine.apply(Command::SetBpm(60.0));
        assert_eq!(engine.position(), 2.0);
        run(&mut engine, 48, 500);
        assert_eq!(engine.position(), 2.5);
    }

    #[test]
    fn test_pause_releases_voices() {
        let mut project = Project::new();
        project.add_track(bound_track("a", &[(60, 0.0, 8.0)])).unwrap();
        let mut engine = engine_with(&project);
        engine.apply(Command::TransportStart(Some(0.0)));
        run(&mut engine, 2, 512);
        engine.apply(Command::TransportPause);
        // The sine bank releases over 0.2 s.
        run(&mut engine, 30, 512);
        assert_eq!(engine.active_voices(), 0);
        assert_eq!(engine.transport(), TransportState::Paused);
    }

    #[test]
    fn test_loop_wraps_and_retriggers() {
        let mut project = Project::new();
        project.add_track(bound_track("a", &[(60, 0.0, 2.0)])).unwrap();
        project.loop_region = Some(LoopRegion::new(0.0, 1.0).unwrap());
        let mut engine = engine_with(&project);
        engine.apply(Command::TransportStart(Some(0.0)));
        // One beat is 24,000 samples; run past three wraps.
        run(&mut engine, 150, 512);
        let pos = engine.position();
        assert!((0.0..1.0).contains(&pos), "position {}", pos);
    }

    #[test]
    fn test_clip_track_plays_from_region_start() {
        let mut project = Project::new();
        let mut audio = Track::new_audio("vox", "vox.wav");
        let clip = Arc::new(AudioBuffer::new(SR, vec![0.25; 2 * 1000]));
        if let crate::project::TrackKind::Audio(a) = &mut audio.kind {
            a.clip = Some(Arc::clone(&clip));
        }
        project.add_track(audio).unwrap();

        let mut engine = Engine::new(SR, 512, 4);
        engine.apply(Command::InstallSource {
            slot: 0,
            source: Box::new(AudioClipSource::new(clip)),
        });
        engine.apply(Command::UpdateSnapshot(snapshot_of(&project)));
        engine.apply(Command::TransportStart(Some(0.0)));
        let out = run(&mut engine, 4, 512);
        // Unity gain for clips: 0.25 ×√2 × √½ at centre pan.
        assert!((out[10] - 0.25).abs() < 1e-4);
        assert_eq!(out[1500], 0.0);
    }

    #[test]
    fn test_live_note_released_after_duration() {
        let mut project = Project::new();
        project.add_track(bound_track("a", &[])).unwrap();
        let mut engine = engine_with(&project);
        engine.apply(Command::LiveNote {
            slot: 0,
            midi: 64,
            velocity: 1.0,
            duration_samples: 1000,
        });
        assert_eq!(engine.active_voices(), 1);
        let out = run(&mut engine, 1, 512);
        assert!(peak(&out) > 0.0);
        // Past the note-off plus the 0.2 s release.
        run(&mut engine, 30, 512);
        assert_eq!(engine.active_voices(), 0);
        assert!(engine.live.is_empty());
    }

    #[test]
    fn test_invalid_seek_reported() {
        let (mut control, audio) = crate::control::engine_channel(8, 8);
        let mut engine = Engine::new(SR, 256, 2).with_endpoint(audio);
        control.send(Command::Seek(-1.0)).unwrap();
        run(&mut engine, 1, 256);
        let events = control.drain_events();
        assert!(events.contains(&EngineEvent::Ready { sample_rate: SR }));
        assert!(events.contains(&EngineEvent::Error {
            kind: ErrorKind::InvalidArgument,
            slot: None
        }));
    }

    #[test]
    fn test_invalid_snapshot_tempo_reported() {
        let (mut control, audio) = crate::control::engine_channel(8, 8);
        let mut engine = Engine::new(SR, 256, 2).with_endpoint(audio);
        let snapshot = ProjectSnapshot {
            bpm: 0.0,
            ..ProjectSnapshot::default()
        };
        control.send(Command::UpdateSnapshot(Box::new(snapshot))).unwrap();
        run(&mut engine, 1, 256);
        assert_eq!(engine.clock().bpm(), 120.0);
        assert!(control.drain_events().contains(&EngineEvent::Error {
            kind: ErrorKind::InvalidArgument,
            slot: None
        }));
    }

    #[test]
    fn test_non_finite_volume_rejected() {
        let mut project = Project::new();
        project.add_track(bound_track("a", &[(69, 0.0, 4.0)])).unwrap();
        let (mut control, audio) = crate::control::engine_channel(8, 8);
        let mut engine = engine_with(&project).with_endpoint(audio);
        control
            .send(Command::SetVolume {
                slot: 0,
                percent: f32::NAN,
            })
            .unwrap();
        control.send(Command::TransportStart(Some(0.0))).unwrap();
        let out = run(&mut engine, 4, 512);
        assert_eq!(engine.mix[0].volume, 100.0);
        assert!(out.iter().all(|s| s.is_finite()));
        assert!(peak(&out) > 0.0);
        assert!(control.drain_events().contains(&EngineEvent::Error {
            kind: ErrorKind::InvalidArgument,
            slot: Some(0)
        }));
    }

    #[test]
    fn test_replaced_source_comes_back_as_garbage() {
        let (mut control, audio) = crate::control::engine_channel(8, 8);
        let mut engine = Engine::new(SR, 256, 2).with_endpoint(audio);
        for _ in 0..2 {
            control
                .send(Command::InstallSource {
                    slot: 1,
                    source: soundfont_source(),
                })
                .unwrap();
        }
        run(&mut engine, 1, 256);
        assert_eq!(control.collect_garbage(), 1);
    }
}
