//! Control-side engine handle.
//!
//! [`EngineHandle`] owns everything the audio thread must never touch: the
//! editable [`Project`], the track to slot map, the loader pool and the
//! decoded resources behind each installed source. It turns protocol
//! requests into project edits, loader jobs and engine commands, and turns
//! loader outcomes and engine events back into reply lines.
//!
//! The handle never blocks on the audio thread. Every change reaches the
//! engine as a prepared command: a built source, a flattened snapshot or a
//! mixer value.

use crate::config::EngineConfig;
use crate::control::protocol::{error_line, event_line};
use crate::control::{engine_channel, parse_request, Command, ControlEndpoint, EngineEvent, Request};
use crate::engine::{Engine, ProjectSnapshot, TransportState};
use crate::error::{EngineError, EngineResult};
use crate::loader::{
    load_processor, scan_plugins, AudioBuffer, AudioPurpose, LoadJob, LoadOutcome, LoaderPool,
    Processor, ResourceCache, SoundfontBank,
};
use crate::mix::capture_ring;
use crate::project::{load_project, save_project, InstrumentBinding, Project, Track, TrackId, TrackKind};
use crate::render::wav::BITS_PER_SAMPLE;
use crate::render::{export_wav, RenderJob, RenderOptions};
use crate::source::{AudioClipSource, PluginSource, SamplerSource, SoundfontSource, VoiceSource};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Step count of beat tracks created by `LOAD_BEAT_SAMPLE`.
const DEFAULT_STEP_COUNT: u32 = 16;

/// Base note of sampler tracks created before their sample arrives.
const DEFAULT_SAMPLER_BASE: u8 = 60;

/// Whether the command loop keeps reading input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Report from the background render thread.
#[derive(Debug)]
pub enum RenderUpdate {
    /// Finished share of the render, in steps of 10 percent.
    Progress(u32),
    Finished { path: PathBuf, frames: u64 },
    Failed { path: PathBuf, error: EngineError },
}

/// Decoded resources behind a track's installed source.
enum Instrument {
    Soundfont { bank: Arc<SoundfontBank>, path: PathBuf },
    Plugin { name: String },
    Beat(HashMap<String, Arc<AudioBuffer>>),
    Sampler(Arc<AudioBuffer>),
    Clip(Arc<AudioBuffer>),
}

impl Instrument {
    fn plays_notes(&self) -> bool {
        matches!(
            self,
            Instrument::Soundfont { .. } | Instrument::Plugin { .. } | Instrument::Sampler(_)
        )
    }
}

/// Track variant a protocol command implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Midi,
    Beat,
    Sampler,
}

impl Shape {
    fn matches(&self, kind: &TrackKind) -> bool {
        matches!(
            (self, kind),
            (Shape::Midi, TrackKind::Midi(_))
                | (Shape::Beat, TrackKind::Beat(_))
                | (Shape::Sampler, TrackKind::Sampler(_))
        )
    }
}

/// The control thread's view of one engine.
pub struct EngineHandle {
    config: EngineConfig,
    project: Project,
    slots: HashMap<TrackId, usize>,
    control: ControlEndpoint,
    loader: LoaderPool,
    instruments: HashMap<TrackId, Instrument>,
    /// Tracks whose plugin is being reloaded by `SET_STATE`.
    restating: HashSet<TrackId>,
    generation: u64,
    /// Last known transport state, updated optimistically on commands.
    transport: TransportState,
    pending: usize,
    cancel: Arc<AtomicBool>,
    render_thread: Option<JoinHandle<()>>,
    render_tx: Sender<RenderUpdate>,
    render_rx: Receiver<RenderUpdate>,
}

impl EngineHandle {
    /// Creates a handle and the engine it drives.
    ///
    /// The engine is returned rather than started so the caller decides who
    /// pulls blocks from it: a device stream, a test or an offline driver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unusable configuration and `Fatal`
    /// if the loader threads cannot be started.
    pub fn new(config: EngineConfig) -> EngineResult<(Self, Engine)> {
        config.validate()?;
        let (control, audio) = engine_channel(config.command_capacity, config.event_capacity);
        let engine = Engine::new(config.sample_rate, config.max_block_size, config.max_tracks)
            .with_endpoint(audio);
        let loader = LoaderPool::new(
            config.loader_threads,
            Arc::new(ResourceCache::new()),
            config.sample_rate,
            config.max_block_size,
        )?;
        tracing::info!(
            "Engine handle ready ({} Hz, block {}, {} slots)",
            config.sample_rate,
            config.block_size,
            config.max_tracks
        );
        let (render_tx, render_rx) = unbounded();
        let handle = Self {
            config,
            project: Project::new(),
            slots: HashMap::new(),
            control,
            loader,
            instruments: HashMap::new(),
            restating: HashSet::new(),
            generation: 0,
            transport: TransportState::Stopped,
            pending: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            render_thread: None,
            render_tx,
            render_rx,
        };
        Ok((handle, engine))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    /// Loads that have been submitted but not yet handled.
    pub fn pending_loads(&self) -> usize {
        self.pending
    }

    /// Flag that stops a running offline render.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Receiver of finished loads, for `crossbeam_channel::select!`.
    pub fn outcome_receiver(&self) -> Receiver<LoadOutcome> {
        self.loader.outcomes().clone()
    }

    /// Receiver of render progress and results, for `crossbeam_channel::select!`.
    pub fn render_receiver(&self) -> Receiver<RenderUpdate> {
        self.render_rx.clone()
    }

    /// Whether an offline render is running.
    pub fn is_rendering(&self) -> bool {
        self.render_thread.is_some()
    }

    /// Applies an edit to the project and publishes the result.
    ///
    /// New tracks get a slot, removed tracks lose theirs. A failed edit or
    /// an edit that leaves the project invalid is rolled back.
    ///
    /// # Errors
    ///
    /// Returns the edit's error, `InvalidArgument` when the project breaks an
    /// invariant or runs out of slots, or `Overrun` if the engine is not
    /// draining commands.
    pub fn edit_project<F>(&mut self, edit: F) -> EngineResult<()>
    where
        F: FnOnce(&mut Project) -> EngineResult<()>,
    {
        let backup = self.project.clone();
        if let Err(e) = edit(&mut self.project).and_then(|_| self.project.validate()) {
            self.project = backup;
            return Err(e);
        }
        if let Err(e) = self.sync_slots() {
            self.project = backup;
            self.sync_slots()?;
            return Err(e);
        }
        self.send(Command::SetBpm(self.project.bpm() as f64))?;
        self.publish()
    }

    /// Parses and handles one protocol line.
    pub fn handle_line(&mut self, line: &str, out: &mut Vec<String>) -> Flow {
        match parse_request(line) {
            Ok(None) => Flow::Continue,
            Ok(Some(request)) => self.handle(request, out),
            Err(e) => {
                tracing::debug!("Rejected line {:?}: {}", line, e.detail);
                out.push(e.to_string());
                Flow::Continue
            }
        }
    }

    /// Handles one parsed request, appending reply lines to `out`.
    pub fn handle(&mut self, request: Request, out: &mut Vec<String>) -> Flow {
        let area = request.area();
        let subject = request.track().map(str::to_string);
        let result = match request {
            Request::Ping => {
                out.push(event_line("PONG", &[]));
                Ok(())
            }
            Request::Quit => {
                self.shutdown();
                out.push(event_line("EXIT", &[]));
                return Flow::Quit;
            }
            Request::Status => {
                out.push(event_line(
                    "STATUS",
                    &[
                        &format!("rate={}", self.config.sample_rate),
                        &format!("block={}", self.config.block_size),
                    ],
                ));
                Ok(())
            }
            Request::LoadPlugin { track, path } => self.load_plugin(track.into(), path),
            Request::LoadSoundfont {
                track,
                path,
                bank,
                preset,
            } => self.load_soundfont(track.into(), path, bank, preset),
            Request::SetSoundfontPreset {
                track,
                bank,
                preset,
            } => self.set_soundfont_preset(&track.into(), bank, preset, out),
            Request::Note {
                track,
                midi,
                velocity,
                duration_ms,
            } => self.play_note(&track.into(), midi, velocity, duration_ms, out),
            Request::SetVolume { track, percent } => self.set_volume(&track.into(), percent, out),
            Request::LoadBeatSample { track, row, path } => {
                self.load_beat_sample(track.into(), row, path)
            }
            Request::TriggerBeat { track, row, gain } => {
                self.trigger_beat(&track.into(), &row, gain, out)
            }
            Request::ClearBeat { track, row } => self.clear_beat(&track.into(), row, out),
            Request::LoadSamplerSample {
                track,
                path,
                base_note,
            } => self.load_sampler_sample(track.into(), path, base_note),
            Request::TriggerSampler {
                track,
                midi,
                velocity,
            } => self.trigger_sampler(&track.into(), midi, velocity, out),
            Request::StopSamplerNote { track, midi } => {
                self.stop_sampler_note(&track.into(), midi, out)
            }
            Request::ClearSampler { track } => self.clear_sampler(&track.into(), out),
            Request::Panic { track } => self.panic(track.map(TrackId::from), out),
            Request::OpenEditor { track } => {
                // In-process processors have no editor windows.
                out.push(error_line("EDITOR", &[&track, &"no-editor"]));
                Ok(())
            }
            Request::CloseEditor { track } => {
                out.push(event_line("EDITOR_CLOSED", &[&track]));
                Ok(())
            }
            Request::RenderWav {
                path,
                sample_rate,
                bit_depth,
            } => self.render_wav(&path, sample_rate, bit_depth, out),
            Request::CancelRender => self.cancel_render(),
            Request::GetState { track } => self.get_state(&track.into(), out),
            Request::SetState { track, blob } => self.set_state(track.into(), &blob, out),
            Request::ScanPlugins => {
                let plugins = scan_plugins(&self.config.plugin_search_dirs());
                for plugin in &plugins {
                    out.push(event_line("PLUGIN", &[&plugin.path, &plugin.name]));
                }
                out.push(event_line("SCAN_DONE", &[&plugins.len()]));
                Ok(())
            }
            Request::LoadProject { path } => self.open_project(&path, out),
            Request::SaveProject { path } => save_project(&self.project, &path).map(|_| {
                out.push(event_line("PROJECT_SAVED", &[&path.display()]));
            }),
            Request::Play { beat } => self.send(Command::TransportStart(beat)).map(|_| {
                self.transport = TransportState::Playing;
            }),
            Request::Pause => self.send(Command::TransportPause).map(|_| {
                if self.transport == TransportState::Playing {
                    self.transport = TransportState::Paused;
                }
            }),
            Request::Stop => self.send(Command::TransportStop).map(|_| {
                self.transport = TransportState::Stopped;
            }),
            Request::Seek { beat } => self.send(Command::Seek(beat)),
            Request::SetBpm { bpm } => self.set_bpm(bpm, out),
            Request::SetMute { track, on } => self.set_mute(&track.into(), on, out),
            Request::SetSolo { track, on } => self.set_solo(&track.into(), on, out),
        };

        if let Err(e) = result {
            tracing::warn!("{} request failed: {}", area, e);
            match subject {
                Some(track) => out.push(error_line(area, &[&track, &e])),
                None => out.push(error_line(area, &[&e])),
            }
        }
        Flow::Continue
    }

    /// Drains loader outcomes, render updates and engine events without
    /// blocking.
    pub fn poll(&mut self, out: &mut Vec<String>) {
        while let Some(outcome) = self.loader.try_recv() {
            self.handle_outcome(outcome, out);
        }
        while let Ok(update) = self.render_rx.try_recv() {
            self.handle_render_update(update, out);
        }
        self.reap_render(out);
        self.drain_engine_events(out);
        self.control.collect_garbage();
    }

    /// Waits until every submitted load and the running render have been
    /// handled, or `timeout` passes.
    ///
    /// # Returns
    ///
    /// `true` when nothing is left pending
    pub fn settle(&mut self, timeout: Duration, out: &mut Vec<String>) -> bool {
        let deadline = Instant::now() + timeout;
        let outcomes = self.loader.outcomes().clone();
        let renders = self.render_rx.clone();
        while self.pending > 0 || self.render_thread.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(outcomes) -> msg => match msg {
                    Ok(outcome) => self.handle_outcome(outcome, out),
                    Err(_) => break,
                },
                recv(renders) -> msg => match msg {
                    Ok(update) => self.handle_render_update(update, out),
                    Err(_) => break,
                },
                default(remaining) => break,
            }
        }
        self.drain_engine_events(out);
        self.control.collect_garbage();
        self.pending == 0 && self.render_thread.is_none()
    }

    /// Reports one message from the render thread.
    pub fn handle_render_update(&mut self, update: RenderUpdate, out: &mut Vec<String>) {
        match update {
            RenderUpdate::Progress(percent) => {
                out.push(event_line("RENDER_PROGRESS", &[&percent]));
            }
            RenderUpdate::Finished { path, frames } => {
                self.join_render();
                tracing::info!("Rendered {} frames to {}", frames, path.display());
                out.push(event_line("RENDERED", &[&path.display()]));
            }
            RenderUpdate::Failed {
                path,
                error: EngineError::Cancelled,
            } => {
                self.join_render();
                tracing::info!("Render of {} cancelled", path.display());
                out.push(event_line("RENDER_CANCELLED", &[&path.display()]));
            }
            RenderUpdate::Failed { path, error } => {
                self.join_render();
                tracing::warn!("Render of {} failed: {}", path.display(), error);
                out.push(error_line("RENDER", &[&error]));
            }
        }
    }

    /// Installs a finished load and reports it.
    pub fn handle_outcome(&mut self, outcome: LoadOutcome, out: &mut Vec<String>) {
        self.pending = self.pending.saturating_sub(1);
        let track = outcome.track().clone();
        if !self.slots.contains_key(&track) {
            tracing::debug!("Dropping load result for removed track {}", track);
            self.restating.remove(&track);
            return;
        }

        let (area, result) = match outcome {
            LoadOutcome::Soundfont {
                path,
                bank,
                preset,
                result,
                ..
            } => (
                "LOAD_SF2",
                self.soundfont_loaded(&track, path, bank, preset, result, out),
            ),
            LoadOutcome::Plugin { path, result, .. } => {
                let restate = self.restating.remove(&track);
                let area = if restate { "STATE" } else { "LOAD" };
                (area, self.plugin_loaded(&track, path, restate, result, out))
            }
            LoadOutcome::Audio {
                path,
                purpose,
                result,
                ..
            } => {
                let area = match purpose {
                    AudioPurpose::Clip => "LOAD",
                    AudioPurpose::BeatRow(_) => "BEAT",
                    AudioPurpose::Sampler { .. } => "SAMPLER",
                };
                (area, self.audio_loaded(&track, path, purpose, result, out))
            }
        };

        if let Err(e) = result {
            tracing::warn!("Load for track {} failed: {}", track, e);
            out.push(error_line(area, &[&track, &e]));
        }
    }

    /// Opens a capture ring after the master limiter.
    ///
    /// # Arguments
    ///
    /// * `seconds` - Ring capacity; blocks that do not fit are dropped
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a non-positive length and `Overrun` if
    /// the command cannot be queued.
    pub fn open_capture(&mut self, seconds: f64) -> EngineResult<rtrb::Consumer<f32>> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "capture length {} must be positive",
                seconds
            )));
        }
        let frames = (seconds * self.config.sample_rate as f64).ceil() as usize;
        let (tap, consumer) = capture_ring(frames);
        self.send(Command::SetCaptureTap(Some(tap)))?;
        Ok(consumer)
    }

    pub fn close_capture(&mut self) -> EngineResult<()> {
        self.send(Command::SetCaptureTap(None))
    }

    /// Silences everything, stops the transport and any running render.
    pub fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        for command in [Command::Panic(None), Command::TransportStop] {
            if let Err(e) = self.send(command) {
                tracing::warn!("Shutdown command dropped: {}", e);
            }
        }
        self.transport = TransportState::Stopped;
        // The render stops at its next block and closes its file.
        self.join_render();
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn send(&mut self, command: Command) -> EngineResult<()> {
        self.control.send(command)
    }

    fn submit(&mut self, job: LoadJob) -> EngineResult<()> {
        self.loader.submit(job)?;
        self.pending += 1;
        Ok(())
    }

    fn publish(&mut self) -> EngineResult<()> {
        self.generation += 1;
        let snapshot = ProjectSnapshot::build(
            &self.project,
            &self.slots,
            self.config.sample_rate,
            self.generation,
        )?;
        tracing::debug!(
            "Publishing snapshot {} ({} tracks)",
            self.generation,
            snapshot.tracks.len()
        );
        self.send(Command::UpdateSnapshot(Box::new(snapshot)))
    }

    fn install(&mut self, slot: usize, mut source: Box<dyn VoiceSource>) -> EngineResult<()> {
        source.prepare(self.config.sample_rate, self.config.max_block_size);
        tracing::debug!("Installing {} source in slot {}", source.name(), slot);
        self.send(Command::InstallSource { slot, source })
    }

    fn slot_of(&self, id: &TrackId) -> EngineResult<usize> {
        self.slots
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("track {}", id)))
    }

    fn track_mut(&mut self, id: &TrackId) -> EngineResult<&mut Track> {
        self.project
            .get_track_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("track {}", id)))
    }

    fn track_in_slot(&self, slot: usize) -> String {
        self.slots
            .iter()
            .find(|(_, s)| **s == slot)
            .map(|(id, _)| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    fn allocate_slot(&mut self, id: &TrackId) -> EngineResult<usize> {
        if let Some(&slot) = self.slots.get(id) {
            return Ok(slot);
        }
        let used: HashSet<usize> = self.slots.values().copied().collect();
        let slot = (0..self.config.max_tracks)
            .find(|s| !used.contains(s))
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!(
                    "track limit {} reached",
                    self.config.max_tracks
                ))
            })?;
        self.slots.insert(id.clone(), slot);
        Ok(slot)
    }

    /// Matches the slot map to the project's tracks.
    fn sync_slots(&mut self) -> EngineResult<()> {
        let live: HashSet<TrackId> = self.project.tracks().iter().map(|t| t.id.clone()).collect();
        let gone: Vec<(TrackId, usize)> = self
            .slots
            .iter()
            .filter(|(id, _)| !live.contains(*id))
            .map(|(id, slot)| (id.clone(), *slot))
            .collect();
        for (id, slot) in gone {
            self.slots.remove(&id);
            self.instruments.remove(&id);
            self.send(Command::UnloadSource { slot })?;
        }
        let ids: Vec<TrackId> = self.project.tracks().iter().map(|t| t.id.clone()).collect();
        for id in ids {
            self.allocate_slot(&id)?;
        }
        Ok(())
    }

    /// Creates the track if it does not exist yet.
    fn ensure_track(&mut self, id: &TrackId, shape: Shape) -> EngineResult<()> {
        if let Some(track) = self.project.get_track(id) {
            if shape.matches(&track.kind) {
                return Ok(());
            }
            return Err(EngineError::InvalidArgument(format!(
                "track {} is a {} track",
                id,
                track.kind.tag()
            )));
        }
        let mut track = match shape {
            Shape::Midi => Track::new_midi(id.as_str()),
            Shape::Beat => Track::new_beat(id.as_str(), DEFAULT_STEP_COUNT)?,
            Shape::Sampler => Track::new_sampler(id.as_str(), None, DEFAULT_SAMPLER_BASE),
        };
        track.id = id.clone();
        let tag = track.kind.tag();
        self.project.add_track(track)?;
        if let Err(e) = self.allocate_slot(id) {
            self.project.remove_track(id);
            return Err(e);
        }
        tracing::info!("Created {} track {}", tag, id);
        self.publish()
    }

    /// Empties a track's slot after its instrument failed to load.
    fn clear_instrument(&mut self, id: &TrackId) -> EngineResult<()> {
        self.instruments.remove(id);
        let track = self.track_mut(id)?;
        if matches!(track.kind, TrackKind::Midi(_)) {
            track.bind_instrument(InstrumentBinding::None)?;
        }
        let slot = self.slot_of(id)?;
        self.send(Command::UnloadSource { slot })?;
        self.publish()
    }

    fn beat_rows(&self, id: &TrackId) -> Vec<Option<Arc<AudioBuffer>>> {
        let loaded = match self.instruments.get(id) {
            Some(Instrument::Beat(rows)) => Some(rows),
            _ => None,
        };
        match self.project.get_track(id).map(|t| &t.kind) {
            Some(TrackKind::Beat(beat)) => beat
                .pattern
                .rows
                .iter()
                .map(|row| loaded.and_then(|rows| rows.get(&row.row_id)).cloned())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn reinstall_beat(&mut self, id: &TrackId) -> EngineResult<()> {
        let slot = self.slot_of(id)?;
        let rows = self.beat_rows(id);
        self.install(slot, Box::new(SamplerSource::rows(rows)))
    }

    // -----------------------------------------------------------------------
    // Instruments
    // -----------------------------------------------------------------------

    fn load_plugin(&mut self, id: TrackId, path: String) -> EngineResult<()> {
        self.ensure_track(&id, Shape::Midi)?;
        self.restating.remove(&id);
        self.submit(LoadJob::Plugin {
            track: id,
            path,
            state: Vec::new(),
        })
    }

    fn load_soundfont(
        &mut self,
        id: TrackId,
        path: PathBuf,
        bank: u16,
        preset: u16,
    ) -> EngineResult<()> {
        self.ensure_track(&id, Shape::Midi)?;
        self.submit(LoadJob::Soundfont {
            track: id,
            path,
            bank,
            preset,
        })
    }

    fn set_soundfont_preset(
        &mut self,
        id: &TrackId,
        bank: u16,
        preset: u16,
        out: &mut Vec<String>,
    ) -> EngineResult<()> {
        let Some(Instrument::Soundfont { bank: sf, path }) = self.instruments.get(id) else {
            return Err(EngineError::InvalidArgument("no soundfont loaded".into()));
        };
        let (sf, path) = (Arc::clone(sf), path.clone());
        self.select_preset(id, sf, path, bank, preset, out)
    }

    fn select_preset(
        &mut self,
        id: &TrackId,
        sf: Arc<SoundfontBank>,
        path: PathBuf,
        bank: u16,
        preset: u16,
        out: &mut Vec<String>,
    ) -> EngineResult<()> {
        let (source, fallback) = SoundfontSource::new(Arc::clone(&sf), bank, preset);
        let (used_bank, used_preset) = if fallback {
            sf.presets()
                .first()
                .map(|p| (p.bank, p.program))
                .unwrap_or((0, 0))
        } else {
            (bank, preset)
        };
        let preset_name = source.preset_name().to_string();

        self.track_mut(id)?.bind_instrument(InstrumentBinding::Soundfont {
            path: path.clone(),
            bank: used_bank,
            preset: used_preset,
        })?;
        let slot = self.slot_of(id)?;
        self.install(slot, Box::new(source))?;
        self.instruments
            .insert(id.clone(), Instrument::Soundfont { bank: sf, path });
        self.publish()?;

        if fallback {
            tracing::warn!(
                "Preset {}:{} missing on track {}, using {}",
                bank,
                preset,
                id,
                preset_name
            );
            out.push(event_line(
                "SF2_PRESET_FALLBACK",
                &[
                    id,
                    &format!("requested_bank={}", bank),
                    &format!("requested_preset={}", preset),
                    &"using_preset=0",
                    &preset_name,
                ],
            ));
        } else {
            out.push(event_line(
                "SF2_PRESET",
                &[id, &used_bank, &used_preset, &preset_name],
            ));
        }
        Ok(())
    }

    fn soundfont_loaded(
        &mut self,
        id: &TrackId,
        path: PathBuf,
        bank: u16,
        preset: u16,
        result: EngineResult<Arc<SoundfontBank>>,
        out: &mut Vec<String>,
    ) -> EngineResult<()> {
        let sf = match result {
            Ok(sf) => sf,
            Err(e) => {
                if let Err(clear) = self.clear_instrument(id) {
                    tracing::warn!("Could not clear track {}: {}", id, clear);
                }
                return Err(e);
            }
        };
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        out.push(event_line("LOADED_SF2", &[id, &name]));
        self.select_preset(id, sf, path, bank, preset, out)
    }

    fn plugin_loaded(
        &mut self,
        id: &TrackId,
        path: String,
        restate: bool,
        result: EngineResult<Box<dyn Processor>>,
        out: &mut Vec<String>,
    ) -> EngineResult<()> {
        let processor = match result {
            Ok(processor) => processor,
            Err(e) => {
                // A rejected state keeps the running instance.
                if !restate {
                    if let Err(clear) = self.clear_instrument(id) {
                        tracing::warn!("Could not clear track {}: {}", id, clear);
                    }
                }
                return Err(e);
            }
        };
        let name = processor.name().to_string();
        let preset = processor.get_state();

        self.track_mut(id)?.bind_instrument(InstrumentBinding::Plugin {
            path: path.clone(),
            preset,
        })?;
        let slot = self.slot_of(id)?;
        self.install(slot, Box::new(PluginSource::new(processor)))?;
        self.instruments
            .insert(id.clone(), Instrument::Plugin { name: name.clone() });
        self.publish()?;

        if restate {
            out.push(event_line("STATE_SET", &[id]));
        } else {
            out.push(event_line("LOADED", &[id, &path]));
            out.push(event_line("READY", &[id, &name]));
        }
        Ok(())
    }

    fn audio_loaded(
        &mut self,
        id: &TrackId,
        path: PathBuf,
        purpose: AudioPurpose,
        result: EngineResult<Arc<AudioBuffer>>,
        out: &mut Vec<String>,
    ) -> EngineResult<()> {
        let buffer = result?;
        let slot = self.slot_of(id)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match purpose {
            AudioPurpose::BeatRow(row) => {
                if let TrackKind::Beat(beat) = &mut self.track_mut(id)?.kind {
                    match beat.pattern.row_index(&row) {
                        Some(i) => beat.pattern.rows[i].sample_path = Some(path.clone()),
                        None => {
                            beat.pattern.add_row(row.clone(), Some(path.clone()));
                        }
                    }
                }
                let mut rows = match self.instruments.remove(id) {
                    Some(Instrument::Beat(rows)) => rows,
                    _ => HashMap::new(),
                };
                rows.insert(row.clone(), buffer);
                self.instruments.insert(id.clone(), Instrument::Beat(rows));
                self.reinstall_beat(id)?;
                self.publish()?;
                out.push(event_line("BEAT_LOADED", &[id, &row, &file_name]));
            }
            AudioPurpose::Sampler { base_midi_note } => {
                if let TrackKind::Sampler(sampler) = &mut self.track_mut(id)?.kind {
                    sampler.sample_path = Some(path.clone());
                    sampler.base_midi_note = base_midi_note;
                }
                let source = SamplerSource::pitched(Some(Arc::clone(&buffer)), base_midi_note);
                self.install(slot, Box::new(source))?;
                self.instruments.insert(id.clone(), Instrument::Sampler(buffer));
                self.publish()?;
                out.push(event_line("SAMPLER_LOADED", &[id, &file_name]));
            }
            AudioPurpose::Clip => {
                if let TrackKind::Audio(audio) = &mut self.track_mut(id)?.kind {
                    audio.clip = Some(Arc::clone(&buffer));
                }
                self.install(slot, Box::new(AudioClipSource::new(Arc::clone(&buffer))))?;
                self.instruments.insert(id.clone(), Instrument::Clip(buffer));
                self.publish()?;
                out.push(event_line("LOADED", &[id, &path.display()]));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Live input and mixer
    // -----------------------------------------------------------------------

    fn play_note(
        &mut self,
        id: &TrackId,
        midi: u8,
        velocity: f32,
        duration_ms: u32,
        out: &mut Vec<String>,
    ) -> EngineResult<()> {
        let playable = self.instruments.get(id).is_some_and(Instrument::plays_notes);
        let Some(&slot) = self.slots.get(id).filter(|_| playable) else {
            out.push(error_line("NOTE", &[id, &"no-plugin-loaded"]));
            return Ok(());
        };
        let duration_samples = duration_ms as u64 * self.config.sample_rate as u64 / 1000;
        self.send(Command::LiveNote {
            slot,
            midi,
            velocity,
            duration_samples,
        })?;
        out.push(event_line("NOTE", &[id, &midi]));
        Ok(())
    }

    fn set_volume(&mut self, id: &TrackId, percent: f32, out: &mut Vec<String>) -> EngineResult<()> {
        let track = self.track_mut(id)?;
        track.set_volume(percent);
        let percent = track.volume();
        let slot = self.slot_of(id)?;
        self.send(Command::SetVolume { slot, percent })?;
        out.push(event_line("VOLUME", &[id, &percent]));
        Ok(())
    }

    fn set_mute(&mut self, id: &TrackId, muted: bool, out: &mut Vec<String>) -> EngineResult<()> {
        self.track_mut(id)?.muted = muted;
        let slot = self.slot_of(id)?;
        self.send(Command::SetMute { slot, muted })?;
        out.push(event_line("MUTE", &[id, &(muted as u8)]));
        Ok(())
    }

    fn set_solo(&mut self, id: &TrackId, soloed: bool, out: &mut Vec<String>) -> EngineResult<()> {
        self.track_mut(id)?.soloed = soloed;
        let slot = self.slot_of(id)?;
        self.send(Command::SetSolo { slot, soloed })?;
        out.push(event_line("SOLO", &[id, &(soloed as u8)]));
        Ok(())
    }

    fn set_bpm(&mut self, bpm: f64, out: &mut Vec<String>) -> EngineResult<()> {
        if !bpm.is_finite() {
            return Err(EngineError::InvalidArgument(format!("bpm {}", bpm)));
        }
        self.project.set_bpm(bpm.round().max(0.0) as u32)?;
        let bpm = self.project.bpm();
        self.send(Command::SetBpm(bpm as f64))?;
        self.publish()?;
        out.push(event_line("BPM", &[&bpm]));
        Ok(())
    }

    fn panic(&mut self, id: Option<TrackId>, out: &mut Vec<String>) -> EngineResult<()> {
        match id {
            None => {
                self.send(Command::Panic(None))?;
                out.push(event_line("PANIC", &[&"ALL"]));
            }
            Some(id) => {
                let slot = self.slot_of(&id)?;
                self.send(Command::Panic(Some(slot)))?;
                out.push(event_line("PANIC", &[&id]));
            }
        }
        Ok(())
    }

    fn load_beat_sample(&mut self, id: TrackId, row: String, path: PathBuf) -> EngineResult<()> {
        self.ensure_track(&id, Shape::Beat)?;
        let added = match &mut self.track_mut(&id)?.kind {
            TrackKind::Beat(beat) if beat.pattern.row_index(&row).is_none() => {
                beat.pattern.add_row(row.clone(), None);
                true
            }
            _ => false,
        };
        if added {
            self.publish()?;
        }
        self.submit(LoadJob::Audio {
            track: id,
            path,
            purpose: AudioPurpose::BeatRow(row),
        })
    }

    fn trigger_beat(
        &mut self,
        id: &TrackId,
        row: &str,
        gain: f32,
        out: &mut Vec<String>,
    ) -> EngineResult<()> {
        let slot = self.slot_of(id)?;
        let index = match self.project.get_track(id).map(|t| &t.kind) {
            Some(TrackKind::Beat(beat)) => beat.pattern.row_index(row),
            _ => return Err(EngineError::InvalidArgument(format!("track {} is not a beat track", id))),
        };
        let loaded = matches!(self.instruments.get(id), Some(Instrument::Beat(rows)) if rows.contains_key(row));
        let Some(index) = index.filter(|_| loaded) else {
            return Err(EngineError::InvalidArgument(format!("row {} has no sample", row)));
        };
        self.send(Command::LiveTrigger {
            slot,
            row: index as u16,
            gain,
        })?;
        out.push(event_line("BEAT_TRIGGERED", &[id, &row]));
        Ok(())
    }

    fn clear_beat(&mut self, id: &TrackId, row: Option<String>, out: &mut Vec<String>) -> EngineResult<()> {
        {
            let TrackKind::Beat(beat) = &mut self.track_mut(id)?.kind else {
                return Err(EngineError::InvalidArgument(format!("track {} is not a beat track", id)));
            };
            match &row {
                Some(row_id) => {
                    let i = beat
                        .pattern
                        .row_index(row_id)
                        .ok_or_else(|| EngineError::NotFound(format!("row {}", row_id)))?;
                    beat.pattern.rows[i].sample_path = None;
                }
                None => beat.pattern.rows.iter_mut().for_each(|r| r.sample_path = None),
            }
        }
        if let Some(Instrument::Beat(rows)) = self.instruments.get_mut(id) {
            match &row {
                Some(row_id) => {
                    rows.remove(row_id);
                }
                None => rows.clear(),
            }
        }
        self.reinstall_beat(id)?;
        self.publish()?;
        match row {
            Some(row_id) => out.push(event_line("BEAT_CLEARED", &[id, &row_id])),
            None => out.push(event_line("BEAT_CLEARED", &[id])),
        }
        Ok(())
    }

    fn load_sampler_sample(&mut self, id: TrackId, path: PathBuf, base_midi_note: u8) -> EngineResult<()> {
        self.ensure_track(&id, Shape::Sampler)?;
        self.submit(LoadJob::Audio {
            track: id,
            path,
            purpose: AudioPurpose::Sampler { base_midi_note },
        })
    }

    fn trigger_sampler(
        &mut self,
        id: &TrackId,
        midi: u8,
        velocity: f32,
        out: &mut Vec<String>,
    ) -> EngineResult<()> {
        let slot = self.slot_of(id)?;
        let Some(Instrument::Sampler(buffer)) = self.instruments.get(id) else {
            return Err(EngineError::InvalidArgument("no sample loaded".into()));
        };
        let base = match self.project.get_track(id).map(|t| &t.kind) {
            Some(TrackKind::Sampler(sampler)) => sampler.base_midi_note,
            _ => DEFAULT_SAMPLER_BASE,
        };
        // The note lasts as long as the sample plays at its pitch.
        let ratio = 2f64.powf((midi as f64 - base as f64) / 12.0);
        let duration_samples = (buffer.frames() as f64 / ratio).ceil() as u64 + 1;
        self.send(Command::LiveNote {
            slot,
            midi,
            velocity,
            duration_samples,
        })?;
        out.push(event_line("SAMPLER_NOTE", &[id, &midi]));
        Ok(())
    }

    fn stop_sampler_note(&mut self, id: &TrackId, midi: u8, out: &mut Vec<String>) -> EngineResult<()> {
        let slot = self.slot_of(id)?;
        self.send(Command::LiveNoteOff { slot, midi })?;
        out.push(event_line("SAMPLER_NOTE_OFF", &[id, &midi]));
        Ok(())
    }

    fn clear_sampler(&mut self, id: &TrackId, out: &mut Vec<String>) -> EngineResult<()> {
        let slot = self.slot_of(id)?;
        let base = match &mut self.track_mut(id)?.kind {
            TrackKind::Sampler(sampler) => {
                sampler.sample_path = None;
                sampler.base_midi_note
            }
            _ => {
                return Err(EngineError::InvalidArgument(format!(
                    "track {} is not a sampler track",
                    id
                )))
            }
        };
        self.instruments.remove(id);
        self.install(slot, Box::new(SamplerSource::pitched(None, base)))?;
        self.publish()?;
        out.push(event_line("SAMPLER_CLEARED", &[id]));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // State, projects and rendering
    // -----------------------------------------------------------------------

    fn get_state(&mut self, id: &TrackId, out: &mut Vec<String>) -> EngineResult<()> {
        match self.project.get_track(id).and_then(Track::instrument) {
            Some(InstrumentBinding::Plugin { preset, .. }) => {
                out.push(event_line("STATE", &[id, &BASE64.encode(preset)]));
            }
            _ => out.push(error_line("STATE", &[id, &"no-plugin-loaded"])),
        }
        Ok(())
    }

    fn set_state(&mut self, id: TrackId, blob: &str, out: &mut Vec<String>) -> EngineResult<()> {
        let path = match self.project.get_track(&id).and_then(Track::instrument) {
            Some(InstrumentBinding::Plugin { path, .. }) => path.clone(),
            _ => {
                out.push(error_line("STATE", &[&id, &"no-plugin-loaded"]));
                return Ok(());
            }
        };
        let state = BASE64
            .decode(blob.trim())
            .map_err(|e| EngineError::Decode(format!("state blob: {}", e)))?;
        // The processor is rebuilt off the control thread with the new state
        // applied, then swapped in like any other load.
        self.restating.insert(id.clone());
        self.submit(LoadJob::Plugin {
            track: id,
            path,
            state,
        })
    }

    fn open_project(&mut self, path: &Path, out: &mut Vec<String>) -> EngineResult<()> {
        if self.transport == TransportState::Playing {
            return Err(EngineError::Busy("stop playback before loading a project".into()));
        }
        let project = load_project(path)?;
        self.send(Command::TransportStop)?;
        self.transport = TransportState::Stopped;

        let old: Vec<usize> = self.slots.drain().map(|(_, slot)| slot).collect();
        for slot in old {
            self.send(Command::UnloadSource { slot })?;
        }
        self.instruments.clear();
        self.restating.clear();
        self.project = project;
        self.sync_slots()?;
        self.send(Command::SetBpm(self.project.bpm() as f64))?;
        self.publish()?;

        let jobs = resource_jobs(&self.project);
        tracing::info!(
            "Opened {} ({} tracks, {} resources to load)",
            path.display(),
            self.project.track_count(),
            jobs.len()
        );
        for job in jobs {
            self.submit(job)?;
        }
        out.push(event_line(
            "PROJECT_LOADED",
            &[&path.display(), &self.project.track_count()],
        ));
        Ok(())
    }

    /// Builds a render job with fresh sources at `sample_rate`.
    ///
    /// Sources are created in parallel; a track whose resources cannot be
    /// loaded renders silent and is logged.
    fn render_job(&self, sample_rate: u32) -> EngineResult<RenderJob> {
        let snapshot =
            ProjectSnapshot::build(&self.project, &self.slots, sample_rate, self.generation)?;
        let cache = self.loader.cache().as_ref();
        let max_block = self.config.max_block_size;
        let tracks: Vec<(usize, &Track)> = self
            .project
            .tracks()
            .iter()
            .filter_map(|t| self.slots.get(&t.id).map(|&slot| (slot, t)))
            .collect();

        let sources = tracks
            .par_iter()
            .filter_map(|&(slot, track)| {
                match render_source(track, cache, sample_rate, max_block) {
                    Ok(Some(source)) => Some((slot, source)),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!("Track {} renders silent: {}", track.id, e);
                        None
                    }
                }
            })
            .collect();
        Ok(RenderJob { snapshot, sources })
    }

    fn render_wav(
        &mut self,
        path: &Path,
        sample_rate: Option<u32>,
        bit_depth: Option<u16>,
        out: &mut Vec<String>,
    ) -> EngineResult<()> {
        if self.transport == TransportState::Playing {
            return Err(EngineError::Busy("stop playback before rendering".into()));
        }
        if self.render_thread.is_some() {
            return Err(EngineError::Busy("a render is already running".into()));
        }
        let mut options = RenderOptions::from_config(&self.config);
        if let Some(rate) = sample_rate {
            if !(8_000..=192_000).contains(&rate) {
                return Err(EngineError::InvalidArgument(format!(
                    "sample rate {} outside 8000-192000",
                    rate
                )));
            }
            options.sample_rate = rate;
        }
        if let Some(bits) = bit_depth {
            if bits != BITS_PER_SAMPLE {
                return Err(EngineError::Unsupported(format!(
                    "{}-bit output (only 24-bit is written)",
                    bits
                )));
            }
        }

        let job = self.render_job(options.sample_rate)?;
        let total = job.total_frames(&options);
        if total == 0 {
            return Err(EngineError::InvalidArgument("nothing to render".into()));
        }

        self.cancel.store(false, Ordering::Relaxed);
        let cancel = Arc::clone(&self.cancel);
        let updates = self.render_tx.clone();
        let target = path.to_path_buf();
        let thread = std::thread::Builder::new()
            .name("beatline-render".into())
            .spawn(move || {
                let progress_tx = updates.clone();
                let mut reported = 0;
                let progress = move |fraction: f32| {
                    let tenth = (fraction * 10.0).floor() as u32;
                    if tenth > reported {
                        reported = tenth;
                        progress_tx.send(RenderUpdate::Progress(tenth * 10)).ok();
                    }
                };
                let update = match export_wav(job, &target, &options, &cancel, Some(progress)) {
                    Ok(frames) => RenderUpdate::Finished {
                        path: target,
                        frames,
                    },
                    Err(e) => RenderUpdate::Failed {
                        path: target,
                        error: render_failure(e),
                    },
                };
                if updates.send(update).is_err() {
                    tracing::debug!("Render finished after its handle was dropped");
                }
            })
            .map_err(|e| EngineError::Fatal(format!("render thread: {}", e)))?;
        self.render_thread = Some(thread);

        tracing::info!("Rendering {} frames to {}", total, path.display());
        out.push(event_line("RENDER_STARTED", &[&path.display(), &total]));
        Ok(())
    }

    fn cancel_render(&mut self) -> EngineResult<()> {
        if self.render_thread.is_none() {
            return Err(EngineError::InvalidArgument("no render running".into()));
        }
        tracing::info!("Cancelling render");
        self.cancel.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn join_render(&mut self) {
        if let Some(thread) = self.render_thread.take() {
            if thread.join().is_err() {
                tracing::error!("Render thread panicked");
            }
        }
    }

    /// Reports a render thread that stopped without sending a result.
    fn reap_render(&mut self, out: &mut Vec<String>) {
        if !self
            .render_thread
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
        {
            return;
        }
        while let Ok(update) = self.render_rx.try_recv() {
            self.handle_render_update(update, out);
        }
        if self.render_thread.is_some() {
            self.join_render();
            let error = EngineError::Fatal("render thread stopped".into());
            out.push(error_line("RENDER", &[&error]));
        }
    }

    fn drain_engine_events(&mut self, out: &mut Vec<String>) {
        while let Some(event) = self.control.poll_event() {
            match event {
                EngineEvent::Ready { sample_rate } => {
                    tracing::info!("Audio engine running at {} Hz", sample_rate);
                }
                EngineEvent::SourceInstalled { slot } => {
                    tracing::debug!("Slot {} source installed", slot);
                }
                EngineEvent::SourceUnloaded { slot } => {
                    tracing::debug!("Slot {} source unloaded", slot);
                }
                EngineEvent::SnapshotApplied { generation } => {
                    tracing::debug!("Snapshot {} applied", generation);
                }
                EngineEvent::State { state, beat } => {
                    self.transport = state;
                    out.push(event_line(
                        "TRANSPORT",
                        &[&state.as_str().to_ascii_uppercase(), &format!("{:.3}", beat)],
                    ));
                }
                EngineEvent::VoiceOverflow { slot, stolen } => {
                    let track = self.track_in_slot(slot);
                    tracing::warn!("Track {} stole {} voices", track, stolen);
                    out.push(event_line("VOICE_OVERFLOW", &[&track, &stolen]));
                }
                EngineEvent::EventOverflow { dropped } => {
                    tracing::warn!("Scheduler dropped {} events in one block", dropped);
                }
                EngineEvent::CaptureOverflow { frames } => {
                    tracing::warn!("Capture tap dropped {} frames", frames);
                }
                EngineEvent::Error { kind, slot } => {
                    let track = slot.map(|s| self.track_in_slot(s)).unwrap_or_else(|| "-".into());
                    tracing::error!("Engine error {} on track {}", kind, track);
                    out.push(error_line("ENGINE", &[&kind, &track]));
                }
                EngineEvent::Dropped { count } => {
                    tracing::warn!("Engine event ring dropped {} events", count);
                }
            }
        }
    }
}

/// Classifies a failed export: output I/O problems are `Io`, engine errors
/// keep their class.
fn render_failure(error: anyhow::Error) -> EngineError {
    if error
        .chain()
        .any(|cause| cause.downcast_ref::<std::io::Error>().is_some())
    {
        return EngineError::Io(format!("{:#}", error));
    }
    error
        .downcast::<EngineError>()
        .unwrap_or_else(|other| EngineError::Fatal(format!("{:#}", other)))
}

/// Load jobs that bring a freshly opened project's resources in.
fn resource_jobs(project: &Project) -> Vec<LoadJob> {
    let mut jobs = Vec::new();
    for track in project.tracks() {
        let id = track.id.clone();
        match &track.kind {
            TrackKind::Midi(midi) => match &midi.instrument {
                InstrumentBinding::None => {}
                InstrumentBinding::Soundfont { path, bank, preset } => {
                    jobs.push(LoadJob::Soundfont {
                        track: id,
                        path: path.clone(),
                        bank: *bank,
                        preset: *preset,
                    })
                }
                InstrumentBinding::Plugin { path, preset } => jobs.push(LoadJob::Plugin {
                    track: id,
                    path: path.clone(),
                    state: preset.clone(),
                }),
            },
            TrackKind::Beat(beat) => {
                for row in &beat.pattern.rows {
                    if let Some(path) = &row.sample_path {
                        jobs.push(LoadJob::Audio {
                            track: id.clone(),
                            path: path.clone(),
                            purpose: AudioPurpose::BeatRow(row.row_id.clone()),
                        });
                    }
                }
            }
            TrackKind::Audio(audio) => jobs.push(LoadJob::Audio {
                track: id,
                path: audio.clip_path.clone(),
                purpose: AudioPurpose::Clip,
            }),
            TrackKind::Sampler(sampler) => {
                if let Some(path) = &sampler.sample_path {
                    jobs.push(LoadJob::Audio {
                        track: id,
                        path: path.clone(),
                        purpose: AudioPurpose::Sampler {
                            base_midi_note: sampler.base_midi_note,
                        },
                    });
                }
            }
        }
    }
    jobs
}

/// Builds an offline source for one track from its project bindings.
fn render_source(
    track: &Track,
    cache: &ResourceCache,
    sample_rate: u32,
    max_block: usize,
) -> EngineResult<Option<Box<dyn VoiceSource>>> {
    let source: Box<dyn VoiceSource> = match &track.kind {
        TrackKind::Midi(midi) => match &midi.instrument {
            InstrumentBinding::None => return Ok(None),
            InstrumentBinding::Soundfont { path, bank, preset } => {
                let (source, _) = SoundfontSource::new(cache.soundfont(path)?, *bank, *preset);
                Box::new(source)
            }
            InstrumentBinding::Plugin { path, preset } => Box::new(PluginSource::new(
                load_processor(path, preset, sample_rate, max_block)?,
            )),
        },
        TrackKind::Beat(beat) => {
            let rows = beat
                .pattern
                .rows
                .iter()
                .map(|row| {
                    let path = row.sample_path.as_deref()?;
                    cache
                        .audio(path, sample_rate)
                        .map_err(|e| tracing::warn!("Beat row {} silent: {}", row.row_id, e))
                        .ok()
                })
                .collect();
            Box::new(SamplerSource::rows(rows))
        }
        TrackKind::Audio(audio) => {
            let clip = match &audio.clip {
                Some(clip) if clip.sample_rate() == sample_rate => Arc::clone(clip),
                _ => cache.audio(&audio.clip_path, sample_rate)?,
            };
            Box::new(AudioClipSource::new(clip))
        }
        TrackKind::Sampler(sampler) => {
            let Some(path) = &sampler.sample_path else {
                return Ok(None);
            };
            Box::new(SamplerSource::pitched(
                Some(cache.audio(path, sample_rate)?),
                sampler.base_midi_note,
            ))
        }
    };
    Ok(Some(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::BUILTIN_SIMPLE_SYNTH;
    use crate::project::Note;
    use crate::render::decode_wav;
    use std::fs::File;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    fn setup() -> (EngineHandle, Engine) {
        setup_with(EngineConfig::default())
    }

    fn setup_with(config: EngineConfig) -> (EngineHandle, Engine) {
        let config = EngineConfig {
            loader_threads: 1,
            ..config
        };
        EngineHandle::new(config).unwrap()
    }

    /// A synth track holding one bar-long note.
    fn one_note_project(handle: &mut EngineHandle) {
        load_synth(handle, "t1");
        handle
            .edit_project(|project| {
                let track = project
                    .get_track_mut(&TrackId::from("t1"))
                    .ok_or(EngineError::NotFound("t1".into()))?;
                track.add_note(Note::new(60, 0.0, 1.0, 0.8))?;
                Ok(())
            })
            .unwrap();
    }

    fn send(handle: &mut EngineHandle, line: &str) -> Vec<String> {
        let mut out = Vec::new();
        handle.handle_line(line, &mut out);
        out
    }

    fn settle(handle: &mut EngineHandle) -> Vec<String> {
        let mut out = Vec::new();
        assert!(handle.settle(WAIT, &mut out));
        out
    }

    /// Runs `blocks` engine blocks and returns the left-channel peak.
    fn pump(engine: &mut Engine, blocks: usize) -> f32 {
        let mut left = vec![0.0; 512];
        let mut right = vec![0.0; 512];
        let mut peak = 0.0f32;
        for _ in 0..blocks {
            engine.process_block(&mut left, &mut right);
            peak = left.iter().fold(peak, |p, s| p.max(s.abs()));
        }
        peak
    }

    fn write_test_wav(dir: &TempDir, name: &str, frames: usize) -> PathBuf {
        let path = dir.path().join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(8_000i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn load_synth(handle: &mut EngineHandle, track: &str) -> Vec<String> {
        let mut out = send(handle, &format!("LOAD {} {}", track, BUILTIN_SIMPLE_SYNTH));
        out.extend(settle(handle));
        out
    }

    #[test]
    fn test_basic_replies() {
        let (mut handle, _engine) = setup();
        assert_eq!(send(&mut handle, "PING"), vec!["EVENT PONG"]);
        assert_eq!(send(&mut handle, "STATUS"), vec!["EVENT STATUS rate=44100 block=512"]);
        assert_eq!(send(&mut handle, "FROB 1"), vec!["ERROR UNKNOWN FROB"]);
        assert_eq!(send(&mut handle, "PANIC"), vec!["EVENT PANIC ALL"]);
        assert!(send(&mut handle, "").is_empty());

        let mut out = Vec::new();
        assert_eq!(handle.handle_line("QUIT", &mut out), Flow::Quit);
        assert_eq!(out, vec!["EVENT EXIT"]);
    }

    #[test]
    fn test_load_plugin_then_play_note() {
        let (mut handle, mut engine) = setup();
        let out = load_synth(&mut handle, "t1");
        assert!(out.contains(&"EVENT LOADED t1 builtin:simple-synth".to_string()));
        assert!(out.contains(&"EVENT READY t1 Simple Synth".to_string()));
        assert_eq!(handle.project().track_count(), 1);

        assert_eq!(send(&mut handle, "NOTE t1 60 100 500"), vec!["EVENT NOTE t1 60"]);
        assert!(pump(&mut engine, 8) > 0.001);
    }

    #[test]
    fn test_note_without_instrument() {
        let (mut handle, _engine) = setup();
        assert_eq!(
            send(&mut handle, "NOTE t9 60"),
            vec!["ERROR NOTE t9 no-plugin-loaded"]
        );
    }

    #[test]
    fn test_missing_plugin_reports_and_clears() {
        let (mut handle, _engine) = setup();
        let out = load_synth(&mut handle, "t1");
        assert!(out.iter().any(|l| l.starts_with("EVENT READY t1")));

        send(&mut handle, "LOAD t1 /no/such/plugin.so");
        let out = settle(&mut handle);
        assert!(out.iter().any(|l| l.starts_with("ERROR LOAD t1 not found")));
        let track = handle.project().get_track(&TrackId::from("t1")).unwrap();
        assert_eq!(track.instrument(), Some(&InstrumentBinding::None));
        assert_eq!(
            send(&mut handle, "NOTE t1 60"),
            vec!["ERROR NOTE t1 no-plugin-loaded"]
        );
    }

    #[test]
    fn test_state_round_trip() {
        let (mut handle, _engine) = setup();
        load_synth(&mut handle, "t1");

        let blob = BASE64.encode([1u8, 2, 3, 4]);
        assert!(send(&mut handle, &format!("SET_STATE t1 {}", blob)).is_empty());
        let out = settle(&mut handle);
        assert!(out.contains(&"EVENT STATE_SET t1".to_string()));
        assert_eq!(
            send(&mut handle, "GET_STATE t1"),
            vec![format!("EVENT STATE t1 {}", blob)]
        );

        let out = send(&mut handle, "SET_STATE t1 ***");
        assert!(out[0].starts_with("ERROR STATE t1 decode error"));
        assert_eq!(
            send(&mut handle, "GET_STATE t2"),
            vec!["ERROR STATE t2 no-plugin-loaded"]
        );
    }

    #[test]
    fn test_beat_row_load_and_trigger() {
        let dir = TempDir::new().unwrap();
        let kick = write_test_wav(&dir, "kick.wav", 4_410);
        let (mut handle, mut engine) = setup();

        send(&mut handle, &format!("LOAD_BEAT_SAMPLE d1 kick {}", kick.display()));
        let out = settle(&mut handle);
        assert!(out.contains(&"EVENT BEAT_LOADED d1 kick kick.wav".to_string()));

        assert_eq!(
            send(&mut handle, "TRIGGER_BEAT d1 kick"),
            vec!["EVENT BEAT_TRIGGERED d1 kick"]
        );
        let peak = pump(&mut engine, 2);
        // 8000/32768 with the +5 dB pre-gain, below the limiter knee.
        assert!(peak > 0.3 && peak < 0.6, "peak {}", peak);

        let out = send(&mut handle, "TRIGGER_BEAT d1 snare");
        assert!(out[0].starts_with("ERROR BEAT d1 invalid argument"));

        assert_eq!(send(&mut handle, "CLEAR_BEAT d1"), vec!["EVENT BEAT_CLEARED d1"]);
        assert!(send(&mut handle, "TRIGGER_BEAT d1 kick")[0].starts_with("ERROR BEAT"));
    }

    #[test]
    fn test_sampler_note_and_clear() {
        let dir = TempDir::new().unwrap();
        let sample = write_test_wav(&dir, "pad.wav", 44_100);
        let (mut handle, mut engine) = setup();

        send(&mut handle, &format!("LOAD_SAMPLER_SAMPLE s1 {} 60", sample.display()));
        let out = settle(&mut handle);
        assert!(out.contains(&"EVENT SAMPLER_LOADED s1 pad.wav".to_string()));

        assert_eq!(
            send(&mut handle, "TRIGGER_SAMPLER s1 72 127"),
            vec!["EVENT SAMPLER_NOTE s1 72"]
        );
        assert!(pump(&mut engine, 2) > 0.1);
        assert_eq!(
            send(&mut handle, "STOP_SAMPLER_NOTE s1 72"),
            vec!["EVENT SAMPLER_NOTE_OFF s1 72"]
        );
        assert_eq!(send(&mut handle, "CLEAR_SAMPLER s1"), vec!["EVENT SAMPLER_CLEARED s1"]);
        assert!(send(&mut handle, "TRIGGER_SAMPLER s1 60")[0].starts_with("ERROR SAMPLER s1"));
    }

    #[test]
    fn test_mixer_commands() {
        let (mut handle, _engine) = setup();
        load_synth(&mut handle, "t1");
        assert_eq!(send(&mut handle, "SET_VOLUME t1 400"), vec!["EVENT VOLUME t1 150"]);
        assert_eq!(send(&mut handle, "SET_MUTE t1 on"), vec!["EVENT MUTE t1 1"]);
        assert_eq!(send(&mut handle, "SET_SOLO t1 0"), vec!["EVENT SOLO t1 0"]);
        let track = handle.project().get_track(&TrackId::from("t1")).unwrap();
        assert!(track.muted);
        assert_eq!(track.volume(), 150.0);

        assert!(send(&mut handle, "SET_VOLUME nope 50")[0].starts_with("ERROR VOLUME nope not found"));
    }

    #[test]
    fn test_editor_commands() {
        let (mut handle, _engine) = setup();
        assert_eq!(send(&mut handle, "OPEN_EDITOR t1"), vec!["ERROR EDITOR t1 no-editor"]);
        assert_eq!(send(&mut handle, "CLOSE_EDITOR t1"), vec!["EVENT EDITOR_CLOSED t1"]);
    }

    #[test]
    fn test_transport_events_reported() {
        let (mut handle, mut engine) = setup();
        assert!(send(&mut handle, "PLAY").is_empty());
        assert_eq!(handle.transport(), TransportState::Playing);
        pump(&mut engine, 1);
        let mut out = Vec::new();
        handle.poll(&mut out);
        assert!(out.iter().any(|l| l.starts_with("EVENT TRANSPORT PLAYING")));

        send(&mut handle, "STOP");
        pump(&mut engine, 1);
        let mut out = Vec::new();
        handle.poll(&mut out);
        assert_eq!(handle.transport(), TransportState::Stopped);
    }

    #[test]
    fn test_render_refused_while_playing() {
        let dir = TempDir::new().unwrap();
        let (mut handle, _engine) = setup();
        send(&mut handle, "PLAY");
        let path = dir.path().join("mix.wav");
        let out = send(&mut handle, &format!("RENDER_WAV {}", path.display()));
        assert!(out[0].starts_with("ERROR RENDER busy"));
        assert!(!path.exists());
    }

    #[test]
    fn test_render_wav_from_project() {
        let dir = TempDir::new().unwrap();
        let (mut handle, _engine) = setup();
        one_note_project(&mut handle);

        let path = dir.path().join("mix.wav");
        // One bar at 120 BPM plus the two second tail.
        assert_eq!(
            send(&mut handle, &format!("RENDER_WAV {}", path.display())),
            vec![format!("EVENT RENDER_STARTED {} 176400", path.display())]
        );
        assert!(handle.is_rendering());
        let out = settle(&mut handle);
        assert!(!handle.is_rendering());
        assert_eq!(out.last().unwrap(), &format!("EVENT RENDERED {}", path.display()));
        let progress: Vec<&String> = out
            .iter()
            .filter(|l| l.starts_with("EVENT RENDER_PROGRESS"))
            .collect();
        assert_eq!(progress.len(), 10);
        assert_eq!(progress[9], "EVENT RENDER_PROGRESS 100");

        let wav = decode_wav(File::open(&path).unwrap()).unwrap();
        assert_eq!(wav.sample_rate, 44_100);
        assert_eq!(wav.frames(), 176_400);
        assert!(wav.samples.iter().any(|&s| s != 0));

        let out = send(&mut handle, &format!("RENDER_WAV {} 44100 16", path.display()));
        assert!(out[0].starts_with("ERROR RENDER unsupported"));
    }

    #[test]
    fn test_cancel_render_leaves_partial_file() {
        let dir = TempDir::new().unwrap();
        let (mut handle, _engine) = setup_with(EngineConfig {
            render_tail_seconds: 3_600.0,
            ..EngineConfig::default()
        });
        one_note_project(&mut handle);
        assert!(send(&mut handle, "CANCEL_RENDER")[0]
            .starts_with("ERROR RENDER invalid argument: no render running"));

        let path = dir.path().join("long.wav");
        let out = send(&mut handle, &format!("RENDER_WAV {}", path.display()));
        assert!(out[0].starts_with("EVENT RENDER_STARTED"));
        let other = dir.path().join("other.wav");
        assert!(send(&mut handle, &format!("RENDER_WAV {}", other.display()))[0]
            .starts_with("ERROR RENDER busy"));

        assert!(send(&mut handle, "CANCEL_RENDER").is_empty());
        let out = settle(&mut handle);
        assert!(out.contains(&format!("EVENT RENDER_CANCELLED {}", path.display())));
        assert!(!out.iter().any(|l| l.starts_with("EVENT RENDERED")));
        assert!(!other.exists());

        // The partial file is closed with a valid header.
        let wav = decode_wav(File::open(&path).unwrap()).unwrap();
        assert!((wav.frames() as u64) < 88_200 + 3_600 * 44_100);
    }

    #[test]
    fn test_render_output_failure_is_io_error() {
        let dir = TempDir::new().unwrap();
        let (mut handle, _engine) = setup();
        one_note_project(&mut handle);
        let path = dir.path().join("missing").join("mix.wav");
        send(&mut handle, &format!("RENDER_WAV {}", path.display()));
        let out = settle(&mut handle);
        assert_eq!(out.len(), 1, "{:?}", out);
        assert!(out[0].starts_with("ERROR RENDER i/o error"), "{}", out[0]);
    }

    #[test]
    fn test_render_failure_classification() {
        let io = anyhow::Error::new(std::io::Error::other("disk full")).context("writing mix.wav");
        assert_eq!(render_failure(io).kind(), crate::error::ErrorKind::Io);
        let cancelled = anyhow::Error::new(EngineError::Cancelled);
        assert_eq!(render_failure(cancelled).kind(), crate::error::ErrorKind::Cancelled);
    }

    #[test]
    fn test_render_empty_project_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut handle, _engine) = setup();
        let out = send(&mut handle, &format!("RENDER_WAV {}", dir.path().join("x.wav").display()));
        assert!(out[0].starts_with("ERROR RENDER invalid argument"));
    }

    #[test]
    fn test_project_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let (mut handle, _engine) = setup();
        load_synth(&mut handle, "t1");
        send(&mut handle, "SET_BPM 96");
        let path = dir.path().join("song.json");
        assert_eq!(
            send(&mut handle, &format!("SAVE_PROJECT {}", path.display())),
            vec![format!("EVENT PROJECT_SAVED {}", path.display())]
        );

        let (mut other, _engine) = setup();
        let out = send(&mut other, &format!("LOAD_PROJECT {}", path.display()));
        assert_eq!(out, vec![format!("EVENT PROJECT_LOADED {} 1", path.display())]);
        assert_eq!(other.project().bpm(), 96);
        let out = settle(&mut other);
        assert!(out.contains(&"EVENT READY t1 Simple Synth".to_string()));
        assert_eq!(send(&mut other, "NOTE t1 64"), vec!["EVENT NOTE t1 64"]);
    }

    #[test]
    fn test_set_bpm_validated() {
        let (mut handle, _engine) = setup();
        assert_eq!(send(&mut handle, "SET_BPM 140"), vec!["EVENT BPM 140"]);
        assert!(send(&mut handle, "SET_BPM 500")[0].starts_with("ERROR TRANSPORT invalid argument"));
        assert_eq!(handle.project().bpm(), 140);
    }

    #[test]
    fn test_scan_lists_builtin() {
        let (mut handle, _engine) = setup();
        let out = send(&mut handle, "SCAN_VSTS");
        assert!(out.contains(&"EVENT PLUGIN builtin:simple-synth Simple Synth".to_string()));
        assert!(out.last().unwrap().starts_with("EVENT SCAN_DONE"));
    }

    #[test]
    fn test_soundfont_preset_needs_bank() {
        let (mut handle, _engine) = setup();
        let out = send(&mut handle, "SET_SF2_PRESET t1 0 5");
        assert_eq!(out, vec!["ERROR SF2_PRESET t1 invalid argument: no soundfont loaded"]);
    }

    #[test]
    fn test_capture_receives_master_output() {
        let (mut handle, mut engine) = setup();
        load_synth(&mut handle, "t1");
        let mut capture = handle.open_capture(1.0).unwrap();
        send(&mut handle, "NOTE t1 69 127 1000");
        pump(&mut engine, 4);
        assert_eq!(capture.slots(), 4 * 512 * 2);
        let chunk = capture.read_chunk(capture.slots()).unwrap();
        let (head, tail) = chunk.as_slices();
        assert!(head.iter().chain(tail).any(|s| s.abs() > 0.001));
        chunk.commit_all();
        handle.close_capture().unwrap();
    }

    #[test]
    fn test_edit_project_rolls_back_on_error() {
        let (mut handle, _engine) = setup();
        load_synth(&mut handle, "t1");
        let err = handle
            .edit_project(|project| {
                project.set_bpm(100)?;
                project.set_bpm(10)
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
        assert_eq!(handle.project().bpm(), 120);
    }
}
