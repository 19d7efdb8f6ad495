//! Project file persistence.
//!
//! Projects are stored as pretty-printed JSON. The layout keeps one array of
//! track headers and one map per track attribute, keyed by track ID:
//!
//! ```text
//! { "app": "beatline", "version": 2, "savedAt": "...", "bpm": 120,
//!   "tracks": [{ "id": "...", "name": "...", "type": "midi" }],
//!   "trackNotes": { "<id>": [...] }, "trackVolumes": { "<id>": 100 }, ... }
//! ```
//!
//! Loading runs a strict migration step: version 1 files (no plugin preset
//! blobs) are upgraded to version 2, any other version is rejected. Missing
//! per-track entries take the defaults of a freshly created track.

use super::arrangement::{LoopRegion, Project, DEFAULT_BPM, MAX_BPM, MIN_BPM};
use super::automation::{Automation, AutomationCurve, AutomationPoint};
use super::note::Note;
use super::track::{
    round_up_to_bar, AudioTrack, BeatPattern, BeatTrack, InstrumentBinding, MidiTrack,
    SamplerTrack, Track, TrackId, TrackKind,
};
use crate::error::{EngineError, EngineResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Application tag written into every file.
pub const APP_NAME: &str = "beatline";

/// Version written by [`save_project`].
pub const CURRENT_VERSION: u32 = 2;

/// Sampler base note when a file does not name one (C4).
const DEFAULT_BASE_NOTE: u8 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackRecord {
    id: TrackId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    color: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clip_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SoundfontRecord {
    path: PathBuf,
    #[serde(default)]
    bank: u16,
    #[serde(default)]
    preset: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SamplerRecord {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default = "default_base_note")]
    base_midi_note: u8,
}

/// Either a bare point list (read as a volume lane) or named lanes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AutomationRecord {
    Points(Vec<AutomationPoint>),
    Lanes(Automation),
}

fn default_app() -> String {
    APP_NAME.to_string()
}

fn default_version() -> u32 {
    1
}

fn default_bpm() -> u32 {
    DEFAULT_BPM
}

fn default_grid_width() -> u32 {
    32
}

fn default_zoom() -> f64 {
    1.0
}

fn default_base_note() -> u8 {
    DEFAULT_BASE_NOTE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectFile {
    #[serde(default = "default_app")]
    app: String,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    saved_at: Option<String>,
    #[serde(default = "default_bpm")]
    bpm: u32,
    #[serde(default = "default_grid_width")]
    grid_width: u32,
    #[serde(default = "default_zoom")]
    zoom: f64,
    #[serde(default)]
    loop_start: Option<f64>,
    #[serde(default)]
    loop_end: Option<f64>,
    #[serde(default)]
    tracks: Vec<TrackRecord>,
    #[serde(default)]
    track_notes: BTreeMap<TrackId, Vec<Note>>,
    #[serde(default)]
    track_instruments: BTreeMap<TrackId, SoundfontRecord>,
    #[serde(default)]
    track_volumes: BTreeMap<TrackId, f32>,
    #[serde(default)]
    track_offsets: BTreeMap<TrackId, f64>,
    #[serde(default)]
    track_lengths: BTreeMap<TrackId, f64>,
    #[serde(default, rename = "trackVSTMode")]
    track_vst_mode: BTreeMap<TrackId, bool>,
    #[serde(default, rename = "trackVSTPlugins")]
    track_vst_plugins: BTreeMap<TrackId, String>,
    /// Base64 plugin state, version 2 only.
    #[serde(default, rename = "trackVSTPresets")]
    track_vst_presets: Option<BTreeMap<TrackId, String>>,
    #[serde(default)]
    track_beats: BTreeMap<TrackId, BeatPattern>,
    #[serde(default)]
    track_sampler_paths: BTreeMap<TrackId, SamplerRecord>,
    #[serde(default)]
    track_muted: BTreeMap<TrackId, bool>,
    #[serde(default)]
    track_soloed: BTreeMap<TrackId, bool>,
    #[serde(default)]
    track_automation: BTreeMap<TrackId, AutomationRecord>,
}

impl ProjectFile {
    /// Upgrades an older layout to [`CURRENT_VERSION`].
    fn migrate(mut self) -> EngineResult<Self> {
        if self.app != APP_NAME {
            tracing::warn!("Project file written by '{}', loading anyway", self.app);
        }
        match self.version {
            1 => {
                // Version 1 never stored plugin state.
                self.track_vst_presets = Some(BTreeMap::new());
                self.version = 2;
                Ok(self)
            }
            2 => {
                if self.track_vst_presets.is_none() {
                    self.track_vst_presets = Some(BTreeMap::new());
                }
                Ok(self)
            }
            v => Err(EngineError::Unsupported(format!(
                "project file version {}",
                v
            ))),
        }
    }

    fn into_project(mut self) -> EngineResult<Project> {
        let mut project = Project::new();
        let bpm = self.bpm.clamp(MIN_BPM, MAX_BPM);
        if bpm != self.bpm {
            tracing::warn!("Project bpm {} clamped to {}", self.bpm, bpm);
        }
        project.set_bpm(bpm)?;
        project.grid_width = self.grid_width.max(1);
        project.zoom = self.zoom;
        project.loop_region = match (self.loop_start, self.loop_end) {
            (Some(start), Some(end)) => match LoopRegion::new(start, end) {
                Ok(region) => Some(region),
                Err(e) => {
                    tracing::warn!("Ignoring loop region: {}", e);
                    None
                }
            },
            _ => None,
        };

        let presets = self.track_vst_presets.take().unwrap_or_default();
        for header in std::mem::take(&mut self.tracks) {
            let id = header.id.clone();
            let kind = match header.kind.as_str() {
                "midi" => {
                    let notes = self.track_notes.remove(&id).unwrap_or_default();
                    let length = self.track_lengths.get(&id).copied().unwrap_or(4.0);
                    let instrument = self.binding_for(&id, &presets)?;
                    let (notes, length_beats) = fit_notes(notes, length);
                    TrackKind::Midi(MidiTrack {
                        notes,
                        length_beats,
                        instrument,
                    })
                }
                "beat" => {
                    let mut pattern = match self.track_beats.remove(&id) {
                        Some(p) => p,
                        None => BeatPattern::new(16)?,
                    };
                    if BeatPattern::new(pattern.step_count).is_err() {
                        return Err(EngineError::InvalidArgument(format!(
                            "track {} step count {}",
                            id, pattern.step_count
                        )));
                    }
                    pattern.normalize();
                    let length = self.track_lengths.get(&id).copied().unwrap_or(4.0);
                    TrackKind::Beat(BeatTrack {
                        pattern,
                        length_beats: round_up_to_bar(length),
                    })
                }
                "audio" => TrackKind::Audio(AudioTrack {
                    clip_path: header.clip_path.clone().unwrap_or_default(),
                    clip: None,
                }),
                "sampler" => {
                    let notes = self.track_notes.remove(&id).unwrap_or_default();
                    let length = self.track_lengths.get(&id).copied().unwrap_or(4.0);
                    let record = self.track_sampler_paths.remove(&id);
                    let (notes, length_beats) = fit_notes(notes, length);
                    TrackKind::Sampler(SamplerTrack {
                        notes,
                        sample_path: record.as_ref().and_then(|r| r.path.clone()),
                        base_midi_note: record
                            .map(|r| r.base_midi_note.min(127))
                            .unwrap_or(DEFAULT_BASE_NOTE),
                        length_beats,
                    })
                }
                other => {
                    return Err(EngineError::Unsupported(format!(
                        "track {} has unknown type '{}'",
                        id, other
                    )))
                }
            };

            let mut track = Track::new_midi(header.name);
            track.id = id.clone();
            if let Some(color) = header.color {
                track.color = color;
            }
            track.offset_beats = self
                .track_offsets
                .get(&id)
                .copied()
                .filter(|o| o.is_finite())
                .unwrap_or(0.0)
                .max(0.0);
            track.set_volume(self.track_volumes.get(&id).copied().unwrap_or(100.0));
            track.muted = self.track_muted.get(&id).copied().unwrap_or(false);
            track.soloed = self.track_soloed.get(&id).copied().unwrap_or(false);
            track.automation = match self.track_automation.remove(&id) {
                Some(AutomationRecord::Lanes(lanes)) => lanes,
                Some(AutomationRecord::Points(points)) => Automation {
                    volume: Some(AutomationCurve::new(points)?),
                    ..Automation::default()
                },
                None => Automation::default(),
            };
            track.kind = kind;
            project.add_track(track)?;
        }
        Ok(project)
    }

    fn binding_for(
        &self,
        id: &TrackId,
        presets: &BTreeMap<TrackId, String>,
    ) -> EngineResult<InstrumentBinding> {
        let plugin_mode = self.track_vst_mode.get(id).copied().unwrap_or(false);
        if plugin_mode {
            if let Some(path) = self.track_vst_plugins.get(id) {
                let preset = match presets.get(id) {
                    Some(encoded) if !encoded.is_empty() => BASE64
                        .decode(encoded)
                        .map_err(|e| EngineError::Decode(format!("track {} preset: {}", id, e)))?,
                    _ => Vec::new(),
                };
                return Ok(InstrumentBinding::Plugin {
                    path: path.clone(),
                    preset,
                });
            }
        }
        Ok(match self.track_instruments.get(id) {
            Some(sf) => InstrumentBinding::Soundfont {
                path: sf.path.clone(),
                bank: sf.bank,
                preset: sf.preset,
            },
            None => InstrumentBinding::None,
        })
    }

    fn from_project(project: &Project) -> Self {
        let mut file = ProjectFile {
            app: APP_NAME.to_string(),
            version: CURRENT_VERSION,
            saved_at: Some(chrono::Local::now().to_rfc3339()),
            bpm: project.bpm(),
            grid_width: project.grid_width,
            zoom: project.zoom,
            loop_start: project.loop_region.map(|r| r.start),
            loop_end: project.loop_region.map(|r| r.end),
            tracks: Vec::new(),
            track_notes: BTreeMap::new(),
            track_instruments: BTreeMap::new(),
            track_volumes: BTreeMap::new(),
            track_offsets: BTreeMap::new(),
            track_lengths: BTreeMap::new(),
            track_vst_mode: BTreeMap::new(),
            track_vst_plugins: BTreeMap::new(),
            track_vst_presets: Some(BTreeMap::new()),
            track_beats: BTreeMap::new(),
            track_sampler_paths: BTreeMap::new(),
            track_muted: BTreeMap::new(),
            track_soloed: BTreeMap::new(),
            track_automation: BTreeMap::new(),
        };

        for track in project.tracks() {
            let id = track.id.clone();
            let clip_path = match &track.kind {
                TrackKind::Audio(audio) => Some(audio.clip_path.clone()),
                _ => None,
            };
            file.tracks.push(TrackRecord {
                id: id.clone(),
                name: track.name.clone(),
                color: Some(track.color.clone()),
                kind: track.kind.tag().to_string(),
                clip_path,
            });
            file.track_volumes.insert(id.clone(), track.volume());
            file.track_offsets.insert(id.clone(), track.offset_beats);
            file.track_muted.insert(id.clone(), track.muted);
            file.track_soloed.insert(id.clone(), track.soloed);
            if let Some(length) = track.declared_length() {
                file.track_lengths.insert(id.clone(), length);
            }
            if let Some(notes) = track.notes() {
                file.track_notes.insert(id.clone(), notes.to_vec());
            }
            if !track.automation.is_empty() {
                file.track_automation
                    .insert(id.clone(), AutomationRecord::Lanes(track.automation.clone()));
            }

            match &track.kind {
                TrackKind::Midi(midi) => match &midi.instrument {
                    InstrumentBinding::None => {}
                    InstrumentBinding::Soundfont { path, bank, preset } => {
                        file.track_vst_mode.insert(id.clone(), false);
                        file.track_instruments.insert(
                            id,
                            SoundfontRecord {
                                path: path.clone(),
                                bank: *bank,
                                preset: *preset,
                            },
                        );
                    }
                    InstrumentBinding::Plugin { path, preset } => {
                        file.track_vst_mode.insert(id.clone(), true);
                        file.track_vst_plugins.insert(id.clone(), path.clone());
                        if let Some(presets) = file.track_vst_presets.as_mut() {
                            presets.insert(id, BASE64.encode(preset));
                        }
                    }
                },
                TrackKind::Beat(beat) => {
                    file.track_beats.insert(id, beat.pattern.clone());
                }
                TrackKind::Sampler(sampler) => {
                    file.track_sampler_paths.insert(
                        id,
                        SamplerRecord {
                            path: sampler.sample_path.clone(),
                            base_midi_note: sampler.base_midi_note,
                        },
                    );
                }
                TrackKind::Audio(_) => {}
            }
        }
        file
    }
}

/// Grows a region so every note fits, dropping notes that can never be valid.
fn fit_notes(notes: Vec<Note>, length: f64) -> (Vec<Note>, f64) {
    let mut kept: Vec<Note> = Vec::with_capacity(notes.len());
    for note in notes {
        if note.is_valid() {
            kept.push(note);
        } else {
            tracing::warn!("Dropping invalid note {:?}", note);
        }
    }
    kept.sort_by(|a, b| a.start_beat.total_cmp(&b.start_beat));
    let latest_end = kept.iter().map(Note::end_beat).fold(0.0, f64::max);
    let length = if length.is_finite() && length > 0.0 { length } else { 4.0 };
    let length = if latest_end > length {
        round_up_to_bar(latest_end)
    } else {
        length
    };
    (kept, length)
}

/// Serializes a project to the current file layout.
///
/// # Errors
///
/// Returns `Decode` if serialization fails.
pub fn project_to_json(project: &Project) -> EngineResult<String> {
    Ok(serde_json::to_string_pretty(&ProjectFile::from_project(project))?)
}

/// Parses and migrates a project file body.
///
/// # Errors
///
/// Returns `Decode` for malformed JSON or preset blobs, `Unsupported` for an
/// unknown version or track type, and `InvalidArgument` for data that breaks
/// a model invariant after migration.
pub fn project_from_json(json: &str) -> EngineResult<Project> {
    let file: ProjectFile = serde_json::from_str(json)?;
    file.migrate()?.into_project()
}

/// Saves a project to disk.
///
/// # Errors
///
/// Returns `Io` if the file cannot be written.
pub fn save_project<P: AsRef<Path>>(project: &Project, path: P) -> EngineResult<()> {
    let path = path.as_ref();
    let json = project_to_json(project)?;
    fs::write(path, json)
        .map_err(|e| EngineError::Io(format!("{}: {}", path.display(), e)))?;
    tracing::info!("Saved project to {}", path.display());
    Ok(())
}

/// Loads a project from disk.
///
/// # Errors
///
/// Returns `NotFound` for a missing file; see [`project_from_json`] for the rest.
pub fn load_project<P: AsRef<Path>>(path: P) -> EngineResult<Project> {
    let path = path.as_ref();
    let json = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::not_found(path),
        _ => EngineError::decode(path, e),
    })?;
    let project = project_from_json(&json)?;
    tracing::info!(
        "Loaded project {} ({} tracks)",
        path.display(),
        project.track_count()
    );
    Ok(project)
}
