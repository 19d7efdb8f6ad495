//! Plugin processors.
//!
//! A plugin is anything implementing [`Processor`]: it receives raw MIDI
//! bytes and renders stereo audio. Two kinds exist:
//!
//! - Built-in processors addressed as `builtin:<name>`
//! - Shared libraries exporting [`PLUGIN_ENTRY_SYMBOL`], which returns a
//!   pointer to a [`PluginDescriptor`] function table
//!
//! Processor state is an opaque byte blob that round-trips bit-exactly.

use crate::error::{EngineError, EngineResult};
use libloading::{Library, Symbol};
use std::ffi::{c_char, c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Prefix of built-in processor paths.
pub const BUILTIN_PREFIX: &str = "builtin:";

/// The built-in subtractive synth.
pub const BUILTIN_SIMPLE_SYNTH: &str = "builtin:simple-synth";

/// Symbol every plugin library exports.
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"beatline_plugin_entry";

/// ABI version a library must report.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Catalogue entry for a discovered processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    /// Library path or `builtin:` name.
    pub path: String,
}

/// An in-process instrument driven by MIDI bytes.
pub trait Processor: Send {
    fn name(&self) -> &str;

    /// Called off the audio thread before the first `process`.
    fn prepare(&mut self, sample_rate: u32, max_block: usize);

    /// Applies `midi` (3-byte messages, in order) then overwrites
    /// `left`/`right` with the next `left.len()` frames.
    fn process(&mut self, midi: &[[u8; 3]], left: &mut [f32], right: &mut [f32]);

    /// Opaque state; must equal the last blob given to `set_state`.
    fn get_state(&self) -> Vec<u8>;

    fn set_state(&mut self, state: &[u8]) -> EngineResult<()>;

    /// Silences every voice immediately.
    fn reset(&mut self);
}

/// C function table returned by a plugin library's entry point.
#[repr(C)]
pub struct PluginDescriptor {
    pub abi_version: u32,
    /// NUL-terminated display name.
    pub name: *const c_char,
    pub create: unsafe extern "C" fn(sample_rate: u32, max_block: u32) -> *mut c_void,
    pub destroy: unsafe extern "C" fn(instance: *mut c_void),
    pub process: unsafe extern "C" fn(
        instance: *mut c_void,
        midi: *const u8,
        midi_count: u32,
        left: *mut f32,
        right: *mut f32,
        frames: u32,
    ),
    /// Writes up to `capacity` bytes and returns the full state length.
    pub get_state: unsafe extern "C" fn(instance: *mut c_void, out: *mut u8, capacity: u32) -> u32,
    /// Returns 0 on success.
    pub set_state: unsafe extern "C" fn(instance: *mut c_void, data: *const u8, len: u32) -> i32,
    pub reset: unsafe extern "C" fn(instance: *mut c_void),
}

type EntryFn = unsafe extern "C" fn() -> *const PluginDescriptor;

/// Loads a processor and applies `state` (if non-empty).
///
/// # Arguments
///
/// * `path` - Library path or `builtin:` name
/// * `state` - Opaque preset blob
/// * `sample_rate` - Engine rate
/// * `max_block` - Largest block `process` will see
///
/// # Errors
///
/// Returns `NotFound` for a missing library or unknown built-in,
/// `Decode` when the entry point is missing or rejects the state, and
/// `Unsupported` for an ABI mismatch.
pub fn load_processor(
    path: &str,
    state: &[u8],
    sample_rate: u32,
    max_block: usize,
) -> EngineResult<Box<dyn Processor>> {
    let mut processor: Box<dyn Processor> = if let Some(name) = path.strip_prefix(BUILTIN_PREFIX) {
        match name {
            "simple-synth" => Box::new(SimpleSynth::new()),
            other => {
                return Err(EngineError::NotFound(format!("built-in processor '{}'", other)));
            }
        }
    } else {
        Box::new(DynamicProcessor::open(Path::new(path), sample_rate, max_block)?)
    };
    processor.prepare(sample_rate, max_block);
    if !state.is_empty() {
        processor.set_state(state)?;
    }
    tracing::info!("Loaded processor {} ({} state bytes)", processor.name(), state.len());
    Ok(processor)
}

/// Opens a library and returns its descriptor.
fn open_library(path: &Path) -> EngineResult<(Arc<Library>, *const PluginDescriptor)> {
    if !path.exists() {
        return Err(EngineError::not_found(path));
    }
    // Loading runs the library's initializers; only trusted plugin
    // directories are scanned.
    let lib = unsafe { Library::new(path) }.map_err(|e| EngineError::decode(path, e))?;
    let desc = unsafe {
        let entry: Symbol<EntryFn> = lib
            .get(PLUGIN_ENTRY_SYMBOL)
            .map_err(|e| EngineError::decode(path, e))?;
        entry()
    };
    if desc.is_null() {
        return Err(EngineError::decode(path, "entry point returned null"));
    }
    let version = unsafe { (*desc).abi_version };
    if version != PLUGIN_ABI_VERSION {
        return Err(EngineError::Unsupported(format!(
            "plugin ABI {} in {}",
            version,
            path.display()
        )));
    }
    Ok((Arc::new(lib), desc))
}

fn descriptor_name(desc: *const PluginDescriptor, path: &Path) -> String {
    let name = unsafe { (*desc).name };
    if name.is_null() {
        return path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
}

/// A processor living in a shared library.
struct DynamicProcessor {
    name: String,
    desc: *const PluginDescriptor,
    instance: *mut c_void,
    state: Vec<u8>,
    midi_scratch: Vec<u8>,
    // Dropped last so the code stays mapped while `instance` exists.
    _lib: Arc<Library>,
}

// The instance is only touched by whichever thread owns the box.
unsafe impl Send for DynamicProcessor {}

impl DynamicProcessor {
    fn open(path: &Path, sample_rate: u32, max_block: usize) -> EngineResult<Self> {
        let (lib, desc) = open_library(path)?;
        let instance = unsafe { ((*desc).create)(sample_rate, max_block as u32) };
        if instance.is_null() {
            return Err(EngineError::decode(path, "plugin create() failed"));
        }
        Ok(Self {
            name: descriptor_name(desc, path),
            desc,
            instance,
            state: Vec::new(),
            midi_scratch: Vec::with_capacity(3 * 256),
            _lib: lib,
        })
    }
}

impl Processor for DynamicProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self, _sample_rate: u32, _max_block: usize) {}

    fn process(&mut self, midi: &[[u8; 3]], left: &mut [f32], right: &mut [f32]) {
        self.midi_scratch.clear();
        for msg in midi.iter().take(self.midi_scratch.capacity() / 3) {
            self.midi_scratch.extend_from_slice(msg);
        }
        let frames = left.len().min(right.len()) as u32;
        unsafe {
            ((*self.desc).process)(
                self.instance,
                self.midi_scratch.as_ptr(),
                (self.midi_scratch.len() / 3) as u32,
                left.as_mut_ptr(),
                right.as_mut_ptr(),
                frames,
            );
        }
    }

    fn get_state(&self) -> Vec<u8> {
        let len = unsafe { ((*self.desc).get_state)(self.instance, std::ptr::null_mut(), 0) };
        let mut out = vec![0u8; len as usize];
        unsafe { ((*self.desc).get_state)(self.instance, out.as_mut_ptr(), len) };
        if out.is_empty() {
            return self.state.clone();
        }
        out
    }

    fn set_state(&mut self, state: &[u8]) -> EngineResult<()> {
        let rc = unsafe { ((*self.desc).set_state)(self.instance, state.as_ptr(), state.len() as u32) };
        if rc != 0 {
            return Err(EngineError::Decode(format!(
                "{} rejected {} state bytes (code {})",
                self.name,
                state.len(),
                rc
            )));
        }
        self.state = state.to_vec();
        Ok(())
    }

    fn reset(&mut self) {
        unsafe { ((*self.desc).reset)(self.instance) };
    }
}

impl Drop for DynamicProcessor {
    fn drop(&mut self) {
        unsafe { ((*self.desc).destroy)(self.instance) };
    }
}

/// Lists the built-in processors plus every loadable library under `dirs`.
///
/// Libraries that fail to open are skipped with a warning.
pub fn scan_plugins(dirs: &[PathBuf]) -> Vec<PluginInfo> {
    let mut found = vec![PluginInfo {
        name: "Simple Synth".to_string(),
        path: BUILTIN_SIMPLE_SYNTH.to_string(),
    }];
    for dir in dirs.iter().filter(|d| d.is_dir()) {
        for entry in WalkDir::new(dir)
            .max_depth(4)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            let is_lib = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "so" | "dylib" | "dll"))
                .unwrap_or(false);
            if !entry.file_type().is_file() || !is_lib {
                continue;
            }
            match open_library(path) {
                Ok((_lib, desc)) => found.push(PluginInfo {
                    name: descriptor_name(desc, path),
                    path: path.display().to_string(),
                }),
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }
    }
    tracing::info!("Plugin scan found {} processors", found.len());
    found
}

// ---------------------------------------------------------------------------
// Built-in simple synth
// ---------------------------------------------------------------------------

const SYNTH_VOICES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waveform {
    Sine,
    Saw,
    Square,
    Triangle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SynthParams {
    waveform: Waveform,
    attack_seconds: f32,
    release_seconds: f32,
    level: f32,
}

impl SynthParams {
    /// Derives parameters from a state blob. An empty blob gives the defaults.
    fn from_state(state: &[u8]) -> Self {
        if state.is_empty() {
            return Self {
                waveform: Waveform::Sine,
                attack_seconds: 0.005,
                release_seconds: 0.1,
                level: 0.3,
            };
        }
        // FNV-1a
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for &b in state {
            h ^= b as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let waveform = match h & 3 {
            0 => Waveform::Sine,
            1 => Waveform::Saw,
            2 => Waveform::Square,
            _ => Waveform::Triangle,
        };
        let unit = |shift: u32| ((h >> shift) & 0xff) as f32 / 255.0;
        Self {
            waveform,
            attack_seconds: 0.002 + unit(8) * 0.048,
            release_seconds: 0.02 + unit(16) * 0.38,
            level: 0.2 + unit(24) * 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SynthVoice {
    active: bool,
    key: u8,
    phase: f32,
    increment: f32,
    velocity: f32,
    env: f32,
    releasing: bool,
}

impl SynthVoice {
    const IDLE: SynthVoice = SynthVoice {
        active: false,
        key: 0,
        phase: 0.0,
        increment: 0.0,
        velocity: 0.0,
        env: 0.0,
        releasing: false,
    };
}

/// Deterministic polyphonic oscillator synth with a one-pole low-pass.
///
/// Its sound is a pure function of the state blob, so two instances given
/// the same blob render identical output.
pub struct SimpleSynth {
    state: Vec<u8>,
    params: SynthParams,
    sample_rate: f32,
    voices: [SynthVoice; SYNTH_VOICES],
    /// Low-pass coefficient driven by CC74.
    cutoff: f32,
    /// Resonance amount driven by CC71.
    resonance: f32,
    lp: [f32; 2],
}

impl Default for SimpleSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleSynth {
    pub fn new() -> Self {
        Self {
            state: Vec::new(),
            params: SynthParams::from_state(&[]),
            sample_rate: 44_100.0,
            voices: [SynthVoice::IDLE; SYNTH_VOICES],
            cutoff: 1.0,
            resonance: 0.0,
            lp: [0.0; 2],
        }
    }

    fn note_on(&mut self, key: u8, velocity: u8) {
        let freq = 440.0 * 2f32.powf((key as f32 - 69.0) / 12.0);
        let slot = self
            .voices
            .iter()
            .position(|v| !v.active)
            .or_else(|| self.voices.iter().position(|v| v.releasing))
            .unwrap_or(0);
        self.voices[slot] = SynthVoice {
            active: true,
            key,
            phase: 0.0,
            increment: freq / self.sample_rate,
            velocity: velocity as f32 / 127.0,
            env: 0.0,
            releasing: false,
        };
    }

    fn note_off(&mut self, key: u8) {
        for v in self.voices.iter_mut().filter(|v| v.active && v.key == key) {
            v.releasing = true;
        }
    }

    fn handle_midi(&mut self, msg: [u8; 3]) {
        match msg[0] & 0xF0 {
            0x90 if msg[2] > 0 => self.note_on(msg[1] & 0x7F, msg[2] & 0x7F),
            0x90 | 0x80 => self.note_off(msg[1] & 0x7F),
            0xB0 => match msg[1] {
                74 => self.cutoff = msg[2] as f32 / 127.0,
                71 => self.resonance = msg[2] as f32 / 127.0,
                120 | 123 => {
                    for v in self.voices.iter_mut().filter(|v| v.active) {
                        v.releasing = true;
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn oscillator(waveform: Waveform, phase: f32) -> f32 {
        match waveform {
            Waveform::Sine => (phase * std::f32::consts::TAU).sin(),
            Waveform::Saw => 2.0 * phase - 1.0,
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        }
    }
}

impl Processor for SimpleSynth {
    fn name(&self) -> &str {
        "Simple Synth"
    }

    fn prepare(&mut self, sample_rate: u32, _max_block: usize) {
        self.sample_rate = sample_rate.max(1) as f32;
    }

    fn process(&mut self, midi: &[[u8; 3]], left: &mut [f32], right: &mut [f32]) {
        for &msg in midi {
            self.handle_midi(msg);
        }
        let attack_step = 1.0 / (self.params.attack_seconds * self.sample_rate);
        let release_step = 1.0 / (self.params.release_seconds * self.sample_rate);
        // Cutoff 0..1 maps onto a one-pole coefficient; resonance adds a
        // little feedback from the previous output.
        let coeff = 0.02 + 0.98 * self.cutoff * self.cutoff;
        let feedback = self.resonance * 0.3;

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let mut sum = 0.0;
            for v in self.voices.iter_mut().filter(|v| v.active) {
                if v.releasing {
                    v.env -= release_step;
                    if v.env <= 0.0 {
                        *v = SynthVoice::IDLE;
                        continue;
                    }
                } else if v.env < 1.0 {
                    v.env = (v.env + attack_step).min(1.0);
                }
                sum += Self::oscillator(self.params.waveform, v.phase) * v.env * v.velocity;
                v.phase += v.increment;
                if v.phase >= 1.0 {
                    v.phase -= 1.0;
                }
            }
            let x = sum * self.params.level;
            let prev = self.lp[0];
            self.lp[0] += coeff * (x - self.lp[0] + feedback * (self.lp[0] - prev));
            self.lp[1] = self.lp[0];
            *l = self.lp[0];
            *r = self.lp[1];
        }
    }

    fn get_state(&self) -> Vec<u8> {
        self.state.clone()
    }

    fn set_state(&mut self, state: &[u8]) -> EngineResult<()> {
        self.state = state.to_vec();
        self.params = SynthParams::from_state(state);
        Ok(())
    }

    fn reset(&mut self) {
        self.voices = [SynthVoice::IDLE; SYNTH_VOICES];
        self.lp = [0.0; 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(p: &mut dyn Processor, midi: &[[u8; 3]], frames: usize) -> Vec<f32> {
        let mut l = vec![0.0; frames];
        let mut r = vec![0.0; frames];
        p.process(midi, &mut l, &mut r);
        l
    }

    #[test]
    fn test_state_round_trip_exact() {
        let blob: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        let synth = load_processor(BUILTIN_SIMPLE_SYNTH, &blob, 44_100, 512).unwrap();
        assert_eq!(synth.get_state(), blob);
    }

    #[test]
    fn test_same_state_same_output() {
        let blob = b"warm pad".to_vec();
        let mut a = load_processor(BUILTIN_SIMPLE_SYNTH, &blob, 48_000, 512).unwrap();
        let mut b = load_processor(BUILTIN_SIMPLE_SYNTH, &blob, 48_000, 512).unwrap();
        let on = [[0x90, 60, 100]];
        let out_a = render(a.as_mut(), &on, 512);
        let out_b = render(b.as_mut(), &on, 512);
        assert_eq!(out_a, out_b);
        assert!(out_a.iter().any(|s| s.abs() > 1e-3));
    }

    #[test]
    fn test_all_notes_off_releases() {
        let mut synth = SimpleSynth::new();
        synth.prepare(1_000, 512);
        render(&mut synth, &[[0x90, 60, 127]], 100);
        // Default release is 100 ms = 100 samples here.
        let tail = render(&mut synth, &[[0xB0, 123, 0]], 200);
        assert!(tail[150..].iter().all(|s| s.abs() < 1e-3));
        assert!(synth.voices.iter().all(|v| !v.active));
    }

    #[test]
    fn test_unknown_builtin_not_found() {
        let err = load_processor("builtin:theremin", &[], 44_100, 512).err().unwrap();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_missing_library_not_found() {
        let err = load_processor("/no/such/plugin.so", &[], 44_100, 512).err().unwrap();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_scan_lists_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fake.so"), b"not a library").unwrap();
        let found = scan_plugins(&[dir.path().to_path_buf()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, BUILTIN_SIMPLE_SYNTH);
    }
}
