//! Line protocol of the host binary.
//!
//! One command per input line: a case-insensitive command word followed by
//! space-separated arguments. An argument may be wrapped in `"` or `'` to
//! carry spaces. Replies are single lines starting with `EVENT` or `ERROR`.
//!
//! ```text
//! LOAD_SF2 t1 "/sounds/Grand Piano.sf2" 0 0
//! NOTE_ON t1 60 100 250
//! RENDER_WAV /tmp/mix.wav
//! CANCEL_RENDER
//! ```

use std::fmt;
use std::path::PathBuf;

/// Default live-note velocity.
pub const DEFAULT_NOTE_VELOCITY: f32 = 0.8;

/// Default live-note length.
pub const DEFAULT_NOTE_MS: u32 = 400;

/// Largest gain a live beat trigger may carry.
pub const MAX_TRIGGER_GAIN: f32 = 4.0;

/// A parsed protocol command.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    Quit,
    Status,
    /// `LOAD` / `LOAD_VST trackId path`
    LoadPlugin {
        track: String,
        path: String,
    },
    LoadSoundfont {
        track: String,
        path: PathBuf,
        bank: u16,
        preset: u16,
    },
    SetSoundfontPreset {
        track: String,
        bank: u16,
        preset: u16,
    },
    /// `NOTE` / `NOTE_ON trackId midi [velocity] [durationMs] [channel]`
    Note {
        track: String,
        midi: u8,
        velocity: f32,
        duration_ms: u32,
    },
    SetVolume {
        track: String,
        percent: f32,
    },
    LoadBeatSample {
        track: String,
        row: String,
        path: PathBuf,
    },
    TriggerBeat {
        track: String,
        row: String,
        gain: f32,
    },
    ClearBeat {
        track: String,
        row: Option<String>,
    },
    LoadSamplerSample {
        track: String,
        path: PathBuf,
        base_note: u8,
    },
    TriggerSampler {
        track: String,
        midi: u8,
        velocity: f32,
    },
    StopSamplerNote {
        track: String,
        midi: u8,
    },
    ClearSampler {
        track: String,
    },
    /// `PANIC` / `ALL_OFF [trackId]`
    Panic {
        track: Option<String>,
    },
    OpenEditor {
        track: String,
    },
    CloseEditor {
        track: String,
    },
    /// `RENDER` / `RENDER_WAV path [sampleRate] [bitDepth]`
    RenderWav {
        path: PathBuf,
        sample_rate: Option<u32>,
        bit_depth: Option<u16>,
    },
    /// `CANCEL_RENDER`: stops the running offline render.
    CancelRender,
    GetState {
        track: String,
    },
    SetState {
        track: String,
        /// Base64 state blob.
        blob: String,
    },
    ScanPlugins,
    LoadProject {
        path: PathBuf,
    },
    SaveProject {
        path: PathBuf,
    },
    Play {
        beat: Option<f64>,
    },
    Pause,
    Stop,
    Seek {
        beat: f64,
    },
    SetBpm {
        bpm: f64,
    },
    SetMute {
        track: String,
        on: bool,
    },
    SetSolo {
        track: String,
        on: bool,
    },
}

impl Request {
    /// Reply area used when the request fails after parsing.
    pub fn area(&self) -> &'static str {
        match self {
            Request::Ping | Request::Quit | Request::Status => "HOST",
            Request::LoadPlugin { .. } => "LOAD",
            Request::LoadSoundfont { .. } => "LOAD_SF2",
            Request::SetSoundfontPreset { .. } => "SF2_PRESET",
            Request::Note { .. } => "NOTE",
            Request::SetVolume { .. } => "VOLUME",
            Request::LoadBeatSample { .. }
            | Request::TriggerBeat { .. }
            | Request::ClearBeat { .. } => "BEAT",
            Request::LoadSamplerSample { .. }
            | Request::TriggerSampler { .. }
            | Request::StopSamplerNote { .. }
            | Request::ClearSampler { .. } => "SAMPLER",
            Request::Panic { .. } => "PANIC",
            Request::OpenEditor { .. } | Request::CloseEditor { .. } => "EDITOR",
            Request::RenderWav { .. } | Request::CancelRender => "RENDER",
            Request::GetState { .. } | Request::SetState { .. } => "STATE",
            Request::ScanPlugins => "SCAN",
            Request::LoadProject { .. } | Request::SaveProject { .. } => "PROJECT",
            Request::Play { .. }
            | Request::Pause
            | Request::Stop
            | Request::Seek { .. }
            | Request::SetBpm { .. } => "TRANSPORT",
            Request::SetMute { .. } | Request::SetSolo { .. } => "MIXER",
        }
    }

    /// Track the request addresses, if any.
    pub fn track(&self) -> Option<&str> {
        match self {
            Request::LoadPlugin { track, .. }
            | Request::LoadSoundfont { track, .. }
            | Request::SetSoundfontPreset { track, .. }
            | Request::Note { track, .. }
            | Request::SetVolume { track, .. }
            | Request::LoadBeatSample { track, .. }
            | Request::TriggerBeat { track, .. }
            | Request::ClearBeat { track, .. }
            | Request::LoadSamplerSample { track, .. }
            | Request::TriggerSampler { track, .. }
            | Request::StopSamplerNote { track, .. }
            | Request::ClearSampler { track }
            | Request::OpenEditor { track }
            | Request::CloseEditor { track }
            | Request::GetState { track }
            | Request::SetState { track, .. }
            | Request::SetMute { track, .. }
            | Request::SetSolo { track, .. } => Some(track),
            Request::Panic { track } => track.as_deref(),
            _ => None,
        }
    }
}

/// A line that could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Reply area, e.g. `LOAD` or `UNKNOWN`.
    pub area: &'static str,
    pub detail: String,
}

impl ParseError {
    fn new(area: &'static str, detail: impl Into<String>) -> Self {
        Self {
            area,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR {} {}", self.area, self.detail)
    }
}

impl std::error::Error for ParseError {}

/// Splits a line into tokens, honouring `"..."` and `'...'` quoting.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' || c == '\'' {
            chars.next();
            for ch in chars.by_ref() {
                if ch == c {
                    break;
                }
                token.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                token.push(ch);
                chars.next();
            }
        }
        if !token.is_empty() {
            tokens.push(token);
        }
    }
    tokens
}

/// Live-note velocity: values above 1.5 are read as MIDI 0-127.
pub fn normalize_velocity(raw: f32) -> f32 {
    if raw > 1.5 {
        (raw / 127.0).clamp(0.0, 1.0)
    } else {
        raw.clamp(0.0, 1.0)
    }
}

/// Arguments of one command, with typed accessors.
struct Args<'a> {
    area: &'static str,
    tokens: &'a [String],
}

impl<'a> Args<'a> {
    fn require(&self, count: usize, missing: &str) -> Result<(), ParseError> {
        if self.tokens.len() < count {
            return Err(ParseError::new(self.area, missing));
        }
        Ok(())
    }

    fn text(&self, i: usize) -> String {
        self.tokens.get(i).cloned().unwrap_or_default()
    }

    fn opt_text(&self, i: usize) -> Option<String> {
        self.tokens.get(i).cloned()
    }

    fn number<T: std::str::FromStr>(&self, i: usize, name: &str) -> Result<Option<T>, ParseError> {
        match self.tokens.get(i) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| ParseError::new(self.area, format!("invalid-{} {}", name, raw))),
        }
    }

    fn midi(&self, i: usize) -> Result<u8, ParseError> {
        let value: i64 = self.number(i, "midi-note")?.unwrap_or(-1);
        u8::try_from(value)
            .ok()
            .filter(|m| *m <= 127)
            .ok_or_else(|| ParseError::new(self.area, format!("invalid-midi-note {}", value)))
    }

    fn flag(&self, i: usize) -> Result<bool, ParseError> {
        match self.tokens.get(i).map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("1") | Some("true") | Some("on") => Ok(true),
            Some("0") | Some("false") | Some("off") => Ok(false),
            other => Err(ParseError::new(
                self.area,
                format!("invalid-flag {}", other.unwrap_or("")),
            )),
        }
    }
}

/// Parses one input line.
///
/// # Returns
///
/// `Ok(None)` for a blank line
///
/// # Errors
///
/// Returns a [`ParseError`] whose `Display` is the reply line, e.g.
/// `ERROR LOAD missing-track-id-or-path` or `ERROR UNKNOWN FOO`.
pub fn parse_request(line: &str) -> Result<Option<Request>, ParseError> {
    let tokens = tokenize(line.trim());
    let Some((word, rest)) = tokens.split_first() else {
        return Ok(None);
    };
    let command = word.to_ascii_uppercase();
    let args = |area: &'static str| Args { area, tokens: rest };

    let request = match command.as_str() {
        "PING" => Request::Ping,
        "QUIT" | "EXIT" => Request::Quit,
        "STATUS" => Request::Status,
        "SCAN_VSTS" => Request::ScanPlugins,
        "LOAD" | "LOAD_VST" => {
            let a = args("LOAD");
            a.require(2, "missing-track-id-or-path")?;
            Request::LoadPlugin {
                track: a.text(0),
                path: a.text(1),
            }
        }
        "LOAD_SF2" => {
            let a = args("LOAD_SF2");
            a.require(2, "missing-track-id-or-path")?;
            Request::LoadSoundfont {
                track: a.text(0),
                path: PathBuf::from(a.text(1)),
                bank: a.number(2, "bank")?.unwrap_or(0),
                preset: a.number(3, "preset")?.unwrap_or(0),
            }
        }
        "SET_SF2_PRESET" => {
            let a = args("SF2_PRESET");
            a.require(3, "missing-track-id-bank-or-preset")?;
            Request::SetSoundfontPreset {
                track: a.text(0),
                bank: a.number(1, "bank")?.unwrap_or(0),
                preset: a.number(2, "preset")?.unwrap_or(0),
            }
        }
        "NOTE" | "NOTE_ON" => {
            let a = args("NOTE");
            a.require(2, "missing-track-id-or-midi-note")?;
            let velocity: f32 = a.number(2, "velocity")?.unwrap_or(DEFAULT_NOTE_VELOCITY);
            // A fifth token names a MIDI channel; every track is one channel.
            Request::Note {
                track: a.text(0),
                midi: a.midi(1)?,
                velocity: normalize_velocity(velocity),
                duration_ms: a.number(3, "duration")?.unwrap_or(DEFAULT_NOTE_MS),
            }
        }
        "SET_VOLUME" => {
            let a = args("VOLUME");
            a.require(2, "missing-track-id-or-volume")?;
            Request::SetVolume {
                track: a.text(0),
                percent: a.number(1, "volume")?.unwrap_or(100.0),
            }
        }
        "LOAD_BEAT_SAMPLE" => {
            let a = args("BEAT");
            a.require(3, "missing-track-row-or-path")?;
            Request::LoadBeatSample {
                track: a.text(0),
                row: a.text(1),
                path: PathBuf::from(a.text(2)),
            }
        }
        "TRIGGER_BEAT" => {
            let a = args("BEAT");
            a.require(2, "missing-track-or-row")?;
            let gain: f32 = a.number(2, "gain")?.unwrap_or(1.0);
            Request::TriggerBeat {
                track: a.text(0),
                row: a.text(1),
                gain: gain.clamp(0.0, MAX_TRIGGER_GAIN),
            }
        }
        "CLEAR_BEAT" => {
            let a = args("BEAT");
            a.require(1, "missing-track-id")?;
            Request::ClearBeat {
                track: a.text(0),
                row: a.opt_text(1),
            }
        }
        "LOAD_SAMPLER_SAMPLE" => {
            let a = args("SAMPLER");
            a.require(2, "missing-track-id-or-path")?;
            let base: i64 = a.number(2, "base-note")?.unwrap_or(60);
            Request::LoadSamplerSample {
                track: a.text(0),
                path: PathBuf::from(a.text(1)),
                base_note: base.clamp(0, 127) as u8,
            }
        }
        "TRIGGER_SAMPLER" => {
            let a = args("SAMPLER");
            a.require(2, "missing-track-id-or-midi-note")?;
            let velocity: f32 = a.number(2, "velocity")?.unwrap_or(DEFAULT_NOTE_VELOCITY);
            Request::TriggerSampler {
                track: a.text(0),
                midi: a.midi(1)?,
                velocity: normalize_velocity(velocity),
            }
        }
        "STOP_SAMPLER_NOTE" => {
            let a = args("SAMPLER");
            a.require(2, "missing-track-id-or-midi-note")?;
            Request::StopSamplerNote {
                track: a.text(0),
                midi: a.midi(1)?,
            }
        }
        "CLEAR_SAMPLER" => {
            let a = args("SAMPLER");
            a.require(1, "missing-track-id")?;
            Request::ClearSampler { track: a.text(0) }
        }
        "PANIC" | "ALL_OFF" => Request::Panic {
            track: rest.first().cloned(),
        },
        "SHOW_UI" | "OPEN_EDITOR" => {
            let a = args("EDITOR");
            a.require(1, "missing-track-id")?;
            Request::OpenEditor { track: a.text(0) }
        }
        "CLOSE_UI" | "CLOSE_EDITOR" => {
            let a = args("EDITOR");
            a.require(1, "missing-track-id")?;
            Request::CloseEditor { track: a.text(0) }
        }
        "RENDER" | "RENDER_WAV" => {
            let a = args("RENDER");
            a.require(1, "missing-output-path")?;
            Request::RenderWav {
                path: PathBuf::from(a.text(0)),
                sample_rate: a.number(1, "sample-rate")?,
                bit_depth: a.number(2, "bit-depth")?,
            }
        }
        "CANCEL_RENDER" => Request::CancelRender,
        "GET_STATE" => {
            let a = args("STATE");
            a.require(1, "missing-track-id")?;
            Request::GetState { track: a.text(0) }
        }
        "SET_STATE" => {
            let a = args("STATE");
            a.require(2, "missing-track-id-or-state")?;
            Request::SetState {
                track: a.text(0),
                blob: a.text(1),
            }
        }
        "LOAD_PROJECT" => {
            let a = args("PROJECT");
            a.require(1, "missing-path")?;
            Request::LoadProject {
                path: PathBuf::from(a.text(0)),
            }
        }
        "SAVE_PROJECT" => {
            let a = args("PROJECT");
            a.require(1, "missing-path")?;
            Request::SaveProject {
                path: PathBuf::from(a.text(0)),
            }
        }
        "PLAY" => Request::Play {
            beat: args("TRANSPORT").number(0, "beat")?,
        },
        "PAUSE" => Request::Pause,
        "STOP" => Request::Stop,
        "SEEK" => {
            let a = args("TRANSPORT");
            a.require(1, "missing-beat")?;
            Request::Seek {
                beat: a.number(0, "beat")?.unwrap_or(0.0),
            }
        }
        "SET_BPM" => {
            let a = args("TRANSPORT");
            a.require(1, "missing-bpm")?;
            Request::SetBpm {
                bpm: a.number(0, "bpm")?.unwrap_or(0.0),
            }
        }
        "SET_MUTE" => {
            let a = args("MIXER");
            a.require(2, "missing-track-id-or-flag")?;
            Request::SetMute {
                track: a.text(0),
                on: a.flag(1)?,
            }
        }
        "SET_SOLO" => {
            let a = args("MIXER");
            a.require(2, "missing-track-id-or-flag")?;
            Request::SetSolo {
                track: a.text(0),
                on: a.flag(1)?,
            }
        }
        _ => return Err(ParseError::new("UNKNOWN", command)),
    };
    Ok(Some(request))
}

/// Formats an `EVENT` reply.
pub fn event_line(name: &str, args: &[&dyn fmt::Display]) -> String {
    let mut line = format!("EVENT {}", name);
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string());
    }
    line
}

/// Formats an `ERROR` reply.
pub fn error_line(area: &str, args: &[&dyn fmt::Display]) -> String {
    let mut line = format!("ERROR {}", area);
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string());
    }
    line
}
