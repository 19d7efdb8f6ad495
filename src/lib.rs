//! beatline - realtime and offline audio engine for a music workstation.
//!
//! The library holds the whole engine; the `beatline-host` binary wraps it
//! in a line protocol for a UI process.
//!
//! - [`project`]: the editable arrangement and its file format
//! - [`engine`]: the block processor, its clock and scheduler
//! - [`source`]: soundfont, sampler, plugin and clip voice sources
//! - [`mix`]: channel strips, master limiter, capture tap
//! - [`loader`]: background decoding and plugin discovery
//! - [`control`]: command and event rings, the text protocol
//! - [`render`]: realtime and offline drivers, WAV output
//! - [`host`]: the control-side handle tying it together

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod host;
pub mod loader;
pub mod mix;
pub mod project;
pub mod render;
pub mod source;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{Engine, ProjectSnapshot, TransportState};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use host::{EngineHandle, Flow, RenderUpdate};
pub use project::{InstrumentBinding, Note, NoteId, Project, Track, TrackId};
pub use render::{export_wav, NullOutput, RealtimeOutput, RenderJob, RenderOptions};
