//! Engine error taxonomy.
//!
//! Every fallible operation in the library returns [`EngineResult`]. The
//! audio thread never carries an [`EngineError`] itself (it owns a `String`);
//! it posts the plain [`ErrorKind`] on the event back-channel instead.

use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors produced by the engine, one variant per failure class.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A sample, plugin or soundfont file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A file exists but could not be read or parsed.
    #[error("decode error: {0}")]
    Decode(String),

    /// Output could not be created or written (permissions, full disk).
    #[error("i/o error: {0}")]
    Io(String),

    /// Format, version or feature the engine does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An exclusive action overlaps another one (e.g. render while playing).
    #[error("busy: {0}")]
    Busy(String),

    /// A caller passed an out-of-range or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The command queue is full and the command was dropped.
    #[error("command queue overrun")]
    Overrun,

    /// A voice pool ran out of voices.
    #[error("voice starvation on {0}")]
    VoiceStarvation(String),

    /// An audio-thread invariant was broken.
    #[error("fatal: {0}")]
    Fatal(String),

    /// An offline render was stopped by its cancel flag.
    #[error("cancelled")]
    Cancelled,
}

/// Allocation-free classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Decode,
    Io,
    Unsupported,
    Busy,
    InvalidArgument,
    Overrun,
    VoiceStarvation,
    Fatal,
    /// Offline render stopped by its cancel flag.
    Cancelled,
}

impl ErrorKind {
    /// Protocol token for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Decode => "DECODE",
            ErrorKind::Io => "IO",
            ErrorKind::Unsupported => "UNSUPPORTED",
            ErrorKind::Busy => "BUSY",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Overrun => "OVERRUN",
            ErrorKind::VoiceStarvation => "VOICE_STARVATION",
            ErrorKind::Fatal => "FATAL",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    /// Returns the error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Decode(_) => ErrorKind::Decode,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Unsupported(_) => ErrorKind::Unsupported,
            EngineError::Busy(_) => ErrorKind::Busy,
            EngineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            EngineError::Overrun => ErrorKind::Overrun,
            EngineError::VoiceStarvation(_) => ErrorKind::VoiceStarvation,
            EngineError::Fatal(_) => ErrorKind::Fatal,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Builds a `NotFound` for a path.
    pub fn not_found(path: &Path) -> Self {
        EngineError::NotFound(path.display().to_string())
    }

    /// Builds a `Decode` error naming the offending path.
    pub fn decode(path: &Path, reason: impl fmt::Display) -> Self {
        EngineError::Decode(format!("{}: {}", path.display(), reason))
    }

    /// Builds an `Io` error for a failed write.
    pub fn io(e: io::Error) -> Self {
        EngineError::Io(e.to_string())
    }

    /// True for errors that clear a track's instrument but keep playback running.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound | ErrorKind::Decode | ErrorKind::Unsupported
        )
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => EngineError::NotFound(e.to_string()),
            _ => EngineError::Decode(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Decode(e.to_string())
    }
}
