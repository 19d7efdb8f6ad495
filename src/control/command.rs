//! Commands to the audio thread and events back from it.
//!
//! Commands carry fully prepared payloads: a source arrives already built
//! and prepared, a snapshot arrives already flattened. Applying one on the
//! audio thread is a move or a pointer swap. Whatever a command displaces
//! travels back as [`Garbage`] so it is freed on the control side.

use crate::engine::{ProjectSnapshot, TransportState};
use crate::error::ErrorKind;
use crate::mix::CaptureTap;
use crate::source::VoiceSource;

/// Commands sent from the control thread to the audio thread.
pub enum Command {
    /// Puts a prepared source into a slot, replacing whatever was there.
    InstallSource {
        slot: usize,
        source: Box<dyn VoiceSource>,
    },
    /// Empties a slot; the track renders silence.
    UnloadSource { slot: usize },
    /// Swaps in a new arrangement at the next block boundary.
    UpdateSnapshot(Box<ProjectSnapshot>),
    /// Starts from a beat, or resumes from the paused position.
    TransportStart(Option<f64>),
    TransportPause,
    /// Pause, rewind to beat 0 and reset every source.
    TransportStop,
    Seek(f64),
    SetBpm(f64),
    SetVolume { slot: usize, percent: f32 },
    SetMute { slot: usize, muted: bool },
    SetSolo { slot: usize, soloed: bool },
    /// Releases every voice of one slot, or of all slots.
    Panic(Option<usize>),
    /// Auditions a note outside the arrangement.
    LiveNote {
        slot: usize,
        midi: u8,
        velocity: f32,
        duration_samples: u64,
    },
    LiveNoteOff { slot: usize, midi: u8 },
    LiveTrigger { slot: usize, row: u16, gain: f32 },
    SetCaptureTap(Option<CaptureTap>),
}

impl Command {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Command::InstallSource { .. } => "install-source",
            Command::UnloadSource { .. } => "unload-source",
            Command::UpdateSnapshot(_) => "update-snapshot",
            Command::TransportStart(_) => "start",
            Command::TransportPause => "pause",
            Command::TransportStop => "stop",
            Command::Seek(_) => "seek",
            Command::SetBpm(_) => "set-bpm",
            Command::SetVolume { .. } => "set-volume",
            Command::SetMute { .. } => "set-mute",
            Command::SetSolo { .. } => "set-solo",
            Command::Panic(_) => "panic",
            Command::LiveNote { .. } => "live-note",
            Command::LiveNoteOff { .. } => "live-note-off",
            Command::LiveTrigger { .. } => "live-trigger",
            Command::SetCaptureTap(_) => "set-capture-tap",
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Something the audio thread let go of.
pub enum Garbage {
    Source(Box<dyn VoiceSource>),
    Snapshot(Box<ProjectSnapshot>),
    Tap(CaptureTap),
}

/// Records posted by the audio thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// First block processed.
    Ready { sample_rate: u32 },
    SourceInstalled { slot: usize },
    SourceUnloaded { slot: usize },
    SnapshotApplied { generation: u64 },
    /// Transport changed; `beat` is the position at the change.
    State { state: TransportState, beat: f64 },
    /// A voice pool had to steal.
    VoiceOverflow { slot: usize, stolen: u32 },
    /// The event buffer was full for a block.
    EventOverflow { dropped: u32 },
    CaptureOverflow { frames: u64 },
    Error { kind: ErrorKind, slot: Option<usize> },
    /// Events lost because the back-channel was full.
    Dropped { count: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(Command::TransportStart(None).label(), "start");
        assert_eq!(format!("{:?}", Command::Panic(Some(1))), "panic");
    }
}
