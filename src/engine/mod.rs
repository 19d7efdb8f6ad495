//! The audio engine core.
//!
//! [`Engine`] is the block processor shared by the realtime and offline
//! drivers. Per block it drains control commands, advances the [`Clock`],
//! asks the scheduler for sample-accurate events, renders every track's
//! source through its channel strip and limits the sum.

mod clock;
mod event;
mod graph;
mod scheduler;
mod snapshot;

pub use clock::{Clock, TransportState};
pub use event::{Event, EventBuffer, EventKind};
pub use graph::{Engine, EVENT_CAPACITY, LIVE_NOTE_CAPACITY};
pub use scheduler::{
    chase, loop_cut, release_all, schedule_segment, Segment, Timeline, TrackGate,
    CONTROL_INTERVAL,
};
pub use snapshot::{ProjectSnapshot, SnapNote, SnapPattern, SourceRole, TrackSnapshot};
