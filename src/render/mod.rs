//! Render drivers.
//!
//! - [`realtime`]: a rodio source that pulls engine blocks for the device,
//!   and a timer driver for machines without one
//! - [`offline`]: block-by-block rendering to buffers or a WAV file
//! - [`wav`]: the canonical 24-bit writer and a reader

pub mod offline;
pub mod realtime;
pub mod wav;

pub use offline::{export_wav, render_blocks, render_to_buffers, RenderJob, RenderOptions};
pub use realtime::{EngineSource, NullOutput, RealtimeOutput};
pub use wav::{decode_wav, encode_wav, Wav24, Wav24Writer};
