//! Control plane.
//!
//! The control thread talks to the audio thread only through the rings in
//! [`channel`]; the host binary talks to the control thread through the
//! text lines in [`protocol`].

pub mod channel;
pub mod command;
pub mod protocol;

pub use channel::{engine_channel, AudioEndpoint, ControlEndpoint};
pub use command::{Command, EngineEvent, Garbage};
pub use protocol::{parse_request, ParseError, Request};
