//! Lock-free rings between the control thread and the audio thread.
//!
//! Three SPSC rings connect the two sides:
//!
//! - commands, control → audio
//! - garbage, audio → control (displaced sources, snapshots, taps)
//! - events, audio → control
//!
//! Neither side ever blocks. A full command ring is reported as
//! [`EngineError::Overrun`]; a full event ring drops the event and counts
//! it, and the count is posted once space returns.

use super::command::{Command, EngineEvent, Garbage};
use crate::error::{EngineError, EngineResult};
use rtrb::{Consumer, Producer, PushError, RingBuffer};

/// Control-thread end.
pub struct ControlEndpoint {
    commands: Producer<Command>,
    garbage: Consumer<Garbage>,
    events: Consumer<EngineEvent>,
}

/// Audio-thread end.
pub struct AudioEndpoint {
    commands: Consumer<Command>,
    garbage: Producer<Garbage>,
    events: Producer<EngineEvent>,
    dropped_events: u32,
}

/// Creates both ends.
///
/// # Arguments
///
/// * `command_capacity` - Commands that may be queued before `Overrun`
/// * `event_capacity` - Events buffered before they are dropped
pub fn engine_channel(
    command_capacity: usize,
    event_capacity: usize,
) -> (ControlEndpoint, AudioEndpoint) {
    let (cmd_tx, cmd_rx) = RingBuffer::new(command_capacity.max(1));
    // Every command displaces at most one item, so this never limits draining
    // while the control side keeps collecting.
    let (garbage_tx, garbage_rx) = RingBuffer::new(command_capacity.max(1));
    let (event_tx, event_rx) = RingBuffer::new(event_capacity.max(1));
    (
        ControlEndpoint {
            commands: cmd_tx,
            garbage: garbage_rx,
            events: event_rx,
        },
        AudioEndpoint {
            commands: cmd_rx,
            garbage: garbage_tx,
            events: event_tx,
            dropped_events: 0,
        },
    )
}

impl ControlEndpoint {
    /// Queues a command.
    ///
    /// # Errors
    ///
    /// Returns `Overrun` when the ring is full; the command is dropped.
    pub fn send(&mut self, command: Command) -> EngineResult<()> {
        self.try_send(command).map_err(|rejected| {
            tracing::warn!("Command queue full, dropped {}", rejected.label());
            EngineError::Overrun
        })
    }

    /// Queues a command, handing it back when the ring is full.
    pub fn try_send(&mut self, command: Command) -> Result<(), Command> {
        self.commands.push(command).map_err(|e| match e {
            PushError::Full(value) => value,
        })
    }

    /// Free command slots.
    pub fn free_slots(&self) -> usize {
        self.commands.slots()
    }

    /// Drops everything the audio thread handed back.
    pub fn collect_garbage(&mut self) -> usize {
        let mut freed = 0;
        while let Ok(item) = self.garbage.pop() {
            drop(item);
            freed += 1;
        }
        freed
    }

    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop().ok()
    }

    /// All pending events.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::with_capacity(self.events.slots());
        while let Ok(event) = self.events.pop() {
            out.push(event);
        }
        out
    }
}

impl AudioEndpoint {
    /// Pops the next command while there is room to return what it
    /// displaces. Commands left behind stay queued, in order.
    pub fn next_command(&mut self) -> Option<Command> {
        if self.garbage.slots() == 0 {
            return None;
        }
        self.commands.pop().ok()
    }

    /// Hands a displaced item back to the control side. Only called after
    /// `next_command` checked for space; if the ring is somehow full the
    /// item is leaked rather than freed here.
    pub fn discard(&mut self, item: Garbage) {
        if let Err(PushError::Full(item)) = self.garbage.push(item) {
            std::mem::forget(item);
        }
    }

    /// Posts an event, counting it as dropped when the ring is full.
    pub fn post(&mut self, event: EngineEvent) {
        if self.dropped_events > 0 && self.events.slots() >= 2 {
            let count = std::mem::take(&mut self.dropped_events);
            let _ = self.events.push(EngineEvent::Dropped { count });
        }
        if self.events.push(event).is_err() {
            self.dropped_events += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProjectSnapshot;

    #[test]
    fn test_full_command_ring_is_overrun() {
        let (mut control, _audio) = engine_channel(2, 4);
        control.send(Command::TransportPause).unwrap();
        control.send(Command::TransportStop).unwrap();
        assert!(matches!(
            control.send(Command::Seek(1.0)),
            Err(EngineError::Overrun)
        ));
        assert_eq!(control.free_slots(), 0);
    }

    #[test]
    fn test_commands_arrive_in_order() {
        let (mut control, mut audio) = engine_channel(8, 4);
        control.send(Command::Seek(1.0)).unwrap();
        control.send(Command::SetBpm(90.0)).unwrap();
        assert!(matches!(audio.next_command(), Some(Command::Seek(b)) if b == 1.0));
        assert!(matches!(audio.next_command(), Some(Command::SetBpm(b)) if b == 90.0));
        assert!(audio.next_command().is_none());
    }

    #[test]
    fn test_garbage_returns_to_control() {
        let (mut control, mut audio) = engine_channel(1, 4);
        control.send(Command::TransportPause).unwrap();
        assert!(audio.next_command().is_some());
        audio.discard(Garbage::Snapshot(Box::new(ProjectSnapshot::default())));

        // Garbage ring full: the next command waits.
        control.send(Command::TransportStop).unwrap();
        assert!(audio.next_command().is_none());
        assert_eq!(control.collect_garbage(), 1);
        assert!(audio.next_command().is_some());
    }

    #[test]
    fn test_dropped_events_reported() {
        let (mut control, mut audio) = engine_channel(4, 2);
        for _ in 0..4 {
            audio.post(EngineEvent::SourceInstalled { slot: 0 });
        }
        assert_eq!(control.drain_events().len(), 2);
        audio.post(EngineEvent::SourceUnloaded { slot: 1 });
        assert_eq!(
            control.drain_events(),
            vec![
                EngineEvent::Dropped { count: 2 },
                EngineEvent::SourceUnloaded { slot: 1 }
            ]
        );
    }
}
