//! Realtime output through rodio.
//!
//! rodio pulls interleaved samples from a [`Source`]; [`EngineSource`]
//! answers by running one engine block whenever its buffer runs dry. The
//! device thread therefore owns the [`Engine`] outright and only talks to
//! the rest of the program through the engine's command and event rings.

use crate::engine::Engine;
use anyhow::{Context, Result};
use rodio::{OutputStream, OutputStreamHandle, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Interleaving adapter from engine blocks to a sample stream.
pub struct EngineSource {
    engine: Engine,
    left_buf: Vec<f32>,
    right_buf: Vec<f32>,
    /// Current frame in the buffers.
    buf_pos: usize,
    /// 0 = left, 1 = right.
    channel: usize,
}

impl EngineSource {
    pub fn new(engine: Engine, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            engine,
            left_buf: vec![0.0; block_size],
            right_buf: vec![0.0; block_size],
            // Start at the end to render on the first pull.
            buf_pos: block_size,
            channel: 0,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Iterator for EngineSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buf_pos >= self.left_buf.len() {
            self.engine
                .process_block(&mut self.left_buf, &mut self.right_buf);
            self.buf_pos = 0;
        }

        let sample = if self.channel == 0 {
            self.left_buf[self.buf_pos]
        } else {
            self.right_buf[self.buf_pos]
        };

        self.channel = 1 - self.channel;
        if self.channel == 0 {
            self.buf_pos += 1;
        }

        Some(sample)
    }
}

impl Source for EngineSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        self.engine.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// An open output device playing an engine.
///
/// Dropping it closes the stream and with it the engine.
pub struct RealtimeOutput {
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
}

impl RealtimeOutput {
    /// Opens the default output device and starts pulling from `engine`.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device can be opened.
    pub fn start(engine: Engine, block_size: usize) -> Result<Self> {
        let (stream, stream_handle) =
            OutputStream::try_default().context("Failed to open audio output")?;
        stream_handle
            .play_raw(EngineSource::new(engine, block_size))
            .context("Failed to start audio playback")?;
        tracing::info!("Realtime output started (block {})", block_size);
        Ok(Self {
            _stream: stream,
            _stream_handle: stream_handle,
        })
    }
}

/// Drives an engine at device pace without a device.
///
/// Used on headless machines: blocks are rendered on a timer thread and
/// discarded, so commands, events and live notes behave as with a device.
pub struct NullOutput {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Engine>>,
}

impl NullOutput {
    /// Starts the timer thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(mut engine: Engine, block_size: usize) -> Result<Self> {
        let block_size = block_size.max(1);
        let period = Duration::from_secs_f64(block_size as f64 / engine.sample_rate() as f64);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("beatline-null-output".into())
            .spawn(move || {
                let mut left = vec![0.0f32; block_size];
                let mut right = vec![0.0f32; block_size];
                let mut next = Instant::now();
                while !flag.load(Ordering::Relaxed) {
                    engine.process_block(&mut left, &mut right);
                    next += period;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        std::thread::sleep(wait);
                    }
                }
                engine
            })
            .context("Failed to start null output thread")?;
        tracing::info!("Null output started (block {})", block_size);
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stops the timer thread and hands the engine back.
    pub fn stop(mut self) -> Option<Engine> {
        self.halt()
    }

    fn halt(&mut self) -> Option<Engine> {
        self.stop.store(true, Ordering::Relaxed);
        self.thread.take().and_then(|t| t.join().ok())
    }
}

impl Drop for NullOutput {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{engine_channel, Command, EngineEvent};
    use crate::engine::TransportState;

    #[test]
    fn test_pulls_whole_blocks() {
        let engine = Engine::new(44_100, 64, 4);
        let mut source = EngineSource::new(engine, 64);
        assert_eq!(source.engine().now(), 0);
        source.next();
        assert_eq!(source.engine().now(), 64);
        // 64 frames are 128 interleaved samples.
        for _ in 0..127 {
            source.next();
        }
        assert_eq!(source.engine().now(), 64);
        source.next();
        assert_eq!(source.engine().now(), 128);
    }

    #[test]
    fn test_reports_engine_format() {
        let source = EngineSource::new(Engine::new(48_000, 128, 1), 128);
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), 48_000);
        assert_eq!(source.total_duration(), None);
    }

    #[test]
    fn test_commands_reach_engine_between_blocks() {
        let (mut control, audio) = engine_channel(16, 16);
        let engine = Engine::new(44_100, 32, 2).with_endpoint(audio);
        let mut source = EngineSource::new(engine, 32);
        control.send(Command::TransportStart(Some(1.0))).unwrap();
        let silent = source.by_ref().take(64).all(|s| s == 0.0);
        assert!(silent);
        assert_eq!(source.engine().clock().state(), TransportState::Playing);
        let events = control.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::State {
                state: TransportState::Playing,
                ..
            }
        )));
    }

    #[test]
    fn test_null_output_advances_engine() {
        let output = NullOutput::start(Engine::new(8_000, 80, 1), 80).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let engine = output.stop().unwrap();
        assert!(engine.now() >= 80);
        assert_eq!(engine.now() % 80, 0);
    }
}
