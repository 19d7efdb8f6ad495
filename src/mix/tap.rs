//! Capture tap after the master limiter.
//!
//! Copies the interleaved master output into a lock-free ring read by a
//! recorder on another thread. The audio side never waits: a block that
//! does not fit is dropped whole and counted.

use rtrb::{Consumer, Producer, RingBuffer};

/// Creates a tap and the consumer that drains it.
///
/// # Arguments
///
/// * `frames` - Ring capacity in stereo frames
pub fn capture_ring(frames: usize) -> (CaptureTap, Consumer<f32>) {
    let (producer, consumer) = RingBuffer::<f32>::new(frames.max(1) * 2);
    (CaptureTap::new(producer), consumer)
}

pub struct CaptureTap {
    producer: Producer<f32>,
    dropped_frames: u64,
}

impl std::fmt::Debug for CaptureTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureTap")
            .field("free_slots", &self.producer.slots())
            .field("dropped_frames", &self.dropped_frames)
            .finish()
    }
}

impl CaptureTap {
    pub fn new(producer: Producer<f32>) -> Self {
        Self {
            producer,
            dropped_frames: 0,
        }
    }

    /// Writes one block. Returns false if it was dropped.
    pub fn write(&mut self, left: &[f32], right: &[f32]) -> bool {
        let frames = left.len().min(right.len());
        if self.producer.slots() < frames * 2 {
            self.dropped_frames += frames as u64;
            return false;
        }
        for (l, r) in left.iter().zip(right.iter()) {
            // Space was checked above.
            let _ = self.producer.push(*l);
            let _ = self.producer.push(*r);
        }
        true
    }

    /// Returns and resets the dropped frame count.
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped_frames)
    }

    /// True once the reading side is gone.
    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaves_blocks() {
        let (mut tap, mut consumer) = capture_ring(8);
        assert!(tap.write(&[0.1, 0.2], &[-0.1, -0.2]));
        let mut out = Vec::new();
        while let Ok(s) = consumer.pop() {
            out.push(s);
        }
        assert_eq!(out, vec![0.1, -0.1, 0.2, -0.2]);
    }

    #[test]
    fn test_full_ring_drops_whole_block() {
        let (mut tap, consumer) = capture_ring(3);
        assert!(tap.write(&[0.0; 2], &[0.0; 2]));
        assert!(!tap.write(&[0.0; 2], &[0.0; 2]));
        assert_eq!(consumer.slots(), 4);
        assert_eq!(tap.take_dropped(), 2);
        assert_eq!(tap.take_dropped(), 0);
    }
}
