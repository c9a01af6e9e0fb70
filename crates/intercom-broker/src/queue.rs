//! Bounded drop-oldest audio queue.
//!
//! Audio is soft-realtime: when a receiver falls behind, the freshest
//! frames matter and the stale ones do not. The queue therefore never
//! blocks the producer; an enqueue at capacity discards the front element.
//! At ~16 ms per frame the default 10-slot queue holds ~160 ms of audio,
//! which is the audible latency budget.

use bytes::Bytes;
use std::collections::VecDeque;

/// One queued audio frame: the sender's sequence number and PCM payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Sender-assigned sequence number, preserved verbatim by the relay.
    pub seq: u32,
    /// PCM payload.
    pub payload: Bytes,
}

/// Bounded FIFO of audio frames with drop-oldest overflow policy.
#[derive(Debug)]
pub struct AudioQueue {
    frames: VecDeque<AudioFrame>,
    capacity: usize,
    dropped: u64,
}

impl AudioQueue {
    /// Create a queue holding at most `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "audio queue capacity must be non-zero");
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Enqueue a frame, discarding the oldest one if the queue is full.
    ///
    /// Returns the discarded frame, if any. Never blocks.
    pub fn push(&mut self, frame: AudioFrame) -> Option<AudioFrame> {
        let evicted = if self.frames.len() == self.capacity {
            self.dropped += 1;
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Dequeue the oldest retained frame.
    pub fn pop(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    /// Number of frames currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total frames discarded by the drop-oldest policy since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Discard all queued frames.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
