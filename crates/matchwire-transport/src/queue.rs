//! The bounded per-peer outbound queue.
//!
//! Every peer's outbound path goes through one of these. The queue is
//! bounded (default 256 frames) and its overflow policy is asymmetric:
//! non-critical frames make room by dropping the *oldest* non-critical
//! frame, while critical frames (MOVE, GAME_START, GAME_END, terminal
//! STATE_SYNC) are never dropped — a queue that overflows while holding
//! only critical frames aborts the connection instead.

use std::collections::VecDeque;

use matchwire_protocol::Envelope;

/// Default queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePush {
    /// The frame was queued; nothing was displaced.
    Queued,
    /// The frame was queued after evicting the oldest non-critical
    /// frame. The evicted tag is reported for logging.
    Displaced { dropped_tag: &'static str },
    /// The queue is full of critical frames and the incoming frame is
    /// critical too. The connection must close with BACKPRESSURE_ABORT.
    CriticalOverflow,
    /// The queue is full of critical frames; the incoming non-critical
    /// frame itself was dropped.
    Rejected,
}

/// Bounded FIFO of envelopes with the critical-frame overflow policy.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    frames: VecDeque<Envelope>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    /// Enqueues a frame, applying the overflow policy when full.
    pub fn push(&mut self, envelope: Envelope) -> QueuePush {
        if self.frames.len() < self.capacity {
            self.frames.push_back(envelope);
            return QueuePush::Queued;
        }

        // Full. Look for the oldest non-critical frame to displace.
        let victim = self
            .frames
            .iter()
            .position(|e| !e.message.is_critical());

        match victim {
            Some(idx) => {
                let dropped = self
                    .frames
                    .remove(idx)
                    .map(|e| e.message.tag())
                    .unwrap_or("?");
                self.frames.push_back(envelope);
                QueuePush::Displaced { dropped_tag: dropped }
            }
            None if envelope.message.is_critical() => {
                QueuePush::CriticalOverflow
            }
            None => QueuePush::Rejected,
        }
    }

    /// Dequeues the oldest frame.
    pub fn pop(&mut self) -> Option<Envelope> {
        self.frames.pop_front()
    }

    /// Puts a frame back at the head (a send that failed mid-flush, or
    /// a rejoin that must precede everything queued). Bypasses the
    /// capacity check: the frame was either already accounted for or
    /// must not be lost.
    pub fn push_front(&mut self, envelope: Envelope) {
        self.frames.push_front(envelope);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}
