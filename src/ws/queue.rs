//! Outbound message queue ordered by priority, then age.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::envelope::Envelope;

/// A message waiting to be written to the socket.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub envelope: Envelope,
    /// Higher values are sent first
    pub priority: i32,
    pub enqueued_at: Instant,
    /// Tie-breaker preserving insertion order for equal timestamps
    seq: u64,
}

impl OutboundMessage {
    pub(crate) fn new(envelope: Envelope, priority: i32, enqueued_at: Instant) -> Self {
        Self {
            envelope,
            priority,
            enqueued_at,
            seq: 0,
        }
    }
}

impl PartialEq for OutboundMessage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OutboundMessage {}

impl PartialOrd for OutboundMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// "Greater" pops first from the max-heap: higher priority, then older, then
// inserted earlier.
impl Ord for OutboundMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    heap: BinaryHeap<OutboundMessage>,
    next_seq: u64,
}

impl OutboundQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope, priority: i32, enqueued_at: Instant) {
        self.requeue(OutboundMessage::new(envelope, priority, enqueued_at));
    }

    /// Put a message back, keeping its original enqueue time.
    pub fn requeue(&mut self, mut message: OutboundMessage) {
        message.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(message);
    }

    pub fn pop(&mut self) -> Option<OutboundMessage> {
        self.heap.pop()
    }

    /// Remove up to `max` messages in delivery order.
    pub fn drain_batch(&mut self, max: usize) -> Vec<OutboundMessage> {
        std::iter::from_fn(|| self.heap.pop()).take(max).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
