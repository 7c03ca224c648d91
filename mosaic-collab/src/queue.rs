//! Bounded FIFO buffer for envelopes produced while the channel is
//! closed. Drained in arrival order on the next successful open.

use std::collections::VecDeque;

use crate::protocol::Outbound;

/// What to do with a new envelope when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued envelope to make room.
    #[default]
    DropOldest,
    /// Refuse the new envelope.
    Reject,
}

#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Outbound>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: u64,
    rejected: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            policy,
            dropped: 0,
            rejected: 0,
        }
    }

    /// Queue an envelope for the next flush. Returns `false` if the
    /// envelope was not accepted. A zero-capacity queue accepts nothing,
    /// regardless of policy.
    pub fn enqueue(&mut self, envelope: Outbound) -> bool {
        if self.capacity == 0 {
            self.rejected += 1;
            log::warn!("Outbound queue has zero capacity, dropping envelope");
            return false;
        }
        if self.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    self.items.pop_front();
                    self.dropped += 1;
                    log::warn!(
                        "Outbound queue full ({}), evicted oldest envelope",
                        self.capacity
                    );
                }
                OverflowPolicy::Reject => {
                    self.rejected += 1;
                    log::warn!(
                        "Outbound queue full ({}), rejecting new envelope",
                        self.capacity
                    );
                    return false;
                }
            }
        }
        self.items.push_back(envelope);
        true
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<Outbound> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Envelopes evicted under [`OverflowPolicy::DropOldest`] so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Envelopes refused under [`OverflowPolicy::Reject`] (or zero
    /// capacity) so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
