use std::collections::VecDeque;
use std::time::Instant;

use harvester_api::sender::SenderQueueItem;

/// One serialized batch with its earliest-send deadline.
#[derive(Debug)]
pub struct PendingSend {
    pub item: SenderQueueItem,
    pub next_send: Option<Instant>,
}

/// Per-destination FIFO of serialized batches awaiting network send.
///
/// Strict FIFO: a retry-delayed head blocks the whole destination, which is
/// what keeps per-destination ordering (and exactly-once) intact.
#[derive(Debug)]
pub struct SenderQueue {
    destination: String,
    items: VecDeque<PendingSend>,
    capacity: usize,
    in_flight: usize,
    max_in_flight: usize,
}

impl SenderQueue {
    pub fn new(destination: impl Into<String>, capacity: usize, max_in_flight: usize) -> Self {
        Self {
            destination: destination.into(),
            items: VecDeque::new(),
            capacity,
            in_flight: 0,
            max_in_flight,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// O(1). Rejects on full, handing the item back.
    pub fn push(&mut self, item: SenderQueueItem) -> Result<(), SenderQueueItem> {
        if self.items.len() == self.capacity {
            return Err(item);
        }
        self.items.push_back(PendingSend { item, next_send: None });
        Ok(())
    }

    /// Re-queue a nacked item at the head with its retry deadline.
    pub fn push_front(&mut self, item: SenderQueueItem, next_send: Instant) {
        self.items.push_front(PendingSend { item, next_send: Some(next_send) });
    }

    /// Move ready head items into `out`, preserving order. Respects the
    /// per-destination in-flight cap and the caller's remaining budget.
    /// Returns how many items were taken.
    pub fn drain_into(
        &mut self,
        out: &mut Vec<SenderQueueItem>,
        budget: usize,
        now: Instant,
    ) -> usize {
        let mut taken = 0;
        while taken < budget && self.in_flight < self.max_in_flight {
            match self.items.front() {
                Some(pending) if pending.next_send.is_none_or(|t| t <= now) => {
                    if let Some(pending) = self.items.pop_front() {
                        out.push(pending.item);
                        self.in_flight += 1;
                        taken += 1;
                    }
                }
                _ => break,
            }
        }
        taken
    }

    /// Earliest deadline blocking the head, if any.
    pub fn head_deadline(&self) -> Option<Instant> {
        self.items.front().and_then(|p| p.next_send)
    }

    /// One outstanding send resolved (ack or nack).
    pub fn on_done(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use harvester_api::plugin::QueueKey;

    use super::*;

    fn item(batch_key: u64) -> SenderQueueItem {
        SenderQueueItem::new(QueueKey::from_raw(1), 0, "dest", Bytes::new(), 1, batch_key)
    }

    #[test]
    fn rejects_on_full() {
        let mut q = SenderQueue::new("dest", 2, 8);
        q.push(item(1)).unwrap();
        q.push(item(2)).unwrap();
        assert!(q.push(item(3)).is_err());
    }

    #[test]
    fn drain_preserves_order_and_caps_in_flight() {
        let mut q = SenderQueue::new("dest", 8, 2);
        for i in 0..4 {
            q.push(item(i)).unwrap();
        }
        let mut out = Vec::new();
        let taken = q.drain_into(&mut out, 10, Instant::now());
        assert_eq!(taken, 2);
        assert_eq!(out[0].batch_key, 0);
        assert_eq!(out[1].batch_key, 1);

        q.on_done();
        let taken = q.drain_into(&mut out, 10, Instant::now());
        assert_eq!(taken, 1);
        assert_eq!(out[2].batch_key, 2);
    }

    #[test]
    fn delayed_head_blocks_destination() {
        let mut q = SenderQueue::new("dest", 8, 8);
        q.push(item(2)).unwrap();
        let retried = item(1);
        q.push_front(retried, Instant::now() + std::time::Duration::from_secs(60));

        let mut out = Vec::new();
        assert_eq!(q.drain_into(&mut out, 10, Instant::now()), 0);
        assert!(out.is_empty());
    }
}
