use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use harvester_api::sender::SenderQueueItem;

use super::sender::SenderQueue;

/// Sender queue sizing and retry policy.
#[derive(Debug, Clone, Copy)]
pub struct SenderQueueManagerParam {
    pub queue_capacity: usize,
    pub per_destination_in_flight: usize,
    pub global_in_flight: usize,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub max_attempts: u32,
}

impl Default for SenderQueueManagerParam {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            per_destination_in_flight: 4,
            global_in_flight: 16,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Outcome of a nack.
#[derive(Debug, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
}

struct SenderInner {
    queues: HashMap<String, SenderQueue>,
    global_in_flight: usize,
}

/// Per-destination FIFOs with a global concurrency cap on outstanding
/// in-flight sends.
pub struct SenderQueueManager {
    inner: Mutex<SenderInner>,
    notify: Notify,
    param: SenderQueueManagerParam,
    dead_letter_total: AtomicU64,
}

impl Default for SenderQueueManager {
    fn default() -> Self {
        Self::new(SenderQueueManagerParam::default())
    }
}

impl SenderQueueManager {
    pub fn new(param: SenderQueueManagerParam) -> Self {
        Self {
            inner: Mutex::new(SenderInner { queues: HashMap::new(), global_in_flight: 0 }),
            notify: Notify::new(),
            param,
            dead_letter_total: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SenderInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("sender queue manager lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// O(1). Rejects on full, handing the item back.
    pub fn push(&self, item: SenderQueueItem) -> Result<(), SenderQueueItem> {
        let mut inner = self.lock();
        let queue = inner
            .queues
            .entry(item.destination.clone())
            .or_insert_with(|| {
                SenderQueue::new(
                    item.destination.clone(),
                    self.param.queue_capacity,
                    self.param.per_destination_in_flight,
                )
            });
        queue.push(item)?;
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Non-blocking drain across destinations. Never exceeds per-destination
    /// nor global concurrency caps; preserves FIFO within a destination.
    pub fn try_drain(&self, limit: usize) -> Vec<SenderQueueItem> {
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut out = Vec::new();
        for queue in inner.queues.values_mut() {
            let global_budget = self
                .param
                .global_in_flight
                .saturating_sub(inner.global_in_flight + out.len());
            let budget = limit.saturating_sub(out.len()).min(global_budget);
            if budget == 0 {
                break;
            }
            queue.drain_into(&mut out, budget, now);
        }
        inner.global_in_flight += out.len();
        out
    }

    /// Drain, suspending until items are ready. Wakes on push/ack and polls
    /// pending retry deadlines.
    pub async fn drain(&self, limit: usize) -> Vec<SenderQueueItem> {
        loop {
            let items = self.try_drain(limit);
            if !items.is_empty() {
                return items;
            }
            let wait = self.nearest_deadline_wait();
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn nearest_deadline_wait(&self) -> Duration {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .queues
            .values()
            .filter_map(|q| q.head_deadline())
            .map(|t| t.saturating_duration_since(now))
            .min()
            .unwrap_or(Duration::from_millis(200))
            .max(Duration::from_millis(10))
    }

    /// Successful delivery: release the in-flight slot.
    pub fn on_ack(&self, item: &SenderQueueItem) {
        let mut inner = self.lock();
        if let Some(queue) = inner.queues.get_mut(&item.destination) {
            queue.on_done();
        }
        inner.global_in_flight = inner.global_in_flight.saturating_sub(1);
        drop(inner);
        self.notify.notify_one();
    }

    /// Failed delivery: re-queue at the head with backoff, or dead-letter
    /// beyond `max_attempts`.
    pub fn on_nack(&self, mut item: SenderQueueItem, retry_after: Option<Duration>) -> NackOutcome {
        item.attempt += 1;
        let mut inner = self.lock();
        if let Some(queue) = inner.queues.get_mut(&item.destination) {
            queue.on_done();
        }
        inner.global_in_flight = inner.global_in_flight.saturating_sub(1);

        if item.attempt >= self.param.max_attempts {
            drop(inner);
            self.dead_letter(item);
            return NackOutcome::DeadLettered;
        }

        let delay = retry_after.unwrap_or_else(|| self.backoff_delay(item.attempt));
        let destination = item.destination.clone();
        if let Some(queue) = inner.queues.get_mut(&destination) {
            queue.push_front(item, Instant::now() + delay);
        }
        drop(inner);
        self.notify.notify_one();
        NackOutcome::Requeued
    }

    /// Permanent failure: release the in-flight slot and dead-letter the
    /// item immediately.
    pub fn on_permanent(&self, item: SenderQueueItem) {
        let mut inner = self.lock();
        if let Some(queue) = inner.queues.get_mut(&item.destination) {
            queue.on_done();
        }
        inner.global_in_flight = inner.global_in_flight.saturating_sub(1);
        drop(inner);
        self.dead_letter(item);
        self.notify.notify_one();
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        (self.param.retry_base * 2u32.saturating_pow(shift)).min(self.param.retry_cap)
    }

    fn dead_letter(&self, item: SenderQueueItem) {
        let total = self.dead_letter_total.fetch_add(1, Ordering::Relaxed) + 1;
        // Sampled log: the counter is the primary signal.
        if total == 1 || total % 100 == 0 {
            tracing::warn!(
                destination = %item.destination,
                attempts = item.attempt,
                events = item.event_count,
                dead_letter_total = total,
                "dropping batch after repeated send failures"
            );
        }
    }

    pub fn dead_letter_total(&self) -> u64 {
        self.dead_letter_total.load(Ordering::Relaxed)
    }

    pub fn is_all_empty(&self) -> bool {
        let inner = self.lock();
        inner.queues.values().all(|q| q.is_empty()) && inner.global_in_flight == 0
    }

    pub fn queue_len(&self, destination: &str) -> usize {
        self.lock().queues.get(destination).map_or(0, |q| q.len())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use harvester_api::plugin::QueueKey;

    use super::*;

    fn item(destination: &str, batch_key: u64) -> SenderQueueItem {
        SenderQueueItem::new(
            QueueKey::from_raw(1),
            0,
            destination,
            Bytes::from_static(b"payload"),
            1,
            batch_key,
        )
    }

    fn manager() -> SenderQueueManager {
        SenderQueueManager::new(SenderQueueManagerParam {
            queue_capacity: 4,
            per_destination_in_flight: 2,
            global_in_flight: 3,
            retry_base: Duration::from_millis(10),
            retry_cap: Duration::from_millis(80),
            max_attempts: 3,
        })
    }

    #[test]
    fn drain_respects_global_cap() {
        let m = manager();
        for i in 0..2 {
            m.push(item("a", i)).unwrap();
            m.push(item("b", i)).unwrap();
        }
        let items = m.try_drain(10);
        // 2 per destination allowed, but global cap is 3.
        assert_eq!(items.len(), 3);
        assert!(m.try_drain(10).is_empty());

        for it in &items {
            m.on_ack(it);
        }
        assert_eq!(m.try_drain(10).len(), 1);
    }

    #[test]
    fn nack_requeues_at_head_with_attempt() {
        let m = manager();
        m.push(item("a", 1)).unwrap();
        m.push(item("a", 2)).unwrap();

        let mut items = m.try_drain(1);
        let first = items.remove(0);
        assert_eq!(first.batch_key, 1);
        assert_eq!(m.on_nack(first, Some(Duration::ZERO)), NackOutcome::Requeued);

        // Retried head comes out first again: FIFO preserved.
        let items = m.try_drain(10);
        assert_eq!(items[0].batch_key, 1);
        assert_eq!(items[0].attempt, 1);
        assert_eq!(items[1].batch_key, 2);
    }

    #[test]
    fn exhausted_attempts_dead_letter() {
        let m = manager();
        m.push(item("a", 1)).unwrap();
        let mut outcome = NackOutcome::Requeued;
        for _ in 0..3 {
            let mut items = m.try_drain(1);
            if items.is_empty() {
                break;
            }
            outcome = m.on_nack(items.remove(0), Some(Duration::ZERO));
        }
        assert_eq!(outcome, NackOutcome::DeadLettered);
        assert_eq!(m.dead_letter_total(), 1);
        assert!(m.is_all_empty());
    }

    #[test]
    fn backoff_is_capped() {
        let m = manager();
        assert_eq!(m.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(m.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(m.backoff_delay(4), Duration::from_millis(80));
        assert_eq!(m.backoff_delay(10), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn drain_wakes_on_push() {
        let m = std::sync::Arc::new(manager());
        let waiter = {
            let m = m.clone();
            tokio::spawn(async move { m.drain(4).await })
        };
        tokio::task::yield_now().await;
        m.push(item("a", 7)).unwrap();
        let items = waiter.await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].batch_key, 7);
    }
}
