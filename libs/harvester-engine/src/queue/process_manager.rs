use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use harvester_api::event::EventGroup;
use harvester_api::plugin::{GroupSink, PushError, QueueKey};

use super::Feedback;
use super::bounded::{BoundedProcessQueue, BoundedQueueParam, ProcessQueueItem};

/// Highest numbered priority tier (inclusive); 0 is the highest priority.
pub const MAX_PRIORITY: usize = 3;

/// Default interval a deleted queue lingers before its remaining items are
/// dropped.
pub const DEFAULT_DELETION_GRACE: Duration = Duration::from_secs(120);

struct QueueSlot {
    queue: BoundedProcessQueue,
    priority: usize,
}

struct Inner {
    queues: HashMap<QueueKey, QueueSlot>,
    /// Round-robin rings, one per tier, in pipeline-entry order.
    tiers: [Vec<QueueKey>; MAX_PRIORITY + 1],
    /// Next-candidate pointer per tier.
    rr: [usize; MAX_PRIORITY + 1],
    keys_by_name: HashMap<String, QueueKey>,
    /// Queues marked for deletion and when they were marked.
    deletion_times: HashMap<QueueKey, Instant>,
}

/// Multi-tier priority scheduler over bounded process queues.
///
/// Strict priority between tiers, round-robin within a tier. The
/// round-robin pointer only advances past a queue when an item was served
/// from it; empty or disabled queues are skipped without losing their turn.
pub struct ProcessQueueManager {
    inner: Mutex<Inner>,
    notify: Notify,
    next_key: AtomicU64,
    deletion_grace: Duration,
}

impl Default for ProcessQueueManager {
    fn default() -> Self {
        Self::new(DEFAULT_DELETION_GRACE)
    }
}

impl ProcessQueueManager {
    pub fn new(deletion_grace: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                tiers: Default::default(),
                rr: [0; MAX_PRIORITY + 1],
                keys_by_name: HashMap::new(),
                deletion_times: HashMap::new(),
            }),
            notify: Notify::new(),
            next_key: AtomicU64::new(1),
            deletion_grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("process queue manager lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Stable key for a pipeline name; minted on first use and reused
    /// across reloads so queues survive them.
    pub fn key_for(&self, config_name: &str) -> QueueKey {
        let mut inner = self.lock();
        if let Some(key) = inner.keys_by_name.get(config_name) {
            return *key;
        }
        let key = QueueKey::from_raw(self.next_key.fetch_add(1, Ordering::Relaxed));
        inner.keys_by_name.insert(config_name.to_string(), key);
        key
    }

    /// Create a queue, or move an existing one to a new priority tier.
    ///
    /// The queue is reused when the capacity matches (preserving in-flight
    /// items); a capacity change recreates it. Returns true if a new queue
    /// was created.
    pub fn create_or_update(
        &self,
        key: QueueKey,
        priority: usize,
        config_name: &str,
        param: BoundedQueueParam,
    ) -> bool {
        let priority = priority.min(MAX_PRIORITY);
        let mut inner = self.lock();
        inner.deletion_times.remove(&key);

        let existing = inner
            .queues
            .get(&key)
            .map(|s| (s.queue.param(), s.priority, s.queue.len()));
        let created = match existing {
            Some((old_param, old_priority, _)) if old_param == param => {
                if old_priority != priority {
                    remove_from_tier(&mut inner, key, old_priority);
                    inner.tiers[priority].push(key);
                }
                if let Some(slot) = inner.queues.get_mut(&key) {
                    slot.priority = priority;
                    slot.queue.enable_pop();
                }
                false
            }
            Some((_, old_priority, dropped)) => {
                if dropped > 0 {
                    tracing::warn!(
                        config = %config_name,
                        dropped,
                        "queue capacity changed on update, dropping in-flight items"
                    );
                }
                remove_from_tier(&mut inner, key, old_priority);
                inner.queues.insert(
                    key,
                    QueueSlot {
                        queue: BoundedProcessQueue::new(key, config_name, param),
                        priority,
                    },
                );
                inner.tiers[priority].push(key);
                true
            }
            None => {
                inner.queues.insert(
                    key,
                    QueueSlot {
                        queue: BoundedProcessQueue::new(key, config_name, param),
                        priority,
                    },
                );
                inner.tiers[priority].push(key);
                true
            }
        };
        drop(inner);
        // New or re-enabled queue may unblock a suspended scheduler.
        self.notify.notify_one();
        created
    }

    /// Mark the queue for deletion. Removal is deferred until the queue is
    /// empty or the grace window elapses (see [`Self::gc_deleted`]).
    pub fn delete(&self, key: QueueKey) {
        let mut inner = self.lock();
        if inner.queues.contains_key(&key) {
            inner.deletion_times.entry(key).or_insert_with(Instant::now);
        }
    }

    /// Reap queues marked for deletion that are drained or out of grace.
    pub fn gc_deleted(&self) {
        let mut inner = self.lock();
        let due: Vec<QueueKey> = inner
            .deletion_times
            .iter()
            .filter(|(key, marked)| {
                let empty = inner.queues.get(key).is_none_or(|s| s.queue.is_empty());
                empty || marked.elapsed() >= self.deletion_grace
            })
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            inner.deletion_times.remove(&key);
            if let Some(slot) = inner.queues.remove(&key) {
                if !slot.queue.is_empty() {
                    tracing::warn!(
                        config = %slot.queue.config_name(),
                        dropped = slot.queue.len(),
                        "deletion grace elapsed, dropping queued items"
                    );
                }
                remove_from_tier(&mut inner, key, slot.priority);
                inner
                    .keys_by_name
                    .retain(|_, k| *k != key);
            }
        }
    }

    pub fn register_feedback(&self, key: QueueKey, feedback: std::sync::Arc<dyn Feedback>) {
        let mut inner = self.lock();
        if let Some(slot) = inner.queues.get_mut(&key) {
            slot.queue.register_feedback(feedback);
        }
    }

    pub fn disable_pop(&self, key: QueueKey) {
        let mut inner = self.lock();
        if let Some(slot) = inner.queues.get_mut(&key) {
            slot.queue.disable_pop();
        }
    }

    pub fn enable_pop(&self, key: QueueKey) {
        let mut inner = self.lock();
        if let Some(slot) = inner.queues.get_mut(&key) {
            slot.queue.enable_pop();
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn is_all_empty(&self) -> bool {
        self.lock().queues.values().all(|s| s.queue.is_empty())
    }

    pub fn queue_len(&self, key: QueueKey) -> Option<usize> {
        self.lock().queues.get(&key).map(|s| s.queue.len())
    }

    /// Scheduling decision: strict priority across tiers, round-robin
    /// within one. Non-blocking.
    pub fn try_pop(&self) -> Option<(QueueKey, ProcessQueueItem)> {
        let mut inner = self.lock();
        for tier in 0..=MAX_PRIORITY {
            let n = inner.tiers[tier].len();
            for i in 0..n {
                let idx = (inner.rr[tier] + i) % n;
                let key = inner.tiers[tier][idx];
                if let Some(slot) = inner.queues.get_mut(&key) {
                    if let Some(item) = slot.queue.pop() {
                        inner.rr[tier] = (idx + 1) % n;
                        return Some((key, item));
                    }
                }
            }
        }
        None
    }

    /// Scheduling decision; suspends until an item is available. Wakes on
    /// any push, enable-pop, or new-queue event.
    pub async fn next(&self) -> (QueueKey, ProcessQueueItem) {
        loop {
            if let Some(served) = self.try_pop() {
                // Cascade: let a sibling worker pick up remaining items.
                if !self.is_all_empty() {
                    self.notify.notify_one();
                }
                return served;
            }
            self.notify.notified().await;
        }
    }
}

fn remove_from_tier(inner: &mut Inner, key: QueueKey, priority: usize) {
    if let Some(pos) = inner.tiers[priority].iter().position(|k| *k == key) {
        inner.tiers[priority].remove(pos);
        let len = inner.tiers[priority].len();
        if len == 0 {
            inner.rr[priority] = 0;
        } else {
            if pos < inner.rr[priority] {
                inner.rr[priority] -= 1;
            }
            inner.rr[priority] %= len;
        }
    }
}

impl GroupSink for ProcessQueueManager {
    fn push(&self, key: QueueKey, mut group: EventGroup) -> Result<(), PushError> {
        group.seal();
        let mut inner = self.lock();
        if inner.deletion_times.contains_key(&key) {
            return Err(PushError::QueueNotFound);
        }
        let Some(slot) = inner.queues.get_mut(&key) else {
            return Err(PushError::QueueNotFound);
        };
        match slot.queue.push(ProcessQueueItem::new(group)) {
            Ok(()) => {
                drop(inner);
                self.notify.notify_one();
                Ok(())
            }
            Err(item) => Err(PushError::QueueFull(item.group)),
        }
    }

    fn is_valid_to_push(&self, key: QueueKey) -> bool {
        let inner = self.lock();
        if inner.deletion_times.contains_key(&key) {
            return false;
        }
        inner
            .queues
            .get(&key)
            .map(|s| s.queue.is_valid_to_push())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use harvester_api::event::GroupMetadata;

    use super::*;

    fn group(source: &str) -> EventGroup {
        let mut g = EventGroup::new(GroupMetadata::default());
        g.metadata_mut().source = source.to_string();
        g
    }

    fn manager() -> ProcessQueueManager {
        ProcessQueueManager::new(Duration::from_secs(1))
    }

    #[test]
    fn bounded_push_pop_scenario() {
        // S1: capacity 3 at priority 2.
        let m = manager();
        let key = m.key_for("p");
        m.create_or_update(key, 2, "p", BoundedQueueParam::new(3));

        for i in 1..=3 {
            assert!(m.push(key, group(&format!("i{i}"))).is_ok());
        }
        assert!(matches!(
            m.push(key, group("i4")),
            Err(PushError::QueueFull(_))
        ));

        for i in 1..=3 {
            let (k, item) = m.try_pop().unwrap();
            assert_eq!(k, key);
            assert_eq!(item.group.metadata().source, format!("i{i}"));
        }
        assert!(m.try_pop().is_none());
    }

    #[test]
    fn round_robin_within_tier() {
        // S2: two queues in one tier interleave without reordering within
        // either queue.
        let m = manager();
        let ka = m.key_for("a");
        let kb = m.key_for("b");
        m.create_or_update(ka, 1, "a", BoundedQueueParam::new(4));
        m.create_or_update(kb, 1, "b", BoundedQueueParam::new(4));

        m.push(ka, group("a1")).unwrap();
        m.push(ka, group("a2")).unwrap();
        m.push(kb, group("b1")).unwrap();
        m.push(kb, group("b2")).unwrap();

        let order: Vec<String> = (0..4)
            .map(|_| m.try_pop().unwrap().1.group.metadata().source.clone())
            .collect();
        assert_eq!(order, vec!["a1", "b1", "a2", "b2"]);
        assert!(m.try_pop().is_none());
        assert!(m.try_pop().is_none());
    }

    #[test]
    fn strict_priority_between_tiers() {
        let m = manager();
        let hi = m.key_for("hi");
        let lo = m.key_for("lo");
        m.create_or_update(hi, 0, "hi", BoundedQueueParam::new(4));
        m.create_or_update(lo, 3, "lo", BoundedQueueParam::new(4));

        m.push(lo, group("lo1")).unwrap();
        m.push(hi, group("hi1")).unwrap();
        m.push(hi, group("hi2")).unwrap();

        assert_eq!(m.try_pop().unwrap().1.group.metadata().source, "hi1");
        assert_eq!(m.try_pop().unwrap().1.group.metadata().source, "hi2");
        assert_eq!(m.try_pop().unwrap().1.group.metadata().source, "lo1");
    }

    #[test]
    fn disabled_queue_keeps_its_turn() {
        let m = manager();
        let ka = m.key_for("a");
        let kb = m.key_for("b");
        m.create_or_update(ka, 1, "a", BoundedQueueParam::new(4));
        m.create_or_update(kb, 1, "b", BoundedQueueParam::new(4));
        m.push(ka, group("a1")).unwrap();
        m.push(kb, group("b1")).unwrap();
        m.push(kb, group("b2")).unwrap();

        m.disable_pop(ka);
        assert_eq!(m.try_pop().unwrap().1.group.metadata().source, "b1");
        m.enable_pop(ka);
        // `a` did not lose its position while disabled.
        assert_eq!(m.try_pop().unwrap().1.group.metadata().source, "a1");
        assert_eq!(m.try_pop().unwrap().1.group.metadata().source, "b2");
    }

    #[test]
    fn round_robin_fairness_window() {
        // Property 5: with 3 non-empty queues, any window of 6 pops serves
        // each queue exactly twice.
        let m = manager();
        let keys: Vec<QueueKey> = (0..3)
            .map(|i| {
                let name = format!("q{i}");
                let k = m.key_for(&name);
                m.create_or_update(k, 1, &name, BoundedQueueParam::new(8));
                k
            })
            .collect();
        for k in &keys {
            for _ in 0..2 {
                m.push(*k, group("x")).unwrap();
            }
        }
        let mut counts = HashMap::new();
        for _ in 0..6 {
            let (k, _) = m.try_pop().unwrap();
            *counts.entry(k).or_insert(0usize) += 1;
        }
        for k in &keys {
            assert_eq!(counts[k], 2);
        }
    }

    #[test]
    fn key_is_stable_per_config_name() {
        let m = manager();
        let k1 = m.key_for("p");
        let k2 = m.key_for("p");
        assert_eq!(k1, k2);
        assert_ne!(k1, m.key_for("other"));
    }

    #[test]
    fn deleted_queue_rejects_push_and_gcs_when_empty() {
        let m = manager();
        let key = m.key_for("p");
        m.create_or_update(key, 1, "p", BoundedQueueParam::new(2));
        m.push(key, group("g1")).unwrap();
        m.delete(key);

        assert!(matches!(
            m.push(key, group("g2")),
            Err(PushError::QueueNotFound)
        ));
        // Still holds an item: not reaped yet (grace not elapsed).
        m.gc_deleted();
        assert_eq!(m.queue_len(key), Some(1));

        m.try_pop().unwrap();
        m.gc_deleted();
        assert_eq!(m.queue_len(key), None);
    }

    #[tokio::test]
    async fn next_wakes_on_push() {
        let m = std::sync::Arc::new(manager());
        let key = m.key_for("p");
        m.create_or_update(key, 0, "p", BoundedQueueParam::new(2));

        let waiter = {
            let m = m.clone();
            tokio::spawn(async move { m.next().await.1.group.metadata().source.clone() })
        };
        tokio::task::yield_now().await;
        m.push(key, group("wake")).unwrap();
        let source = waiter.await.unwrap();
        assert_eq!(source, "wake");
    }
}
