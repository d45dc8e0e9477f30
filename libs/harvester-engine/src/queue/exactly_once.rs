use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use harvester_api::event::EventGroup;
use harvester_api::plugin::{PushError, QueueKey};
use harvester_api::sender::SenderQueueItem;

use crate::checkpoint::{CheckpointState, CheckpointStore, RangeCheckpoint};
use crate::error::EngineError;

use super::bounded::BoundedQueueParam;
use super::process_manager::ProcessQueueManager;

/// Why an exactly-once push was refused. The item is handed back so the
/// producer can retry or park it.
#[derive(Debug)]
pub enum EoPushError {
    /// This hash key already has a checkpoint in `Sending` state; the
    /// producer must wait for resolution.
    Busy(SenderQueueItem),
    /// The queue hit a checkpoint IO error and accepts no new pushes.
    ReadOnly(SenderQueueItem),
    QueueNotFound(SenderQueueItem),
    QueueFull(SenderQueueItem),
}

struct EoSenderQueue {
    config_name: String,
    store: CheckpointStore,
    items: VecDeque<SenderQueueItem>,
    /// Hash keys with an item queued or in flight.
    active: HashSet<String>,
    capacity: usize,
    read_only: bool,
}

struct EoInner {
    queues: HashMap<QueueKey, EoSenderQueue>,
    deletion_times: HashMap<QueueKey, Instant>,
}

/// Checkpoint-anchored queue pair.
///
/// The process side delegates to the shared scheduler so exactly-once
/// pipelines keep global priority fairness; the sender side anchors every
/// item to a persistent range checkpoint, giving at-most-one delivery per
/// `(hash_key, sequence_id)`.
pub struct ExactlyOnceQueueManager {
    process: Arc<ProcessQueueManager>,
    process_param: BoundedQueueParam,
    inner: Mutex<EoInner>,
    notify: Notify,
    deletion_grace: Duration,
    sender_capacity: usize,
    /// Checkpoints stuck in `Sending` after a permanent failure, awaiting
    /// operator intervention.
    stuck_sending_total: AtomicU64,
    orphan_ack_total: AtomicU64,
}

impl ExactlyOnceQueueManager {
    pub fn new(process: Arc<ProcessQueueManager>, deletion_grace: Duration) -> Self {
        Self {
            process,
            process_param: BoundedQueueParam::new(20),
            inner: Mutex::new(EoInner { queues: HashMap::new(), deletion_times: HashMap::new() }),
            notify: Notify::new(),
            deletion_grace,
            sender_capacity: 100,
            stuck_sending_total: AtomicU64::new(0),
            orphan_ack_total: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EoInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("exactly-once queue manager lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Create the queue pair for one exactly-once pipeline, or refresh an
    /// existing one. The checkpoint store is kept across updates so
    /// in-flight ranges survive reloads.
    pub fn create_or_update_queue(
        &self,
        key: QueueKey,
        priority: usize,
        config_name: &str,
        checkpoint_path: &Path,
    ) -> Result<(), EngineError> {
        self.process
            .create_or_update(key, priority, config_name, self.process_param);
        let mut inner = self.lock();
        inner.deletion_times.remove(&key);
        if inner.queues.contains_key(&key) {
            return Ok(());
        }
        let store = CheckpointStore::open(checkpoint_path)
            .map_err(|e| e.with_context(format!("pipeline '{config_name}'")))?;
        inner.queues.insert(
            key,
            EoSenderQueue {
                config_name: config_name.to_string(),
                store,
                items: VecDeque::new(),
                active: HashSet::new(),
                capacity: self.sender_capacity,
                read_only: false,
            },
        );
        Ok(())
    }

    /// Mark the queue pair for deletion. Reaping is deferred to
    /// [`Self::clear_timeout_queues`].
    pub fn delete_queue(&self, key: QueueKey) {
        self.process.delete(key);
        let mut inner = self.lock();
        if inner.queues.contains_key(&key) {
            inner.deletion_times.entry(key).or_insert_with(Instant::now);
        }
    }

    /// Push into the pipeline's process queue (shared scheduler).
    pub fn push_process_queue(&self, key: QueueKey, group: EventGroup) -> Result<(), PushError> {
        use harvester_api::plugin::GroupSink;
        self.process.push(key, group)
    }

    /// Checkpoints left in `Sending` by a previous run. The caller rebuilds
    /// each item from its recorded range and re-enqueues it via `rebuild`.
    /// Returns how many items were restored.
    pub fn recover(
        &self,
        key: QueueKey,
        rebuild: &dyn Fn(&RangeCheckpoint) -> Option<SenderQueueItem>,
    ) -> usize {
        let mut inner = self.lock();
        let Some(queue) = inner.queues.get_mut(&key) else {
            return 0;
        };
        let pending: Vec<RangeCheckpoint> = queue
            .store
            .checkpoints()
            .filter(|cp| cp.state == CheckpointState::Sending && !queue.active.contains(&cp.hash_key))
            .cloned()
            .collect();
        let mut restored = 0;
        for cp in pending {
            let Some(mut item) = rebuild(&cp) else {
                continue;
            };
            item.hash_key = Some(cp.hash_key.clone());
            item.sequence_id = Some(cp.sequence_id);
            queue.active.insert(cp.hash_key.clone());
            queue.items.push_back(item);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(
                config = %queue.config_name,
                restored,
                "restored in-flight exactly-once ranges from checkpoints"
            );
            drop(inner);
            self.notify.notify_one();
        }
        restored
    }

    /// Push a serialized batch, transitioning its checkpoint
    /// `Unsent → Sending` and persisting the transition before the item is
    /// released to the sender loop.
    pub fn push_sender(
        &self,
        key: QueueKey,
        mut item: SenderQueueItem,
        read_offset: u64,
        write_offset: u64,
    ) -> Result<(), EoPushError> {
        let (Some(hash_key), Some(sequence_id)) = (item.hash_key.clone(), item.sequence_id) else {
            tracing::warn!("exactly-once sender item without hash key, dropping");
            return Err(EoPushError::QueueNotFound(item));
        };
        let mut inner = self.lock();
        if inner.deletion_times.contains_key(&key) {
            return Err(EoPushError::QueueNotFound(item));
        }
        let Some(queue) = inner.queues.get_mut(&key) else {
            return Err(EoPushError::QueueNotFound(item));
        };
        if queue.read_only {
            return Err(EoPushError::ReadOnly(item));
        }
        if queue.items.len() >= queue.capacity {
            return Err(EoPushError::QueueFull(item));
        }
        // At-most-one in-flight per hash key.
        if queue.active.contains(&hash_key)
            || queue
                .store
                .get(&hash_key)
                .is_some_and(|cp| cp.state == CheckpointState::Sending)
        {
            return Err(EoPushError::Busy(item));
        }
        let result = queue.store.put(RangeCheckpoint {
            hash_key: hash_key.clone(),
            sequence_id,
            read_offset,
            write_offset,
            state: CheckpointState::Sending,
        });
        if let Err(e) = result {
            queue.read_only = true;
            tracing::error!(
                config = %queue.config_name,
                error = %e,
                "checkpoint write failed, queue is now read-only"
            );
            return Err(EoPushError::ReadOnly(item));
        }
        item.attempt = 0;
        queue.active.insert(hash_key);
        queue.items.push_back(item);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Non-blocking drain across all exactly-once queues, FIFO within each.
    /// Re-queued items whose checkpoint returned to `Unsent` are moved back
    /// to `Sending` (persisted) before release.
    pub fn try_drain(&self, limit: usize) -> Vec<(QueueKey, SenderQueueItem)> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        let keys: Vec<QueueKey> = inner.queues.keys().copied().collect();
        for key in keys {
            if out.len() >= limit {
                break;
            }
            let Some(queue) = inner.queues.get_mut(&key) else {
                continue;
            };
            while out.len() < limit {
                let Some(item) = queue.items.front() else {
                    break;
                };
                let hash_key = item.hash_key.clone().unwrap_or_default();
                let needs_transition = queue
                    .store
                    .get(&hash_key)
                    .is_some_and(|cp| cp.state == CheckpointState::Unsent);
                if needs_transition {
                    if let Err(e) = queue.store.transition(&hash_key, CheckpointState::Sending) {
                        queue.read_only = true;
                        tracing::error!(
                            config = %queue.config_name,
                            error = %e,
                            "checkpoint write failed, queue is now read-only"
                        );
                        break;
                    }
                }
                if let Some(item) = queue.items.pop_front() {
                    out.push((key, item));
                }
            }
        }
        out
    }

    /// Drain, suspending until items are ready.
    pub async fn drain(&self, limit: usize) -> Vec<(QueueKey, SenderQueueItem)> {
        loop {
            let items = self.try_drain(limit);
            if !items.is_empty() {
                return items;
            }
            self.notify.notified().await;
        }
    }

    /// Ack: checkpoint advances to `Acked` durably; only then is the range
    /// eligible for truncation. Acks for queues that are gone are no-ops.
    pub fn on_ack(&self, key: QueueKey, item: &SenderQueueItem) {
        let mut inner = self.lock();
        let Some(queue) = inner.queues.get_mut(&key) else {
            self.orphan_ack_total.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(hash_key) = item.hash_key.as_deref() else {
            return;
        };
        if let Err(e) = queue.store.transition(hash_key, CheckpointState::Acked) {
            tracing::warn!(config = %queue.config_name, error = %e, "checkpoint ack failed");
        }
        queue.active.remove(hash_key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Recoverable nack: the checkpoint returns to `Unsent` and the item
    /// re-enters its queue. Permanent nack: the checkpoint is preserved in
    /// `Sending` for operator intervention and the item is dropped.
    pub fn on_nack(&self, key: QueueKey, item: SenderQueueItem, recoverable: bool) {
        let mut inner = self.lock();
        let Some(queue) = inner.queues.get_mut(&key) else {
            self.orphan_ack_total.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(hash_key) = item.hash_key.clone() else {
            return;
        };
        if !recoverable {
            queue.active.remove(&hash_key);
            self.stuck_sending_total.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                config = %queue.config_name,
                hash_key = %hash_key,
                "permanent send failure, checkpoint held in sending state"
            );
            return;
        }
        if let Err(e) = queue.store.transition(&hash_key, CheckpointState::Unsent) {
            queue.read_only = true;
            tracing::error!(
                config = %queue.config_name,
                error = %e,
                "checkpoint write failed, queue is now read-only"
            );
            return;
        }
        queue.items.push_front(item);
        drop(inner);
        self.notify.notify_one();
    }

    /// Reap queues whose deletion grace window elapsed and that are fully
    /// drained.
    pub fn clear_timeout_queues(&self) {
        self.process.gc_deleted();
        let mut inner = self.lock();
        let due: Vec<QueueKey> = inner
            .deletion_times
            .iter()
            .filter(|(key, marked)| {
                marked.elapsed() >= self.deletion_grace
                    && inner.queues.get(key).is_none_or(|q| q.items.is_empty() && q.active.is_empty())
            })
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            inner.deletion_times.remove(&key);
            if let Some(queue) = inner.queues.remove(&key) {
                tracing::info!(config = %queue.config_name, "reaped exactly-once queue pair");
            }
        }
    }

    pub fn is_all_sender_empty(&self) -> bool {
        self.lock().queues.values().all(|q| q.items.is_empty() && q.active.is_empty())
    }

    pub fn is_read_only(&self, key: QueueKey) -> bool {
        self.lock().queues.get(&key).is_some_and(|q| q.read_only)
    }

    pub fn stuck_sending_total(&self) -> u64 {
        self.stuck_sending_total.load(Ordering::Relaxed)
    }

    /// Highest sequence id recorded for this queue, for re-seeding
    /// producers after a restart.
    pub fn max_sequence(&self, key: QueueKey) -> u64 {
        self.lock()
            .queues
            .get(&key)
            .map(|q| q.store.checkpoints().map(|cp| cp.sequence_id).max().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn checkpoint_state(&self, key: QueueKey, hash_key: &str) -> Option<CheckpointState> {
        self.lock()
            .queues
            .get(&key)
            .and_then(|q| q.store.get(hash_key).map(|cp| cp.state))
    }
}

/// Exactly-once pipelines push through the manager so its interface owns
/// the whole queue pair, even though the process side shares the global
/// scheduler. Sender-side saturation (queue full or read-only) gates
/// `is_valid_to_push` too, so inputs back off instead of feeding a stage
/// that cannot drain.
impl harvester_api::plugin::GroupSink for ExactlyOnceQueueManager {
    fn push(&self, key: QueueKey, group: EventGroup) -> Result<(), PushError> {
        self.push_process_queue(key, group)
    }

    fn is_valid_to_push(&self, key: QueueKey) -> bool {
        use harvester_api::plugin::GroupSink;
        if !self.process.is_valid_to_push(key) {
            return false;
        }
        self.lock()
            .queues
            .get(&key)
            .is_none_or(|q| !q.read_only && q.items.len() < q.capacity)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn managers(dir: &Path) -> (Arc<ProcessQueueManager>, ExactlyOnceQueueManager, QueueKey) {
        let process = Arc::new(ProcessQueueManager::new(Duration::from_millis(10)));
        let eo = ExactlyOnceQueueManager::new(process.clone(), Duration::from_millis(10));
        let key = process.key_for("eo_pipeline");
        eo.create_or_update_queue(key, 1, "eo_pipeline", &dir.join("cp.bin"))
            .unwrap();
        (process, eo, key)
    }

    fn item(key: QueueKey, hash_key: &str, seq: u64) -> SenderQueueItem {
        let mut it = SenderQueueItem::new(key, 0, "dest", Bytes::from_static(b"x"), 1, seq);
        it.hash_key = Some(hash_key.to_string());
        it.sequence_id = Some(seq);
        it
    }

    #[test]
    fn push_persists_sending_before_release() {
        let dir = tempfile::tempdir().unwrap();
        let (_p, eo, key) = managers(dir.path());
        eo.push_sender(key, item(key, "h1", 1), 0, 100).unwrap();
        assert_eq!(eo.checkpoint_state(key, "h1"), Some(CheckpointState::Sending));
        let drained = eo.try_drain(10);
        assert_eq!(drained.len(), 1);
    }

    #[test]
    fn second_push_for_sending_hash_key_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (_p, eo, key) = managers(dir.path());
        eo.push_sender(key, item(key, "h1", 1), 0, 100).unwrap();
        match eo.push_sender(key, item(key, "h1", 2), 100, 200) {
            Err(EoPushError::Busy(_)) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn ack_advances_checkpoint_and_frees_hash_key() {
        let dir = tempfile::tempdir().unwrap();
        let (_p, eo, key) = managers(dir.path());
        eo.push_sender(key, item(key, "h1", 1), 0, 100).unwrap();
        let (k, it) = eo.try_drain(10).remove(0);
        eo.on_ack(k, &it);
        assert_eq!(eo.checkpoint_state(key, "h1"), Some(CheckpointState::Acked));
        // The hash key is free again for the next range.
        eo.push_sender(key, item(key, "h1", 2), 100, 200).unwrap();
    }

    #[test]
    fn recoverable_nack_requeues_and_resends_once() {
        let dir = tempfile::tempdir().unwrap();
        let (_p, eo, key) = managers(dir.path());
        eo.push_sender(key, item(key, "h1", 1), 0, 100).unwrap();
        let (k, it) = eo.try_drain(10).remove(0);
        eo.on_nack(k, it, true);
        assert_eq!(eo.checkpoint_state(key, "h1"), Some(CheckpointState::Unsent));

        // Re-drain transitions back to Sending before release.
        let drained = eo.try_drain(10);
        assert_eq!(drained.len(), 1);
        assert_eq!(eo.checkpoint_state(key, "h1"), Some(CheckpointState::Sending));
    }

    #[test]
    fn permanent_nack_holds_sending_and_raises_metric() {
        let dir = tempfile::tempdir().unwrap();
        let (_p, eo, key) = managers(dir.path());
        eo.push_sender(key, item(key, "h1", 1), 0, 100).unwrap();
        let (k, it) = eo.try_drain(10).remove(0);
        eo.on_nack(k, it, false);
        assert_eq!(eo.checkpoint_state(key, "h1"), Some(CheckpointState::Sending));
        assert_eq!(eo.stuck_sending_total(), 1);
        // Hash key stays blocked until operator intervention.
        assert!(matches!(
            eo.push_sender(key, item(key, "h1", 2), 100, 200),
            Err(EoPushError::Busy(_))
        ));
    }

    #[test]
    fn restart_rebuilds_sending_ranges() {
        // S4: crash after Sending persisted but before the send completed.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.bin");
        let process = Arc::new(ProcessQueueManager::new(Duration::from_millis(10)));
        let key = process.key_for("eo_pipeline");
        {
            let eo = ExactlyOnceQueueManager::new(process.clone(), Duration::from_millis(10));
            eo.create_or_update_queue(key, 1, "eo_pipeline", &path).unwrap();
            eo.push_sender(key, item(key, "h1", 1), 0, 100).unwrap();
            // Crash: item never drained, never acked.
        }
        let eo = ExactlyOnceQueueManager::new(process.clone(), Duration::from_millis(10));
        eo.create_or_update_queue(key, 1, "eo_pipeline", &path).unwrap();
        let restored = eo.recover(key, &|cp| {
            Some(SenderQueueItem::new(key, 0, "dest", Bytes::from_static(b"x"), 1, cp.sequence_id))
        });
        assert_eq!(restored, 1);
        let drained = eo.try_drain(10);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.sequence_id, Some(1));
    }

    #[test]
    fn clear_timeout_queues_requires_grace_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        let (_p, eo, key) = managers(dir.path());
        eo.push_sender(key, item(key, "h1", 1), 0, 100).unwrap();
        eo.delete_queue(key);

        std::thread::sleep(Duration::from_millis(20));
        eo.clear_timeout_queues();
        // Still holds an item: not reaped despite elapsed grace.
        assert!(!eo.is_all_sender_empty());

        let (k, it) = eo.try_drain(10).remove(0);
        eo.on_ack(k, &it);
        eo.clear_timeout_queues();
        assert!(eo.is_all_sender_empty());
    }

    #[test]
    fn sender_saturation_gates_is_valid_to_push() {
        use harvester_api::plugin::GroupSink;

        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(ProcessQueueManager::new(Duration::from_millis(10)));
        let mut eo = ExactlyOnceQueueManager::new(process.clone(), Duration::from_millis(10));
        eo.sender_capacity = 2;
        let key = process.key_for("eo_pipeline");
        eo.create_or_update_queue(key, 1, "eo_pipeline", &dir.path().join("cp.bin"))
            .unwrap();

        assert!(eo.is_valid_to_push(key));
        eo.push_sender(key, item(key, "h1", 1), 0, 10).unwrap();
        assert!(eo.is_valid_to_push(key));
        eo.push_sender(key, item(key, "h2", 2), 0, 10).unwrap();
        // Sender side saturated: inputs must back off.
        assert!(!eo.is_valid_to_push(key));
        assert!(matches!(
            eo.push_sender(key, item(key, "h3", 3), 0, 10),
            Err(EoPushError::QueueFull(_))
        ));

        eo.try_drain(10);
        assert!(eo.is_valid_to_push(key));
    }
}
