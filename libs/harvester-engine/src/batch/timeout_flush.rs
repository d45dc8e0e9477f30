use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::instance::FlusherInstance;

/// `(flusher_index, batch_key)` within one config.
type RecordKey = (usize, u64);

struct TimeoutRecord {
    update_time: Instant,
    timeout_secs: u64,
    flusher: Arc<FlusherInstance>,
}

/// Per-config timer registry that flushes batches whose age exceeds their
/// configured bound.
///
/// Invoked both from the background flush tick and from pipeline-reload
/// paths; the internal mutex is released while flusher callbacks run to
/// avoid deadlocking against reload.
#[derive(Default)]
pub struct TimeoutFlushManager {
    records: Mutex<HashMap<String, HashMap<RecordKey, TimeoutRecord>>>,
    /// Flushers unregistered since the last tick. They survive exactly one
    /// more `flush_timeout_batch` so batches scheduled before removal still
    /// flush.
    deleted_flushers: Mutex<Vec<Arc<FlusherInstance>>>,
}

impl TimeoutFlushManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, HashMap<RecordKey, TimeoutRecord>>> {
        match self.records.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("timeout flush records lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn lock_deleted(&self) -> MutexGuard<'_, Vec<Arc<FlusherInstance>>> {
        match self.deleted_flushers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert or refresh a record; refreshing resets `update_time` to now.
    pub fn update_record(
        &self,
        config_name: &str,
        flusher_index: usize,
        batch_key: u64,
        timeout_secs: u64,
        flusher: Arc<FlusherInstance>,
    ) {
        let mut records = self.lock_records();
        records.entry(config_name.to_string()).or_default().insert(
            (flusher_index, batch_key),
            TimeoutRecord { update_time: Instant::now(), timeout_secs, flusher },
        );
    }

    /// Flush every record whose age reached its timeout. A zero timeout
    /// means "flush on this scan". Flusher callbacks run outside the lock.
    pub fn flush_timeout_batch(&self) {
        let due: Vec<(Arc<FlusherInstance>, u64)> = {
            let mut records = self.lock_records();
            let mut due = Vec::new();
            for per_config in records.values_mut() {
                per_config.retain(|(_, batch_key), rec| {
                    let expired = rec.timeout_secs == 0
                        || rec.update_time.elapsed().as_secs() >= rec.timeout_secs;
                    if expired {
                        due.push((rec.flusher.clone(), *batch_key));
                    }
                    !expired
                });
            }
            records.retain(|_, per_config| !per_config.is_empty());
            due
        };
        for (flusher, batch_key) in due {
            if let Err(e) = FlusherInstance::flush_batch(&flusher, batch_key, self) {
                tracing::warn!(
                    config = %flusher.config_name(),
                    flusher = %flusher.name(),
                    batch_key,
                    error = %e,
                    "timeout flush failed"
                );
            }
        }

        let deleted: Vec<Arc<FlusherInstance>> = self.lock_deleted().drain(..).collect();
        for flusher in deleted {
            if let Err(e) = FlusherInstance::flush_all(&flusher, self) {
                tracing::warn!(
                    config = %flusher.config_name(),
                    flusher = %flusher.name(),
                    error = %e,
                    "final flush of unregistered flusher failed"
                );
            }
        }
    }

    /// Drop a config's records now; its flushers flush anything already
    /// scheduled on the next tick, then are released.
    pub fn unregister_flushers(
        &self,
        config_name: &str,
        flushers: impl IntoIterator<Item = Arc<FlusherInstance>>,
    ) {
        self.lock_records().remove(config_name);
        self.lock_deleted().extend(flushers);
    }

    pub fn record_count(&self, config_name: &str) -> usize {
        self.lock_records().get(config_name).map_or(0, |m| m.len())
    }

    pub fn deleted_flusher_count(&self) -> usize {
        self.lock_deleted().len()
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use bytes::Bytes;
    use serde_json::Value;

    use harvester_api::config::PipelineContext;
    use harvester_api::error::PluginError;
    use harvester_api::event::{Event, EventGroup, GroupMetadata, LogEvent, Timestamp};
    use harvester_api::plugin::{Flusher, FlusherSpec, PluginMeta, QueueKey, SendResult};
    use harvester_api::sender::SenderQueueItem;

    use crate::instance::{FlusherInstance, SenderRoute};
    use crate::monitor::MetricsManager;
    use crate::queue::sender_manager::SenderQueueManager;

    use super::*;

    struct MockFlusher;

    impl Flusher for MockFlusher {
        fn name(&self) -> &'static str {
            "flusher_mock"
        }

        fn init(&mut self, _: &Value, _: &PipelineContext) -> Result<FlusherSpec, PluginError> {
            Ok(FlusherSpec {
                destination: "mock".into(),
                flush_timeout_secs: 0,
                max_batch_events: 1000,
            })
        }

        fn serialize(&self, groups: Vec<EventGroup>) -> Result<Bytes, PluginError> {
            Ok(Bytes::from(format!("{} groups", groups.len())))
        }

        fn export(
            &self,
            _item: &SenderQueueItem,
        ) -> Pin<Box<dyn Future<Output = SendResult> + Send + '_>> {
            Box::pin(async { SendResult::Ok })
        }

        fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct Fixture {
        manager: TimeoutFlushManager,
        sender: Arc<SenderQueueManager>,
        flusher: Arc<FlusherInstance>,
        _metrics: MetricsManager,
    }

    fn fixture() -> Fixture {
        let metrics = MetricsManager::new();
        let sender = Arc::new(SenderQueueManager::default());
        let flusher = Arc::new(FlusherInstance::new(
            Box::new(MockFlusher),
            PluginMeta::new("1"),
            "test_config",
            0,
            QueueKey::from_raw(1),
            FlusherSpec { destination: "mock".into(), flush_timeout_secs: 0, max_batch_events: 1000 },
            SenderRoute::Standard(sender.clone()),
            &metrics,
        ));
        Fixture { manager: TimeoutFlushManager::new(), sender, flusher, _metrics: metrics }
    }

    fn group(source: &str) -> EventGroup {
        let mut g = EventGroup::new(GroupMetadata {
            config_name: "test_config".into(),
            source: source.into(),
            acquired_at: Timestamp::now(),
        });
        g.push_event(Event::Log(LogEvent::new(Timestamp::now())));
        g
    }

    #[test]
    fn update_record_refreshes_in_place() {
        let f = fixture();
        f.manager
            .update_record("test_config", 0, 1, 3, f.flusher.clone());
        assert_eq!(f.manager.record_count("test_config"), 1);

        // Existing batch queue: still one record after a refresh.
        f.manager
            .update_record("test_config", 0, 1, 3, f.flusher.clone());
        assert_eq!(f.manager.record_count("test_config"), 1);
    }

    #[test]
    fn flush_timeout_batch_flushes_zero_timeout_records() {
        // S3: k1 and k3 carry timeout 0, k2 carries timeout 3.
        let f = fixture();
        FlusherInstance::send(&f.flusher, group("s1"), &f.manager).unwrap();
        FlusherInstance::send(&f.flusher, group("s2"), &f.manager).unwrap();
        FlusherInstance::send(&f.flusher, group("s3"), &f.manager).unwrap();
        assert_eq!(f.manager.record_count("test_config"), 3);

        // Raise k2's timeout so it survives the immediate scan.
        let k2 = crate::batch::batcher::Batcher::batch_key(&group("s2"));
        f.manager.update_record("test_config", 0, k2, 3, f.flusher.clone());

        f.manager.flush_timeout_batch();
        assert_eq!(f.manager.record_count("test_config"), 1);
        assert_eq!(f.sender.queue_len("mock"), 2);

        // A second scan without new pushes flushes nothing further for the
        // already-flushed records.
        f.manager.flush_timeout_batch();
        assert_eq!(f.sender.queue_len("mock"), 2);
    }

    #[test]
    fn unregister_keeps_flushers_exactly_one_tick() {
        let f = fixture();
        FlusherInstance::send(&f.flusher, group("s1"), &f.manager).unwrap();
        assert_eq!(f.manager.record_count("test_config"), 1);

        f.manager
            .unregister_flushers("test_config", [f.flusher.clone()]);
        assert_eq!(f.manager.record_count("test_config"), 0);
        assert_eq!(f.manager.deleted_flusher_count(), 1);

        // The deferred flusher still flushes its scheduled batch once.
        f.manager.flush_timeout_batch();
        assert_eq!(f.manager.deleted_flusher_count(), 0);
        assert_eq!(f.sender.queue_len("mock"), 1);
    }
}
