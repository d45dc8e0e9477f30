use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use harvester_api::event::EventGroup;

/// One accumulating batch.
#[derive(Debug, Default)]
struct Batch {
    groups: Vec<EventGroup>,
    events: usize,
}

/// Per-flusher batch accumulator keyed by batch key (derived from the
/// group's source). Size-triggered flushes are decided here; age-triggered
/// flushes come from the timeout flush manager.
pub struct Batcher {
    batches: Mutex<HashMap<u64, Batch>>,
    max_batch_events: usize,
}

impl Batcher {
    pub fn new(max_batch_events: usize) -> Self {
        Self {
            batches: Mutex::new(HashMap::new()),
            max_batch_events: max_batch_events.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Batch>> {
        match self.batches.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Batch key for a group: one batch per source within a flusher.
    pub fn batch_key(group: &EventGroup) -> u64 {
        let mut hasher = DefaultHasher::new();
        group.metadata().source.hash(&mut hasher);
        hasher.finish()
    }

    /// Accumulate a group. Returns the full batch when the event threshold
    /// is crossed; otherwise the group stays buffered until a timeout
    /// flush.
    pub fn add(&self, group: EventGroup) -> (u64, Option<Vec<EventGroup>>) {
        let key = Self::batch_key(&group);
        let mut batches = self.lock();
        let batch = batches.entry(key).or_default();
        batch.events += group.len();
        batch.groups.push(group);
        if batch.events >= self.max_batch_events {
            let batch = batches.remove(&key).unwrap_or_default();
            return (key, Some(batch.groups));
        }
        (key, None)
    }

    /// Take one pending batch, if any.
    pub fn take(&self, batch_key: u64) -> Option<Vec<EventGroup>> {
        self.lock().remove(&batch_key).map(|b| b.groups)
    }

    /// Take every pending batch.
    pub fn take_all(&self) -> Vec<(u64, Vec<EventGroup>)> {
        self.lock().drain().map(|(k, b)| (k, b.groups)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use harvester_api::event::{Event, GroupMetadata, LogEvent, Timestamp};

    use super::*;

    fn group(source: &str, events: usize) -> EventGroup {
        let mut g = EventGroup::new(GroupMetadata {
            config_name: "cfg".into(),
            source: source.into(),
            acquired_at: Timestamp::now(),
        });
        for _ in 0..events {
            g.push_event(Event::Log(LogEvent::new(Timestamp::now())));
        }
        g
    }

    #[test]
    fn size_threshold_triggers_flush() {
        let b = Batcher::new(3);
        let (_, none) = b.add(group("s", 2));
        assert!(none.is_none());
        let (key, full) = b.add(group("s", 2));
        let groups = full.unwrap();
        assert_eq!(groups.len(), 2);
        assert!(b.take(key).is_none());
    }

    #[test]
    fn distinct_sources_get_distinct_batches() {
        let b = Batcher::new(100);
        let (k1, _) = b.add(group("s1", 1));
        let (k2, _) = b.add(group("s2", 1));
        assert_ne!(k1, k2);
        assert_eq!(b.take_all().len(), 2);
        assert!(b.is_empty());
    }
}
