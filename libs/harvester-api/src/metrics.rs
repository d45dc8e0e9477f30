use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Canonical self-observation metric names shared by all plugin instances.
pub mod names {
    pub const IN_EVENTS_TOTAL: &str = "inEventsTotal";
    pub const OUT_EVENTS_TOTAL: &str = "outEventsTotal";
    pub const DISCARDED_EVENTS_TOTAL: &str = "discardedEventsTotal";
    pub const OUT_FAILED_EVENTS_TOTAL: &str = "outFailedEventsTotal";
    pub const OUT_KEY_NOT_FOUND_EVENTS_TOTAL: &str = "outKeyNotFoundEventsTotal";
    pub const TOTAL_PROCESS_TIME_MS: &str = "totalProcessTimeMs";
    pub const OUT_SIZE_BYTES: &str = "outSizeBytes";
}

/// Monotonic counter. `fetch` moves the accumulated value into the read
/// snapshot, so write-side counters restart from zero after every
/// `update_metrics` tick.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Take the accumulated value, resetting the counter.
    pub fn fetch(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

/// Point-in-time gauge. Snapshots copy the value without resetting it.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct RecordInner {
    labels: Vec<(String, String)>,
    counters: Mutex<Vec<(String, Arc<Counter>)>>,
    gauges: Mutex<Vec<(String, Arc<Gauge>)>>,
    deleted: AtomicBool,
}

/// One labeled metrics record, shared between its owning plugin instance
/// and the metrics manager.
#[derive(Debug, Clone)]
pub struct MetricsRecord {
    inner: Arc<RecordInner>,
}

impl MetricsRecord {
    pub(crate) fn new(labels: Vec<(String, String)>) -> Self {
        Self {
            inner: Arc::new(RecordInner { labels, ..Default::default() }),
        }
    }

    /// A record not registered with any manager. Counters work but are
    /// never exported; used by plugins running outside an instance.
    pub fn detached() -> Self {
        Self::new(Vec::new())
    }

    pub fn labels(&self) -> &[(String, String)] {
        &self.inner.labels
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut counters = lock_unpoisoned(&self.inner.counters);
        if let Some((_, c)) = counters.iter().find(|(n, _)| n == name) {
            return c.clone();
        }
        let c = Arc::new(Counter::default());
        counters.push((name.to_string(), c.clone()));
        c
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        let mut gauges = lock_unpoisoned(&self.inner.gauges);
        if let Some((_, g)) = gauges.iter().find(|(n, _)| n == name) {
            return g.clone();
        }
        let g = Arc::new(Gauge::default());
        gauges.push((name.to_string(), g.clone()));
        g
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    /// Snapshot and reset all counters, copy all gauges.
    pub fn collect(&self) -> MetricsSnapshotRecord {
        let counters = lock_unpoisoned(&self.inner.counters)
            .iter()
            .map(|(n, c)| (n.clone(), c.fetch()))
            .collect();
        let gauges = lock_unpoisoned(&self.inner.gauges)
            .iter()
            .map(|(n, g)| (n.clone(), g.value()))
            .collect();
        MetricsSnapshotRecord {
            labels: self.inner.labels.clone(),
            counters,
            gauges,
        }
    }
}

/// Owning handle held by a plugin instance. Dropping the ref marks the
/// record deleted; the manager exposes its final values for one more
/// snapshot before garbage-collecting it.
#[derive(Debug)]
pub struct MetricsRecordRef {
    record: MetricsRecord,
}

impl MetricsRecordRef {
    pub(crate) fn new(record: MetricsRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &MetricsRecord {
        &self.record
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.record.counter(name)
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        self.record.gauge(name)
    }
}

impl Drop for MetricsRecordRef {
    fn drop(&mut self) {
        self.record.inner.deleted.store(true, Ordering::Release);
    }
}

/// Immutable view of one record at snapshot time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshotRecord {
    pub labels: Vec<(String, String)>,
    pub counters: Vec<(String, u64)>,
    pub gauges: Vec<(String, u64)>,
}

impl MetricsSnapshotRecord {
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

/// Factory used by the metrics manager; kept here so plugin crates only
/// ever see the handle types.
pub fn new_record(labels: Vec<(String, String)>) -> (MetricsRecord, MetricsRecordRef) {
    let record = MetricsRecord::new(labels);
    let r = record.clone();
    (record, MetricsRecordRef::new(r))
}

fn lock_unpoisoned<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_fetch_moves_value() {
        let c = Counter::default();
        c.add(111);
        c.add(111);
        assert_eq!(c.value(), 222);
        assert_eq!(c.fetch(), 222);
        assert_eq!(c.value(), 0);
    }

    #[test]
    fn record_counter_is_deduped_by_name() {
        let (record, rf) = new_record(vec![("plugin".into(), "p1".into())]);
        let a = rf.counter("inEventsTotal");
        let b = record.counter("inEventsTotal");
        a.add(5);
        assert_eq!(b.value(), 5);
    }

    #[test]
    fn drop_marks_record_deleted() {
        let (record, rf) = new_record(vec![]);
        assert!(!record.is_deleted());
        drop(rf);
        assert!(record.is_deleted());
    }
}
