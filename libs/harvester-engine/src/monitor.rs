use std::sync::{Arc, Mutex, RwLock};

use harvester_api::metrics::{MetricsRecord, MetricsRecordRef, MetricsSnapshotRecord, new_record};

/// Read/write metrics pair.
///
/// Plugin instances write into committed records; `update_metrics` moves the
/// accumulated values into an atomically swapped read snapshot. A record
/// whose ref was dropped is included in exactly one more snapshot (so its
/// final values are exposed) and then garbage-collected.
pub struct MetricsManager {
    write: Mutex<Vec<MetricsRecord>>,
    read: RwLock<Arc<Vec<MetricsSnapshotRecord>>>,
}

impl Default for MetricsManager {
    fn default() -> Self {
        Self {
            write: Mutex::new(Vec::new()),
            read: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl MetricsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and commit a labeled record, returning the owning handle.
    pub fn create_record(&self, labels: Vec<(String, String)>) -> MetricsRecordRef {
        let (record, record_ref) = new_record(labels);
        match self.write.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => {
                tracing::warn!("metrics write list lock was poisoned, recovering");
                poisoned.into_inner().push(record);
            }
        }
        record_ref
    }

    /// Swap a fresh snapshot in. Counters are moved (write side restarts
    /// from zero); deleted records get their final exposure here.
    pub fn update_metrics(&self) {
        let snapshot: Vec<MetricsSnapshotRecord> = {
            let mut records = match self.write.lock() {
                Ok(g) => g,
                Err(poisoned) => {
                    tracing::warn!("metrics write list lock was poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            let snap = records.iter().map(|r| r.collect()).collect();
            records.retain(|r| !r.is_deleted());
            snap
        };
        match self.read.write() {
            Ok(mut read) => *read = Arc::new(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<MetricsSnapshotRecord>> {
        match self.read.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
