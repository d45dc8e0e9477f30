use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use harvester_api::event::EventGroup;
use harvester_api::plugin::QueueKey;

use super::Feedback;

/// Sizing of one bounded queue. `high` gates producers, `low` resumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedQueueParam {
    pub capacity: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

impl BoundedQueueParam {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            low_watermark: (capacity / 3).max(1),
            high_watermark: capacity,
        }
    }
}

/// One event-group batch queued for processing.
#[derive(Debug)]
pub struct ProcessQueueItem {
    pub group: EventGroup,
    pub received_at: Instant,
}

impl ProcessQueueItem {
    pub fn new(group: EventGroup) -> Self {
        Self { group, received_at: Instant::now() }
    }
}

/// Fixed-capacity FIFO of process-queue items.
///
/// The queue is the only point where per-pipeline ordering is preserved
/// end-to-end: the scheduler interleaves across queues but never reorders
/// within one.
pub struct BoundedProcessQueue {
    key: QueueKey,
    config_name: String,
    param: BoundedQueueParam,
    items: VecDeque<ProcessQueueItem>,
    valid_to_push: bool,
    pop_enabled: bool,
    upstream: Vec<Arc<dyn Feedback>>,
}

impl std::fmt::Debug for BoundedProcessQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedProcessQueue")
            .field("key", &self.key)
            .field("config_name", &self.config_name)
            .field("size", &self.items.len())
            .field("param", &self.param)
            .finish()
    }
}

impl BoundedProcessQueue {
    pub fn new(key: QueueKey, config_name: impl Into<String>, param: BoundedQueueParam) -> Self {
        Self {
            key,
            config_name: config_name.into(),
            param,
            items: VecDeque::with_capacity(param.capacity),
            valid_to_push: true,
            pop_enabled: true,
            upstream: Vec::new(),
        }
    }

    pub fn key(&self) -> QueueKey {
        self.key
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn param(&self) -> BoundedQueueParam {
        self.param
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// False above the high watermark; producers must back off.
    pub fn is_valid_to_push(&self) -> bool {
        self.valid_to_push
    }

    pub fn register_feedback(&mut self, feedback: Arc<dyn Feedback>) {
        self.upstream.push(feedback);
    }

    /// O(1). Rejects when `size == capacity`, handing the item back.
    pub fn push(&mut self, item: ProcessQueueItem) -> Result<(), ProcessQueueItem> {
        if self.items.len() == self.param.capacity {
            return Err(item);
        }
        self.items.push_back(item);
        if self.valid_to_push && self.items.len() >= self.param.high_watermark {
            self.valid_to_push = false;
            for f in &self.upstream {
                f.on_pause(self.key);
            }
        }
        Ok(())
    }

    /// Front item, or None if empty or pop is disabled.
    pub fn pop(&mut self) -> Option<ProcessQueueItem> {
        if !self.pop_enabled {
            return None;
        }
        let item = self.items.pop_front()?;
        if !self.valid_to_push && self.items.len() <= self.param.low_watermark {
            self.valid_to_push = true;
            for f in &self.upstream {
                f.on_resume(self.key);
            }
        }
        Some(item)
    }

    /// Gate used during pipeline teardown and per-pipeline quiescing.
    pub fn disable_pop(&mut self) {
        self.pop_enabled = false;
    }

    pub fn enable_pop(&mut self) {
        self.pop_enabled = true;
    }

    pub fn is_pop_enabled(&self) -> bool {
        self.pop_enabled
    }

    /// True when the scheduler can serve from this queue right now.
    pub fn has_ready_item(&self) -> bool {
        self.pop_enabled && !self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use harvester_api::event::{EventGroup, GroupMetadata};

    use super::*;

    fn item() -> ProcessQueueItem {
        ProcessQueueItem::new(EventGroup::new(GroupMetadata::default()))
    }

    fn queue(capacity: usize) -> BoundedProcessQueue {
        BoundedProcessQueue::new(
            QueueKey::from_raw(1),
            "test_config",
            BoundedQueueParam::new(capacity),
        )
    }

    #[derive(Default)]
    struct RecordingFeedback {
        events: Mutex<Vec<&'static str>>,
    }

    impl Feedback for RecordingFeedback {
        fn on_pause(&self, _key: QueueKey) {
            self.events.lock().unwrap().push("pause");
        }
        fn on_resume(&self, _key: QueueKey) {
            self.events.lock().unwrap().push("resume");
        }
    }

    #[test]
    fn push_rejects_at_capacity() {
        let mut q = queue(3);
        for _ in 0..3 {
            assert!(q.push(item()).is_ok());
        }
        assert!(q.push(item()).is_err());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn pop_is_fifo() {
        let mut q = queue(3);
        for i in 0..3 {
            let mut it = item();
            it.group.metadata_mut().source = format!("s{i}");
            q.push(it).unwrap();
        }
        for i in 0..3 {
            let it = q.pop().unwrap();
            assert_eq!(it.group.metadata().source, format!("s{i}"));
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn disable_pop_gates_pop() {
        let mut q = queue(2);
        q.push(item()).unwrap();
        q.disable_pop();
        assert!(q.pop().is_none());
        q.enable_pop();
        assert!(q.pop().is_some());
    }

    #[test]
    fn watermark_feedback_fires_once_per_crossing() {
        let fb = Arc::new(RecordingFeedback::default());
        let mut q = BoundedProcessQueue::new(
            QueueKey::from_raw(7),
            "test_config",
            BoundedQueueParam { capacity: 4, low_watermark: 1, high_watermark: 3 },
        );
        q.register_feedback(fb.clone());

        q.push(item()).unwrap();
        q.push(item()).unwrap();
        assert!(q.is_valid_to_push());
        q.push(item()).unwrap(); // crosses high watermark
        assert!(!q.is_valid_to_push());
        q.push(item()).unwrap(); // above high watermark, no second signal

        q.pop().unwrap();
        q.pop().unwrap();
        assert!(!q.is_valid_to_push());
        q.pop().unwrap(); // size 1 == low watermark
        assert!(q.is_valid_to_push());

        assert_eq!(*fb.events.lock().unwrap(), vec!["pause", "resume"]);
    }
}
