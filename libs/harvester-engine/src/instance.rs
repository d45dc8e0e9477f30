use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;

use harvester_api::config::PipelineContext;
use harvester_api::error::PluginError;
use harvester_api::event::EventGroup;
use harvester_api::metrics::{Counter, MetricsRecordRef, names};
use harvester_api::plugin::{
    Flusher, FlusherSpec, GroupSink, Input, InputContext, Processor, PluginMeta, PushError,
    QueueKey, SendResult,
};
use harvester_api::sender::SenderQueueItem;

use crate::batch::batcher::Batcher;
use crate::batch::timeout_flush::TimeoutFlushManager;
use crate::monitor::MetricsManager;
use crate::queue::exactly_once::{EoPushError, ExactlyOnceQueueManager};
use crate::queue::sender_manager::SenderQueueManager;

fn lock_parked(parked: &Mutex<VecDeque<ParkedBatch>>) -> std::sync::MutexGuard<'_, VecDeque<ParkedBatch>> {
    match parked.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn plugin_labels(config_name: &str, plugin_type: &str, meta: &PluginMeta) -> Vec<(String, String)> {
    vec![
        ("config".to_string(), config_name.to_string()),
        ("plugin_type".to_string(), plugin_type.to_string()),
        ("plugin_id".to_string(), meta.plugin_id.clone()),
    ]
}

/// A constructed input with its metadata and observability handles.
pub struct InputInstance {
    plugin: Box<dyn Input>,
    meta: PluginMeta,
    _metrics: MetricsRecordRef,
    out_events_total: Arc<Counter>,
}

impl InputInstance {
    pub fn new(
        plugin: Box<dyn Input>,
        meta: PluginMeta,
        config_name: &str,
        metrics: &MetricsManager,
    ) -> Self {
        let record = metrics.create_record(plugin_labels(config_name, plugin.name(), &meta));
        let out_events_total = record.counter(names::OUT_EVENTS_TOTAL);
        Self { plugin, meta, _metrics: record, out_events_total }
    }

    pub fn name(&self) -> &'static str {
        self.plugin.name()
    }

    pub fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    pub fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<(), PluginError> {
        let ctx = ctx.clone().with_metrics(self._metrics.record().clone());
        self.plugin
            .init(config, &ctx)
            .map_err(|e| e.with_context(format!("input '{}'", self.plugin.name())))
    }

    pub fn run(
        &self,
        ctx: InputContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        self.plugin.run(ctx)
    }

    pub fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        self.plugin.stop()
    }

    pub fn out_events_total(&self) -> Arc<Counter> {
        self.out_events_total.clone()
    }
}

/// Sink wrapper that accounts produced events to the owning input.
pub struct InstrumentedSink {
    inner: Arc<dyn GroupSink>,
    out_events_total: Arc<Counter>,
}

impl InstrumentedSink {
    pub fn new(inner: Arc<dyn GroupSink>, out_events_total: Arc<Counter>) -> Self {
        Self { inner, out_events_total }
    }
}

impl GroupSink for InstrumentedSink {
    fn push(&self, key: QueueKey, group: EventGroup) -> Result<(), PushError> {
        let events = group.len() as u64;
        self.inner.push(key, group)?;
        self.out_events_total.add(events);
        Ok(())
    }

    fn is_valid_to_push(&self, key: QueueKey) -> bool {
        self.inner.is_valid_to_push(key)
    }
}

/// A constructed processor with per-call event and timing accounting.
pub struct ProcessorInstance {
    plugin: Box<dyn Processor>,
    meta: PluginMeta,
    _metrics: MetricsRecordRef,
    in_events_total: Arc<Counter>,
    out_events_total: Arc<Counter>,
    discarded_events_total: Arc<Counter>,
    total_process_time_ms: Arc<Counter>,
}

impl ProcessorInstance {
    pub fn new(
        plugin: Box<dyn Processor>,
        meta: PluginMeta,
        config_name: &str,
        metrics: &MetricsManager,
    ) -> Self {
        let record = metrics.create_record(plugin_labels(config_name, plugin.name(), &meta));
        Self {
            in_events_total: record.counter(names::IN_EVENTS_TOTAL),
            out_events_total: record.counter(names::OUT_EVENTS_TOTAL),
            discarded_events_total: record.counter(names::DISCARDED_EVENTS_TOTAL),
            total_process_time_ms: record.counter(names::TOTAL_PROCESS_TIME_MS),
            plugin,
            meta,
            _metrics: record,
        }
    }

    pub fn name(&self) -> &'static str {
        self.plugin.name()
    }

    pub fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    pub fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<(), PluginError> {
        let ctx = ctx.clone().with_metrics(self._metrics.record().clone());
        self.plugin
            .init(config, &ctx)
            .map_err(|e| e.with_context(format!("processor '{}'", self.plugin.name())))
    }

    pub fn process(&self, group: &mut EventGroup) {
        let before = group.len() as u64;
        self.in_events_total.add(before);
        let start = Instant::now();
        self.plugin.process(group);
        self.total_process_time_ms
            .add(start.elapsed().as_millis() as u64);
        let after = group.len() as u64;
        self.out_events_total.add(after);
        if after < before {
            self.discarded_events_total.add(before - after);
        }
    }
}

/// Which sender path a flusher's batches take.
pub enum SenderRoute {
    Standard(Arc<SenderQueueManager>),
    ExactlyOnce(Arc<ExactlyOnceQueueManager>),
}

/// A serialized batch the exactly-once queue refused (hash key still in
/// flight, queue full, or read-only). Held here and re-offered on the next
/// flush tick instead of being dropped.
struct ParkedBatch {
    batch_key: u64,
    item: SenderQueueItem,
}

/// Upper bound on parked batches per flusher. Beyond this the flusher is
/// hopelessly behind its destination and further refusals are dropped and
/// counted as failed.
const MAX_PARKED_BATCHES: usize = 64;

/// A constructed flusher plus its engine-side batcher and sender route.
pub struct FlusherInstance {
    plugin: Box<dyn Flusher>,
    meta: PluginMeta,
    config_name: String,
    flusher_index: usize,
    queue_key: QueueKey,
    spec: FlusherSpec,
    batcher: Batcher,
    route: SenderRoute,
    /// Exactly-once only: next sequence id for this flusher's ranges.
    sequence: AtomicU64,
    /// Exactly-once only: refused batches awaiting a retry.
    parked: Mutex<VecDeque<ParkedBatch>>,
    _metrics: MetricsRecordRef,
    in_events_total: Arc<Counter>,
    out_events_total: Arc<Counter>,
    out_failed_events_total: Arc<Counter>,
    out_size_bytes: Arc<Counter>,
}

impl FlusherInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugin: Box<dyn Flusher>,
        meta: PluginMeta,
        config_name: &str,
        flusher_index: usize,
        queue_key: QueueKey,
        spec: FlusherSpec,
        route: SenderRoute,
        metrics: &MetricsManager,
    ) -> Self {
        let record = metrics.create_record(plugin_labels(config_name, plugin.name(), &meta));
        Self {
            in_events_total: record.counter(names::IN_EVENTS_TOTAL),
            out_events_total: record.counter(names::OUT_EVENTS_TOTAL),
            out_failed_events_total: record.counter(names::OUT_FAILED_EVENTS_TOTAL),
            out_size_bytes: record.counter(names::OUT_SIZE_BYTES),
            batcher: Batcher::new(spec.max_batch_events),
            plugin,
            meta,
            config_name: config_name.to_string(),
            flusher_index,
            queue_key,
            spec,
            route,
            sequence: AtomicU64::new(1),
            parked: Mutex::new(VecDeque::new()),
            _metrics: record,
        }
    }

    pub fn name(&self) -> &'static str {
        self.plugin.name()
    }

    pub fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn flusher_index(&self) -> usize {
        self.flusher_index
    }

    pub fn spec(&self) -> &FlusherSpec {
        &self.spec
    }

    /// Accumulate one group, refreshing this batch's timeout record. A
    /// batch crossing the size threshold is flushed inline.
    pub fn send(
        this: &Arc<Self>,
        group: EventGroup,
        timeout_flush: &TimeoutFlushManager,
    ) -> Result<(), PluginError> {
        this.in_events_total.add(group.len() as u64);
        let (batch_key, full) = this.batcher.add(group);
        timeout_flush.update_record(
            &this.config_name,
            this.flusher_index,
            batch_key,
            this.spec.flush_timeout_secs,
            this.clone(),
        );
        match full {
            Some(groups) => Self::flush_groups(this, batch_key, groups, timeout_flush),
            None => Ok(()),
        }
    }

    /// Flush one batch by key, if it is still pending. Parked batches for
    /// this flusher are re-offered first.
    pub fn flush_batch(
        this: &Arc<Self>,
        batch_key: u64,
        timeout_flush: &TimeoutFlushManager,
    ) -> Result<(), PluginError> {
        Self::retry_parked(this, timeout_flush);
        match this.batcher.take(batch_key) {
            Some(groups) => Self::flush_groups(this, batch_key, groups, timeout_flush),
            None => Ok(()),
        }
    }

    /// Flush every pending batch (teardown path).
    pub fn flush_all(this: &Arc<Self>, timeout_flush: &TimeoutFlushManager) -> Result<(), PluginError> {
        Self::retry_parked(this, timeout_flush);
        for (batch_key, groups) in this.batcher.take_all() {
            Self::flush_groups(this, batch_key, groups, timeout_flush)?;
        }
        Ok(())
    }

    fn flush_groups(
        this: &Arc<Self>,
        batch_key: u64,
        groups: Vec<EventGroup>,
        timeout_flush: &TimeoutFlushManager,
    ) -> Result<(), PluginError> {
        let events: usize = groups.iter().map(|g| g.len()).sum();
        if events == 0 {
            return Ok(());
        }
        let payload = this
            .plugin
            .serialize(groups)
            .map_err(|e| e.with_context(format!("flusher '{}'", this.plugin.name())))?;
        this.out_size_bytes.add(payload.len() as u64);
        let payload_len = payload.len() as u64;
        let mut item = SenderQueueItem::new(
            this.queue_key,
            this.flusher_index,
            this.spec.destination.clone(),
            payload,
            events,
            batch_key,
        );
        match &this.route {
            SenderRoute::Standard(sender) => {
                if sender.push(item).is_err() {
                    this.out_failed_events_total.add(events as u64);
                    tracing::warn!(
                        config = %this.config_name,
                        flusher = %this.plugin.name(),
                        events,
                        "sender queue full, dropping batch"
                    );
                    return Ok(());
                }
            }
            SenderRoute::ExactlyOnce(eo) => {
                item.hash_key = Some(format!("{}/{batch_key:016x}", this.config_name));
                item.sequence_id = Some(this.sequence.fetch_add(1, Ordering::Relaxed));
                // An earlier refused batch for this key must go first;
                // queue behind it to keep per-range ordering.
                if this.has_parked(batch_key) {
                    Self::park(this, batch_key, item, timeout_flush);
                    return Ok(());
                }
                if let Err(err) = eo.push_sender(this.queue_key, item, 0, payload_len) {
                    Self::handle_refusal(this, batch_key, err, timeout_flush);
                    return Ok(());
                }
            }
        }
        this.out_events_total.add(events as u64);
        Ok(())
    }

    /// Re-offer every parked batch in order. Batches the queue still
    /// refuses are parked again for the next tick.
    fn retry_parked(this: &Arc<Self>, timeout_flush: &TimeoutFlushManager) {
        let SenderRoute::ExactlyOnce(eo) = &this.route else {
            return;
        };
        let parked: Vec<ParkedBatch> = {
            let mut parked = lock_parked(&this.parked);
            parked.drain(..).collect()
        };
        for batch in parked {
            let events = batch.item.event_count as u64;
            let write_offset = batch.item.payload.len() as u64;
            match eo.push_sender(this.queue_key, batch.item, 0, write_offset) {
                Ok(()) => this.out_events_total.add(events),
                Err(err) => Self::handle_refusal(this, batch.batch_key, err, timeout_flush),
            }
        }
    }

    /// A refused push: park the handed-back item for retry, except when
    /// the queue itself is gone (pipeline removal).
    fn handle_refusal(
        this: &Arc<Self>,
        batch_key: u64,
        err: EoPushError,
        timeout_flush: &TimeoutFlushManager,
    ) {
        match err {
            EoPushError::Busy(item) => {
                // Routine under load: the previous range for this key has
                // not resolved yet.
                tracing::debug!(
                    config = %this.config_name,
                    flusher = %this.plugin.name(),
                    batch_key,
                    "previous range still in flight, parking batch"
                );
                Self::park(this, batch_key, item, timeout_flush);
            }
            EoPushError::QueueFull(item) => {
                tracing::warn!(
                    config = %this.config_name,
                    flusher = %this.plugin.name(),
                    "exactly-once sender queue full, parking batch"
                );
                Self::park(this, batch_key, item, timeout_flush);
            }
            EoPushError::ReadOnly(item) => {
                tracing::warn!(
                    config = %this.config_name,
                    flusher = %this.plugin.name(),
                    "exactly-once queue is read-only, parking batch"
                );
                Self::park(this, batch_key, item, timeout_flush);
            }
            EoPushError::QueueNotFound(item) => {
                this.out_failed_events_total.add(item.event_count as u64);
                tracing::warn!(
                    config = %this.config_name,
                    flusher = %this.plugin.name(),
                    events = item.event_count,
                    "exactly-once queue not found, dropping batch"
                );
            }
        }
    }

    fn park(
        this: &Arc<Self>,
        batch_key: u64,
        item: SenderQueueItem,
        timeout_flush: &TimeoutFlushManager,
    ) {
        {
            let mut parked = lock_parked(&this.parked);
            if parked.len() >= MAX_PARKED_BATCHES {
                this.out_failed_events_total.add(item.event_count as u64);
                tracing::warn!(
                    config = %this.config_name,
                    flusher = %this.plugin.name(),
                    events = item.event_count,
                    parked = parked.len(),
                    "parked batch limit reached, dropping batch"
                );
                return;
            }
            parked.push_back(ParkedBatch { batch_key, item });
        }
        // A zero-timeout record makes the next flush tick call back into
        // this flusher, which retries the parked queue.
        timeout_flush.update_record(
            &this.config_name,
            this.flusher_index,
            batch_key,
            0,
            this.clone(),
        );
    }

    fn has_parked(&self, batch_key: u64) -> bool {
        lock_parked(&self.parked).iter().any(|p| p.batch_key == batch_key)
    }

    pub fn parked_batches(&self) -> usize {
        lock_parked(&self.parked).len()
    }

    /// Exactly-once recovery: seed the sequence counter past everything the
    /// checkpoint store has seen.
    pub fn seed_sequence(&self, next: u64) {
        self.sequence.store(next.max(1), Ordering::Relaxed);
    }

    pub fn export(
        &self,
        item: &SenderQueueItem,
    ) -> Pin<Box<dyn Future<Output = SendResult> + Send + '_>> {
        self.plugin.export(item)
    }

    pub fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        self.plugin.stop()
    }
}
