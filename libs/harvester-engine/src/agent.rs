use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use harvester_api::plugin::{GroupSink, QueueKey, SendResult};

use crate::batch::timeout_flush::TimeoutFlushManager;
use crate::config::AgentConfig;
use crate::error::EngineError;
use crate::monitor::MetricsManager;
use crate::pipeline::{CollectionPipeline, PipelineManager};
use crate::queue::bounded::ProcessQueueItem;
use crate::queue::exactly_once::ExactlyOnceQueueManager;
use crate::queue::process_manager::{DEFAULT_DELETION_GRACE, ProcessQueueManager};
use crate::queue::sender_manager::SenderQueueManager;
use crate::registry::PluginRegistry;

/// How long a removed pipeline may keep draining before its queued items
/// are dropped.
const REMOVAL_DRAIN_GRACE: Duration = Duration::from_secs(5);
/// Upper bound on the shutdown drain.
const SHUTDOWN_DRAIN_GRACE: Duration = Duration::from_secs(10);
/// Cadence of the timeout flush tick.
const FLUSH_TICK: Duration = Duration::from_secs(1);
/// Metrics snapshot once per this many flush ticks.
const METRICS_TICKS: u32 = 10;
/// Batch size for one sender drain.
const SENDER_DRAIN_LIMIT: usize = 16;

/// Shared state of one running agent: the plugin catalog, the queue
/// managers, and the applied pipelines. Constructed once at boot and passed
/// by reference into every component.
pub struct AgentRuntime {
    pub registry: Arc<PluginRegistry>,
    pub metrics: Arc<MetricsManager>,
    pub process_queues: Arc<ProcessQueueManager>,
    pub sender_queues: Arc<SenderQueueManager>,
    pub exactly_once: Arc<ExactlyOnceQueueManager>,
    pub timeout_flush: Arc<TimeoutFlushManager>,
    pub pipelines: PipelineManager,
    orphan_acks_total: AtomicU64,
}

impl AgentRuntime {
    pub fn new(registry: Arc<PluginRegistry>) -> Arc<Self> {
        let process_queues = Arc::new(ProcessQueueManager::default());
        let exactly_once = Arc::new(ExactlyOnceQueueManager::new(
            process_queues.clone(),
            DEFAULT_DELETION_GRACE,
        ));
        Arc::new(Self {
            registry,
            metrics: Arc::new(MetricsManager::new()),
            process_queues,
            sender_queues: Arc::new(SenderQueueManager::default()),
            exactly_once,
            timeout_flush: Arc::new(TimeoutFlushManager::new()),
            pipelines: PipelineManager::default(),
            orphan_acks_total: AtomicU64::new(0),
        })
    }

    /// The sink an input pushes into, per the pipeline's queue flavor.
    pub fn group_sink(&self, exactly_once: bool) -> Arc<dyn GroupSink> {
        if exactly_once {
            self.exactly_once.clone()
        } else {
            self.process_queues.clone()
        }
    }

    pub fn orphan_acks_total(&self) -> u64 {
        self.orphan_acks_total.load(Ordering::Relaxed)
    }

    /// Run one dequeued group through its pipeline: processor chain, then
    /// flusher fan-out. Errors stay scoped to this group; a processor
    /// panic quiesces the whole pipeline.
    pub fn handle_group(&self, key: QueueKey, item: ProcessQueueItem) {
        let Some(pipeline) = self.pipelines.get(key) else {
            tracing::debug!(key = key.raw(), "group for removed pipeline, dropping");
            return;
        };
        let mut group = item.group;
        debug_assert!(group.is_sealed());
        // Exclusive ownership from here on: reopen the arena for the
        // processor chain.
        group.unseal();

        let chain = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            for processor in pipeline.processors() {
                processor.process(&mut group);
            }
        }));
        if chain.is_err() {
            tracing::error!(
                pipeline = %pipeline.name(),
                "processor panicked, quiescing pipeline"
            );
            self.process_queues.disable_pop(key);
            pipeline.mark_stopping();
            return;
        }
        if group.is_empty() {
            return;
        }

        let flushers: Vec<_> = pipeline.flushers().cloned().collect();
        let Some((last, rest)) = flushers.split_last() else {
            return;
        };
        for flusher in rest {
            if let Err(e) =
                crate::instance::FlusherInstance::send(flusher, group.duplicate(), &self.timeout_flush)
            {
                tracing::warn!(pipeline = %pipeline.name(), flusher = %flusher.name(), error = %e, "flusher send failed");
            }
        }
        if let Err(e) = crate::instance::FlusherInstance::send(last, group, &self.timeout_flush) {
            tracing::warn!(pipeline = %pipeline.name(), flusher = %last.name(), error = %e, "flusher send failed");
        }
    }

    /// Deliver one standard-queue item and resolve the result.
    async fn export_standard(&self, item: harvester_api::sender::SenderQueueItem) {
        match self.pipelines.flusher_for(&item) {
            None => {
                // Pipeline gone at send time: resolve as a no-op ack.
                self.orphan_acks_total.fetch_add(1, Ordering::Relaxed);
                self.sender_queues.on_ack(&item);
            }
            Some(flusher) => match flusher.export(&item).await {
                SendResult::Ok => self.sender_queues.on_ack(&item),
                SendResult::Retry { after } => {
                    let _ = self.sender_queues.on_nack(item, after);
                }
                SendResult::Permanent => self.sender_queues.on_permanent(item),
            },
        }
    }

    /// Deliver one exactly-once item and resolve its checkpoint.
    async fn export_exactly_once(&self, key: QueueKey, item: harvester_api::sender::SenderQueueItem) {
        match self.pipelines.flusher_for(&item) {
            None => {
                self.orphan_acks_total.fetch_add(1, Ordering::Relaxed);
                self.exactly_once.on_ack(key, &item);
            }
            Some(flusher) => match flusher.export(&item).await {
                SendResult::Ok => self.exactly_once.on_ack(key, &item),
                SendResult::Retry { .. } => self.exactly_once.on_nack(key, item, true),
                SendResult::Permanent => self.exactly_once.on_nack(key, item, false),
            },
        }
    }
}

/// The running collector: applied pipelines plus the shared background
/// tasks (processor workers, sender loops, flush tick).
pub struct Agent {
    runtime: Arc<AgentRuntime>,
    config: AgentConfig,
    shutdown_tx: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Bootstrap from a parsed configuration: apply every pipeline, then
    /// start the shared worker pool, sender loops, and flush tick.
    pub async fn bootstrap(
        config: AgentConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = AgentRuntime::new(registry);

        for pipeline_cfg in &config.pipelines {
            apply_pipeline(&runtime, pipeline_cfg.clone(), None)?;
            tracing::info!(pipeline = %pipeline_cfg.name, priority = pipeline_cfg.priority, "applied pipeline");
        }

        let (shutdown_tx, _) = watch::channel(false);
        let mut background = Vec::new();

        let workers = if config.worker_threads > 0 {
            config.worker_threads
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        };
        for worker_id in 0..workers {
            let runtime = runtime.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        (key, item) = runtime.process_queues.next() => {
                            runtime.handle_group(key, item);
                        }
                    }
                }
                tracing::debug!(worker_id, "processor worker stopped");
            }));
        }

        {
            let runtime = runtime.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        items = runtime.sender_queues.drain(SENDER_DRAIN_LIMIT) => {
                            for item in items {
                                runtime.export_standard(item).await;
                            }
                        }
                    }
                }
            }));
        }

        {
            let runtime = runtime.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        items = runtime.exactly_once.drain(SENDER_DRAIN_LIMIT) => {
                            for (key, item) in items {
                                runtime.export_exactly_once(key, item).await;
                            }
                        }
                    }
                }
            }));
        }

        {
            let runtime = runtime.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            background.push(tokio::spawn(async move {
                let mut ticks = 0u32;
                let mut interval = tokio::time::interval(FLUSH_TICK);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = interval.tick() => {
                            runtime.timeout_flush.flush_timeout_batch();
                            runtime.process_queues.gc_deleted();
                            runtime.exactly_once.clear_timeout_queues();
                            ticks += 1;
                            if ticks % METRICS_TICKS == 0 {
                                runtime.metrics.update_metrics();
                            }
                        }
                    }
                }
            }));
        }

        Ok(Self { runtime, config, shutdown_tx, background })
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Diff-apply a new configuration (SIGHUP).
    ///
    /// Removed pipelines are stopped and their queues deleted; changed
    /// pipelines are rebuilt, carrying over every plugin whose config
    /// subtree is identical; unchanged pipelines are untouched.
    pub async fn reload(&mut self, new_config: AgentConfig) -> Result<(), EngineError> {
        new_config.validate()?;

        for name in self.runtime.pipelines.names() {
            let still_exists = new_config.pipelines.iter().any(|p| p.name == name);
            if !still_exists {
                tracing::info!(pipeline = %name, "removing pipeline (reload)");
                remove_pipeline(&self.runtime, &name).await;
            }
        }

        for pipeline_cfg in &new_config.pipelines {
            match self.runtime.pipelines.get_by_name(&pipeline_cfg.name) {
                Some(old) if old.config() == pipeline_cfg => {
                    // Unchanged; keep as-is.
                }
                Some(old) => {
                    let new_pipeline = Arc::new(CollectionPipeline::build(
                        pipeline_cfg.clone(),
                        &self.runtime,
                        Some(old.as_ref()),
                    )?);
                    // Inputs carried into the new generation kept their
                    // tasks; stop the rest.
                    old.stop_inputs().await;
                    // Flushers not carried over flush once more and drop.
                    for flusher in old.replaced_flushers(&new_pipeline) {
                        if let Err(e) =
                            crate::instance::FlusherInstance::flush_all(&flusher, &self.runtime.timeout_flush)
                        {
                            tracing::warn!(pipeline = %old.name(), flusher = %flusher.name(), error = %e, "final flush failed");
                        }
                    }
                    // Same queue key: the insert replaces the old
                    // generation atomically, so in-flight sender items
                    // never observe a missing pipeline.
                    self.runtime.pipelines.insert(new_pipeline.clone());
                    new_pipeline.start(&self.runtime);
                    tracing::info!(pipeline = %pipeline_cfg.name, "rebuilt pipeline (reload)");
                }
                None => {
                    apply_pipeline(&self.runtime, pipeline_cfg.clone(), None)?;
                    tracing::info!(pipeline = %pipeline_cfg.name, "applied new pipeline (reload)");
                }
            }
        }

        self.config = new_config;
        tracing::info!("config reload complete");
        Ok(())
    }

    /// Reload configuration from a file path.
    pub async fn reload_from_file(&mut self, path: &str) -> Result<(), EngineError> {
        let new_config = AgentConfig::load(path)?;
        self.reload(new_config).await
    }

    /// Graceful shutdown: stop inputs, drain queues up to the grace
    /// deadline, then stop the background tasks.
    pub async fn shutdown(self) {
        for name in self.runtime.pipelines.names() {
            if let Some(pipeline) = self.runtime.pipelines.get_by_name(&name) {
                pipeline.stop_inputs().await;
            }
        }

        let deadline = Instant::now() + SHUTDOWN_DRAIN_GRACE;
        while Instant::now() < deadline && !self.runtime.process_queues.is_all_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Push out whatever the batchers still hold.
        for name in self.runtime.pipelines.names() {
            if let Some(pipeline) = self.runtime.pipelines.get_by_name(&name) {
                for flusher in pipeline.all_flushers() {
                    if let Err(e) =
                        crate::instance::FlusherInstance::flush_all(&flusher, &self.runtime.timeout_flush)
                    {
                        tracing::warn!(pipeline = %name, flusher = %flusher.name(), error = %e, "final flush failed");
                    }
                }
            }
        }
        while Instant::now() < deadline
            && !(self.runtime.sender_queues.is_all_empty()
                && self.runtime.exactly_once.is_all_sender_empty())
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if !self.runtime.process_queues.is_all_empty()
            || !self.runtime.sender_queues.is_all_empty()
        {
            tracing::warn!("shutdown grace elapsed with undelivered items, dropping");
        }

        let _ = self.shutdown_tx.send(true);
        for handle in self.background {
            let _ = handle.await;
        }
        self.runtime.metrics.update_metrics();
        tracing::info!("agent shut down");
    }
}

fn apply_pipeline(
    runtime: &Arc<AgentRuntime>,
    config: crate::config::PipelineConfig,
    prev: Option<&CollectionPipeline>,
) -> Result<Arc<CollectionPipeline>, EngineError> {
    let name = config.name.clone();
    let pipeline = match CollectionPipeline::build(config, runtime, prev) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            // A half-applied config must not pin singleton claims.
            if runtime.pipelines.get_by_name(&name).is_none() {
                runtime.pipelines.release_singletons(&name);
            }
            return Err(e);
        }
    };
    runtime.pipelines.insert(pipeline.clone());
    pipeline.start(runtime);
    Ok(pipeline)
}

async fn remove_pipeline(runtime: &Arc<AgentRuntime>, name: &str) {
    let Some(pipeline) = runtime.pipelines.get_by_name(name) else {
        return;
    };
    let key = pipeline.queue_key();
    pipeline.stop_inputs().await;

    // Block new pushes, then let the workers drain what is queued.
    if pipeline.config().exactly_once {
        runtime.exactly_once.delete_queue(key);
    } else {
        runtime.process_queues.delete(key);
    }
    let deadline = Instant::now() + REMOVAL_DRAIN_GRACE;
    while Instant::now() < deadline
        && runtime.process_queues.queue_len(key).is_some_and(|len| len > 0)
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    runtime.pipelines.remove(key);
    runtime.pipelines.release_singletons(name);
    runtime
        .timeout_flush
        .unregister_flushers(name, pipeline.all_flushers());
}
