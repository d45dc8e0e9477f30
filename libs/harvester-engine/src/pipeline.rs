use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use harvester_api::config::PipelineContext;
use harvester_api::plugin::{InputContext, PluginMeta, QueueKey};
use harvester_api::sender::SenderQueueItem;

use crate::agent::AgentRuntime;
use crate::config::{PipelineConfig, plugin_type};
use crate::error::EngineError;
use crate::instance::{
    FlusherInstance, InputInstance, InstrumentedSink, ProcessorInstance, SenderRoute,
};
use crate::queue::bounded::BoundedQueueParam;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initialized,
    Running,
    Stopping,
    Stopped,
}

struct InputTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One input plus its running poll task. The task handle lives behind a
/// mutex so a reload can carry a running input into the next pipeline
/// generation without restarting it.
pub struct InputSlot {
    instance: Arc<InputInstance>,
    type_name: String,
    raw_config: Value,
    task: Mutex<Option<InputTask>>,
}

impl InputSlot {
    fn steal_task(&self) -> Option<InputTask> {
        match self.task.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

struct ProcessorSlot {
    instance: Arc<ProcessorInstance>,
    type_name: String,
    raw_config: Value,
}

struct FlusherSlot {
    instance: Arc<FlusherInstance>,
    type_name: String,
    raw_config: Value,
}

/// One applied collection config end to end: inputs → processors →
/// process queue → flushers → sender queue.
pub struct CollectionPipeline {
    name: String,
    config: PipelineConfig,
    context: PipelineContext,
    queue_key: QueueKey,
    inputs: Vec<InputSlot>,
    processors: Vec<ProcessorSlot>,
    flushers: Vec<FlusherSlot>,
    state: Mutex<PipelineState>,
}

impl CollectionPipeline {
    /// Apply a config: create queues and plugins. Plugins whose config
    /// subtree is identical to the previous generation's survive (their
    /// instances are carried over, inputs without a restart).
    pub fn build(
        config: PipelineConfig,
        runtime: &AgentRuntime,
        prev: Option<&CollectionPipeline>,
    ) -> Result<Self, EngineError> {
        let name = config.name.clone();
        let pipeline_ctx = format!("pipeline '{name}'");
        let context = PipelineContext::new(name.as_str());
        let queue_key = runtime.process_queues.key_for(&name);

        // Singleton inputs may be applied by at most one config at a time.
        for input_cfg in &config.inputs {
            let type_name = plugin_type(input_cfg).map_err(|e| e.with_context(&pipeline_ctx))?;
            if runtime.registry.is_global_singleton_input(type_name) {
                runtime
                    .pipelines
                    .claim_singleton(type_name, &name)
                    .map_err(|e| e.with_context(&pipeline_ctx))?;
            }
        }

        // Queue pair; reused when key and capacity match.
        if config.exactly_once {
            let dir = config
                .checkpoint_dir
                .clone()
                .ok_or_else(|| EngineError::Config(format!("{pipeline_ctx}: missing checkpoint_dir")))?;
            let path = PathBuf::from(dir).join(format!("{name}.checkpoints"));
            runtime
                .exactly_once
                .create_or_update_queue(queue_key, config.priority as usize, &name, &path)?;
        } else {
            runtime.process_queues.create_or_update(
                queue_key,
                config.priority as usize,
                &name,
                BoundedQueueParam::new(config.queue_capacity),
            );
        }

        let mut plugin_id = 0usize;
        let mut next_meta = || {
            plugin_id += 1;
            PluginMeta::new(plugin_id.to_string())
        };

        let mut inputs = Vec::with_capacity(config.inputs.len());
        for (i, raw) in config.inputs.iter().enumerate() {
            let type_name = plugin_type(raw).map_err(|e| e.with_context(&pipeline_ctx))?;
            let meta = next_meta();
            let carried = prev.and_then(|p| p.inputs.get(i)).filter(|slot| {
                slot.type_name == type_name && slot.raw_config == *raw
            });
            let slot = match carried {
                Some(old) => InputSlot {
                    instance: old.instance.clone(),
                    type_name: old.type_name.clone(),
                    raw_config: raw.clone(),
                    task: Mutex::new(old.steal_task()),
                },
                None => {
                    let plugin = runtime
                        .registry
                        .create_input(type_name)
                        .map_err(|e| e.with_context(&pipeline_ctx))?;
                    let mut instance =
                        InputInstance::new(plugin, meta, &name, &runtime.metrics);
                    instance
                        .init(raw, &context)
                        .map_err(|e| e.with_context(&pipeline_ctx))?;
                    InputSlot {
                        instance: Arc::new(instance),
                        type_name: type_name.to_string(),
                        raw_config: raw.clone(),
                        task: Mutex::new(None),
                    }
                }
            };
            inputs.push(slot);
        }

        let mut processors = Vec::with_capacity(config.processors.len());
        for (i, raw) in config.processors.iter().enumerate() {
            let type_name = plugin_type(raw).map_err(|e| e.with_context(&pipeline_ctx))?;
            let meta = next_meta();
            let carried = prev.and_then(|p| p.processors.get(i)).filter(|slot| {
                slot.type_name == type_name && slot.raw_config == *raw
            });
            let slot = match carried {
                Some(old) => ProcessorSlot {
                    instance: old.instance.clone(),
                    type_name: old.type_name.clone(),
                    raw_config: raw.clone(),
                },
                None => {
                    let plugin = runtime
                        .registry
                        .create_processor(type_name)
                        .map_err(|e| e.with_context(&pipeline_ctx))?;
                    let mut instance =
                        ProcessorInstance::new(plugin, meta, &name, &runtime.metrics);
                    instance
                        .init(raw, &context)
                        .map_err(|e| e.with_context(&pipeline_ctx))?;
                    ProcessorSlot {
                        instance: Arc::new(instance),
                        type_name: type_name.to_string(),
                        raw_config: raw.clone(),
                    }
                }
            };
            processors.push(slot);
        }

        let mut flushers = Vec::with_capacity(config.flushers.len());
        for (i, raw) in config.flushers.iter().enumerate() {
            let type_name = plugin_type(raw).map_err(|e| e.with_context(&pipeline_ctx))?;
            let meta = next_meta();
            let carried = prev.and_then(|p| p.flushers.get(i)).filter(|slot| {
                slot.type_name == type_name && slot.raw_config == *raw
            });
            let slot = match carried {
                Some(old) => FlusherSlot {
                    instance: old.instance.clone(),
                    type_name: old.type_name.clone(),
                    raw_config: raw.clone(),
                },
                None => {
                    let mut plugin = runtime
                        .registry
                        .create_flusher(type_name)
                        .map_err(|e| e.with_context(&pipeline_ctx))?;
                    let spec = plugin
                        .init(raw, &context)
                        .map_err(|e| e.with_context(format!("{pipeline_ctx}: flusher '{type_name}'")))?;
                    let route = if config.exactly_once {
                        SenderRoute::ExactlyOnce(runtime.exactly_once.clone())
                    } else {
                        SenderRoute::Standard(runtime.sender_queues.clone())
                    };
                    let instance = FlusherInstance::new(
                        plugin,
                        meta,
                        &name,
                        i,
                        queue_key,
                        spec,
                        route,
                        &runtime.metrics,
                    );
                    if config.exactly_once {
                        instance.seed_sequence(runtime.exactly_once.max_sequence(queue_key) + 1);
                    }
                    FlusherSlot {
                        instance: Arc::new(instance),
                        type_name: type_name.to_string(),
                        raw_config: raw.clone(),
                    }
                }
            };
            flushers.push(slot);
        }

        Ok(Self {
            name,
            config,
            context,
            queue_key,
            inputs,
            processors,
            flushers,
            state: Mutex::new(PipelineState::Initialized),
        })
    }

    /// Spawn a poll task for every input that is not already running.
    pub fn start(&self, runtime: &AgentRuntime) {
        for slot in &self.inputs {
            let mut task = match slot.task.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if task.is_some() {
                continue;
            }
            let instance = slot.instance.clone();
            let sink = Arc::new(InstrumentedSink::new(
                runtime.group_sink(self.config.exactly_once),
                instance.out_events_total(),
            ));
            let ctx = InputContext {
                key: self.queue_key,
                sink,
                pipeline: self.context.clone(),
            };
            let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
            let pipeline_name = self.name.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    result = instance.run(ctx) => {
                        match result {
                            Ok(()) => tracing::info!(pipeline = %pipeline_name, input = %instance.name(), "input stopped"),
                            Err(e) => tracing::error!(pipeline = %pipeline_name, input = %instance.name(), error = %e, "input error"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!(pipeline = %pipeline_name, input = %instance.name(), "input shutting down");
                        if let Err(e) = instance.stop().await {
                            tracing::error!(pipeline = %pipeline_name, input = %instance.name(), error = %e, "input stop error");
                        }
                    }
                }
            });
            *task = Some(InputTask { shutdown_tx, handle });
        }
        self.set_state(PipelineState::Running);
    }

    /// Stop every input task still owned by this generation. Queues keep
    /// draining; their deletion (if any) is the agent's decision.
    pub async fn stop_inputs(&self) {
        self.set_state(PipelineState::Stopping);
        let tasks: Vec<InputTask> = self.inputs.iter().filter_map(|s| s.steal_task()).collect();
        for task in &tasks {
            let _ = task.shutdown_tx.send(true);
        }
        for task in tasks {
            let _ = task.handle.await;
        }
        self.set_state(PipelineState::Stopped);
    }

    /// Fault isolation: a plugin failure moved this pipeline to Stopping.
    pub fn mark_stopping(&self) {
        self.set_state(PipelineState::Stopping);
    }

    fn set_state(&self, state: PipelineState) {
        match self.state.lock() {
            Ok(mut g) => *g = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub fn state(&self) -> PipelineState {
        match self.state.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue_key(&self) -> QueueKey {
        self.queue_key
    }

    pub fn processors(&self) -> impl Iterator<Item = &Arc<ProcessorInstance>> {
        self.processors.iter().map(|s| &s.instance)
    }

    pub fn flushers(&self) -> impl Iterator<Item = &Arc<FlusherInstance>> {
        self.flushers.iter().map(|s| &s.instance)
    }

    pub fn flusher(&self, index: usize) -> Option<Arc<FlusherInstance>> {
        self.flushers.get(index).map(|s| s.instance.clone())
    }

    /// Flushers of this generation that were NOT carried into `next`.
    /// These must flush once more and then be dropped.
    pub fn replaced_flushers(&self, next: &CollectionPipeline) -> Vec<Arc<FlusherInstance>> {
        self.flushers
            .iter()
            .filter(|old| {
                !next
                    .flushers
                    .iter()
                    .any(|new| Arc::ptr_eq(&new.instance, &old.instance))
            })
            .map(|s| s.instance.clone())
            .collect()
    }

    pub fn all_flushers(&self) -> Vec<Arc<FlusherInstance>> {
        self.flushers.iter().map(|s| s.instance.clone()).collect()
    }
}

/// Registry of applied pipelines plus the singleton-input claims.
#[derive(Default)]
pub struct PipelineManager {
    by_key: RwLock<HashMap<QueueKey, Arc<CollectionPipeline>>>,
    /// singleton input type → owning config name.
    singleton_inputs: Mutex<HashMap<String, String>>,
}

impl PipelineManager {
    pub fn insert(&self, pipeline: Arc<CollectionPipeline>) {
        self.write().insert(pipeline.queue_key(), pipeline);
    }

    pub fn remove(&self, key: QueueKey) -> Option<Arc<CollectionPipeline>> {
        self.write().remove(&key)
    }

    pub fn get(&self, key: QueueKey) -> Option<Arc<CollectionPipeline>> {
        self.read().get(&key).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<CollectionPipeline>> {
        self.read().values().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().values().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Resolve the weak back-reference of a sender item. None when the
    /// pipeline is gone; the caller treats the ack as a no-op.
    pub fn flusher_for(&self, item: &SenderQueueItem) -> Option<Arc<FlusherInstance>> {
        self.get(item.queue_key)?.flusher(item.flusher_index)
    }

    /// Claim a singleton input type for a config. Re-claiming by the same
    /// config (reload) is allowed.
    pub fn claim_singleton(&self, type_name: &str, config_name: &str) -> Result<(), EngineError> {
        let mut claims = match self.singleton_inputs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match claims.get(type_name) {
            Some(owner) if owner != config_name => Err(EngineError::Config(format!(
                "singleton input '{type_name}' already applied by config '{owner}'"
            ))),
            _ => {
                claims.insert(type_name.to_string(), config_name.to_string());
                Ok(())
            }
        }
    }

    /// Release every singleton claim held by a config (pipeline removal).
    pub fn release_singletons(&self, config_name: &str) {
        let mut claims = match self.singleton_inputs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        claims.retain(|_, owner| owner != config_name);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<QueueKey, Arc<CollectionPipeline>>> {
        match self.by_key.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<QueueKey, Arc<CollectionPipeline>>> {
        match self.by_key.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
