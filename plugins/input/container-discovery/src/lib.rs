pub mod filter;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;

use harvester_api::config::{self, PipelineContext};
use harvester_api::error::PluginError;
use harvester_api::event::{Event, EventGroup, GroupMetadata, LogEvent, Timestamp};
use harvester_api::plugin::{Backoff, Input, InputContext, PushError};

use crate::filter::{ContainerFilterConfig, ContainerFilters, ContainerMeta};

pub const TYPE_NAME: &str = "input_container_discovery";

const KNOWN_KEYS: &[&str] = &[
    "StateFile",
    "IntervalSecs",
    "ContainerFilters",
    "ExternalEnvTag",
    "ExternalK8sLabelTag",
    "CollectingContainersMeta",
];

/// Singleton input emitting one discovery record per matching container.
///
/// Container state comes from a JSON state file maintained by the
/// container runtime integration; this input owns filtering and tag
/// mapping, not the runtime protocol.
pub struct ContainerDiscoveryInput {
    state_file: PathBuf,
    interval: Duration,
    filters: ContainerFilters,
    external_env_tag: Vec<(String, String)>,
    external_k8s_label_tag: Vec<(String, String)>,
    collecting_containers_meta: bool,
}

impl ContainerDiscoveryInput {
    pub fn new() -> Self {
        Self {
            state_file: PathBuf::new(),
            interval: Duration::from_secs(30),
            filters: ContainerFilters::default(),
            external_env_tag: Vec::new(),
            external_k8s_label_tag: Vec::new(),
            collecting_containers_meta: false,
        }
    }

    fn read_state(&self) -> Result<Vec<ContainerMeta>, PluginError> {
        let raw = std::fs::read_to_string(&self.state_file)?;
        let containers: Vec<ContainerMeta> = serde_json::from_str(&raw)?;
        Ok(containers)
    }

    /// Build one discovery group from the current container state.
    fn collect(&self, config_name: &str) -> Result<EventGroup, PluginError> {
        let containers = self.read_state()?;
        let mut group = EventGroup::new(GroupMetadata {
            config_name: config_name.to_string(),
            source: self.state_file.display().to_string(),
            acquired_at: Timestamp::now(),
        });
        for meta in containers.iter().filter(|m| self.filters.matches(m)) {
            let mut event = LogEvent::new(Timestamp::now());
            let mut push = |group: &mut EventGroup, event: &mut LogEvent, k: &str, v: &str| {
                let key = group.alloc(k);
                let value = group.alloc(v);
                event.contents.push((key, value));
            };
            push(&mut group, &mut event, "container.id", &meta.id);
            push(&mut group, &mut event, "container.name", &meta.name);
            if self.collecting_containers_meta {
                push(&mut group, &mut event, "k8s.namespace", &meta.k8s_namespace);
                push(&mut group, &mut event, "k8s.pod", &meta.k8s_pod);
                push(&mut group, &mut event, "k8s.container", &meta.k8s_container);
            }
            // Mapped external tags: env values and k8s label values under
            // user-chosen tag keys.
            for (env_key, tag_key) in &self.external_env_tag {
                if let Some(value) = meta.env.get(env_key) {
                    push(&mut group, &mut event, tag_key, value);
                }
            }
            for (label_key, tag_key) in &self.external_k8s_label_tag {
                if let Some(value) = meta.k8s_labels.get(label_key) {
                    push(&mut group, &mut event, tag_key, value);
                }
            }
            group.push_event(Event::Log(event));
        }
        Ok(group)
    }
}

impl Default for ContainerDiscoveryInput {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_pairs(map: std::collections::HashMap<String, String>) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = map.into_iter().collect();
    entries.sort();
    entries
}

impl Input for ContainerDiscoveryInput {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<(), PluginError> {
        config::warn_unknown_keys(config, KNOWN_KEYS, ctx, TYPE_NAME);

        self.state_file = PathBuf::from(config::required_string(config, "StateFile")?);
        self.interval =
            Duration::from_secs(config::optional_u64(config, "IntervalSecs", 30, ctx, TYPE_NAME).max(1));
        match config.get("ContainerFilters") {
            None => {}
            Some(filters) if filters.is_object() => {
                let raw = ContainerFilterConfig::parse(filters, ctx, TYPE_NAME);
                self.filters = ContainerFilters::compile(&raw)?;
            }
            Some(_) => {
                tracing::warn!(
                    config = %ctx.config_name,
                    "param ContainerFilters is not of type object, ignoring"
                );
            }
        }
        if let Some(map) = config::optional_map(config, "ExternalEnvTag", ctx, TYPE_NAME) {
            self.external_env_tag = sorted_pairs(map);
        }
        if let Some(map) = config::optional_map(config, "ExternalK8sLabelTag", ctx, TYPE_NAME) {
            self.external_k8s_label_tag = sorted_pairs(map);
        }
        self.collecting_containers_meta =
            config::optional_bool(config, "CollectingContainersMeta", false, ctx, TYPE_NAME);
        Ok(())
    }

    fn run(
        &self,
        ctx: InputContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async move {
            let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(30));
            loop {
                if !ctx.sink.is_valid_to_push(ctx.key) {
                    backoff.wait().await;
                    continue;
                }
                match self.collect(&ctx.pipeline.config_name) {
                    Ok(group) if group.is_empty() => {}
                    Ok(mut group) => loop {
                        match ctx.sink.push(ctx.key, group) {
                            Ok(()) => {
                                backoff.reset();
                                break;
                            }
                            Err(PushError::QueueFull(returned)) => {
                                group = returned;
                                backoff.wait().await;
                            }
                            Err(PushError::QueueNotFound) => return Ok(()),
                        }
                    },
                    Err(e) => {
                        tracing::warn!(
                            config = %ctx.pipeline.config_name,
                            state_file = %self.state_file.display(),
                            error = %e,
                            "container state read failed"
                        );
                    }
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
