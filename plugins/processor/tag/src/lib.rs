use std::collections::HashMap;

use serde_json::Value;

use harvester_api::config::{self, PipelineContext};
use harvester_api::error::PluginError;
use harvester_api::event::EventGroup;
use harvester_api::plugin::Processor;

pub const TYPE_NAME: &str = "processor_tag";

const KNOWN_KEYS: &[&str] = &["Hostname", "StaticTags", "AgentEnvMetaTagKey"];

/// Attaches host metadata and user-configured tags to every group.
pub struct TagProcessor {
    hostname: String,
    static_tags: Vec<(String, String)>,
    /// env var name → tag key; resolved once at init.
    env_tags: Vec<(String, String)>,
}

impl TagProcessor {
    pub fn new() -> Self {
        Self { hostname: String::new(), static_tags: Vec::new(), env_tags: Vec::new() }
    }
}

impl Default for TagProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn read_hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

impl Processor for TagProcessor {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<(), PluginError> {
        config::warn_unknown_keys(config, KNOWN_KEYS, ctx, TYPE_NAME);

        self.hostname = config::optional_string(config, "Hostname", ctx, TYPE_NAME)
            .unwrap_or_else(read_hostname);

        if let Some(tags) = config::optional_map(config, "StaticTags", ctx, TYPE_NAME) {
            self.static_tags = sorted(tags);
        }
        if let Some(env_tags) = config::optional_map(config, "AgentEnvMetaTagKey", ctx, TYPE_NAME) {
            // Resolve env values at init; the agent's environment does not
            // change while it runs.
            self.env_tags = sorted(env_tags)
                .into_iter()
                .filter_map(|(env_name, tag_key)| {
                    std::env::var(&env_name).ok().map(|value| (tag_key, value))
                })
                .collect();
        }
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        group.set_tag("host.name", &self.hostname);
        for (key, value) in &self.static_tags {
            group.set_tag(key, value);
        }
        for (key, value) in &self.env_tags {
            group.set_tag(key, value);
        }
    }
}

fn sorted(map: HashMap<String, String>) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = map.into_iter().collect();
    entries.sort();
    entries
}
