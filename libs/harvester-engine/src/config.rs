use serde::Deserialize;
use serde_json::Value;

use crate::error::EngineError;
use crate::queue::process_manager::MAX_PRIORITY;

/// Root configuration — parsed from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Collection pipeline definitions.
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,

    /// Optional dynamic plugin modules (.so paths). Load failures are
    /// warnings, never fatal.
    #[serde(default)]
    pub plugin_modules: Vec<String>,

    /// Processor worker pool size. Zero means hardware concurrency.
    #[serde(default)]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub name: String,

    /// Priority tier in `[0, MAX_PRIORITY]`, 0 = highest.
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Anchor the queue pair to persistent range checkpoints.
    #[serde(default)]
    pub exactly_once: bool,

    /// Checkpoint file directory (exactly-once pipelines only).
    #[serde(default)]
    pub checkpoint_dir: Option<String>,

    /// Plugin config trees; each carries at least `"Type"`.
    #[serde(default)]
    pub inputs: Vec<Value>,
    #[serde(default)]
    pub processors: Vec<Value>,
    #[serde(default)]
    pub flushers: Vec<Value>,
}

fn default_queue_capacity() -> usize {
    20
}

impl AgentConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn parse(json: &str) -> Result<Self, EngineError> {
        let config: AgentConfig =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for p in &self.pipelines {
            p.validate()?;
        }
        let mut names: Vec<&str> = self.pipelines.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.pipelines.len() {
            return Err(EngineError::Config("duplicate pipeline name".into()));
        }
        Ok(())
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let ctx = format!("pipeline '{}'", self.name);
        if self.name.is_empty() {
            return Err(EngineError::Config("pipeline name must not be empty".into()));
        }
        if self.priority as usize > MAX_PRIORITY {
            return Err(EngineError::Config(format!(
                "{ctx}: priority {} out of range [0, {MAX_PRIORITY}]",
                self.priority
            )));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::Config(format!("{ctx}: queue_capacity must be > 0")));
        }
        if self.inputs.is_empty() {
            return Err(EngineError::Config(format!("{ctx}: at least one input required")));
        }
        if self.flushers.is_empty() {
            return Err(EngineError::Config(format!("{ctx}: at least one flusher required")));
        }
        if self.exactly_once && self.checkpoint_dir.is_none() {
            return Err(EngineError::Config(format!(
                "{ctx}: exactly_once requires checkpoint_dir"
            )));
        }
        for plugin in self.inputs.iter().chain(&self.processors).chain(&self.flushers) {
            plugin_type(plugin).map_err(|e| e.with_context(&ctx))?;
        }
        // High-priority producers can starve lower tiers at saturation.
        if self.priority == 0 {
            tracing::debug!(pipeline = %self.name, "pipeline registered at highest priority");
        }
        Ok(())
    }
}

/// Extract the mandatory `"Type"` discriminator from a plugin config tree.
pub fn plugin_type(config: &Value) -> Result<&str, EngineError> {
    match config.get("Type") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(_) => Err(EngineError::Config("plugin 'Type' must be a string".into())),
        None => Err(EngineError::Config("plugin config missing 'Type'".into())),
    }
}
