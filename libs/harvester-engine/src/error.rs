use harvester_api::error::PluginError;
use harvester_api::ffi::PluginCategory;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("duplicate {category} plugin '{name}'")]
    DuplicatePlugin { category: PluginCategory, name: String },

    #[error("unknown {category} plugin '{name}'")]
    UnknownPlugin { category: PluginCategory, name: String },

    #[error("queue full")]
    QueueFull,

    #[error("queue not found: {0}")]
    QueueNotFound(u64),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Plugin` variant, context is added to the inner `PluginError`.
    /// For message-carrying variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Plugin(e) => EngineError::Plugin(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::Checkpoint(msg) => EngineError::Checkpoint(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}
