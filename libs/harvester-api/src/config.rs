use std::collections::HashMap;

use serde_json::Value;

use crate::error::PluginError;

/// Pipeline-scoped context handed to every plugin at init time.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub config_name: String,
    /// The instance's metrics record, for plugin-specific counters beyond
    /// the standard set. Absent in bare test setups.
    pub metrics: Option<crate::metrics::MetricsRecord>,
}

impl PipelineContext {
    pub fn new(config_name: impl Into<String>) -> Self {
        Self { config_name: config_name.into(), metrics: None }
    }

    pub fn with_metrics(mut self, metrics: crate::metrics::MetricsRecord) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

fn warn_type(ctx: &PipelineContext, plugin: &str, key: &str, expected: &str) {
    tracing::warn!(
        config = %ctx.config_name,
        plugin = %plugin,
        key = %key,
        expected = %expected,
        "config param has wrong type, ignoring"
    );
}

/// Read an optional string param. A present-but-mistyped value is ignored
/// with a warning.
pub fn optional_string(
    config: &Value,
    key: &str,
    ctx: &PipelineContext,
    plugin: &str,
) -> Option<String> {
    match config.get(key) {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            warn_type(ctx, plugin, key, "string");
            None
        }
    }
}

/// Read a required string param. Missing or mistyped fails `init`.
pub fn required_string(config: &Value, key: &str) -> Result<String, PluginError> {
    match config.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(PluginError::config(format!("param '{key}': expected string"))),
        None => Err(PluginError::config(format!("missing required param '{key}'"))),
    }
}

pub fn optional_bool(
    config: &Value,
    key: &str,
    default: bool,
    ctx: &PipelineContext,
    plugin: &str,
) -> bool {
    match config.get(key) {
        None => default,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            warn_type(ctx, plugin, key, "bool");
            default
        }
    }
}

pub fn optional_u64(
    config: &Value,
    key: &str,
    default: u64,
    ctx: &PipelineContext,
    plugin: &str,
) -> u64 {
    match config.get(key) {
        None => default,
        Some(v) => match v.as_u64() {
            Some(n) => n,
            None => {
                warn_type(ctx, plugin, key, "unsigned integer");
                default
            }
        },
    }
}

/// Read an optional string→string mapping param.
pub fn optional_map(
    config: &Value,
    key: &str,
    ctx: &PipelineContext,
    plugin: &str,
) -> Option<HashMap<String, String>> {
    let obj = match config.get(key) {
        None => return None,
        Some(Value::Object(obj)) => obj,
        Some(_) => {
            warn_type(ctx, plugin, key, "object");
            return None;
        }
    };
    let mut out = HashMap::with_capacity(obj.len());
    for (k, v) in obj {
        match v {
            Value::String(s) => {
                out.insert(k.clone(), s.clone());
            }
            _ => warn_type(ctx, plugin, &format!("{key}.{k}"), "string"),
        }
    }
    Some(out)
}

/// Read a string-list param. A single element containing commas is split,
/// so `["k1,k2"]` and `["k1", "k2"]` are equivalent.
pub fn optional_string_list(
    config: &Value,
    key: &str,
    ctx: &PipelineContext,
    plugin: &str,
) -> Option<Vec<String>> {
    let arr = match config.get(key) {
        None => return None,
        Some(Value::Array(arr)) => arr,
        Some(_) => {
            warn_type(ctx, plugin, key, "array");
            return None;
        }
    };
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        match v {
            Value::String(s) => out.extend(s.split(',').map(|p| p.trim().to_string())),
            _ => warn_type(ctx, plugin, key, "array of strings"),
        }
    }
    Some(out)
}

/// Warn once per key that is not in the plugin's known set. Unknown keys
/// never fail init.
pub fn warn_unknown_keys(config: &Value, known: &[&str], ctx: &PipelineContext, plugin: &str) {
    let Some(obj) = config.as_object() else {
        return;
    };
    for key in obj.keys() {
        if key != "Type" && !known.contains(&key.as_str()) {
            tracing::warn!(
                config = %ctx.config_name,
                plugin = %plugin,
                key = %key,
                "unknown config param, ignoring"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> PipelineContext {
        PipelineContext::new("test_config")
    }

    #[test]
    fn required_string_missing_fails() {
        let config = json!({ "Other": 1 });
        assert!(required_string(&config, "SourceKey").is_err());
    }

    #[test]
    fn optional_params_tolerate_wrong_types() {
        let config = json!({ "Interval": "not-a-number", "Enable": 1 });
        assert_eq!(optional_u64(&config, "Interval", 30, &ctx(), "p"), 30);
        assert!(optional_bool(&config, "Enable", true, &ctx(), "p"));
    }

    #[test]
    fn string_list_splits_commas() {
        let config = json!({ "Keys": ["k1,k2", "k3"] });
        let keys = optional_string_list(&config, "Keys", &ctx(), "p");
        assert_eq!(keys, Some(vec!["k1".into(), "k2".into(), "k3".into()]));
    }

    #[test]
    fn map_param_skips_mistyped_values() {
        let config = json!({ "IncludeEnv": { "A": "1", "B": 2 } });
        let map = optional_map(&config, "IncludeEnv", &ctx(), "p").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("A").map(String::as_str), Some("1"));
    }
}
