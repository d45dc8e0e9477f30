use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use harvester_api::config::{self, PipelineContext};
use harvester_api::error::PluginError;

/// Raw filter strings as read from the `ContainerFilters` object.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilterConfig {
    pub k8s_namespace_regex: Option<String>,
    pub k8s_pod_regex: Option<String>,
    pub k8s_container_regex: Option<String>,
    pub include_k8s_label: HashMap<String, String>,
    pub exclude_k8s_label: HashMap<String, String>,
    pub include_env: HashMap<String, String>,
    pub exclude_env: HashMap<String, String>,
    pub include_container_label: HashMap<String, String>,
    pub exclude_container_label: HashMap<String, String>,
}

impl ContainerFilterConfig {
    pub fn parse(config: &Value, ctx: &PipelineContext, plugin: &str) -> Self {
        let mut out = Self {
            k8s_namespace_regex: config::optional_string(config, "K8sNamespaceRegex", ctx, plugin),
            k8s_pod_regex: config::optional_string(config, "K8sPodRegex", ctx, plugin),
            k8s_container_regex: config::optional_string(config, "K8sContainerRegex", ctx, plugin),
            ..Default::default()
        };
        for (key, target) in [
            ("IncludeK8sLabel", &mut out.include_k8s_label),
            ("ExcludeK8sLabel", &mut out.exclude_k8s_label),
            ("IncludeEnv", &mut out.include_env),
            ("ExcludeEnv", &mut out.exclude_env),
            ("IncludeContainerLabel", &mut out.include_container_label),
            ("ExcludeContainerLabel", &mut out.exclude_container_label),
        ] {
            if let Some(map) = config::optional_map(config, key, ctx, plugin) {
                *target = map;
            }
        }
        out
    }
}

/// One include/exclude map, split into exact-match and regex entries.
/// Values that begin with `^` and end with `$` are compiled as regular
/// expressions; everything else is exact-match.
#[derive(Debug, Default)]
pub struct FieldFilter {
    exact: HashMap<String, String>,
    regex: HashMap<String, Regex>,
}

impl FieldFilter {
    fn compile(source: &HashMap<String, String>) -> Result<Self, PluginError> {
        let mut exact = HashMap::new();
        let mut regex = HashMap::new();
        for (key, value) in source {
            let is_regex = value.starts_with('^') && value.ends_with('$') && !value.is_empty();
            if is_regex {
                let compiled = Regex::new(value)
                    .map_err(|e| PluginError::config(format!("filter '{key}': {e}")))?;
                regex.insert(key.clone(), compiled);
            } else {
                exact.insert(key.clone(), value.clone());
            }
        }
        Ok(Self { exact, regex })
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.regex.is_empty()
    }

    fn entry_matches(&self, fields: &HashMap<String, String>, key: &str) -> bool {
        let Some(actual) = fields.get(key) else {
            return false;
        };
        if let Some(expected) = self.exact.get(key) {
            return actual == expected;
        }
        if let Some(re) = self.regex.get(key) {
            return re.is_match(actual);
        }
        false
    }

    /// Include semantics: every entry must be satisfied.
    pub fn matches_all(&self, fields: &HashMap<String, String>) -> bool {
        self.exact.keys().chain(self.regex.keys()).all(|k| self.entry_matches(fields, k))
    }

    /// Exclude semantics: any satisfied entry rejects.
    pub fn matches_any(&self, fields: &HashMap<String, String>) -> bool {
        self.exact.keys().chain(self.regex.keys()).any(|k| self.entry_matches(fields, k))
    }
}

/// Compiled container filters. Regex compile failure is a config error at
/// init, never at discovery time.
#[derive(Debug, Default)]
pub struct ContainerFilters {
    namespace_regex: Option<Regex>,
    pod_regex: Option<Regex>,
    container_regex: Option<Regex>,
    include_k8s_label: FieldFilter,
    exclude_k8s_label: FieldFilter,
    include_env: FieldFilter,
    exclude_env: FieldFilter,
    include_container_label: FieldFilter,
    exclude_container_label: FieldFilter,
}

/// Discovery record for one container, as read from the state file.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ContainerMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub k8s_namespace: String,
    #[serde(default)]
    pub k8s_pod: String,
    #[serde(default)]
    pub k8s_container: String,
    #[serde(default)]
    pub k8s_labels: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ContainerFilters {
    pub fn compile(config: &ContainerFilterConfig) -> Result<Self, PluginError> {
        let compile_opt = |pattern: &Option<String>, what: &str| -> Result<Option<Regex>, PluginError> {
            match pattern {
                Some(p) if !p.is_empty() => Regex::new(p)
                    .map(Some)
                    .map_err(|e| PluginError::config(format!("{what}: {e}"))),
                _ => Ok(None),
            }
        };
        Ok(Self {
            namespace_regex: compile_opt(&config.k8s_namespace_regex, "K8sNamespaceRegex")?,
            pod_regex: compile_opt(&config.k8s_pod_regex, "K8sPodRegex")?,
            container_regex: compile_opt(&config.k8s_container_regex, "K8sContainerRegex")?,
            include_k8s_label: FieldFilter::compile(&config.include_k8s_label)?,
            exclude_k8s_label: FieldFilter::compile(&config.exclude_k8s_label)?,
            include_env: FieldFilter::compile(&config.include_env)?,
            exclude_env: FieldFilter::compile(&config.exclude_env)?,
            include_container_label: FieldFilter::compile(&config.include_container_label)?,
            exclude_container_label: FieldFilter::compile(&config.exclude_container_label)?,
        })
    }

    pub fn matches(&self, meta: &ContainerMeta) -> bool {
        if let Some(re) = &self.namespace_regex {
            if !re.is_match(&meta.k8s_namespace) {
                return false;
            }
        }
        if let Some(re) = &self.pod_regex {
            if !re.is_match(&meta.k8s_pod) {
                return false;
            }
        }
        if let Some(re) = &self.container_regex {
            if !re.is_match(&meta.k8s_container) {
                return false;
            }
        }
        if !self.include_k8s_label.is_empty() && !self.include_k8s_label.matches_all(&meta.k8s_labels)
        {
            return false;
        }
        if self.exclude_k8s_label.matches_any(&meta.k8s_labels) {
            return false;
        }
        if !self.include_env.is_empty() && !self.include_env.matches_all(&meta.env) {
            return false;
        }
        if self.exclude_env.matches_any(&meta.env) {
            return false;
        }
        if !self.include_container_label.is_empty()
            && !self.include_container_label.matches_all(&meta.labels)
        {
            return false;
        }
        if self.exclude_container_label.matches_any(&meta.labels) {
            return false;
        }
        true
    }
}
