use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use harvester_api::error::PluginError;
use harvester_api::ffi::PluginCategory;
use harvester_api::plugin::{Flusher, Input, Processor};

use crate::error::EngineError;
use crate::plugin_host;

pub type InputFactory = Box<dyn Fn() -> Result<Box<dyn Input>, PluginError> + Send + Sync>;
pub type ProcessorFactory = Box<dyn Fn() -> Result<Box<dyn Processor>, PluginError> + Send + Sync>;
pub type FlusherFactory = Box<dyn Fn() -> Result<Box<dyn Flusher>, PluginError> + Send + Sync>;

pub enum PluginFactory {
    Input(InputFactory),
    Processor(ProcessorFactory),
    Flusher(FlusherFactory),
}

struct PluginCreator {
    factory: PluginFactory,
    singleton: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PluginKey {
    category: PluginCategory,
    name: String,
}

/// Process-wide catalog mapping `(category, type name)` to a factory.
///
/// Written only during startup/reload; steady-state lookups take the read
/// lock.
pub struct PluginRegistry {
    plugins: RwLock<HashMap<PluginKey, PluginCreator>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self { plugins: RwLock::new(HashMap::new()) }
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every built-in plugin, then discover optional dynamic
    /// modules. A module that fails to load is skipped with a warning —
    /// never fatal.
    pub fn load(&self, dynamic_modules: &[String]) -> Result<(), EngineError> {
        self.load_static_plugins()?;
        for module in dynamic_modules {
            self.load_dynamic_module(Path::new(module));
        }
        Ok(())
    }

    /// Drop the whole catalog (teardown and tests).
    pub fn unload(&self) {
        self.write().clear();
    }

    fn load_static_plugins(&self) -> Result<(), EngineError> {
        use harvester_flusher_file::FileFlusher;
        use harvester_input_container_discovery::ContainerDiscoveryInput;
        use harvester_input_host_monitor::HostMonitorInput;
        use harvester_processor_parse_regex::ParseRegexProcessor;
        use harvester_processor_tag::TagProcessor;

        self.register_input(
            harvester_input_host_monitor::TYPE_NAME,
            Box::new(|| Ok(Box::new(HostMonitorInput::new()) as Box<dyn Input>)),
            true,
        )?;
        self.register_input(
            harvester_input_container_discovery::TYPE_NAME,
            Box::new(|| Ok(Box::new(ContainerDiscoveryInput::new()) as Box<dyn Input>)),
            true,
        )?;
        self.register_processor(
            harvester_processor_tag::TYPE_NAME,
            Box::new(|| Ok(Box::new(TagProcessor::new()) as Box<dyn Processor>)),
        )?;
        self.register_processor(
            harvester_processor_parse_regex::TYPE_NAME,
            Box::new(|| Ok(Box::new(ParseRegexProcessor::new()) as Box<dyn Processor>)),
        )?;
        self.register_flusher(
            harvester_flusher_file::TYPE_NAME,
            Box::new(|| Ok(Box::new(FileFlusher::new()) as Box<dyn Flusher>)),
            false,
        )?;
        Ok(())
    }

    fn load_dynamic_module(&self, path: &Path) {
        let loaded = match plugin_host::load_module(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(module = %path.display(), error = %e, "skipping plugin module");
                return;
            }
        };
        for plugin in loaded {
            let name = plugin.type_name.clone();
            let category = plugin.category();
            let result = self.register(category, &name, plugin.factory, plugin.singleton, false);
            match result {
                Ok(()) => {
                    tracing::info!(module = %path.display(), %category, plugin = %name, "registered dynamic plugin")
                }
                Err(e) => {
                    tracing::warn!(module = %path.display(), plugin = %name, error = %e, "skipping dynamic plugin")
                }
            }
        }
    }

    pub fn register_input(
        &self,
        name: &str,
        factory: InputFactory,
        singleton: bool,
    ) -> Result<(), EngineError> {
        self.register(PluginCategory::Input, name, PluginFactory::Input(factory), singleton, false)
    }

    pub fn register_processor(
        &self,
        name: &str,
        factory: ProcessorFactory,
    ) -> Result<(), EngineError> {
        self.register(
            PluginCategory::Processor,
            name,
            PluginFactory::Processor(factory),
            false,
            false,
        )
    }

    pub fn register_flusher(
        &self,
        name: &str,
        factory: FlusherFactory,
        singleton: bool,
    ) -> Result<(), EngineError> {
        self.register(
            PluginCategory::Flusher,
            name,
            PluginFactory::Flusher(factory),
            singleton,
            false,
        )
    }

    /// Replace an existing registration (tests and module upgrades).
    pub fn register_override(
        &self,
        category: PluginCategory,
        name: &str,
        factory: PluginFactory,
        singleton: bool,
    ) {
        // Explicit override never fails on duplicates.
        let _ = self.register(category, name, factory, singleton, true);
    }

    fn register(
        &self,
        category: PluginCategory,
        name: &str,
        factory: PluginFactory,
        singleton: bool,
        replace: bool,
    ) -> Result<(), EngineError> {
        let key = PluginKey { category, name: name.to_string() };
        let mut plugins = self.write();
        if !replace && plugins.contains_key(&key) {
            return Err(EngineError::DuplicatePlugin { category, name: name.to_string() });
        }
        plugins.insert(key, PluginCreator { factory, singleton });
        Ok(())
    }

    pub fn create_input(&self, name: &str) -> Result<Box<dyn Input>, EngineError> {
        let plugins = self.read();
        match plugins.get(&PluginKey { category: PluginCategory::Input, name: name.to_string() }) {
            Some(PluginCreator { factory: PluginFactory::Input(f), .. }) => Ok(f()?),
            _ => Err(EngineError::UnknownPlugin {
                category: PluginCategory::Input,
                name: name.to_string(),
            }),
        }
    }

    pub fn create_processor(&self, name: &str) -> Result<Box<dyn Processor>, EngineError> {
        let plugins = self.read();
        match plugins
            .get(&PluginKey { category: PluginCategory::Processor, name: name.to_string() })
        {
            Some(PluginCreator { factory: PluginFactory::Processor(f), .. }) => Ok(f()?),
            _ => Err(EngineError::UnknownPlugin {
                category: PluginCategory::Processor,
                name: name.to_string(),
            }),
        }
    }

    pub fn create_flusher(&self, name: &str) -> Result<Box<dyn Flusher>, EngineError> {
        let plugins = self.read();
        match plugins.get(&PluginKey { category: PluginCategory::Flusher, name: name.to_string() })
        {
            Some(PluginCreator { factory: PluginFactory::Flusher(f), .. }) => Ok(f()?),
            _ => Err(EngineError::UnknownPlugin {
                category: PluginCategory::Flusher,
                name: name.to_string(),
            }),
        }
    }

    pub fn is_valid_input(&self, name: &str) -> bool {
        self.contains(PluginCategory::Input, name)
    }

    pub fn is_valid_processor(&self, name: &str) -> bool {
        self.contains(PluginCategory::Processor, name)
    }

    pub fn is_valid_flusher(&self, name: &str) -> bool {
        self.contains(PluginCategory::Flusher, name)
    }

    /// True when at most one instance of this input may be applied across
    /// all configs simultaneously.
    pub fn is_global_singleton_input(&self, name: &str) -> bool {
        self.read()
            .get(&PluginKey { category: PluginCategory::Input, name: name.to_string() })
            .is_some_and(|c| c.singleton)
    }

    fn contains(&self, category: PluginCategory, name: &str) -> bool {
        self.read()
            .contains_key(&PluginKey { category, name: name.to_string() })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PluginKey, PluginCreator>> {
        match self.plugins.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("plugin registry read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PluginKey, PluginCreator>> {
        match self.plugins.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("plugin registry write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use serde_json::Value;

    use harvester_api::config::PipelineContext;
    use harvester_api::event::EventGroup;
    use harvester_api::plugin::InputContext;

    use super::*;

    struct NoopInput;

    impl Input for NoopInput {
        fn name(&self) -> &'static str {
            "input_noop"
        }
        fn init(&mut self, _: &Value, _: &PipelineContext) -> Result<(), PluginError> {
            Ok(())
        }
        fn run(
            &self,
            _ctx: InputContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
        fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct NoopProcessor;

    impl Processor for NoopProcessor {
        fn name(&self) -> &'static str {
            "processor_noop"
        }
        fn init(&mut self, _: &Value, _: &PipelineContext) -> Result<(), PluginError> {
            Ok(())
        }
        fn process(&self, _group: &mut EventGroup) {}
    }

    fn noop_input_factory() -> InputFactory {
        Box::new(|| Ok(Box::new(NoopInput) as Box<dyn Input>))
    }

    #[test]
    fn built_in_catalog_loads() {
        let registry = PluginRegistry::new();
        registry.load(&[]).unwrap();
        assert!(registry.is_valid_input("input_host_monitor"));
        assert!(registry.is_valid_input("input_container_discovery"));
        assert!(registry.is_valid_processor("processor_tag"));
        assert!(registry.is_valid_processor("processor_parse_regex"));
        assert!(registry.is_valid_flusher("flusher_file"));
        assert!(registry.is_global_singleton_input("input_host_monitor"));
        assert!(!registry.is_valid_flusher("input_host_monitor"));
    }

    #[test]
    fn duplicate_registration_fails_without_override() {
        let registry = PluginRegistry::new();
        registry
            .register_input("input_noop", noop_input_factory(), false)
            .unwrap();
        let err = registry.register_input("input_noop", noop_input_factory(), true);
        assert!(matches!(err, Err(EngineError::DuplicatePlugin { .. })));
        // First registration won: not a singleton.
        assert!(!registry.is_global_singleton_input("input_noop"));

        registry.register_override(
            PluginCategory::Input,
            "input_noop",
            PluginFactory::Input(noop_input_factory()),
            true,
        );
        assert!(registry.is_global_singleton_input("input_noop"));
    }

    #[test]
    fn same_name_across_categories_is_allowed() {
        let registry = PluginRegistry::new();
        registry
            .register_input("noop", noop_input_factory(), false)
            .unwrap();
        registry
            .register_processor("noop", Box::new(|| Ok(Box::new(NoopProcessor) as Box<dyn Processor>)))
            .unwrap();
        assert!(registry.is_valid_input("noop"));
        assert!(registry.is_valid_processor("noop"));
    }

    #[test]
    fn unknown_plugin_create_fails() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.create_input("missing"),
            Err(EngineError::UnknownPlugin { .. })
        ));
    }

    #[test]
    fn unload_clears_catalog() {
        let registry = PluginRegistry::new();
        registry.load(&[]).unwrap();
        registry.unload();
        assert!(!registry.is_valid_input("input_host_monitor"));
        // A second load after unload succeeds (no stale duplicates).
        registry.load(&[]).unwrap();
        assert!(registry.is_valid_input("input_host_monitor"));
    }

    #[test]
    fn missing_dynamic_module_is_not_fatal() {
        let registry = PluginRegistry::new();
        registry
            .load(&["/nonexistent/libplugins.so".to_string()])
            .unwrap();
        assert!(registry.is_valid_input("input_host_monitor"));
    }
}
