use std::path::Path;
use std::sync::Arc;

use libloading::{Library, Symbol};

use harvester_api::error::PluginError;
use harvester_api::ffi::{
    AbiVersionFn, CreatePluginFn, DestroyPluginFn, HV_ABI_VERSION, PluginCategory,
    PluginCreateResult, PluginManifestEntry, PluginTypesFn,
};
use harvester_api::plugin::{Flusher, Input, Processor};

use crate::error::EngineError;
use crate::registry::PluginFactory;

/// One plugin type loaded from a dynamic module, ready for registration.
pub struct LoadedPlugin {
    pub type_name: String,
    pub singleton: bool,
    pub factory: PluginFactory,
}

impl LoadedPlugin {
    pub fn category(&self) -> PluginCategory {
        match &self.factory {
            PluginFactory::Input(_) => PluginCategory::Input,
            PluginFactory::Processor(_) => PluginCategory::Processor,
            PluginFactory::Flusher(_) => PluginCategory::Flusher,
        }
    }
}

/// A loaded module with its per-category create symbols. Kept alive inside
/// the factory closures so the library outlives every plugin it produced.
struct ModuleHandle {
    _lib: Library,
    create_input: Option<CreatePluginFn>,
    create_processor: Option<CreatePluginFn>,
    create_flusher: Option<CreatePluginFn>,
    // Resolved for ABI completeness; ownership of created plugins moves to
    // the host, so the destroy path is only exercised on creation failure
    // inside the module itself.
    _destroy_input: Option<DestroyPluginFn>,
    _destroy_processor: Option<DestroyPluginFn>,
    _destroy_flusher: Option<DestroyPluginFn>,
}

/// Load a plugin module: verify ABI version, read the manifest, and build
/// one factory per offered plugin type.
pub fn load_module(path: &Path) -> Result<Vec<LoadedPlugin>, EngineError> {
    let lib = unsafe { Library::new(path) }.map_err(|e| {
        EngineError::Config(format!("failed to load plugin module '{}': {e}", path.display()))
    })?;

    // Check ABI version.
    let abi_fn: Symbol<AbiVersionFn> = unsafe { lib.get(b"hv_abi_version") }.map_err(|e| {
        EngineError::Config(format!(
            "plugin module '{}' missing hv_abi_version symbol: {e}",
            path.display()
        ))
    })?;
    let module_abi = unsafe { abi_fn() };
    if module_abi != HV_ABI_VERSION {
        return Err(EngineError::Config(format!(
            "plugin module '{}' ABI version mismatch: module={module_abi}, host={HV_ABI_VERSION}",
            path.display()
        )));
    }

    let types_fn: Symbol<PluginTypesFn> = unsafe { lib.get(b"hv_plugin_types") }.map_err(|e| {
        EngineError::Config(format!(
            "plugin module '{}' missing hv_plugin_types symbol: {e}",
            path.display()
        ))
    })?;
    let manifest = {
        let ptr = unsafe { types_fn() };
        if ptr.is_null() {
            Vec::new()
        } else {
            // The module returned a Box<Vec<PluginManifestEntry>>; take
            // ownership.
            unsafe { *Box::from_raw(ptr as *mut Vec<PluginManifestEntry>) }
        }
    };

    let needs = |cat: PluginCategory| manifest.iter().any(|e| e.category == cat);
    let resolve = |create: &[u8], destroy: &[u8]| -> (Option<CreatePluginFn>, Option<DestroyPluginFn>) {
        let create = unsafe { lib.get::<CreatePluginFn>(create) }.ok().map(|s| *s);
        let destroy = unsafe { lib.get::<DestroyPluginFn>(destroy) }.ok().map(|s| *s);
        (create, destroy)
    };
    let (create_input, destroy_input) = if needs(PluginCategory::Input) {
        resolve(b"hv_create_input", b"hv_destroy_input")
    } else {
        (None, None)
    };
    let (create_processor, destroy_processor) = if needs(PluginCategory::Processor) {
        resolve(b"hv_create_processor", b"hv_destroy_processor")
    } else {
        (None, None)
    };
    let (create_flusher, destroy_flusher) = if needs(PluginCategory::Flusher) {
        resolve(b"hv_create_flusher", b"hv_destroy_flusher")
    } else {
        (None, None)
    };

    let handle = Arc::new(ModuleHandle {
        _lib: lib,
        create_input,
        create_processor,
        create_flusher,
        _destroy_input: destroy_input,
        _destroy_processor: destroy_processor,
        _destroy_flusher: destroy_flusher,
    });

    let mut loaded = Vec::new();
    for entry in manifest {
        let factory = match entry.category {
            PluginCategory::Input => match handle.create_input {
                Some(create) => {
                    let handle = handle.clone();
                    let name = entry.type_name.clone();
                    PluginFactory::Input(Box::new(move || {
                        let _keep_alive = &handle;
                        let result = unsafe { create(name.as_ptr(), name.len()) };
                        // Safety: on success the module returned a
                        // Box<Box<dyn Input>> built against the same ABI.
                        unsafe { reconstruct::<dyn Input>(result) }
                    }))
                }
                None => {
                    warn_missing_symbol(path, &entry, "hv_create_input");
                    continue;
                }
            },
            PluginCategory::Processor => match handle.create_processor {
                Some(create) => {
                    let handle = handle.clone();
                    let name = entry.type_name.clone();
                    PluginFactory::Processor(Box::new(move || {
                        let _keep_alive = &handle;
                        let result = unsafe { create(name.as_ptr(), name.len()) };
                        unsafe { reconstruct::<dyn Processor>(result) }
                    }))
                }
                None => {
                    warn_missing_symbol(path, &entry, "hv_create_processor");
                    continue;
                }
            },
            PluginCategory::Flusher => match handle.create_flusher {
                Some(create) => {
                    let handle = handle.clone();
                    let name = entry.type_name.clone();
                    PluginFactory::Flusher(Box::new(move || {
                        let _keep_alive = &handle;
                        let result = unsafe { create(name.as_ptr(), name.len()) };
                        unsafe { reconstruct::<dyn Flusher>(result) }
                    }))
                }
                None => {
                    warn_missing_symbol(path, &entry, "hv_create_flusher");
                    continue;
                }
            },
        };
        loaded.push(LoadedPlugin { type_name: entry.type_name, singleton: entry.singleton, factory });
    }
    Ok(loaded)
}

fn warn_missing_symbol(path: &Path, entry: &PluginManifestEntry, symbol: &str) {
    tracing::warn!(
        module = %path.display(),
        plugin = %entry.type_name,
        symbol,
        "manifest offers a plugin but its create symbol is missing, skipping"
    );
}

/// Turn a `PluginCreateResult` back into an owned trait object.
///
/// # Safety
///
/// `result.plugin_ptr`, when non-null, must point to a `Box<Box<T>>`
/// allocated by the module; `result.error_ptr`, when non-null, must point
/// to `error_len` heap bytes the host now owns.
unsafe fn reconstruct<T: ?Sized>(result: PluginCreateResult) -> Result<Box<T>, PluginError> {
    if result.plugin_ptr.is_null() {
        let msg = if !result.error_ptr.is_null() && result.error_len > 0 {
            let error_msg = unsafe {
                String::from_utf8_lossy(std::slice::from_raw_parts(
                    result.error_ptr,
                    result.error_len,
                ))
                .into_owned()
            };
            // Free the error string allocated by the module.
            unsafe {
                let _ = Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                    result.error_ptr,
                    result.error_len,
                ));
            };
            error_msg
        } else {
            "unknown error".to_string()
        };
        return Err(PluginError::config(format!("plugin create failed: {msg}")));
    }
    Ok(unsafe { *Box::from_raw(result.plugin_ptr as *mut Box<T>) })
}
