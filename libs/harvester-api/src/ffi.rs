/// Current ABI version. The host checks this against a module's
/// `hv_abi_version()` before registering anything from it.
pub const HV_ABI_VERSION: u32 = 1;

/// Plugin category, shared between the registry and dynamic modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginCategory {
    Input,
    Processor,
    Flusher,
}

impl std::fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginCategory::Input => write!(f, "input"),
            PluginCategory::Processor => write!(f, "processor"),
            PluginCategory::Flusher => write!(f, "flusher"),
        }
    }
}

/// One plugin type offered by a dynamic module.
#[derive(Debug, Clone)]
pub struct PluginManifestEntry {
    pub category: PluginCategory,
    pub type_name: String,
    pub singleton: bool,
}

/// FFI return struct from `hv_create_*` functions.
#[repr(C)]
pub struct PluginCreateResult {
    /// Pointer to the created plugin object (`Box<Box<dyn Trait>>`).
    /// Null if creation failed.
    pub plugin_ptr: *mut (),
    /// Pointer to a heap-allocated error string. Null on success.
    pub error_ptr: *mut u8,
    /// Length of the error string.
    pub error_len: usize,
}

/// Type signature for the `hv_abi_version` symbol.
pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

/// Type signature for the `hv_plugin_types` symbol.
/// Returns a pointer to a boxed `Vec<PluginManifestEntry>`; caller takes
/// ownership.
pub type PluginTypesFn = unsafe extern "C" fn() -> *mut ();

/// Type signature for `hv_create_*` symbols. Takes the requested type name
/// as a borrowed (ptr, len) UTF-8 slice.
pub type CreatePluginFn = unsafe extern "C" fn(*const u8, usize) -> PluginCreateResult;

/// Type signature for `hv_destroy_*` symbols.
pub type DestroyPluginFn = unsafe extern "C" fn(*mut ());

/// Helper: create a successful `PluginCreateResult` from a trait object.
pub fn plugin_ok<T: ?Sized>(plugin: Box<Box<T>>) -> PluginCreateResult {
    PluginCreateResult {
        plugin_ptr: Box::into_raw(plugin) as *mut (),
        error_ptr: std::ptr::null_mut(),
        error_len: 0,
    }
}

/// Helper: create a failed `PluginCreateResult` from an error message.
pub fn plugin_err(msg: &str) -> PluginCreateResult {
    let bytes = msg.as_bytes().to_vec();
    let len = bytes.len();
    let ptr = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
    PluginCreateResult {
        plugin_ptr: std::ptr::null_mut(),
        error_ptr: ptr,
        error_len: len,
    }
}

/// Helper: return a manifest from module to host. The host reconstructs it
/// as `Box<Vec<PluginManifestEntry>>` and takes ownership.
pub fn manifest_ok(entries: Vec<PluginManifestEntry>) -> *mut () {
    Box::into_raw(Box::new(entries)) as *mut ()
}

/// Reassemble the borrowed type-name slice passed to `hv_create_*`.
///
/// # Safety
///
/// `ptr` must point to `len` bytes of valid UTF-8 owned by the host for the
/// duration of the call.
pub unsafe fn type_name_from_raw<'a>(ptr: *const u8, len: usize) -> Result<&'a str, std::str::Utf8Error> {
    std::str::from_utf8(unsafe { std::slice::from_raw_parts(ptr, len) })
}

/// Macro: export the `hv_abi_version` function.
#[macro_export]
macro_rules! hv_abi_version_fn {
    () => {
        #[unsafe(no_mangle)]
        pub extern "C" fn hv_abi_version() -> u32 {
            $crate::ffi::HV_ABI_VERSION
        }
    };
}

/// Macro: export the `hv_plugin_types` manifest function.
#[macro_export]
macro_rules! hv_plugin_types_fn {
    ([$($entry:expr),* $(,)?]) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn hv_plugin_types() -> *mut () {
            $crate::ffi::manifest_ok(vec![$($entry),*])
        }
    };
}

/// Macro: export an `hv_destroy_*` function for a trait object.
#[macro_export]
macro_rules! hv_destroy_fn {
    ($name:ident, $trait_ty:path) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name(ptr: *mut ()) {
            if !ptr.is_null() {
                let _ = unsafe { Box::from_raw(ptr as *mut Box<dyn $trait_ty>) };
            }
        }
    };
}
