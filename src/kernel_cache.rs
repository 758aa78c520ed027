//! Precompiled kernel module lookup and caching.
//!
//! Modules live at `<module_root>/<token>/<token>.<ext>` and are loaded at
//! most once per token for the lifetime of a [`ModuleCache`].

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use libloading::Library;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::ffi::tvm::{
    any_none, error_object_message, TVMFFIErrorMoveFromRaisedFn, TVMFFIObjectDecRefFn,
    TVMFFISafeCallFn, TVMFFITensorFromDLPackVersionedFn, EXPORT_SYMBOL_PREFIX,
};
use crate::launch::{FfiArgs, FfiRuntime, FfiValue};

/// On-disk location of the module for `token`.
pub fn module_path(config: &DispatchConfig, token: &str) -> PathBuf {
    config
        .module_root()
        .join(token)
        .join(format!("{}.{}", token, config.extension))
}

enum Entries {
    Library(Library),
    Static(HashMap<String, TVMFFISafeCallFn>),
}

/// A loaded kernel module.
pub struct KernelModule {
    uri: String,
    path: PathBuf,
    entries: Entries,
    runtime: Option<FfiRuntime>,
}

// Entry points are plain C functions; the library handle is only read after load.
unsafe impl Send for KernelModule {}
unsafe impl Sync for KernelModule {}

/// Runtime symbols come from the module's libtvm_ffi dependency.
fn resolve_runtime(library: &Library) -> Result<FfiRuntime, &'static str> {
    // SAFETY: signatures match the TVM-FFI C API.
    unsafe {
        let tensor_from_dlpack = library
            .get::<TVMFFITensorFromDLPackVersionedFn>(b"TVMFFITensorFromDLPackVersioned\0")
            .map_err(|_| "TVMFFITensorFromDLPackVersioned")?;
        let decref = library
            .get::<TVMFFIObjectDecRefFn>(b"TVMFFIObjectDecRef\0")
            .map_err(|_| "TVMFFIObjectDecRef")?;
        let move_from_raised = library
            .get::<TVMFFIErrorMoveFromRaisedFn>(b"TVMFFIErrorMoveFromRaised\0")
            .ok()
            .map(|sym| *sym);
        Ok(FfiRuntime {
            tensor_from_dlpack: *tensor_from_dlpack,
            decref: *decref,
            move_from_raised,
        })
    }
}

impl KernelModule {
    /// Load the shared object at `path`. No fallback locations are tried.
    pub fn load(uri: &str, path: &Path) -> DispatchResult<Self> {
        if !path.is_file() {
            return Err(DispatchError::ModuleNotFound {
                uri: uri.to_string(),
                path: path.to_path_buf(),
            });
        }
        let load_error = |reason: String| DispatchError::ModuleLoad {
            uri: uri.to_string(),
            path: path.to_path_buf(),
            reason,
        };
        // SAFETY: module initialisers run here; cached modules are trusted build outputs.
        let library = unsafe { Library::new(path) }.map_err(|e| load_error(e.to_string()))?;
        let runtime = resolve_runtime(&library)
            .map_err(|symbol| load_error(format!("missing TVM-FFI runtime symbol `{symbol}`")))?;

        Ok(Self {
            uri: uri.to_string(),
            path: path.to_path_buf(),
            entries: Entries::Library(library),
            runtime: Some(runtime),
        })
    }

    /// Build a module from entry points linked into the current binary.
    ///
    /// Without [`KernelModule::with_runtime`] its entries receive tensors as
    /// borrowed `DLTensor*` views.
    pub fn from_entries<I, S>(uri: &str, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, TVMFFISafeCallFn)>,
        S: Into<String>,
    {
        Self {
            uri: uri.to_string(),
            path: PathBuf::new(),
            entries: Entries::Static(entries.into_iter().map(|(n, f)| (n.into(), f)).collect()),
            runtime: None,
        }
    }

    pub fn with_runtime(mut self, runtime: FfiRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve the exported entry point `name`.
    pub fn function(&self, name: &str) -> DispatchResult<ModuleFunction<'_>> {
        let call = match &self.entries {
            Entries::Library(library) => {
                let symbol = format!("{EXPORT_SYMBOL_PREFIX}{name}\0");
                // SAFETY: every `__tvm_ffi_` export uses the safe-call signature.
                unsafe { library.get::<TVMFFISafeCallFn>(symbol.as_bytes()) }
                    .ok()
                    .map(|sym| *sym)
            }
            Entries::Static(map) => map.get(name).copied(),
        };
        let call = call.ok_or_else(|| DispatchError::MissingEntryPoint {
            uri: self.uri.clone(),
            function: name.to_string(),
            path: self.path.clone(),
        })?;
        Ok(ModuleFunction {
            module: self,
            name: name.to_string(),
            call,
        })
    }

    /// Take the thread's pending error, if the runtime recorded one.
    fn take_raised(&self) -> Option<String> {
        let runtime = self.runtime?;
        let move_from_raised = runtime.move_from_raised?;
        let mut err: *mut c_void = std::ptr::null_mut();
        // SAFETY: hands us the thread's pending error object, or null.
        unsafe { move_from_raised(&mut err) };
        if err.is_null() {
            return None;
        }
        // SAFETY: `err` is a live error object we now own.
        let message = unsafe { error_object_message(err) };
        unsafe { (runtime.decref)(err) };
        Some(message)
    }

    fn call_error(&self, function: &str, fallback: String) -> DispatchError {
        DispatchError::KernelCall {
            uri: self.uri.clone(),
            function: function.to_string(),
            message: self.take_raised().unwrap_or(fallback),
        }
    }
}

impl std::fmt::Debug for KernelModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelModule")
            .field("uri", &self.uri)
            .field("path", &self.path)
            .finish()
    }
}

/// A resolved entry point of a [`KernelModule`].
pub struct ModuleFunction<'m> {
    module: &'m KernelModule,
    name: String,
    call: TVMFFISafeCallFn,
}

impl<'m> ModuleFunction<'m> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the entry point synchronously.
    pub fn call(&self, args: &FfiArgs<'_>) -> DispatchResult<FfiValue<'m>> {
        let packed = args.pack(self.module.runtime.as_ref()).map_err(|tensor| {
            let err = self
                .module
                .call_error(&self.name, format!("cannot wrap tensor `{tensor}` as a Tensor object"));
            log::warn!("{}", err);
            err
        })?;
        let values = packed.as_slice();
        let mut result = any_none();
        log::trace!("Calling {}::{} with {} args", self.module.uri, self.name, values.len());
        // SAFETY: `values` and the objects they reference stay alive for the call.
        let code = unsafe {
            (self.call)(
                std::ptr::null_mut(),
                values.as_ptr(),
                values.len() as i32,
                &mut result,
            )
        };
        drop(packed);
        if code != 0 {
            let err = self
                .module
                .call_error(&self.name, format!("entry point returned error code {code}"));
            log::warn!("{}", err);
            return Err(err);
        }
        Ok(FfiValue::new(result, self.module.runtime.map(|r| r.decref)))
    }
}

/// Per-token entry. `loading` serialises loads of one token only.
#[derive(Default)]
struct Slot {
    module: OnceLock<Arc<KernelModule>>,
    loading: Mutex<()>,
}

/// Token-keyed cache of loaded modules.
#[derive(Default)]
pub struct ModuleCache {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the module for `token`, loading it on first use.
    ///
    /// Hits never wait on a load, including loads of the same token that
    /// finished after the lookup. A failed load is not cached, so the next
    /// call retries the file system.
    pub fn get_or_load(&self, config: &DispatchConfig, token: &str) -> DispatchResult<Arc<KernelModule>> {
        let slot = self.slot(token);
        if let Some(module) = slot.module.get() {
            log::debug!("Kernel module cache hit: {}", token);
            return Ok(Arc::clone(module));
        }

        let _loading = slot
            .loading
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(module) = slot.module.get() {
            return Ok(Arc::clone(module));
        }

        let path = module_path(config, token);
        match KernelModule::load(token, &path) {
            Ok(module) => {
                log::info!("Loaded kernel module: {:?}", path);
                Ok(Arc::clone(slot.module.get_or_init(|| Arc::new(module))))
            }
            Err(e) => {
                log::warn!("Failed to load kernel module {}: {}", token, e);
                Err(e)
            }
        }
    }

    fn slot(&self, token: &str) -> Arc<Slot> {
        if let Some(slot) = self.read_map().get(token) {
            return Arc::clone(slot);
        }
        let mut map = self
            .slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(map.entry(token.to_string()).or_default())
    }

    /// Register a module under `token`, replacing any previous entry.
    pub fn insert(&self, token: impl Into<String>, module: KernelModule) -> Arc<KernelModule> {
        let module = Arc::new(module);
        let slot = Slot::default();
        let _ = slot.module.set(Arc::clone(&module));
        self.slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(token.into(), Arc::new(slot));
        module
    }

    pub fn contains(&self, token: &str) -> bool {
        self.read_map()
            .get(token)
            .is_some_and(|slot| slot.module.get().is_some())
    }

    /// Number of loaded modules.
    pub fn len(&self) -> usize {
        self.read_map()
            .values()
            .filter(|slot| slot.module.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached handle. Modules stay mapped while callers hold an `Arc`.
    pub fn clear(&self) {
        let mut map = self
            .slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        log::info!("Cleared {} cached kernel modules", map.len());
        map.clear();
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache").field("len", &self.len()).finish()
    }
}
