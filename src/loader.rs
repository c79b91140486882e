//! Plugin module loader using libloading.

use std::fmt;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use thiserror::Error;

use crate::plugin::{
    PluginFactory, PrewarmFn, RegisterFn, ABI_VERSION_SYMBOL, ANSWER_PLUGIN_ABI_VERSION, PREWARM_SYMBOL,
    REGISTER_SYMBOL,
};

/// Dynamic module extension for the current platform.
pub fn platform_module_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

/// Errors raised while opening a plugin module.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Not a loadable plugin module; the file is skipped
    #[error("Malformed plugin module: {0}")]
    Malformed(String),

    /// Built against an older, unsupported ABI; the file is skipped
    #[error("Incompatible plugin ABI: host supports {host}, module declares {module}")]
    Incompatible { host: u32, module: u32 },

    /// A transitive dependency cannot be resolved; aborts the scan
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// The module is not allowed to load; aborts the scan
    #[error("Policy violation: {0}")]
    PolicyViolation(String),
}

impl ModuleError {
    /// Whether this error aborts the whole scan instead of skipping the file.
    pub fn aborts_scan(&self) -> bool {
        matches!(self, ModuleError::MissingDependency(_) | ModuleError::PolicyViolation(_))
    }
}

/// Keeps a module's code mapped, and its shadow copy on disk, while anything
/// created from it is alive.
pub struct ModuleHandle {
    // Field order matters: the library must close before the shadow file is removed.
    _library: Option<Library>,
    _shadow: Option<tempfile::TempPath>,
    path: PathBuf,
}

impl ModuleHandle {
    /// Handle for a module with no backing library (statically linked plugins).
    pub fn detached(path: impl Into<PathBuf>) -> Self {
        Self {
            _library: None,
            _shadow: None,
            path: path.into(),
        }
    }

    pub(crate) fn attach_shadow(&mut self, shadow: tempfile::TempPath) {
        self._shadow = Some(shadow);
    }

    /// Path the module was actually opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("path", &self.path)
            .field("shadow", &self._shadow.is_some())
            .finish()
    }
}

/// Result of opening a module: its plugin factories and optional prewarm hook.
pub struct LoadedModule {
    pub factories: Vec<PluginFactory>,
    pub prewarm: Option<PrewarmFn>,
    pub handle: ModuleHandle,
}

/// Opens plugin modules.
pub trait ModuleLoader: Send + Sync {
    /// Open the module at `path` and collect its plugin factories.
    fn load(&self, path: &Path) -> Result<LoadedModule, ModuleError>;
}

/// Loader for native dynamic libraries.
#[derive(Debug, Clone)]
pub struct DylibLoader {
    abi_version: u32,
}

impl Default for DylibLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DylibLoader {
    pub fn new() -> Self {
        Self {
            abi_version: ANSWER_PLUGIN_ABI_VERSION,
        }
    }

    /// Check the module's declared ABI version.
    ///
    /// A newer ABI than the host knows is a policy violation; an older one
    /// just means the module is stale.
    fn check_abi(&self, library: &Library) -> Result<(), ModuleError> {
        let version_fn: Symbol<extern "C" fn() -> u32> = unsafe {
            library
                .get(ABI_VERSION_SYMBOL)
                .map_err(|e| ModuleError::Malformed(format!("missing ABI version symbol: {}", e)))?
        };
        let version = version_fn();
        if version > self.abi_version {
            return Err(ModuleError::PolicyViolation(format!(
                "module declares ABI version {} but the host allows at most {}",
                version, self.abi_version
            )));
        }
        if version < self.abi_version {
            return Err(ModuleError::Incompatible {
                host: self.abi_version,
                module: version,
            });
        }
        Ok(())
    }
}

impl ModuleLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<LoadedModule, ModuleError> {
        // Safety: loading native code runs its initializers. Plugin modules are
        // trusted to the same degree as the host binary.
        let library = unsafe { Library::new(path) }.map_err(|e| classify_open_error(&e.to_string()))?;

        self.check_abi(&library)?;

        let mut factories: Vec<PluginFactory> = Vec::new();
        {
            let register: Symbol<RegisterFn> = unsafe {
                library
                    .get(REGISTER_SYMBOL)
                    .map_err(|e| ModuleError::Malformed(format!("missing registration symbol: {}", e)))?
            };
            register(&mut factories);
        }

        let prewarm = unsafe { library.get::<PrewarmFn>(PREWARM_SYMBOL) }.ok().map(|f| *f);

        Ok(LoadedModule {
            factories,
            prewarm,
            handle: ModuleHandle {
                _library: Some(library),
                _shadow: None,
                path: path.to_path_buf(),
            },
        })
    }
}

/// Sort a dynamic loader failure into "skip this file" or "abort the scan".
///
/// The OS loader only reports text. Unresolvable shared objects or symbols
/// mean a dependency is missing; anything else is a bad file.
fn classify_open_error(message: &str) -> ModuleError {
    let lower = message.to_ascii_lowercase();
    let dependency_markers = [
        "cannot open shared object file",
        "library not loaded",
        "image not found",
        "the specified module could not be found",
        "undefined symbol",
        "symbol not found",
    ];
    if dependency_markers.iter().any(|m| lower.contains(m)) {
        ModuleError::MissingDependency(message.to_string())
    } else {
        ModuleError::Malformed(message.to_string())
    }
}
