//! Plugin discovery.
//!
//! The registry walks a plugin directory for module files, opens every file
//! that is new or has a newer last-write time than on the previous scan, and
//! records one [`RegistryEntry`] per plugin type the module registers. Files
//! that have not changed are never re-opened.
//!
//! A scan is all-or-nothing. Entries collected from touched files are staged
//! and applied in a single step, so lookups see either the old table or the
//! new one. If a module has a missing dependency or violates loading policy
//! the scan aborts: nothing is applied and the touched files are forgotten,
//! so the next scan tries them again.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{panic_message, HostError, Result};
use crate::fs::{normalize, FileSystem};
use crate::identity::PluginIdentity;
use crate::loader::{LoadedModule, ModuleError, ModuleHandle, ModuleLoader};
use crate::plugin::{AnswerPlugin, PluginFactory, PrewarmFn};

/// How module files are found and opened.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Module file extension, without the dot
    pub extension: String,
    /// Open a private copy of each module instead of the original file
    pub shadow_copy: bool,
    /// Where shadow copies are written
    pub shadow_dir: PathBuf,
}

impl ScanOptions {
    /// Open module files in place. Requires a file system with local paths.
    pub fn in_place(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            shadow_copy: false,
            shadow_dir: PathBuf::new(),
        }
    }

    /// Copy each module into `shadow_dir` before opening it, so the original
    /// can be replaced while its code is in use.
    pub fn shadow_copied(extension: impl Into<String>, shadow_dir: impl Into<PathBuf>) -> Self {
        Self {
            extension: extension.into(),
            shadow_copy: true,
            shadow_dir: shadow_dir.into(),
        }
    }
}

/// A discovered plugin type.
#[derive(Clone)]
pub struct RegistryEntry {
    /// Module file the plugin was registered from
    pub source_path: PathBuf,
    /// Last-write time of that file when it was scanned
    pub last_modified: DateTime<Utc>,
    factory: PluginFactory,
    module: Arc<ModuleHandle>,
}

impl RegistryEntry {
    /// Create a fresh instance of the plugin.
    pub fn instantiate(&self) -> Box<dyn AnswerPlugin> {
        (self.factory)()
    }

    /// The module the factory's code lives in.
    pub fn module(&self) -> &Arc<ModuleHandle> {
        &self.module
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("source_path", &self.source_path)
            .field("last_modified", &self.last_modified)
            .field("module", &self.module)
            .finish()
    }
}

/// What a scan did.
#[derive(Debug, Default, Clone)]
pub struct RescanReport {
    /// Files that were new or modified since the last scan
    pub touched: Vec<PathBuf>,
    /// Identities registered from touched files
    pub registered: Vec<PluginIdentity>,
    /// Touched files that were not loadable and were ignored
    pub skipped: Vec<PathBuf>,
}

/// Directory-scanning registry of plugin types.
pub struct PluginRegistry {
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
    loader: Arc<dyn ModuleLoader>,
    options: ScanOptions,
    /// Last-write times seen by the previous scan. Also serializes scans.
    modify_times: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
    entries: RwLock<HashMap<PluginIdentity, RegistryEntry>>,
}

impl PluginRegistry {
    /// Create a registry over `root` on `fs`. Nothing is scanned yet.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        root: impl Into<PathBuf>,
        loader: Arc<dyn ModuleLoader>,
        options: ScanOptions,
    ) -> Result<Self> {
        let root = normalize(&root.into());
        if options.shadow_copy {
            std::fs::create_dir_all(&options.shadow_dir)?;
        } else if fs.local_path(&root).is_none() {
            return Err(HostError::Config(
                "opening plugin modules in place requires a file system backed by disk; enable shadow copying"
                    .to_string(),
            ));
        }
        Ok(Self {
            fs,
            root,
            loader,
            options,
            modify_times: Mutex::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Directory being scanned, relative to the file system root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bring the registry up to date with the plugin directory.
    ///
    /// Concurrent callers are serialized; the second caller sees the first
    /// caller's timestamps and only opens what changed in between.
    pub fn rescan(&self) -> Result<RescanReport> {
        let mut modify_times = self
            .modify_times
            .lock()
            .map_err(|_| HostError::LockPoisoned("registry scan state"))?;

        let mut report = RescanReport::default();
        if !self.fs.exists(&self.root) {
            debug!("Plugin directory {} does not exist yet", self.root.display());
            return Ok(report);
        }

        let mut touched = Vec::new();
        if let Err(e) = self.find_touched_files(&self.root, &mut modify_times, &mut touched) {
            forget(&mut modify_times, &touched);
            return Err(e);
        }
        if touched.is_empty() {
            return Ok(report);
        }

        let mut staged: Vec<(PluginIdentity, RegistryEntry)> = Vec::new();
        let mut prewarms: Vec<PrewarmFn> = Vec::new();

        for (path, last_modified) in &touched {
            let module = match self.open_module(path) {
                Ok(Ok(module)) => module,
                Ok(Err(e)) if !e.aborts_scan() => {
                    warn!("Skipping plugin module {}: {}", path.display(), e);
                    report.skipped.push(path.clone());
                    continue;
                }
                Ok(Err(e)) => {
                    error!("Aborting plugin scan at {}: {}", path.display(), e);
                    forget(&mut modify_times, &touched);
                    return Err(scan_abort_error(path, e));
                }
                Err(e) => {
                    error!("Aborting plugin scan at {}: {}", path.display(), e);
                    forget(&mut modify_times, &touched);
                    return Err(e);
                }
            };

            let LoadedModule {
                factories,
                prewarm,
                handle,
            } = module;
            let handle = Arc::new(handle);
            if factories.is_empty() {
                debug!("Plugin module {} registers no plugins", path.display());
            }

            for factory in factories {
                match probe_identity(&factory) {
                    Ok(identity) => staged.push((
                        identity,
                        RegistryEntry {
                            source_path: path.clone(),
                            last_modified: *last_modified,
                            factory,
                            module: handle.clone(),
                        },
                    )),
                    Err(reason) => warn!(
                        "Skipping plugin candidate in {} that could not be instantiated: {}",
                        path.display(),
                        reason
                    ),
                }
            }
            prewarms.extend(prewarm);
        }

        {
            let mut entries = self
                .entries
                .write()
                .map_err(|_| HostError::LockPoisoned("registry entries"))?;
            for (identity, entry) in staged {
                info!("Registered plugin {} from {}", identity, entry.source_path.display());
                entries.insert(identity.clone(), entry);
                report.registered.push(identity);
            }
        }

        for prewarm in prewarms {
            if let Err(payload) = catch_unwind(prewarm) {
                warn!("Plugin module prewarm panicked: {}", panic_message(&*payload));
            }
        }

        report.touched = touched.into_iter().map(|(path, _)| path).collect();
        Ok(report)
    }

    /// Identities of every registered plugin.
    pub fn available(&self) -> BTreeSet<PluginIdentity> {
        self.entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entry(&self, identity: &PluginIdentity) -> Option<RegistryEntry> {
        self.entries.read().ok()?.get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_touched_files(
        &self,
        dir: &Path,
        modify_times: &mut HashMap<PathBuf, DateTime<Utc>>,
        touched: &mut Vec<(PathBuf, DateTime<Utc>)>,
    ) -> Result<()> {
        for file in self.fs.list_files(dir)? {
            if !has_extension(&file, &self.options.extension) {
                continue;
            }
            let stat = self.fs.stat(&file)?;
            match modify_times.get(&file) {
                None => debug!("Plugin file {} is new so it will be loaded", file.display()),
                Some(previous) if stat.last_write_time != *previous => {
                    debug!("Plugin file {} has been touched so it will be reloaded", file.display())
                }
                Some(_) => continue,
            }
            modify_times.insert(file.clone(), stat.last_write_time);
            touched.push((file, stat.last_write_time));
        }
        for sub in self.fs.list_dirs(dir)? {
            self.find_touched_files(&sub, modify_times, touched)?;
        }
        Ok(())
    }

    /// Open one module file. The outer error is a host failure (the shadow
    /// copy could not be written), the inner one a problem with the module.
    fn open_module(&self, path: &Path) -> Result<std::result::Result<LoadedModule, ModuleError>> {
        if !self.options.shadow_copy {
            let local = self.fs.local_path(path).ok_or_else(|| {
                HostError::Config(format!("{} has no local path to open in place", path.display()))
            })?;
            return Ok(self.loader.load(&local));
        }

        let bytes = match self.fs.read(path) {
            Ok(bytes) => bytes,
            Err(e) => return Ok(Err(ModuleError::Malformed(format!("cannot read module: {}", e)))),
        };
        let mut shadow = tempfile::Builder::new()
            .prefix("answer-plugin-")
            .suffix(&format!(".{}", self.options.extension))
            .tempfile_in(&self.options.shadow_dir)?;
        shadow.write_all(&bytes)?;
        shadow.flush()?;
        let shadow = shadow.into_temp_path();
        debug!("Shadow copied {} to {}", path.display(), shadow.display());

        Ok(self.loader.load(&shadow).map(|mut module| {
            module.handle.attach_shadow(shadow);
            module
        }))
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("root", &self.root)
            .field("options", &self.options)
            .field("entries", &self.len())
            .finish()
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

fn forget(modify_times: &mut HashMap<PathBuf, DateTime<Utc>>, touched: &[(PathBuf, DateTime<Utc>)]) {
    for (path, _) in touched {
        modify_times.remove(path);
    }
}

fn scan_abort_error(path: &Path, error: ModuleError) -> HostError {
    match error {
        ModuleError::PolicyViolation(reason) => HostError::PolicyViolation {
            path: path.to_path_buf(),
            reason,
        },
        other => HostError::MissingDependency {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}

/// Instantiate a candidate once to learn its identity.
fn probe_identity(factory: &PluginFactory) -> std::result::Result<PluginIdentity, String> {
    catch_unwind(AssertUnwindSafe(|| factory().identity())).map_err(|payload| panic_message(&*payload))
}
