//! Lifecycle of loaded plugin instances.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use tracing::{error, info, warn, Instrument};

use crate::error::{panic_message, HostError, Result};
use crate::identity::PluginIdentity;
use crate::loader::ModuleHandle;
use crate::model::PluginServices;
use crate::plugin::{plugin_span, AnswerPlugin, ConversationTree, PluginInfo};
use crate::registry::{PluginRegistry, RegistryEntry, RescanReport};

/// A plugin instance the host has loaded.
pub struct LoadedPlugin {
    identity: PluginIdentity,
    instance: Arc<dyn AnswerPlugin>,
    conversation_tree: Arc<dyn ConversationTree>,
    plugin_info: PluginInfo,
    source_path: PathBuf,
    // Declared last so the module outlives the instance built from it.
    _module: Arc<ModuleHandle>,
}

impl LoadedPlugin {
    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn instance(&self) -> &Arc<dyn AnswerPlugin> {
        &self.instance
    }

    pub fn conversation_tree(&self) -> &Arc<dyn ConversationTree> {
        &self.conversation_tree
    }

    pub fn plugin_info(&self) -> &PluginInfo {
        &self.plugin_info
    }

    /// Module file the plugin was loaded from.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("identity", &self.identity)
            .field("plugin_info", &self.plugin_info)
            .field("source_path", &self.source_path)
            .finish()
    }
}

#[derive(Default)]
struct HostState {
    loaded: HashMap<PluginIdentity, Arc<LoadedPlugin>>,
    /// Identities whose load hook is running
    loading: HashSet<PluginIdentity>,
}

/// Loads and unloads plugin instances discovered by a [`PluginRegistry`].
pub struct PluginHost {
    registry: Arc<PluginRegistry>,
    state: RwLock<HostState>,
}

impl PluginHost {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            state: RwLock::new(HostState::default()),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    // === Discovery ===

    /// Rescan the plugin directory on the blocking pool.
    pub async fn rescan(&self) -> Result<RescanReport> {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || registry.rescan())
            .await
            .map_err(|e| HostError::Task(e.to_string()))?
    }

    /// Identities of every plugin that could be loaded, after a fresh scan.
    pub async fn get_all_available(&self) -> Result<BTreeSet<PluginIdentity>> {
        self.rescan().await?;
        Ok(self.registry.available())
    }

    // === Lifecycle ===

    /// Instantiate a plugin and run its load hook.
    ///
    /// Fails if the identity is already loaded (or being loaded by a
    /// concurrent caller), if no module registers it, or if the hook fails.
    pub async fn load(&self, identity: &PluginIdentity, services: &PluginServices) -> Result<Arc<LoadedPlugin>> {
        self.rescan().await?;

        let _reservation = self.reserve(identity)?;
        let plugin = self.instantiate_loaded(identity, services).await?;

        self.write_state()?.loaded.insert(identity.clone(), plugin.clone());
        info!("Loaded plugin {} from {}", identity, plugin.source_path.display());
        Ok(plugin)
    }

    /// Remove a plugin from the host and run its unload hook.
    ///
    /// Returns the hook's success flag. The plugin is no longer dispatchable
    /// once this starts, whether or not the hook succeeds. Unloading an
    /// identity that is not loaded still runs the hook on a fresh instance.
    /// A loaded plugin's hook runs even when the rescan fails; the scan error
    /// is returned afterwards.
    pub async fn unload(&self, identity: &PluginIdentity, services: &PluginServices) -> Result<bool> {
        let removed = self.write_state()?.loaded.remove(identity);
        let rescanned = self.rescan().await;

        let instance: Arc<dyn AnswerPlugin> = match (removed, rescanned) {
            (Some(plugin), Ok(_)) => plugin.instance.clone(),
            (Some(plugin), Err(e)) => {
                error!("Rescan failed while unloading plugin {}: {}", identity, e);
                run_unload_hook(identity, &plugin.instance, services).await;
                return Err(e);
            }
            (None, Err(e)) => return Err(e),
            (None, Ok(_)) => {
                let entry = self.find_entry(identity)?;
                Arc::from(instantiate(&entry, identity)?)
            }
        };

        Ok(run_unload_hook(identity, &instance, services).await)
    }

    // === Queries ===

    /// The loaded instance for an identity, if any.
    pub fn loaded(&self, identity: &PluginIdentity) -> Option<Arc<LoadedPlugin>> {
        self.state.read().ok()?.loaded.get(identity).cloned()
    }

    pub fn is_loaded(&self, identity: &PluginIdentity) -> bool {
        self.loaded(identity).is_some()
    }

    pub fn loaded_identities(&self) -> BTreeSet<PluginIdentity> {
        self.state
            .read()
            .map(|state| state.loaded.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, HostState>> {
        self.state.write().map_err(|_| HostError::LockPoisoned("plugin host state"))
    }

    fn reserve(&self, identity: &PluginIdentity) -> Result<LoadReservation<'_>> {
        let mut state = self.write_state()?;
        if state.loaded.contains_key(identity) || state.loading.contains(identity) {
            error!("Plugin {} is already loaded; cannot load it twice", identity);
            return Err(HostError::AlreadyLoaded(identity.clone()));
        }
        state.loading.insert(identity.clone());
        Ok(LoadReservation {
            host: self,
            identity: identity.clone(),
        })
    }

    fn find_entry(&self, identity: &PluginIdentity) -> Result<RegistryEntry> {
        self.registry.entry(identity).ok_or_else(|| {
            error!("No plugin with identity {} could be found in any plugin module", identity);
            HostError::PluginNotFound(identity.clone())
        })
    }

    async fn instantiate_loaded(&self, identity: &PluginIdentity, services: &PluginServices) -> Result<Arc<LoadedPlugin>> {
        let entry = self.find_entry(identity)?;
        let instance: Arc<dyn AnswerPlugin> = Arc::from(instantiate(&entry, identity)?);

        instance
            .on_load(services)
            .instrument(plugin_span(identity))
            .await
            .map_err(|e| HostError::LoadHookFailed {
                identity: identity.clone(),
                reason: e.to_string(),
            })?;

        let fs = services.file_system().as_ref();
        let conversation_tree = instance.conversation_tree(fs, services.data_dir());
        let plugin_info = instance.plugin_info(fs, services.data_dir());

        Ok(Arc::new(LoadedPlugin {
            identity: identity.clone(),
            instance,
            conversation_tree,
            plugin_info,
            source_path: entry.source_path.clone(),
            _module: entry.module().clone(),
        }))
    }
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("registry", &self.registry)
            .field("loaded", &self.loaded_identities())
            .finish()
    }
}

/// Marks an identity as loading until dropped.
struct LoadReservation<'a> {
    host: &'a PluginHost,
    identity: PluginIdentity,
}

impl Drop for LoadReservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.host.state.write() {
            state.loading.remove(&self.identity);
        }
    }
}

async fn run_unload_hook(identity: &PluginIdentity, instance: &Arc<dyn AnswerPlugin>, services: &PluginServices) -> bool {
    match instance.on_unload(services).instrument(plugin_span(identity)).await {
        Ok(()) => {
            info!("Unloaded plugin {}", identity);
            true
        }
        Err(e) => {
            warn!("Unload hook of plugin {} failed: {}", identity, e);
            false
        }
    }
}

fn instantiate(entry: &RegistryEntry, identity: &PluginIdentity) -> Result<Box<dyn AnswerPlugin>> {
    catch_unwind(AssertUnwindSafe(|| entry.instantiate())).map_err(|payload| HostError::InstantiationFailed {
        identity: identity.clone(),
        reason: panic_message(&*payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BrokenModule, ScriptedPlugin, TraceRecorder, TestRig};

    #[tokio::test]
    async fn test_load_and_double_load() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        rig.loader.add_module("weather", &[&weather]);
        rig.install("weather.so", "weather");

        let loaded = rig.host.load(&weather.identity, &rig.services()).await.unwrap();
        assert_eq!(loaded.identity(), &weather.identity);
        assert_eq!(loaded.plugin_info().display_name, "weather");
        assert!(loaded.conversation_tree().has_entry_point("start"));
        assert!(rig.host.is_loaded(&weather.identity));
        assert_eq!(weather.events(), vec!["load"]);

        let err = rig.host.load(&weather.identity, &rig.services()).await.unwrap_err();
        assert!(matches!(err, HostError::AlreadyLoaded(_)));
    }

    #[tokio::test]
    async fn test_load_unknown_identity() {
        let rig = TestRig::new();
        let err = rig
            .host
            .load(&PluginIdentity::new("ghost", 1, 0), &rig.services())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::PluginNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_double_load_has_one_winner() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        rig.loader.add_module("weather", &[&weather]);
        rig.install("weather.so", "weather");

        let services = rig.services();
        let (a, b) = tokio::join!(
            rig.host.load(&weather.identity, &services),
            rig.host.load(&weather.identity, &services)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(weather.events(), vec!["load"]);
    }

    #[tokio::test]
    async fn test_failed_load_hook_leaves_plugin_unloaded() {
        let rig = TestRig::new();
        let mut grumpy = ScriptedPlugin::replying("grumpy", "no");
        grumpy.fail_load = true;
        rig.loader.add_module("grumpy", &[&grumpy]);
        rig.install("grumpy.so", "grumpy");

        let err = rig.host.load(&grumpy.identity, &rig.services()).await.unwrap_err();
        assert!(matches!(err, HostError::LoadHookFailed { .. }));
        assert!(!rig.host.is_loaded(&grumpy.identity));

        // The reservation was released, so a second attempt gets as far as the hook again.
        let err = rig.host.load(&grumpy.identity, &rig.services()).await.unwrap_err();
        assert!(matches!(err, HostError::LoadHookFailed { .. }));
    }

    #[tokio::test]
    async fn test_unload_reports_hook_result() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        let mut sticky = ScriptedPlugin::replying("sticky", "still here");
        sticky.fail_unload = true;
        rig.load_all("bundle", &[&weather, &sticky]).await;

        assert!(rig.host.unload(&weather.identity, &rig.services()).await.unwrap());
        assert!(!rig.host.is_loaded(&weather.identity));
        assert_eq!(weather.events(), vec!["load", "unload"]);

        assert!(!rig.host.unload(&sticky.identity, &rig.services()).await.unwrap());
        assert!(!rig.host.is_loaded(&sticky.identity));
    }

    #[tokio::test]
    async fn test_hooks_run_inside_plugin_span() {
        let recorder = TraceRecorder::default();
        let _guard = recorder.install();
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        rig.load_all("weather", &[&weather]).await;
        rig.host.unload(&weather.identity, &rig.services()).await.unwrap();

        let plugin_spans: Vec<_> = recorder
            .spans()
            .into_iter()
            .filter(|(name, id)| name == "plugin" && id == "weather:1.0")
            .collect();
        assert_eq!(plugin_spans.len(), 2);
    }

    #[tokio::test]
    async fn test_unload_runs_hook_when_rescan_fails() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        rig.load_all("weather", &[&weather]).await;

        rig.loader.add_broken("needy", BrokenModule::MissingDependency);
        rig.install("needy.so", "needy");

        let err = rig.host.unload(&weather.identity, &rig.services()).await.unwrap_err();
        assert!(matches!(err, HostError::MissingDependency { .. }));
        assert!(!rig.host.is_loaded(&weather.identity));
        assert_eq!(weather.events(), vec!["load", "unload"]);
    }

    #[tokio::test]
    async fn test_unload_not_loaded_uses_fresh_instance() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        rig.loader.add_module("weather", &[&weather]);
        rig.install("weather.so", "weather");

        assert!(rig.host.unload(&weather.identity, &rig.services()).await.unwrap());
        assert_eq!(weather.events(), vec!["unload"]);

        let err = rig
            .host
            .unload(&PluginIdentity::new("ghost", 1, 0), &rig.services())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::PluginNotFound(_)));
    }

    #[tokio::test]
    async fn test_new_module_is_loadable_without_disturbing_others() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        rig.load_all("weather", &[&weather]).await;
        let before = rig.host.loaded(&weather.identity).unwrap();

        let news = ScriptedPlugin::replying("news", "headlines");
        rig.loader.add_module("news", &[&news]);
        rig.install("news.so", "news");

        let available = rig.host.get_all_available().await.unwrap();
        assert!(available.contains(&news.identity));
        rig.host.load(&news.identity, &rig.services()).await.unwrap();

        let after = rig.host.loaded(&weather.identity).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(weather.events(), vec!["load"]);
    }

    #[tokio::test]
    async fn test_replaced_module_serves_next_load() {
        let rig = TestRig::new();
        let v1 = ScriptedPlugin::replying("weather", "old");
        rig.load_all("weather", &[&v1]).await;
        let old = rig.host.loaded(&v1.identity).unwrap();

        let v2 = ScriptedPlugin::replying("weather", "new");
        rig.loader.add_module("weather-v2", &[&v2]);
        rig.install("weather.so", "weather-v2");

        rig.host.unload(&v1.identity, &rig.services()).await.unwrap();
        let reloaded = rig.host.load(&v2.identity, &rig.services()).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &reloaded));
        assert_eq!(v2.events(), vec!["load"]);
        // The old instance keeps its module alive while referenced.
        assert_eq!(old.identity(), &v1.identity);
    }
}
