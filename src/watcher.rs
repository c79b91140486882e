//! Background rescans driven by changes in the plugin directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{HostError, Result};
use crate::registry::PluginRegistry;

/// Polls the on-disk plugin directory and rescans the registry when a
/// module file appears or changes. Dropping the watcher stops it.
pub struct PluginDirectoryWatcher {
    dir: PathBuf,
    _watcher: PollWatcher,
    task: JoinHandle<()>,
}

impl PluginDirectoryWatcher {
    /// Start watching `dir`, which must be the on-disk location of the
    /// registry's root. Must be called from within a tokio runtime.
    pub fn spawn(
        registry: Arc<PluginRegistry>,
        dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let dir = dir.into();
        let extension = extension.into();
        let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = PollWatcher::new(
            move |res| {
                // Nobody is listening once the task is gone.
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;
        info!("Watching {} for plugin modules every {:?}", dir.display(), poll_interval);

        let task = tokio::spawn(watch_loop(registry, rx, extension));
        Ok(Self {
            dir,
            _watcher: watcher,
            task,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for PluginDirectoryWatcher {
    fn drop(&mut self) {
        debug!("Stopping plugin directory watcher on {}", self.dir.display());
        self.task.abort();
    }
}

async fn watch_loop(registry: Arc<PluginRegistry>, mut rx: UnboundedReceiver<notify::Result<Event>>, extension: String) {
    // Pick up whatever was already there before the first poll.
    rescan(&registry).await;

    while let Some(res) = rx.recv().await {
        let mut dirty = is_relevant_result(&res, &extension);
        // Coalesce a burst of events into one scan.
        while let Ok(res) = rx.try_recv() {
            dirty |= is_relevant_result(&res, &extension);
        }
        if dirty {
            rescan(&registry).await;
        }
    }
}

async fn rescan(registry: &Arc<PluginRegistry>) {
    let registry = registry.clone();
    match tokio::task::spawn_blocking(move || registry.rescan())
        .await
        .map_err(|e| HostError::Task(e.to_string()))
    {
        Ok(Ok(report)) if !report.touched.is_empty() => info!(
            "Plugin directory changed: {} file(s) touched, {} plugin(s) registered, {} skipped",
            report.touched.len(),
            report.registered.len(),
            report.skipped.len()
        ),
        Ok(Ok(_)) => {}
        Ok(Err(e)) | Err(e) => error!("Background plugin rescan failed: {}", e),
    }
}

fn is_relevant_result(res: &notify::Result<Event>, extension: &str) -> bool {
    match res {
        Ok(event) => is_relevant(event, extension),
        Err(e) => {
            warn!("Plugin directory watcher error: {}", e);
            false
        }
    }
}

/// Whether an event may change what the registry would find.
fn is_relevant(event: &Event, extension: &str) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|path| match path.extension() {
        Some(ext) => ext.to_string_lossy().eq_ignore_ascii_case(extension),
        // Directories: a new subtree may hold modules.
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    use super::*;
    use crate::fs::RealFileSystem;
    use crate::identity::PluginIdentity;
    use crate::registry::ScanOptions;
    use crate::testing::{FakeModuleLoader, ScriptedPlugin};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_is_relevant() {
        assert!(is_relevant(&event(EventKind::Create(CreateKind::Any), "/p/a.so"), "so"));
        assert!(is_relevant(&event(EventKind::Modify(ModifyKind::Any), "/p/A.SO"), "so"));
        assert!(is_relevant(&event(EventKind::Create(CreateKind::Any), "/p/nested"), "so"));
        assert!(!is_relevant(&event(EventKind::Create(CreateKind::Any), "/p/readme.txt"), "so"));
        assert!(!is_relevant(&event(EventKind::Access(AccessKind::Any), "/p/a.so"), "so"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_module_is_registered_in_background() {
        let root = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        let plugins = root.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();

        let loader = Arc::new(FakeModuleLoader::default());
        loader.add_module("weather", &[&ScriptedPlugin::replying("weather", "sunny")]);
        let registry = Arc::new(
            PluginRegistry::new(
                Arc::new(RealFileSystem::new(root.path())),
                "plugins",
                loader,
                ScanOptions::shadow_copied("so", shadow.path()),
            )
            .unwrap(),
        );

        let watcher =
            PluginDirectoryWatcher::spawn(registry.clone(), &plugins, "so", Duration::from_millis(50)).unwrap();
        assert_eq!(watcher.dir(), plugins.as_path());
        std::fs::write(plugins.join("weather.so"), "weather").unwrap();

        let expected = PluginIdentity::new("weather", 1, 0);
        let mut found = false;
        for _ in 0..100 {
            if registry.available().contains(&expected) {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(found, "watcher never registered the new module");
    }
}
