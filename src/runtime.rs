//! The runtime façade: everything wired together from a [`RuntimeConfig`].

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::boundary::IsolationBoundary;
use crate::config::{ConcurrencyPolicy, ContainerCommand, IsolationStrategy, RuntimeConfig};
use crate::dispatcher::{Dispatch, ExecutionDispatcher};
use crate::engine::ExecutionEngine;
use crate::error::{DispatchError, Result};
use crate::fs::{FileSystem, RealFileSystem};
use crate::host::PluginHost;
use crate::identity::PluginIdentity;
use crate::loader::{DylibLoader, ModuleLoader};
use crate::model::{
    CrossDomainContext, CrossDomainRequestData, CrossDomainResponseResponse, ExecutionRequest, ExecutionResult,
    PluginServices, QueryContext, TriggerResult,
};
use crate::registry::{PluginRegistry, ScanOptions};
use crate::remote::{LoadedPluginSummary, ProcessConnector, RemoteConnector, RemoteDispatcher};
use crate::views::{CachedViewData, ViewDataCache};
use crate::watcher::PluginDirectoryWatcher;

/// Name of the container binary looked up next to the current executable.
pub const CONTAINER_BINARY: &str = "answer-container";

/// Build a registry and host over `config.plugins_dir`.
pub fn build_local_host(config: &RuntimeConfig, loader: Arc<dyn ModuleLoader>) -> Result<Arc<PluginHost>> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new(config.plugins_dir.clone()));
    let options = if config.shadow_copy {
        ScanOptions::shadow_copied(config.module_extension.clone(), config.shadow_dir.clone())
    } else {
        ScanOptions::in_place(config.module_extension.clone())
    };
    let registry = Arc::new(PluginRegistry::new(fs, "", loader, options)?);
    Ok(Arc::new(PluginHost::new(registry)))
}

/// Command that starts a container serving the same directories as `config`.
pub fn default_container_command(config: &RuntimeConfig) -> Result<ContainerCommand> {
    let program = std::env::current_exe()?
        .with_file_name(format!("{}{}", CONTAINER_BINARY, std::env::consts::EXE_SUFFIX));

    let mut args = vec![
        "--plugins-dir".to_string(),
        config.plugins_dir.display().to_string(),
        "--content-dir".to_string(),
        config.content_dir.display().to_string(),
        "--shadow-dir".to_string(),
        config.shadow_dir.display().to_string(),
        "--extension".to_string(),
        config.module_extension.clone(),
    ];
    if !config.shadow_copy {
        args.push("--no-shadow-copy".to_string());
    }
    if config.concurrency == ConcurrencyPolicy::SingleCallPerIdentity {
        args.push("--serialize-calls".to_string());
    }
    Ok(ContainerCommand { program, args })
}

/// Where plugin lifecycle calls go.
enum Lifecycle {
    Local {
        host: Arc<PluginHost>,
        _watcher: Option<PluginDirectoryWatcher>,
    },
    Remote(Arc<RemoteDispatcher>),
}

/// Discovery, lifecycle, isolated dispatch and view content behind one handle.
pub struct AnswerRuntime {
    config: RuntimeConfig,
    content_fs: Arc<dyn FileSystem>,
    lifecycle: Lifecycle,
    boundary: IsolationBoundary,
    views: ViewDataCache,
}

impl AnswerRuntime {
    /// Build a runtime loading native plugin modules.
    ///
    /// Under the Remoted strategy `engine` is unused; the container brings
    /// its own. A configured watcher needs a running tokio runtime.
    pub fn new(config: RuntimeConfig, engine: Arc<dyn ExecutionEngine>) -> Result<Self> {
        if config.isolation.strategy == IsolationStrategy::Remoted {
            let command = match &config.isolation.container {
                Some(command) => command.clone(),
                None => default_container_command(&config)?,
            };
            let connector = Arc::new(ProcessConnector::new(command.program, command.args));
            return Self::remoted(config, connector);
        }
        Self::with_loader(config, engine, Arc::new(DylibLoader::new()))
    }

    /// Build an in-process runtime with a custom module loader.
    pub fn with_loader(
        config: RuntimeConfig,
        engine: Arc<dyn ExecutionEngine>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let host = build_local_host(&config, loader)?;
        let dispatcher =
            Arc::new(ExecutionDispatcher::new(host.clone(), engine).with_policy(config.concurrency));
        let boundary = IsolationBoundary::in_process(&config.isolation, dispatcher)?;

        let watcher = match config.watch_interval_ms {
            Some(ms) => Some(PluginDirectoryWatcher::spawn(
                host.registry().clone(),
                config.plugins_dir.clone(),
                config.module_extension.clone(),
                Duration::from_millis(ms),
            )?),
            None => None,
        };

        info!("Answer runtime ready over {}", config.plugins_dir.display());
        Ok(Self::assemble(
            config,
            Lifecycle::Local {
                host,
                _watcher: watcher,
            },
            boundary,
        ))
    }

    /// Build a runtime whose plugins live in a container reached through
    /// `connector`. The container is started on first use.
    pub fn remoted(config: RuntimeConfig, connector: Arc<dyn RemoteConnector>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.content_dir)?;

        let remote = Arc::new(RemoteDispatcher::new(connector, config.isolation.protocol));
        let boundary = IsolationBoundary::remoted(&config.isolation, remote.clone());
        info!("Answer runtime ready; plugins run in a container");
        Ok(Self::assemble(config, Lifecycle::Remote(remote), boundary))
    }

    fn assemble(config: RuntimeConfig, lifecycle: Lifecycle, boundary: IsolationBoundary) -> Self {
        let content_fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new(config.content_dir.clone()));
        Self {
            views: ViewDataCache::new(content_fs.clone()),
            content_fs,
            config,
            lifecycle,
            boundary,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn strategy(&self) -> IsolationStrategy {
        self.boundary.strategy()
    }

    /// The local host, or `None` when plugins run in a container.
    pub fn host(&self) -> Option<&Arc<PluginHost>> {
        match &self.lifecycle {
            Lifecycle::Local { host, .. } => Some(host),
            Lifecycle::Remote(_) => None,
        }
    }

    pub fn boundary(&self) -> &IsolationBoundary {
        &self.boundary
    }

    /// Fresh services for a plugin, with its private data directory under
    /// `data/` on the content store.
    pub fn services_for(&self, identity: &PluginIdentity) -> PluginServices {
        let data_dir = PathBuf::from("data").join(identity.content_dir_name());
        PluginServices::new(self.content_fs.clone(), data_dir)
    }

    // === Lifecycle ===

    pub async fn available(&self) -> Result<BTreeSet<PluginIdentity>> {
        match &self.lifecycle {
            Lifecycle::Local { host, .. } => host.get_all_available().await,
            Lifecycle::Remote(remote) => remote.get_all_available().await,
        }
    }

    pub async fn load(&self, identity: &PluginIdentity, services: &PluginServices) -> Result<LoadedPluginSummary> {
        match &self.lifecycle {
            Lifecycle::Local { host, .. } => {
                let plugin = host.load(identity, services).await?;
                Ok(LoadedPluginSummary {
                    identity: plugin.identity().clone(),
                    plugin_info: plugin.plugin_info().clone(),
                    entry_points: plugin.conversation_tree().entry_points(),
                })
            }
            Lifecycle::Remote(remote) => remote.load(identity, services).await,
        }
    }

    /// Unload a plugin; returns whether its unload hook succeeded.
    pub async fn unload(&self, identity: &PluginIdentity, services: &PluginServices) -> Result<bool> {
        match &self.lifecycle {
            Lifecycle::Local { host, .. } => host.unload(identity, services).await,
            Lifecycle::Remote(remote) => remote.unload(identity, services).await,
        }
    }

    /// Rescan the plugin directory. Containers rescan on their own.
    pub async fn rescan(&self) -> Result<()> {
        match &self.lifecycle {
            Lifecycle::Local { host, .. } => host.rescan().await.map(|_| ()),
            Lifecycle::Remote(_) => {
                debug!("Rescan requested; the container rescans before each lifecycle call");
                Ok(())
            }
        }
    }

    /// Stop the plugin container, if there is one.
    pub async fn shutdown(&self) {
        if let Lifecycle::Remote(remote) = &self.lifecycle {
            remote.shutdown().await;
        }
    }

    // === Dispatch ===

    pub async fn launch(
        &self,
        identity: &PluginIdentity,
        request: &mut ExecutionRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ExecutionResult, DispatchError> {
        self.boundary.launch(identity, request, cancel).await
    }

    pub async fn trigger(
        &self,
        identity: &PluginIdentity,
        query: &QueryContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> std::result::Result<TriggerResult, DispatchError> {
        self.boundary.trigger(identity, query, services, cancel).await
    }

    pub async fn cross_domain_request(
        &self,
        identity: &PluginIdentity,
        target_intent: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<CrossDomainRequestData, DispatchError> {
        self.boundary.cross_domain_request(identity, target_intent, cancel).await
    }

    pub async fn cross_domain_response(
        &self,
        identity: &PluginIdentity,
        context: &CrossDomainContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> std::result::Result<CrossDomainResponseResponse, DispatchError> {
        self.boundary.cross_domain_response(identity, context, services, cancel).await
    }

    // === Content ===

    pub async fn fetch_view(
        &self,
        identity: &PluginIdentity,
        sub_path: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<Option<CachedViewData>> {
        self.views.fetch(identity, sub_path, if_modified_since).await
    }
}

impl std::fmt::Debug for AnswerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerRuntime")
            .field("plugins_dir", &self.config.plugins_dir)
            .field("strategy", &self.strategy())
            .finish()
    }
}
