//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};
use crate::loader::platform_module_extension;
use crate::remote::WireProtocolKind;

/// How plugin calls are isolated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStrategy {
    /// Call plugin code on the caller's task. Errors and panics propagate;
    /// meant for development under a debugger.
    Direct,
    /// Run each call on its own task with an SLA timeout.
    #[default]
    Sandboxed,
    /// Like `Sandboxed` but without a timeout, so breakpoints do not trip the SLA.
    SandboxedDebug,
    /// Run plugins in a separate container process.
    Remoted,
}

/// Whether calls against the same plugin may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Plugins are expected to be thread-safe
    #[default]
    Unrestricted,
    /// At most one in-flight call per plugin identity
    SingleCallPerIdentity,
}

/// Command line used to start the remote plugin container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Isolation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub strategy: IsolationStrategy,

    /// Maximum time a single plugin call may take, in milliseconds
    pub sla_ms: u64,

    /// Wire protocol for the Remoted strategy
    pub protocol: WireProtocolKind,

    /// Container command for the Remoted strategy. When unset, the
    /// `answer-container` binary next to the current executable is used.
    pub container: Option<ContainerCommand>,
}

impl IsolationConfig {
    pub fn sla(&self) -> Duration {
        Duration::from_millis(self.sla_ms)
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            strategy: IsolationStrategy::default(),
            sla_ms: 1000,
            protocol: WireProtocolKind::default(),
            container: None,
        }
    }
}

/// Configuration for the answer runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory scanned (recursively) for plugin modules
    pub plugins_dir: PathBuf,

    /// Root of plugin data and static content (`views/` lives here)
    pub content_dir: PathBuf,

    /// Where shadow copies of plugin modules are written
    pub shadow_dir: PathBuf,

    /// Open a private copy of each module so the original can be replaced
    pub shadow_copy: bool,

    /// Plugin module file extension, without the dot
    pub module_extension: String,

    pub isolation: IsolationConfig,

    pub concurrency: ConcurrencyPolicy,

    /// Poll interval of the plugin directory watcher (None = no watcher)
    pub watch_interval_ms: Option<u64>,
}

impl RuntimeConfig {
    /// Create a new configuration with required paths.
    pub fn new(plugins_dir: impl Into<PathBuf>, content_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            content_dir: content_dir.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file; missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_shadow_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shadow_dir = dir.into();
        self
    }

    /// Enable or disable shadow copying.
    pub fn shadow_copy(mut self, enabled: bool) -> Self {
        self.shadow_copy = enabled;
        self
    }

    pub fn with_module_extension(mut self, extension: impl Into<String>) -> Self {
        self.module_extension = extension.into();
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationConfig) -> Self {
        self.isolation = isolation;
        self
    }

    /// Set the isolation strategy, keeping the other isolation settings.
    pub fn with_strategy(mut self, strategy: IsolationStrategy) -> Self {
        self.isolation.strategy = strategy;
        self
    }

    pub fn with_sla(mut self, sla: Duration) -> Self {
        self.isolation.sla_ms = sla.as_millis() as u64;
        self
    }

    pub fn with_concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    /// Watch the plugin directory, polling at the given interval.
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.module_extension.is_empty() {
            return Err(HostError::Config("module_extension must not be empty".into()));
        }
        if self.isolation.sla_ms == 0 && self.isolation.strategy != IsolationStrategy::Direct {
            return Err(HostError::Config("isolation.sla_ms must be positive".into()));
        }
        Ok(())
    }

    /// Ensure directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.plugins_dir)?;
        std::fs::create_dir_all(&self.content_dir)?;
        if self.shadow_copy {
            std::fs::create_dir_all(&self.shadow_dir)?;
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // Use platform-appropriate default directories
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("answer-host");
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".")).join("answer-host");

        Self {
            plugins_dir: data_dir.join("plugins"),
            content_dir: data_dir.join("content"),
            shadow_dir: cache_dir.join("shadow"),
            shadow_copy: true,
            module_extension: platform_module_extension().to_string(),
            isolation: IsolationConfig::default(),
            concurrency: ConcurrencyPolicy::default(),
            watch_interval_ms: None,
        }
    }
}
