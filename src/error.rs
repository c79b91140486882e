//! Error types for plugin host operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::identity::PluginIdentity;

/// Errors that can occur during discovery and plugin lifecycle operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// Plugin already loaded
    #[error("Plugin {0} is already loaded; cannot load it twice")]
    AlreadyLoaded(PluginIdentity),

    /// No registered factory for the identity
    #[error("Plugin {0} does not exist in any plugin module")]
    PluginNotFound(PluginIdentity),

    /// Creating the plugin instance failed
    #[error("Failed to instantiate plugin {identity}: {reason}")]
    InstantiationFailed {
        identity: PluginIdentity,
        reason: String,
    },

    /// The plugin's load hook returned an error
    #[error("Load hook of plugin {identity} failed: {reason}")]
    LoadHookFailed {
        identity: PluginIdentity,
        reason: String,
    },

    /// A plugin module depends on something the host cannot resolve
    #[error("Plugin module {path:?} has an unresolvable dependency: {reason}")]
    MissingDependency { path: PathBuf, reason: String },

    /// A plugin module violates the host's loading policy
    #[error("Plugin module {path:?} violates loading policy: {reason}")]
    PolicyViolation { path: PathBuf, reason: String },

    /// Invalid host configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared state lock was poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// A blocking task failed to complete
    #[error("Background task failed: {0}")]
    Task(String),

    /// Failure reported by the remote plugin container
    #[error("Remote host error: {0}")]
    Remote(String),

    /// File watcher error
    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for plugin host operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors raised across the dispatch boundary.
///
/// `NotLoaded` and `EntryPointNotFound` are caller errors and pass through
/// every isolation strategy unchanged. The remaining variants describe the
/// call itself; sandboxed strategies turn them into failure values.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Dispatch against an identity with no loaded instance
    #[error("Plugin {0} isn't loaded")]
    NotLoaded(PluginIdentity),

    /// The conversation tree has no such entry point
    #[error("Plugin {identity} has no entry point named {entry_point:?}")]
    EntryPointNotFound {
        identity: PluginIdentity,
        entry_point: String,
    },

    /// Plugin code returned an error or panicked
    #[error("Plugin {identity} raised an error: {message}")]
    Plugin {
        identity: PluginIdentity,
        message: String,
    },

    /// The caller cancelled the call
    #[error("Call into plugin {0} was cancelled")]
    Cancelled(PluginIdentity),

    /// The remote plugin process is unreachable
    #[error("Transport error: {0}")]
    Transport(String),

    /// A remote message could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl DispatchError {
    /// Whether this error is the caller's fault rather than the call's.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, DispatchError::NotLoaded(_) | DispatchError::EntryPointNotFound { .. })
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}
