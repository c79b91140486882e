//! The contract every answer plugin implements, and the registration ABI a
//! plugin module exports so the host can discover it.
//!
//! A plugin module is a dynamic library built against this crate. Instead of
//! the host inspecting the module's types, the module exports a registration
//! function that hands the host one factory per plugin type:
//!
//! ```rust,ignore
//! use lib_answer_host::export_answer_plugins;
//!
//! #[derive(Default)]
//! struct Weather;
//!
//! #[async_trait::async_trait]
//! impl lib_answer_host::AnswerPlugin for Weather { /* ... */ }
//!
//! export_answer_plugins!(Weather);
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info_span, Span};

use crate::fs::FileSystem;
use crate::identity::PluginIdentity;
use crate::model::{
    CrossDomainContext, CrossDomainRequestData, CrossDomainResponseData, ExecutionResult, PluginServices,
    QueryContext, TriggerResult,
};

/// ABI version of the registration interface. A module declaring a newer
/// version than this is refused.
pub const ANSWER_PLUGIN_ABI_VERSION: u32 = 1;

/// `extern "C" fn() -> u32`
pub const ABI_VERSION_SYMBOL: &[u8] = b"answer_plugin_abi_version\0";

/// [`RegisterFn`]
pub const REGISTER_SYMBOL: &[u8] = b"answer_plugin_register\0";

/// Optional `fn()`, called once after the module's plugins are registered.
pub const PREWARM_SYMBOL: &[u8] = b"answer_plugin_prewarm\0";

/// Signature of the exported registration function.
pub type RegisterFn = fn(&mut dyn PluginRegistrar);

/// Signature of the optional prewarm function.
pub type PrewarmFn = fn();

/// Creates a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn AnswerPlugin> + Send + Sync>;

/// Receives plugin factories from a module's registration function.
pub trait PluginRegistrar {
    fn register(&mut self, factory: PluginFactory);
}

impl PluginRegistrar for Vec<PluginFactory> {
    fn register(&mut self, factory: PluginFactory) {
        self.push(factory);
    }
}

/// Error returned by plugin code.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PluginError {
    pub message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Descriptive metadata a plugin publishes about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub display_name: String,
    pub creator: String,
    pub description: String,
    /// Example utterances shown to users
    pub sample_queries: Vec<String>,
}

/// The conversation state machine inside a plugin.
///
/// Its internals belong to the plugin; the host only needs to know which
/// entry points exist.
pub trait ConversationTree: Send + Sync {
    fn entry_points(&self) -> Vec<String>;

    fn has_entry_point(&self, name: &str) -> bool {
        self.entry_points().iter().any(|e| e == name)
    }
}

/// A conversation tree that is just a fixed list of entry points.
#[derive(Debug, Clone, Default)]
pub struct StaticConversationTree {
    entry_points: Vec<String>,
}

impl StaticConversationTree {
    pub fn new<I, S>(entry_points: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entry_points: entry_points.into_iter().map(Into::into).collect(),
        }
    }
}

impl ConversationTree for StaticConversationTree {
    fn entry_points(&self) -> Vec<String> {
        self.entry_points.clone()
    }
}

/// Base contract of an answer plugin.
///
/// The host runs every hook and call inside [`plugin_span`]. That span is the
/// plugin's logger: events a plugin emits through `tracing` carry its
/// identity without the plugin naming itself.
#[async_trait]
pub trait AnswerPlugin: Send + Sync {
    fn identity(&self) -> PluginIdentity;

    /// Build the plugin's conversation tree. Called once per load.
    fn conversation_tree(&self, fs: &dyn FileSystem, data_dir: &Path) -> Arc<dyn ConversationTree>;

    /// Build the plugin's metadata. Called once per load.
    fn plugin_info(&self, fs: &dyn FileSystem, data_dir: &Path) -> PluginInfo;

    /// Called when the plugin is loaded into the host.
    async fn on_load(&self, _services: &PluginServices) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called when the plugin is unloaded.
    async fn on_unload(&self, _services: &PluginServices) -> Result<(), PluginError> {
        Ok(())
    }

    /// Run one turn through the named entry point.
    async fn execute(
        &self,
        entry_point: &str,
        is_retry: bool,
        query: &QueryContext,
        services: &mut PluginServices,
    ) -> Result<ExecutionResult, PluginError>;

    /// Rank interest in an utterance without committing to handle it.
    async fn trigger(&self, _query: &QueryContext, _services: &mut PluginServices) -> Result<TriggerResult, PluginError> {
        Ok(TriggerResult::NoChange)
    }

    /// Whether a handoff to `target_intent` is accepted.
    async fn cross_domain_request(&self, _target_intent: &str) -> Result<CrossDomainRequestData, PluginError> {
        Ok(CrossDomainRequestData::unsupported())
    }

    /// Continue a conversation handed off from another plugin.
    async fn cross_domain_response(
        &self,
        _context: &CrossDomainContext,
        _services: &mut PluginServices,
    ) -> Result<CrossDomainResponseData, PluginError> {
        Ok(CrossDomainResponseData {
            result: ExecutionResult::Skip,
            callback_intent: None,
        })
    }
}

/// Span entered around every call into a plugin.
pub fn plugin_span(identity: &PluginIdentity) -> Span {
    info_span!("plugin", id = %identity)
}

/// Export the registration symbols for one or more `Default` plugin types.
#[macro_export]
macro_rules! export_answer_plugins {
    ($($plugin:ty),+ $(,)?) => {
        #[no_mangle]
        pub extern "C" fn answer_plugin_abi_version() -> u32 {
            $crate::ANSWER_PLUGIN_ABI_VERSION
        }

        #[no_mangle]
        pub fn answer_plugin_register(registrar: &mut dyn $crate::PluginRegistrar) {
            $(
                registrar.register(::std::sync::Arc::new(|| {
                    ::std::boxed::Box::new(<$plugin as ::std::default::Default>::default())
                        as ::std::boxed::Box<dyn $crate::AnswerPlugin>
                }));
            )+
        }
    };
}
