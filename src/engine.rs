//! Executes calls against a loaded plugin instance.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::host::LoadedPlugin;
use crate::model::{
    CrossDomainContext, CrossDomainRequestData, CrossDomainResponseData, ExecutionRequest, ExecutionResult,
    PluginServices, QueryContext, TriggerResult,
};
use crate::plugin::PluginError;

/// Runs one operation of a loaded plugin.
///
/// The engine owns how a call is carried out (entry point resolution, error
/// mapping). Isolation and concurrency are layered on top by the dispatcher.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn launch(
        &self,
        plugin: &LoadedPlugin,
        request: &mut ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, DispatchError>;

    async fn trigger(
        &self,
        plugin: &LoadedPlugin,
        query: &QueryContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<TriggerResult, DispatchError>;

    async fn cross_domain_request(
        &self,
        plugin: &LoadedPlugin,
        target_intent: &str,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainRequestData, DispatchError>;

    async fn cross_domain_response(
        &self,
        plugin: &LoadedPlugin,
        context: &CrossDomainContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainResponseData, DispatchError>;
}

/// Engine that calls straight into the plugin instance.
///
/// Plugin futures are raced against the cancellation token; a cancelled call
/// is dropped at its next await point.
#[derive(Debug, Default, Clone)]
pub struct BasicExecutionEngine;

impl BasicExecutionEngine {
    pub fn new() -> Self {
        Self
    }
}

fn plugin_error(plugin: &LoadedPlugin, error: PluginError) -> DispatchError {
    DispatchError::Plugin {
        identity: plugin.identity().clone(),
        message: error.message,
    }
}

#[async_trait]
impl ExecutionEngine for BasicExecutionEngine {
    async fn launch(
        &self,
        plugin: &LoadedPlugin,
        request: &mut ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, DispatchError> {
        if !plugin.conversation_tree().has_entry_point(&request.entry_point) {
            return Err(DispatchError::EntryPointNotFound {
                identity: plugin.identity().clone(),
                entry_point: request.entry_point.clone(),
            });
        }

        let ExecutionRequest {
            entry_point,
            is_retry,
            query,
            services,
        } = request;
        tokio::select! {
            result = plugin.instance().execute(entry_point, *is_retry, query, services) => {
                result.map_err(|e| plugin_error(plugin, e))
            }
            _ = cancel.cancelled() => Err(DispatchError::Cancelled(plugin.identity().clone())),
        }
    }

    async fn trigger(
        &self,
        plugin: &LoadedPlugin,
        query: &QueryContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<TriggerResult, DispatchError> {
        tokio::select! {
            result = plugin.instance().trigger(query, services) => result.map_err(|e| plugin_error(plugin, e)),
            _ = cancel.cancelled() => Err(DispatchError::Cancelled(plugin.identity().clone())),
        }
    }

    async fn cross_domain_request(
        &self,
        plugin: &LoadedPlugin,
        target_intent: &str,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainRequestData, DispatchError> {
        tokio::select! {
            result = plugin.instance().cross_domain_request(target_intent) => {
                result.map_err(|e| plugin_error(plugin, e))
            }
            _ = cancel.cancelled() => Err(DispatchError::Cancelled(plugin.identity().clone())),
        }
    }

    async fn cross_domain_response(
        &self,
        plugin: &LoadedPlugin,
        context: &CrossDomainContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainResponseData, DispatchError> {
        tokio::select! {
            result = plugin.instance().cross_domain_response(context, services) => {
                result.map_err(|e| plugin_error(plugin, e))
            }
            _ = cancel.cancelled() => Err(DispatchError::Cancelled(plugin.identity().clone())),
        }
    }
}
