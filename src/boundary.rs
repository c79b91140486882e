//! Selection of the isolation strategy.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{IsolationConfig, IsolationStrategy};
use crate::dispatcher::{AbandonReason, Dispatch, ExecutionDispatcher};
use crate::error::{DispatchError, HostError, Result};
use crate::identity::PluginIdentity;
use crate::model::{
    CrossDomainContext, CrossDomainRequestData, CrossDomainResponseResponse, ExecutionRequest, ExecutionResult,
    PluginServices, QueryContext, TriggerResult,
};
use crate::remote::RemoteDispatcher;
use crate::sandbox::SandboxedDispatcher;

/// The dispatcher callers use, wrapped according to the configured
/// isolation strategy.
pub struct IsolationBoundary {
    strategy: IsolationStrategy,
    dispatch: Arc<dyn Dispatch>,
}

impl IsolationBoundary {
    /// Boundary around an in-process dispatcher (Direct, Sandboxed or
    /// SandboxedDebug).
    pub fn in_process(config: &IsolationConfig, dispatcher: Arc<ExecutionDispatcher>) -> Result<Self> {
        let dispatch: Arc<dyn Dispatch> = match config.strategy {
            IsolationStrategy::Direct => dispatcher,
            IsolationStrategy::Sandboxed => Arc::new(SandboxedDispatcher::new(dispatcher, config.sla())),
            IsolationStrategy::SandboxedDebug => Arc::new(SandboxedDispatcher::debug(dispatcher)),
            IsolationStrategy::Remoted => {
                return Err(HostError::Config(
                    "the remoted strategy needs a remote dispatcher, not an in-process one".into(),
                ))
            }
        };
        info!("Plugin calls use the {:?} isolation strategy", config.strategy);
        Ok(Self {
            strategy: config.strategy,
            dispatch,
        })
    }

    /// Boundary around a plugin container. Calls are still bounded by the
    /// SLA on the host side.
    pub fn remoted(config: &IsolationConfig, remote: Arc<RemoteDispatcher>) -> Self {
        info!(
            "Plugin calls use the Remoted isolation strategy over {:?}",
            remote.protocol()
        );
        Self {
            strategy: IsolationStrategy::Remoted,
            dispatch: Arc::new(SandboxedDispatcher::new(remote, config.sla())),
        }
    }

    pub fn strategy(&self) -> IsolationStrategy {
        self.strategy
    }
}

#[async_trait]
impl Dispatch for IsolationBoundary {
    async fn launch(
        &self,
        identity: &PluginIdentity,
        request: &mut ExecutionRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ExecutionResult, DispatchError> {
        self.dispatch.launch(identity, request, cancel).await
    }

    async fn trigger(
        &self,
        identity: &PluginIdentity,
        query: &QueryContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> std::result::Result<TriggerResult, DispatchError> {
        self.dispatch.trigger(identity, query, services, cancel).await
    }

    async fn cross_domain_request(
        &self,
        identity: &PluginIdentity,
        target_intent: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<CrossDomainRequestData, DispatchError> {
        self.dispatch.cross_domain_request(identity, target_intent, cancel).await
    }

    async fn cross_domain_response(
        &self,
        identity: &PluginIdentity,
        context: &CrossDomainContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> std::result::Result<CrossDomainResponseResponse, DispatchError> {
        self.dispatch.cross_domain_response(identity, context, services, cancel).await
    }

    async fn abandon(&self, identity: &PluginIdentity, reason: AbandonReason) {
        self.dispatch.abandon(identity, reason).await;
    }
}
