//! Sandboxed dispatch: each call runs on its own worker thread, bounded by
//! an SLA.
//!
//! The worker gets a deep copy of the call's services; the copy is written
//! back only when the worker finishes in time. When the SLA expires or the
//! caller cancels, the worker's cancellation token fires and the caller gets
//! a failure value straight away.
//!
//! The worker thread drives the plugin future on the caller's runtime, so a
//! plugin that blocks its thread never holds up the caller's timer, even on a
//! current-thread runtime. A blocking plugin keeps its worker thread until it
//! returns; its result is discarded. Deployments that need hard termination
//! use the Remoted strategy, which can kill the container process.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dispatcher::{AbandonReason, Dispatch};
use crate::error::{panic_message, DispatchError};
use crate::identity::PluginIdentity;
use crate::model::{
    CrossDomainContext, CrossDomainRequestData, CrossDomainResponseResponse, ExecutionRequest, ExecutionResult,
    Failure, FailureResponse, PluginServices, QueryContext, TriggerResult,
};

/// Contains failures of an inner dispatcher.
pub struct SandboxedDispatcher {
    inner: Arc<dyn Dispatch>,
    /// None in the debug variant
    sla: Option<Duration>,
}

impl SandboxedDispatcher {
    pub fn new(inner: Arc<dyn Dispatch>, sla: Duration) -> Self {
        Self { inner, sla: Some(sla) }
    }

    /// Sandbox without a timeout, for stepping through plugin code.
    pub fn debug(inner: Arc<dyn Dispatch>) -> Self {
        Self { inner, sla: None }
    }

    pub fn sla(&self) -> Option<Duration> {
        self.sla
    }

    /// Run `work` on a worker thread and turn anything other than an in-time
    /// answer into a failure value. Returns the worker's write-back state
    /// only when the worker answered.
    async fn contain<T, S, F, Fut>(
        &self,
        identity: &PluginIdentity,
        operation: &'static str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<(T, Option<S>), DispatchError>
    where
        T: FailureResponse + Send + 'static,
        S: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(T, S), DispatchError>> + Send + 'static,
    {
        let worker_token = cancel.child_token();
        let outcome = match spawn_worker(identity, worker_token.clone(), work(worker_token.clone())) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Could not start a worker thread for plugin {} during {}: {}", identity, operation, e);
                let reason = format!("no worker thread: {}", e);
                return Ok((T::from_failure(Failure::unhandled_exception(identity, operation, &reason)), None));
            }
        };
        let deadline = async {
            match self.sla {
                Some(sla) => tokio::time::sleep(sla).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            finished = outcome => {
                let finished = finished.unwrap_or_else(|_| Err("worker thread exited without a result".to_string()));
                settle(identity, operation, finished)
            }
            _ = deadline => {
                worker_token.cancel();
                let sla_ms = self.sla.map(|d| d.as_millis()).unwrap_or_default();
                error!("Plugin {} violated its SLA of {} ms during {}; abandoning the call", identity, sla_ms, operation);
                self.inner.abandon(identity, AbandonReason::SlaViolation).await;
                Ok((T::from_failure(Failure::sla_violation(identity, operation, sla_ms)), None))
            }
            _ = cancel.cancelled() => {
                warn!("Call into plugin {} was cancelled during {}", identity, operation);
                self.inner.abandon(identity, AbandonReason::Cancelled).await;
                Ok((T::from_failure(Failure::cancelled(identity, operation)), None))
            }
        }
    }
}

type WorkerOutcome<T, S> = Result<Result<(T, S), DispatchError>, String>;

/// Drive `work` to completion on a dedicated thread. The thread stops
/// polling once `token` fires; a panic comes back as its message.
fn spawn_worker<T, S, Fut>(
    identity: &PluginIdentity,
    token: CancellationToken,
    work: Fut,
) -> std::io::Result<oneshot::Receiver<WorkerOutcome<T, S>>>
where
    T: Send + 'static,
    S: Send + 'static,
    Fut: Future<Output = Result<(T, S), DispatchError>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let handle = tokio::runtime::Handle::current();
    let identity = identity.clone();
    std::thread::Builder::new()
        .name("answer-plugin-worker".to_string())
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handle.block_on(async {
                    tokio::select! {
                        result = work => result,
                        _ = token.cancelled() => Err(DispatchError::Cancelled(identity.clone())),
                    }
                })
            }))
            .map_err(|payload| panic_message(&*payload));
            if tx.send(outcome).is_err() {
                debug!("Discarding late result of plugin {}", identity);
            }
        })?;
    Ok(rx)
}

fn settle<T: FailureResponse, S>(
    identity: &PluginIdentity,
    operation: &str,
    finished: WorkerOutcome<T, S>,
) -> Result<(T, Option<S>), DispatchError> {
    let contained = |failure: Failure| Ok((T::from_failure(failure), None));
    match finished {
        Ok(Ok((value, state))) => Ok((value, Some(state))),
        Ok(Err(e)) if e.is_caller_error() => Err(e),
        Ok(Err(DispatchError::Plugin { message, .. })) => {
            warn!("Plugin {} raised an error during {}: {}", identity, operation, message);
            contained(Failure::unhandled_exception(identity, operation, &message))
        }
        Ok(Err(DispatchError::Cancelled(_))) => contained(Failure::cancelled(identity, operation)),
        Ok(Err(e)) => {
            error!("Plugin {} could not be reached during {}: {}", identity, operation, e);
            contained(Failure::transport(identity, operation, &e.to_string()))
        }
        Err(message) => {
            error!("Plugin {} panicked during {}: {}", identity, operation, message);
            contained(Failure::unhandled_exception(identity, operation, &message))
        }
    }
}

#[async_trait]
impl Dispatch for SandboxedDispatcher {
    async fn launch(
        &self,
        identity: &PluginIdentity,
        request: &mut ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, DispatchError> {
        let inner = self.inner.clone();
        let target = identity.clone();
        let mut isolated = request.clone();
        let (result, services) = self
            .contain(identity, "launch", cancel, move |token| async move {
                let result = inner.launch(&target, &mut isolated, &token).await?;
                Ok((result, isolated.services))
            })
            .await?;
        if let Some(services) = services {
            request.services = services;
        }
        Ok(result)
    }

    async fn trigger(
        &self,
        identity: &PluginIdentity,
        query: &QueryContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<TriggerResult, DispatchError> {
        let inner = self.inner.clone();
        let target = identity.clone();
        let query = query.clone();
        let mut isolated = services.clone();
        let (result, updated) = self
            .contain(identity, "trigger", cancel, move |token| async move {
                let result = inner.trigger(&target, &query, &mut isolated, &token).await?;
                Ok((result, isolated))
            })
            .await?;
        if let Some(updated) = updated {
            *services = updated;
        }
        Ok(result)
    }

    async fn cross_domain_request(
        &self,
        identity: &PluginIdentity,
        target_intent: &str,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainRequestData, DispatchError> {
        let inner = self.inner.clone();
        let target = identity.clone();
        let target_intent = target_intent.to_string();
        let (data, _) = self
            .contain(identity, "cross-domain request", cancel, move |token| async move {
                let data = inner.cross_domain_request(&target, &target_intent, &token).await?;
                Ok((data, ()))
            })
            .await?;
        Ok(data)
    }

    async fn cross_domain_response(
        &self,
        identity: &PluginIdentity,
        context: &CrossDomainContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainResponseResponse, DispatchError> {
        let inner = self.inner.clone();
        let target = identity.clone();
        let context = context.clone();
        let mut isolated = services.clone();
        let (mut response, updated) = self
            .contain(identity, "cross-domain response", cancel, move |token| async move {
                let response = inner.cross_domain_response(&target, &context, &mut isolated, &token).await?;
                Ok((response, isolated))
            })
            .await?;
        match updated {
            Some(updated) => *services = updated,
            None => response.entity_context = services.entity_context.clone(),
        }
        Ok(response)
    }

    async fn abandon(&self, identity: &PluginIdentity, reason: AbandonReason) {
        self.inner.abandon(identity, reason).await;
    }
}
