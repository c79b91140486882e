//! Routes dispatch calls to loaded plugin instances.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::config::ConcurrencyPolicy;
use crate::engine::ExecutionEngine;
use crate::error::DispatchError;
use crate::host::{LoadedPlugin, PluginHost};
use crate::identity::PluginIdentity;
use crate::model::{
    CrossDomainContext, CrossDomainRequestData, CrossDomainResponseResponse, ExecutionRequest, ExecutionResult,
    PluginServices, QueryContext, TriggerResult,
};
use crate::plugin::plugin_span;

/// Why a call was abandoned by an outer strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The call ran past its SLA
    SlaViolation,
    /// The caller cancelled the call
    Cancelled,
}

/// The four dispatch operations, implemented by every isolation strategy.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Execute an entry point. Session and entity changes the plugin makes
    /// are visible in `request.services` afterwards.
    async fn launch(
        &self,
        identity: &PluginIdentity,
        request: &mut ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, DispatchError>;

    async fn trigger(
        &self,
        identity: &PluginIdentity,
        query: &QueryContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<TriggerResult, DispatchError>;

    async fn cross_domain_request(
        &self,
        identity: &PluginIdentity,
        target_intent: &str,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainRequestData, DispatchError>;

    /// Deliver a handoff. The returned entity context is read after the call.
    async fn cross_domain_response(
        &self,
        identity: &PluginIdentity,
        context: &CrossDomainContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainResponseResponse, DispatchError>;

    /// An outer strategy gave up waiting on a call into `identity`.
    async fn abandon(&self, _identity: &PluginIdentity, _reason: AbandonReason) {}
}

/// Dispatcher over the in-process plugin host.
///
/// This is the Direct strategy: it resolves the loaded instance and hands
/// the call to the execution engine, with no timeout or containment.
pub struct ExecutionDispatcher {
    host: Arc<PluginHost>,
    engine: Arc<dyn ExecutionEngine>,
    policy: ConcurrencyPolicy,
    gates: DashMap<PluginIdentity, Arc<Mutex<()>>>,
}

impl ExecutionDispatcher {
    pub fn new(host: Arc<PluginHost>, engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            host,
            engine,
            policy: ConcurrencyPolicy::default(),
            gates: DashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    pub fn host(&self) -> &Arc<PluginHost> {
        &self.host
    }

    fn resolve(&self, identity: &PluginIdentity) -> Result<Arc<LoadedPlugin>, DispatchError> {
        self.host
            .loaded(identity)
            .ok_or_else(|| DispatchError::NotLoaded(identity.clone()))
    }

    /// Number of per-identity gates currently held.
    pub(crate) fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// Wait for the identity's gate under `SingleCallPerIdentity`.
    async fn admit(
        &self,
        identity: &PluginIdentity,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedMutexGuard<()>>, DispatchError> {
        if self.policy == ConcurrencyPolicy::Unrestricted {
            return Ok(None);
        }
        // Idle gates of unloaded identities go away.
        self.gates.retain(|id, gate| Arc::strong_count(gate) > 1 || self.host.is_loaded(id));
        let gate = self.gates.entry(identity.clone()).or_default().value().clone();
        tokio::select! {
            guard = gate.lock_owned() => Ok(Some(guard)),
            _ = cancel.cancelled() => {
                debug!("Cancelled while waiting for plugin {} to finish its previous call", identity);
                Err(DispatchError::Cancelled(identity.clone()))
            }
        }
    }
}

#[async_trait]
impl Dispatch for ExecutionDispatcher {
    async fn launch(
        &self,
        identity: &PluginIdentity,
        request: &mut ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, DispatchError> {
        let plugin = self.resolve(identity)?;
        let _gate = self.admit(identity, cancel).await?;
        self.engine
            .launch(&plugin, request, cancel)
            .instrument(plugin_span(identity))
            .await
    }

    async fn trigger(
        &self,
        identity: &PluginIdentity,
        query: &QueryContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<TriggerResult, DispatchError> {
        let plugin = self.resolve(identity)?;
        let _gate = self.admit(identity, cancel).await?;
        self.engine
            .trigger(&plugin, query, services, cancel)
            .instrument(plugin_span(identity))
            .await
    }

    async fn cross_domain_request(
        &self,
        identity: &PluginIdentity,
        target_intent: &str,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainRequestData, DispatchError> {
        let plugin = self.resolve(identity)?;
        let _gate = self.admit(identity, cancel).await?;
        self.engine
            .cross_domain_request(&plugin, target_intent, cancel)
            .instrument(plugin_span(identity))
            .await
    }

    async fn cross_domain_response(
        &self,
        identity: &PluginIdentity,
        context: &CrossDomainContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> Result<CrossDomainResponseResponse, DispatchError> {
        let plugin = self.resolve(identity)?;
        let _gate = self.admit(identity, cancel).await?;
        let plugin_response = self
            .engine
            .cross_domain_response(&plugin, context, services, cancel)
            .instrument(plugin_span(identity))
            .await?;
        Ok(CrossDomainResponseResponse {
            plugin_response,
            entity_context: services.entity_context.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::model::{FailureKind, ResponsePayload};
    use crate::testing::{Behavior, ScriptedPlugin, TraceRecorder, TestRig};

    fn request(rig: &TestRig, utterance: &str) -> ExecutionRequest {
        ExecutionRequest::new("start", QueryContext::new(utterance, "weather"), rig.services())
    }

    #[tokio::test]
    async fn test_not_loaded_is_an_error() {
        let rig = TestRig::new();
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::Unrestricted);
        let ghost = PluginIdentity::new("ghost", 1, 0);
        let cancel = CancellationToken::new();

        let err = dispatcher.launch(&ghost, &mut request(&rig, "hi"), &cancel).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotLoaded(_)));

        let mut services = rig.services();
        let query = QueryContext::new("hi", "weather");
        assert!(matches!(
            dispatcher.trigger(&ghost, &query, &mut services, &cancel).await,
            Err(DispatchError::NotLoaded(_))
        ));
        assert!(matches!(
            dispatcher.cross_domain_request(&ghost, "handoff", &cancel).await,
            Err(DispatchError::NotLoaded(_))
        ));
        assert!(matches!(
            dispatcher
                .cross_domain_response(&ghost, &CrossDomainContext::default(), &mut services, &cancel)
                .await,
            Err(DispatchError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_runs_entry_point() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        rig.load_all("weather", &[&weather]).await;
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::Unrestricted);

        let result = dispatcher
            .launch(&weather.identity, &mut request(&rig, "today?").retry(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result,
            ExecutionResult::Success(ResponsePayload::text("sunny (retry):start:today?"))
        );

        let mut bad = request(&rig, "today?");
        bad.entry_point = "nowhere".into();
        let err = dispatcher
            .launch(&weather.identity, &mut bad, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::EntryPointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_direct_dispatch_propagates_plugin_errors() {
        let rig = TestRig::new();
        let broken = ScriptedPlugin::new("broken", 1, 0, Behavior::Error("disk on fire".into()));
        let failing = ScriptedPlugin::new("failing", 1, 0, Behavior::Fail("custom message".into()));
        rig.load_all("bundle", &[&broken, &failing]).await;
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::Unrestricted);
        let cancel = CancellationToken::new();

        let err = dispatcher
            .launch(&broken.identity, &mut request(&rig, "x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Plugin { ref message, .. } if message == "disk on fire"));

        let result = dispatcher
            .launch(&failing.identity, &mut request(&rig, "x"), &cancel)
            .await
            .unwrap();
        let failure = result.failure().unwrap();
        assert_eq!(failure.message, "custom message");
        assert_eq!(failure.kind, FailureKind::Plugin);
    }

    #[tokio::test]
    async fn test_services_changes_are_visible_to_caller() {
        let rig = TestRig::new();
        let memo = ScriptedPlugin::new("memo", 1, 0, Behavior::Remember("city".into(), "Oslo".into()));
        rig.load_all("memo", &[&memo]).await;
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::Unrestricted);

        let mut req = request(&rig, "remember Oslo");
        dispatcher.launch(&memo.identity, &mut req, &CancellationToken::new()).await.unwrap();
        assert_eq!(req.services.entity_context.get("city"), Some("Oslo"));
        assert_eq!(req.services.session_store.get("city").map(String::as_str), Some("Oslo"));
    }

    #[tokio::test]
    async fn test_cross_domain_round_trip() {
        let rig = TestRig::new();
        let target = ScriptedPlugin::replying("travel", "ok");
        rig.load_all("travel", &[&target]).await;
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::Unrestricted);
        let cancel = CancellationToken::new();

        let data = dispatcher.cross_domain_request(&target.identity, "handoff", &cancel).await.unwrap();
        assert!(data.supported);
        assert_eq!(data.requested_slots, vec!["city"]);

        let context = CrossDomainContext {
            source_plugin: "weather".into(),
            target_intent: "handoff".into(),
            slots: [("city".to_string(), "Lima".to_string())].into_iter().collect(),
        };
        let mut services = rig.services();
        let response = dispatcher
            .cross_domain_response(&target.identity, &context, &mut services, &cancel)
            .await
            .unwrap();
        assert_eq!(response.plugin_response.callback_intent.as_deref(), Some("done"));
        assert_eq!(response.entity_context.get("handoff_city"), Some("Lima"));
    }

    #[tokio::test]
    async fn test_trigger_boosts_matching_intent() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        rig.load_all("weather", &[&weather]).await;
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::Unrestricted);

        let result = dispatcher
            .trigger(
                &weather.identity,
                &QueryContext::new("rain?", "weather"),
                &mut rig.services(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, TriggerResult::Boost);
    }

    #[tokio::test]
    async fn test_concurrent_launches_on_different_plugins() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        let news = ScriptedPlugin::replying("news", "headlines");
        rig.load_all("bundle", &[&weather, &news]).await;
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::Unrestricted);
        let cancel = CancellationToken::new();

        let mut a = request(&rig, "a");
        let mut b = request(&rig, "b");
        let (ra, rb) = tokio::join!(
            dispatcher.launch(&weather.identity, &mut a, &cancel),
            dispatcher.launch(&news.identity, &mut b, &cancel)
        );
        assert_eq!(ra.unwrap(), ExecutionResult::Success(ResponsePayload::text("sunny:start:a")));
        assert_eq!(rb.unwrap(), ExecutionResult::Success(ResponsePayload::text("headlines:start:b")));
    }

    async fn peak_concurrency(policy: ConcurrencyPolicy) -> usize {
        let rig = TestRig::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let counter = ScriptedPlugin::new(
            "counter",
            1,
            0,
            Behavior::Track {
                current: current.clone(),
                peak: peak.clone(),
                hold: Duration::from_millis(50),
            },
        );
        rig.load_all("counter", &[&counter]).await;
        let dispatcher = rig.dispatcher(policy);
        let cancel = CancellationToken::new();

        let mut calls = Vec::new();
        for i in 0..4 {
            let dispatcher = dispatcher.clone();
            let identity = counter.identity.clone();
            let cancel = cancel.clone();
            let mut req = request(&rig, &i.to_string());
            calls.push(tokio::spawn(async move {
                dispatcher.launch(&identity, &mut req, &cancel).await.unwrap()
            }));
        }
        for call in calls {
            assert!(call.await.unwrap().is_success());
        }
        peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_unrestricted_policy_overlaps_calls() {
        assert!(peak_concurrency(ConcurrencyPolicy::Unrestricted).await > 1);
    }

    #[tokio::test]
    async fn test_single_call_policy_serializes_calls() {
        assert_eq!(peak_concurrency(ConcurrencyPolicy::SingleCallPerIdentity).await, 1);
    }

    #[tokio::test]
    async fn test_gates_of_unloaded_plugins_are_dropped() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        let news = ScriptedPlugin::replying("news", "headlines");
        rig.load_all("bundle", &[&weather, &news]).await;
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::SingleCallPerIdentity);
        let cancel = CancellationToken::new();

        dispatcher.launch(&weather.identity, &mut request(&rig, "a"), &cancel).await.unwrap();
        assert_eq!(dispatcher.gate_count(), 1);

        rig.host.unload(&weather.identity, &rig.services()).await.unwrap();
        dispatcher.launch(&news.identity, &mut request(&rig, "b"), &cancel).await.unwrap();
        assert_eq!(dispatcher.gate_count(), 1);
    }

    #[tokio::test]
    async fn test_calls_run_inside_plugin_span() {
        let rig = TestRig::new();
        let weather = ScriptedPlugin::replying("weather", "sunny");
        rig.load_all("weather", &[&weather]).await;
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::Unrestricted);

        let recorder = TraceRecorder::default();
        let _guard = recorder.install();
        dispatcher
            .launch(&weather.identity, &mut request(&rig, "x"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(recorder.spans(), vec![("plugin".to_string(), "weather:1.0".to_string())]);
    }

    #[tokio::test]
    async fn test_cancellation_reaches_plugin_call() {
        let rig = TestRig::new();
        let sleepy = ScriptedPlugin::new("sleepy", 1, 0, Behavior::Sleep(Duration::from_secs(30)));
        rig.load_all("sleepy", &[&sleepy]).await;
        let dispatcher = rig.dispatcher(ConcurrencyPolicy::Unrestricted);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = dispatcher
            .launch(&sleepy.identity, &mut request(&rig, "zzz"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
