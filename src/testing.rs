//! Test fixtures: scripted plugins, a fake module loader and a rig wiring
//! registry, host and dispatcher over an in-memory file system.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dispatcher::ExecutionDispatcher;
use crate::engine::BasicExecutionEngine;
use crate::fs::{FileSystem, InMemoryFileSystem};
use crate::host::PluginHost;
use crate::identity::PluginIdentity;
use crate::loader::{LoadedModule, ModuleError, ModuleHandle, ModuleLoader};
use crate::model::{
    CrossDomainContext, CrossDomainRequestData, CrossDomainResponseData, ExecutionResult, Failure, PluginServices,
    QueryContext, ResponsePayload, TriggerResult,
};
use crate::plugin::{AnswerPlugin, ConversationTree, PluginError, PluginFactory, PluginInfo, StaticConversationTree};
use crate::registry::{PluginRegistry, ScanOptions};
use crate::config::ConcurrencyPolicy;

/// What a scripted plugin does when executed.
#[derive(Clone)]
pub enum Behavior {
    Reply(String),
    Sleep(Duration),
    /// Block the calling thread without yielding
    Block(Duration),
    Panic(String),
    Error(String),
    Fail(String),
    Skip,
    /// Record concurrent executions, holding each call for a while
    Track {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        hold: Duration,
    },
    /// Write an entity and a session value, then reply
    Remember(String, String),
}

#[derive(Clone)]
pub struct ScriptedPlugin {
    pub identity: PluginIdentity,
    pub behavior: Behavior,
    pub fail_load: bool,
    pub fail_unload: bool,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPlugin {
    pub fn new(id: &str, major: u32, minor: u32, behavior: Behavior) -> Self {
        Self {
            identity: PluginIdentity::new(id, major, minor),
            behavior,
            fail_load: false,
            fail_unload: false,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn replying(id: &str, text: &str) -> Self {
        Self::new(id, 1, 0, Behavior::Reply(text.to_string()))
    }

    pub fn factory(&self) -> PluginFactory {
        let template = self.clone();
        Arc::new(move || Box::new(template.clone()) as Box<dyn AnswerPlugin>)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
    }
}

#[async_trait]
impl AnswerPlugin for ScriptedPlugin {
    fn identity(&self) -> PluginIdentity {
        self.identity.clone()
    }

    fn conversation_tree(&self, _fs: &dyn FileSystem, _data_dir: &Path) -> Arc<dyn ConversationTree> {
        Arc::new(StaticConversationTree::new(["start", "followup"]))
    }

    fn plugin_info(&self, _fs: &dyn FileSystem, _data_dir: &Path) -> PluginInfo {
        PluginInfo {
            display_name: self.identity.id.clone(),
            creator: "tests".to_string(),
            ..Default::default()
        }
    }

    async fn on_load(&self, _services: &PluginServices) -> Result<(), PluginError> {
        self.record("load");
        if self.fail_load {
            return Err(PluginError::new("load refused"));
        }
        Ok(())
    }

    async fn on_unload(&self, _services: &PluginServices) -> Result<(), PluginError> {
        self.record("unload");
        if self.fail_unload {
            return Err(PluginError::new("unload refused"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        entry_point: &str,
        is_retry: bool,
        query: &QueryContext,
        services: &mut PluginServices,
    ) -> Result<ExecutionResult, PluginError> {
        match &self.behavior {
            Behavior::Reply(text) => {
                let suffix = if is_retry { " (retry)" } else { "" };
                Ok(ExecutionResult::Success(ResponsePayload::text(format!(
                    "{}{}:{}:{}",
                    text, suffix, entry_point, query.utterance
                ))))
            }
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(ExecutionResult::Success(ResponsePayload::text("woke up")))
            }
            Behavior::Block(duration) => {
                std::thread::sleep(*duration);
                Ok(ExecutionResult::Success(ResponsePayload::text("unblocked")))
            }
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::Error(message) => Err(PluginError::new(message.clone())),
            Behavior::Fail(message) => Ok(ExecutionResult::Failure(Failure::plugin(message.clone(), false))),
            Behavior::Skip => Ok(ExecutionResult::Skip),
            Behavior::Track { current, peak, hold } => {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(*hold).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(ExecutionResult::Success(ResponsePayload::text(self.identity.id.clone())))
            }
            Behavior::Remember(key, value) => {
                services.entity_context.set(key.clone(), value.clone());
                services.session_store.insert(key.clone(), value.clone());
                Ok(ExecutionResult::Success(ResponsePayload::text("remembered")))
            }
        }
    }

    async fn trigger(&self, query: &QueryContext, _services: &mut PluginServices) -> Result<TriggerResult, PluginError> {
        match &self.behavior {
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(TriggerResult::NoChange)
            }
            _ if query.intent.as_deref() == Some(self.identity.id.as_str()) => Ok(TriggerResult::Boost),
            _ => Ok(TriggerResult::NoChange),
        }
    }

    async fn cross_domain_request(&self, target_intent: &str) -> Result<CrossDomainRequestData, PluginError> {
        if target_intent == "handoff" {
            Ok(CrossDomainRequestData::supported(vec!["city".to_string()]))
        } else {
            Ok(CrossDomainRequestData::unsupported())
        }
    }

    async fn cross_domain_response(
        &self,
        context: &CrossDomainContext,
        services: &mut PluginServices,
    ) -> Result<CrossDomainResponseData, PluginError> {
        if let Behavior::Sleep(duration) = &self.behavior {
            tokio::time::sleep(*duration).await;
        }
        if let Some(city) = context.slots.get("city") {
            services.entity_context.set("handoff_city", city.clone());
        }
        Ok(CrossDomainResponseData {
            result: ExecutionResult::Success(ResponsePayload::text(format!("from {}", context.source_plugin))),
            callback_intent: Some("done".to_string()),
        })
    }
}

#[derive(Clone, Copy)]
pub enum BrokenModule {
    Malformed,
    MissingDependency,
    PolicyViolation,
}

enum FakeModule {
    Plugins(Vec<PluginFactory>),
    Broken(BrokenModule),
}

/// Loader whose "modules" are named by the text content of the module file.
#[derive(Default)]
pub struct FakeModuleLoader {
    modules: Mutex<HashMap<String, FakeModule>>,
    opened: Mutex<Vec<PathBuf>>,
}

impl FakeModuleLoader {
    pub fn add_module(&self, name: &str, plugins: &[&ScriptedPlugin]) {
        let factories = plugins.iter().map(|p| p.factory()).collect();
        self.add_factories(name, factories);
    }

    pub fn add_factories(&self, name: &str, factories: Vec<PluginFactory>) {
        self.modules
            .lock()
            .unwrap()
            .insert(name.to_string(), FakeModule::Plugins(factories));
    }

    pub fn add_broken(&self, name: &str, kind: BrokenModule) {
        self.modules
            .lock()
            .unwrap()
            .insert(name.to_string(), FakeModule::Broken(kind));
    }

    /// Paths opened so far, in order.
    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap().clone()
    }
}

impl ModuleLoader for FakeModuleLoader {
    fn load(&self, path: &Path) -> Result<LoadedModule, ModuleError> {
        self.opened.lock().unwrap().push(path.to_path_buf());
        let name = std::fs::read_to_string(path)
            .map_err(|e| ModuleError::Malformed(e.to_string()))?
            .trim()
            .to_string();
        let modules = self.modules.lock().unwrap();
        match modules.get(&name) {
            Some(FakeModule::Plugins(factories)) => Ok(LoadedModule {
                factories: factories.clone(),
                prewarm: None,
                handle: ModuleHandle::detached(path),
            }),
            Some(FakeModule::Broken(BrokenModule::Malformed)) | None => {
                Err(ModuleError::Malformed(format!("{} is not a plugin module", name)))
            }
            Some(FakeModule::Broken(BrokenModule::MissingDependency)) => {
                Err(ModuleError::MissingDependency(format!("{} needs libmissing", name)))
            }
            Some(FakeModule::Broken(BrokenModule::PolicyViolation)) => {
                Err(ModuleError::PolicyViolation(format!("{} declares a newer ABI", name)))
            }
        }
    }
}

/// Registry + host over an in-memory plugin directory.
pub struct TestRig {
    pub fs: Arc<InMemoryFileSystem>,
    pub loader: Arc<FakeModuleLoader>,
    pub registry: Arc<PluginRegistry>,
    pub host: Arc<PluginHost>,
    clock: AtomicI64,
    _shadow_dir: tempfile::TempDir,
}

impl TestRig {
    pub fn new() -> Self {
        let fs = Arc::new(InMemoryFileSystem::new());
        let loader = Arc::new(FakeModuleLoader::default());
        let shadow_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            PluginRegistry::new(
                fs.clone(),
                "plugins",
                loader.clone(),
                ScanOptions::shadow_copied("so", shadow_dir.path()),
            )
            .unwrap(),
        );
        let host = Arc::new(PluginHost::new(registry.clone()));
        Self {
            fs,
            loader,
            registry,
            host,
            clock: AtomicI64::new(1_700_000_000),
            _shadow_dir: shadow_dir,
        }
    }

    /// Drop a module file naming `module` at `plugins/<file>`, stamped later
    /// than anything written before.
    pub fn install(&self, file: &str, module: &str) {
        let secs = self.clock.fetch_add(1, Ordering::SeqCst);
        let stamp: DateTime<Utc> = DateTime::from_timestamp(secs, 0).unwrap();
        self.fs.write_at(Path::new("plugins").join(file), module.as_bytes().to_vec(), stamp);
    }

    pub fn services(&self) -> PluginServices {
        PluginServices::new(self.fs.clone(), "data")
    }

    pub fn dispatcher(&self, policy: ConcurrencyPolicy) -> Arc<ExecutionDispatcher> {
        Arc::new(
            ExecutionDispatcher::new(self.host.clone(), Arc::new(BasicExecutionEngine::new())).with_policy(policy),
        )
    }

    /// Install `<module>.so` with the given plugins and load all of them.
    pub async fn load_all(&self, module: &str, plugins: &[&ScriptedPlugin]) {
        self.loader.add_module(module, plugins);
        self.install(&format!("{}.so", module), module);
        for plugin in plugins {
            self.host.load(&plugin.identity, &self.services()).await.unwrap();
        }
    }
}

/// Records spans and event messages emitted while installed.
#[derive(Clone, Default)]
pub struct TraceRecorder {
    spans: Arc<Mutex<Vec<(String, String)>>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl TraceRecorder {
    /// Install as the thread's subscriber until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::layer::SubscriberExt;
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    /// `(name, id field)` of every span opened so far.
    pub fn spans(&self) -> Vec<(String, String)> {
        self.spans.lock().unwrap().clone()
    }

    /// Messages of every event so far.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for TraceRecorder {
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        _id: &tracing::span::Id,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut id = FieldText::new("id");
        attrs.record(&mut id);
        self.spans
            .lock()
            .unwrap()
            .push((attrs.metadata().name().to_string(), id.text));
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut message = FieldText::new("message");
        event.record(&mut message);
        self.events.lock().unwrap().push(message.text);
    }
}

/// Debug text of one named field.
struct FieldText {
    name: &'static str,
    text: String,
}

impl FieldText {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            text: String::new(),
        }
    }
}

impl tracing::field::Visit for FieldText {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == self.name {
            self.text = format!("{:?}", value);
        }
    }
}
