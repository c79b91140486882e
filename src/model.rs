//! Values that flow through a conversational turn.
//!
//! Everything here is plain data: it is cloned into sandbox workers and
//! serialized across the remoting boundary, so none of these types may rely
//! on `deserialize_any` (the binary wire protocol cannot support it).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fs::{FileSystem, InMemoryFileSystem};

/// The user's turn as seen by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    /// Raw utterance text
    pub utterance: String,
    /// Recognized intent, if understanding ran
    pub intent: Option<String>,
    /// Recognizer confidence for `intent`
    pub confidence: f32,
    /// Recognized slot values
    pub slots: BTreeMap<String, String>,
    /// Locale, e.g. `en-US`
    pub locale: String,
    /// Capabilities the client advertised (display, audio, ...)
    pub client_capabilities: Vec<String>,
}

impl QueryContext {
    /// Create a query for an utterance with a recognized intent.
    pub fn new(utterance: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            utterance: utterance.into(),
            intent: Some(intent.into()),
            confidence: 1.0,
            locale: "en-US".to_string(),
            ..Default::default()
        }
    }

    /// Add a slot value.
    pub fn with_slot(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.slots.insert(name.into(), value.into());
        self
    }

    /// Check whether the client advertised a capability.
    pub fn client_supports(&self, capability: &str) -> bool {
        self.client_capabilities.iter().any(|c| c == capability)
    }
}

/// Entities a plugin publishes for later turns or for other plugins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityContext {
    entities: BTreeMap<String, String>,
}

impl EntityContext {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entities.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entities.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entities.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn empty_file_system() -> Arc<dyn FileSystem> {
    Arc::new(InMemoryFileSystem::new())
}

/// Per-call bundle of scoped services handed to plugin code.
///
/// Cloning produces an independent copy of the session and entity state; the
/// file system handle is shared. The file system never crosses the remoting
/// boundary, the receiving side attaches its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginServices {
    /// Trace id of the turn, for log correlation
    pub trace_id: Option<String>,
    /// The plugin's private data directory on `file_system`
    pub data_dir: PathBuf,
    /// Session key/value store
    pub session_store: BTreeMap<String, String>,
    /// Entity context, readable by the caller after the call completes
    pub entity_context: EntityContext,
    #[serde(skip, default = "empty_file_system")]
    file_system: Arc<dyn FileSystem>,
}

impl PluginServices {
    /// Create services rooted at `data_dir` on the given file system.
    pub fn new(file_system: Arc<dyn FileSystem>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            trace_id: None,
            data_dir: data_dir.into(),
            session_store: BTreeMap::new(),
            entity_context: EntityContext::default(),
            file_system,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.file_system
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Replace the file system handle (used after deserialization).
    pub fn attach_file_system(&mut self, file_system: Arc<dyn FileSystem>) {
        self.file_system = file_system;
    }
}

impl Default for PluginServices {
    fn default() -> Self {
        Self::new(empty_file_system(), PathBuf::new())
    }
}

/// Input to a launch call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Handler inside the plugin's conversation tree
    pub entry_point: String,
    /// A previous attempt at this turn failed
    pub is_retry: bool,
    pub query: QueryContext,
    pub services: PluginServices,
}

impl ExecutionRequest {
    pub fn new(entry_point: impl Into<String>, query: QueryContext, services: PluginServices) -> Self {
        Self {
            entry_point: entry_point.into(),
            is_retry: false,
            query,
            services,
        }
    }

    pub fn retry(mut self) -> Self {
        self.is_retry = true;
        self
    }
}

/// What the plugin produced for the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Text to display
    pub text: Option<String>,
    /// Text to speak
    pub spoken: Option<String>,
    /// Keep the conversation open for a follow-up turn
    pub continue_conversation: bool,
}

impl ResponsePayload {
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            spoken: Some(text.clone()),
            text: Some(text),
            continue_conversation: false,
        }
    }
}

/// Category of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The plugin deliberately returned a failure
    Plugin,
    /// The plugin raised an error or panicked
    UnhandledException,
    /// The plugin did not finish within its SLA
    SlaViolation,
    /// The caller cancelled the call
    Cancelled,
    /// The remote plugin process could not be reached
    Transport,
}

impl FailureKind {
    /// Marker embedded in failure messages so log-only consumers can still
    /// tell categories apart.
    pub fn marker(&self) -> &'static str {
        match self {
            FailureKind::Plugin => "plugin failure",
            FailureKind::UnhandledException => "unhandled exception",
            FailureKind::SlaViolation => "violated its SLA",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Transport => "transport failure",
        }
    }
}

/// A failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    /// End the turn with an error instead of falling back to another plugin
    pub fatal: bool,
    pub kind: FailureKind,
}

impl Failure {
    /// A failure returned by plugin code; the message is kept verbatim.
    pub fn plugin(message: impl Into<String>, fatal: bool) -> Self {
        Self {
            message: message.into(),
            fatal,
            kind: FailureKind::Plugin,
        }
    }

    pub fn unhandled_exception(plugin: impl fmt::Display, operation: &str, detail: &str) -> Self {
        Self {
            message: format!(
                "Plugin {} threw an {} during {}: {}",
                plugin,
                FailureKind::UnhandledException.marker(),
                operation,
                detail
            ),
            fatal: true,
            kind: FailureKind::UnhandledException,
        }
    }

    pub fn sla_violation(plugin: impl fmt::Display, operation: &str, sla_ms: u128) -> Self {
        Self {
            message: format!(
                "Plugin {} {} of {} ms during {}",
                plugin,
                FailureKind::SlaViolation.marker(),
                sla_ms,
                operation
            ),
            fatal: true,
            kind: FailureKind::SlaViolation,
        }
    }

    pub fn cancelled(plugin: impl fmt::Display, operation: &str) -> Self {
        Self {
            message: format!("Plugin {} call was {} during {}", plugin, FailureKind::Cancelled.marker(), operation),
            fatal: false,
            kind: FailureKind::Cancelled,
        }
    }

    pub fn transport(plugin: impl fmt::Display, operation: &str, detail: &str) -> Self {
        Self {
            message: format!(
                "Plugin {} hit a {} during {}: {}",
                plugin,
                FailureKind::Transport.marker(),
                operation,
                detail
            ),
            fatal: true,
            kind: FailureKind::Transport,
        }
    }
}

/// Outcome of a launch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionResult {
    Success(ResponsePayload),
    Failure(Failure),
    /// The plugin declined the turn; the caller may fall back elsewhere
    Skip,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ExecutionResult::Failure(f) => Some(f),
            _ => None,
        }
    }

    /// Whether the caller may try another plugin for this turn.
    pub fn allows_fallback(&self) -> bool {
        match self {
            ExecutionResult::Success(_) => false,
            ExecutionResult::Failure(f) => !f.fatal,
            ExecutionResult::Skip => true,
        }
    }
}

/// How strongly a plugin wants to handle an utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerResult {
    /// Leave ranking unchanged
    NoChange,
    /// Prefer this plugin
    Boost,
    /// Do not route this turn here
    Suppress,
    Failure(Failure),
}

/// Answer to "do you accept a handoff to this intent?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossDomainRequestData {
    pub supported: bool,
    /// Slots the plugin wants filled in the handoff context
    pub requested_slots: Vec<String>,
    pub failure: Option<Failure>,
}

impl CrossDomainRequestData {
    pub fn supported(requested_slots: Vec<String>) -> Self {
        Self {
            supported: true,
            requested_slots,
            failure: None,
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            requested_slots: Vec::new(),
            failure: None,
        }
    }
}

/// Handoff payload delivered into the target plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossDomainContext {
    /// Plugin id handing off
    pub source_plugin: String,
    pub target_intent: String,
    pub slots: BTreeMap<String, String>,
}

/// The target plugin's reaction to a handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossDomainResponseData {
    pub result: ExecutionResult,
    /// Intent to call back into the source plugin with, if any
    pub callback_intent: Option<String>,
}

/// Plugin output of a handoff plus the entity state read after the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossDomainResponseResponse {
    pub plugin_response: CrossDomainResponseData,
    pub entity_context: EntityContext,
}

/// Responses that can carry a contained failure in place of a real answer.
///
/// Isolation strategies use this to turn panics, timeouts and cancellation
/// into values instead of errors.
pub trait FailureResponse: Sized {
    fn from_failure(failure: Failure) -> Self;
}

impl FailureResponse for ExecutionResult {
    fn from_failure(failure: Failure) -> Self {
        ExecutionResult::Failure(failure)
    }
}

impl FailureResponse for TriggerResult {
    fn from_failure(failure: Failure) -> Self {
        TriggerResult::Failure(failure)
    }
}

impl FailureResponse for CrossDomainRequestData {
    fn from_failure(failure: Failure) -> Self {
        Self {
            supported: false,
            requested_slots: Vec::new(),
            failure: Some(failure),
        }
    }
}

impl FailureResponse for CrossDomainResponseResponse {
    fn from_failure(failure: Failure) -> Self {
        Self {
            plugin_response: CrossDomainResponseData {
                result: ExecutionResult::Failure(failure),
                callback_intent: None,
            },
            entity_context: EntityContext::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_messages_carry_kind_markers() {
        let f = Failure::sla_violation("weather:1.0", "launch", 1000);
        assert_eq!(f.kind, FailureKind::SlaViolation);
        assert!(f.message.contains("violated its SLA"));

        let f = Failure::unhandled_exception("weather:1.0", "trigger", "boom");
        assert!(f.message.contains("unhandled exception"));
        assert!(f.message.ends_with("boom"));

        let f = Failure::plugin("custom message", false);
        assert_eq!(f.message, "custom message");
    }

    #[test]
    fn test_fallback_rules() {
        assert!(!ExecutionResult::Success(ResponsePayload::text("hi")).allows_fallback());
        assert!(ExecutionResult::Skip.allows_fallback());
        assert!(ExecutionResult::Failure(Failure::plugin("x", false)).allows_fallback());
        assert!(!ExecutionResult::Failure(Failure::plugin("x", true)).allows_fallback());
    }

    #[test]
    fn test_services_clone_is_independent() {
        let mut a = PluginServices::default();
        a.entity_context.set("city", "Seattle");
        let mut b = a.clone();
        b.entity_context.set("city", "Paris");
        b.session_store.insert("turns".into(), "2".into());

        assert_eq!(a.entity_context.get("city"), Some("Seattle"));
        assert!(a.session_store.is_empty());
    }
}
