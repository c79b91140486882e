//! Host side of the remoting boundary.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{AbandonReason, Dispatch};
use crate::error::{DispatchError, HostError, Result};
use crate::identity::PluginIdentity;
use crate::model::{
    CrossDomainContext, CrossDomainRequestData, CrossDomainResponseResponse, ExecutionRequest, ExecutionResult,
    PluginServices, QueryContext, TriggerResult,
};
use crate::remote::protocol::{
    read_frame, write_frame, LoadedPluginSummary, RemoteCall, RemoteMessage, RemoteReply, WireProtocolKind,
};

/// Byte streams to a plugin container.
pub struct RemoteChannel {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Container process, killed when the connection is dropped
    pub child: Option<Child>,
}

/// Opens connections to a plugin container.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self) -> std::result::Result<RemoteChannel, DispatchError>;
}

/// Spawns the container as a child process and talks over its stdio.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessConnector {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl RemoteConnector for ProcessConnector {
    async fn connect(&self) -> std::result::Result<RemoteChannel, DispatchError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DispatchError::Transport(format!("failed to start plugin container {}: {}", self.program.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DispatchError::Transport("plugin container has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::Transport("plugin container has no stdout".into()))?;
        info!("Started plugin container {} (pid {:?})", self.program.display(), child.id());

        Ok(RemoteChannel {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<RemoteMessage>,
    pending: Arc<DashMap<u64, oneshot::Sender<RemoteReply>>>,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    child: std::sync::Mutex<Option<Child>>,
}

impl Connection {
    fn open(channel: RemoteChannel, protocol: WireProtocolKind) -> Self {
        let RemoteChannel {
            mut reader,
            mut writer,
            child,
        } = channel;
        let (outgoing, mut rx) = mpsc::unbounded_channel::<RemoteMessage>();
        let pending: Arc<DashMap<u64, oneshot::Sender<RemoteReply>>> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let writer_alive = alive.clone();
        let writer_task = tokio::spawn(async move {
            let protocol = protocol.protocol();
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, protocol.as_ref(), &message).await {
                    error!("Lost connection to plugin container while writing: {}", e);
                    break;
                }
            }
            writer_alive.store(false, Ordering::SeqCst);
        });

        let reader_alive = alive.clone();
        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some((kind, payload))) => match kind.protocol().decode(&payload) {
                        Ok(RemoteMessage::Reply { call_id, reply }) => {
                            if let Some((_, waiter)) = reader_pending.remove(&call_id) {
                                let _ = waiter.send(reply);
                            } else {
                                debug!("Dropping reply for abandoned call {}", call_id);
                            }
                        }
                        Ok(other) => warn!("Ignoring unexpected message from plugin container: {:?}", other),
                        Err(e) => warn!("Discarding undecodable frame from plugin container: {}", e),
                    },
                    Ok(None) => {
                        warn!("Plugin container closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!("Lost connection to plugin container while reading: {}", e);
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with an error.
            reader_pending.clear();
        });

        Self {
            outgoing,
            pending,
            alive,
            tasks: vec![writer_task, reader_task],
            child: std::sync::Mutex::new(child),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.outgoing.is_closed()
    }

    /// Tear the connection down now, even while calls still hold it. Every
    /// waiting call wakes with a transport error.
    fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
        if let Ok(mut child) = self.child.lock() {
            if let Some(child) = child.as_mut() {
                if let Err(e) = child.start_kill() {
                    debug!("Plugin container could not be killed: {}", e);
                }
            }
        }
        self.pending.clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Sends `Cancel` for a call whose caller stopped waiting.
struct InFlight {
    connection: Arc<Connection>,
    call_id: u64,
    settled: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.settled {
            self.connection.pending.remove(&self.call_id);
            let _ = self
                .connection
                .outgoing
                .send(RemoteMessage::Cancel { call_id: self.call_id });
        }
    }
}

enum CallError {
    Cancelled,
    Transport(String),
}

/// Dispatcher that forwards every call to a plugin container.
///
/// The connection is opened lazily. If it is lost (or killed after an SLA
/// violation) the next call reconnects and loads the plugins that were
/// loaded before, in load order.
pub struct RemoteDispatcher {
    connector: Arc<dyn RemoteConnector>,
    protocol: WireProtocolKind,
    connection: Mutex<Option<Arc<Connection>>>,
    next_call_id: AtomicU64,
    /// Loads to replay on reconnect
    loaded: std::sync::Mutex<Vec<(PluginIdentity, PluginServices)>>,
}

impl RemoteDispatcher {
    pub fn new(connector: Arc<dyn RemoteConnector>, protocol: WireProtocolKind) -> Self {
        Self {
            connector,
            protocol,
            connection: Mutex::new(None),
            next_call_id: AtomicU64::new(1),
            loaded: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn protocol(&self) -> WireProtocolKind {
        self.protocol
    }

    // === Lifecycle ===

    /// Load a plugin inside the container.
    pub async fn load(&self, identity: &PluginIdentity, services: &PluginServices) -> Result<LoadedPluginSummary> {
        let call = RemoteCall::Load {
            identity: identity.clone(),
            services: services.clone(),
        };
        match self.lifecycle_call(call).await? {
            RemoteReply::Loaded(summary) => {
                if let Ok(mut loaded) = self.loaded.lock() {
                    loaded.push((identity.clone(), services.clone()));
                }
                Ok(summary)
            }
            RemoteReply::Fault(fault) => Err(HostError::Remote(fault.message)),
            other => Err(unexpected_reply("load", &other)),
        }
    }

    /// Unload a plugin inside the container; returns the unload hook's result.
    pub async fn unload(&self, identity: &PluginIdentity, services: &PluginServices) -> Result<bool> {
        if let Ok(mut loaded) = self.loaded.lock() {
            loaded.retain(|(id, _)| id != identity);
        }
        let call = RemoteCall::Unload {
            identity: identity.clone(),
            services: services.clone(),
        };
        match self.lifecycle_call(call).await? {
            RemoteReply::Unloaded(ok) => Ok(ok),
            RemoteReply::Fault(fault) => Err(HostError::Remote(fault.message)),
            other => Err(unexpected_reply("unload", &other)),
        }
    }

    pub async fn get_all_available(&self) -> Result<BTreeSet<PluginIdentity>> {
        match self.lifecycle_call(RemoteCall::GetAvailable).await? {
            RemoteReply::Available(identities) => Ok(identities.into_iter().collect()),
            RemoteReply::Fault(fault) => Err(HostError::Remote(fault.message)),
            other => Err(unexpected_reply("get available", &other)),
        }
    }

    /// Close the connection, stopping the container.
    pub async fn shutdown(&self) {
        if self.connection.lock().await.take().is_some() {
            info!("Closed connection to plugin container");
        }
    }

    async fn lifecycle_call(&self, call: RemoteCall) -> Result<RemoteReply> {
        let connection = self.connection().await.map_err(|e| HostError::Remote(e.to_string()))?;
        self.call_on(&connection, call, &CancellationToken::new())
            .await
            .map_err(|e| match e {
                CallError::Cancelled => HostError::Remote("call was cancelled".into()),
                CallError::Transport(message) => HostError::Remote(message),
            })
    }

    /// Current connection, reconnecting and replaying loads if it was lost.
    async fn connection(&self) -> std::result::Result<Arc<Connection>, DispatchError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.is_alive() {
                return Ok(connection.clone());
            }
            warn!("Connection to plugin container was lost; reconnecting");
        }

        let connection = Arc::new(Connection::open(self.connector.connect().await?, self.protocol));
        let replay = self.loaded.lock().map(|l| l.clone()).unwrap_or_default();
        for (identity, services) in replay {
            let call = RemoteCall::Load {
                identity: identity.clone(),
                services,
            };
            match self.call_on(&connection, call, &CancellationToken::new()).await {
                Ok(RemoteReply::Loaded(_)) => debug!("Reloaded plugin {} in new container", identity),
                Ok(RemoteReply::Fault(fault)) => {
                    warn!("Could not reload plugin {} in new container: {}", identity, fault.message)
                }
                Ok(other) => warn!("Unexpected reply reloading plugin {}: {:?}", identity, other),
                Err(_) => {
                    return Err(DispatchError::Transport(
                        "plugin container failed while reloading plugins".into(),
                    ))
                }
            }
        }
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn call_on(
        &self,
        connection: &Arc<Connection>,
        call: RemoteCall,
        cancel: &CancellationToken,
    ) -> std::result::Result<RemoteReply, CallError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        connection.pending.insert(call_id, tx);
        if !connection.is_alive() {
            // Killed between lookup and insert; nobody would answer.
            connection.pending.remove(&call_id);
            return Err(CallError::Transport("plugin container is not running".into()));
        }
        let mut in_flight = InFlight {
            connection: connection.clone(),
            call_id,
            settled: false,
        };

        connection
            .outgoing
            .send(RemoteMessage::Call { call_id, call })
            .map_err(|_| CallError::Transport("plugin container is not running".into()))?;

        tokio::select! {
            reply = rx => {
                in_flight.settled = true;
                reply.map_err(|_| CallError::Transport("connection to plugin container was lost".into()))
            }
            _ = cancel.cancelled() => Err(CallError::Cancelled),
        }
    }

    async fn dispatch_call(
        &self,
        identity: &PluginIdentity,
        call: RemoteCall,
        cancel: &CancellationToken,
    ) -> std::result::Result<RemoteReply, DispatchError> {
        let connection = self.connection().await?;
        match self.call_on(&connection, call, cancel).await {
            Ok(RemoteReply::Fault(fault)) => Err(fault.into_dispatch_error(identity)),
            Ok(reply) => Ok(reply),
            Err(CallError::Cancelled) => Err(DispatchError::Cancelled(identity.clone())),
            Err(CallError::Transport(message)) => Err(DispatchError::Transport(message)),
        }
    }
}

fn unexpected_reply(operation: &str, reply: &RemoteReply) -> HostError {
    HostError::Remote(format!("unexpected reply to {}: {:?}", operation, reply))
}

fn protocol_error(operation: &str, reply: &RemoteReply) -> DispatchError {
    DispatchError::Protocol(format!("unexpected reply to {}: {:?}", operation, reply))
}

/// Carry the caller's file system over to services that crossed the wire.
fn restore(mut received: PluginServices, original: &PluginServices) -> PluginServices {
    received.attach_file_system(original.file_system().clone());
    received
}

#[async_trait]
impl Dispatch for RemoteDispatcher {
    async fn launch(
        &self,
        identity: &PluginIdentity,
        request: &mut ExecutionRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ExecutionResult, DispatchError> {
        let call = RemoteCall::Launch {
            identity: identity.clone(),
            request: request.clone(),
        };
        match self.dispatch_call(identity, call, cancel).await? {
            RemoteReply::Launched { result, services } => {
                request.services = restore(services, &request.services);
                Ok(result)
            }
            other => Err(protocol_error("launch", &other)),
        }
    }

    async fn trigger(
        &self,
        identity: &PluginIdentity,
        query: &QueryContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> std::result::Result<TriggerResult, DispatchError> {
        let call = RemoteCall::Trigger {
            identity: identity.clone(),
            query: query.clone(),
            services: services.clone(),
        };
        match self.dispatch_call(identity, call, cancel).await? {
            RemoteReply::Triggered { result, services: updated } => {
                *services = restore(updated, services);
                Ok(result)
            }
            other => Err(protocol_error("trigger", &other)),
        }
    }

    async fn cross_domain_request(
        &self,
        identity: &PluginIdentity,
        target_intent: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<CrossDomainRequestData, DispatchError> {
        let call = RemoteCall::CrossDomainRequest {
            identity: identity.clone(),
            target_intent: target_intent.to_string(),
        };
        match self.dispatch_call(identity, call, cancel).await? {
            RemoteReply::CrossDomainRequested(data) => Ok(data),
            other => Err(protocol_error("cross-domain request", &other)),
        }
    }

    async fn cross_domain_response(
        &self,
        identity: &PluginIdentity,
        context: &CrossDomainContext,
        services: &mut PluginServices,
        cancel: &CancellationToken,
    ) -> std::result::Result<CrossDomainResponseResponse, DispatchError> {
        let call = RemoteCall::CrossDomainResponse {
            identity: identity.clone(),
            context: context.clone(),
            services: services.clone(),
        };
        match self.dispatch_call(identity, call, cancel).await? {
            RemoteReply::CrossDomainResponded { response, services: updated } => {
                *services = restore(updated, services);
                Ok(response)
            }
            other => Err(protocol_error("cross-domain response", &other)),
        }
    }

    async fn abandon(&self, identity: &PluginIdentity, reason: AbandonReason) {
        if reason != AbandonReason::SlaViolation {
            return;
        }
        // The stuck call cannot be stopped from here; kill the container.
        // Calls into other plugins on the same connection fail with a
        // transport error, and the next call starts a fresh container.
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            warn!("Killing plugin container after plugin {} violated its SLA", identity);
            connection.kill();
        }
    }
}
