//! Container side of the remoting boundary.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dispatcher::Dispatch;
use crate::error::{panic_message, DispatchError};
use crate::fs::FileSystem;
use crate::host::PluginHost;
use crate::remote::protocol::{
    read_frame, write_frame, FaultKind, LoadedPluginSummary, RemoteCall, RemoteFault, RemoteMessage, RemoteReply,
    WireProtocolKind,
};

/// Serves remote calls against a local dispatcher and plugin host.
pub struct RemoteServer {
    dispatch: Arc<dyn Dispatch>,
    host: Option<Arc<PluginHost>>,
    /// Attached to every services bundle that arrives over the wire
    file_system: Arc<dyn FileSystem>,
}

impl RemoteServer {
    pub fn new(dispatch: Arc<dyn Dispatch>, file_system: Arc<dyn FileSystem>) -> Self {
        Self {
            dispatch,
            host: None,
            file_system,
        }
    }

    /// Accept lifecycle calls (load, unload, available) against `host`.
    pub fn with_host(mut self, host: Arc<PluginHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Serve one connection until the reader reaches end of stream.
    ///
    /// Each call runs on its own task; replies may therefore go out in a
    /// different order than the calls came in.
    pub async fn serve<R, W>(self: Arc<Self>, mut reader: R, writer: W) -> Result<(), DispatchError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<(WireProtocolKind, RemoteMessage)>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some((kind, message)) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, kind.protocol().as_ref(), &message).await {
                    error!("Failed to write reply to host: {}", e);
                    break;
                }
            }
        });

        let calls: Arc<DashMap<u64, CancellationToken>> = Arc::new(DashMap::new());
        let outcome = loop {
            let (kind, payload) = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            let message = match kind.protocol().decode(&payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Discarding undecodable frame: {}", e);
                    continue;
                }
            };

            match message {
                RemoteMessage::Call { call_id, call } => {
                    let token = CancellationToken::new();
                    calls.insert(call_id, token.clone());
                    let server = self.clone();
                    let calls = calls.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        // Inner task so a panicking plugin still gets a reply.
                        let reply = match tokio::spawn(async move { server.handle(call, token).await }).await {
                            Ok(reply) => reply,
                            Err(join) if join.is_panic() => {
                                let message = panic_message(&*join.into_panic());
                                error!("Remote call {} panicked: {}", call_id, message);
                                RemoteReply::Fault(RemoteFault::new(FaultKind::Plugin, message))
                            }
                            Err(join) => RemoteReply::Fault(RemoteFault::new(FaultKind::Cancelled, join.to_string())),
                        };
                        calls.remove(&call_id);
                        if tx.send((kind, RemoteMessage::Reply { call_id, reply })).is_err() {
                            debug!("Dropping reply to call {}: the reply writer has stopped", call_id);
                        }
                    });
                }
                RemoteMessage::Cancel { call_id } => {
                    if let Some((_, token)) = calls.remove(&call_id) {
                        debug!("Host cancelled remote call {}", call_id);
                        token.cancel();
                    }
                }
                RemoteMessage::Reply { call_id, .. } => {
                    warn!("Ignoring unexpected reply frame for call {}", call_id);
                }
            }
        };

        for entry in calls.iter() {
            entry.value().cancel();
        }
        drop(tx);
        if let Err(e) = writer_task.await {
            debug!("Reply writer ended abnormally: {}", e);
        }
        outcome
    }

    async fn handle(&self, call: RemoteCall, cancel: CancellationToken) -> RemoteReply {
        match call {
            RemoteCall::Launch { identity, mut request } => {
                request.services.attach_file_system(self.file_system.clone());
                match self.dispatch.launch(&identity, &mut request, &cancel).await {
                    Ok(result) => RemoteReply::Launched {
                        result,
                        services: request.services,
                    },
                    Err(e) => RemoteReply::Fault(RemoteFault::from(&e)),
                }
            }
            RemoteCall::Trigger {
                identity,
                query,
                mut services,
            } => {
                services.attach_file_system(self.file_system.clone());
                match self.dispatch.trigger(&identity, &query, &mut services, &cancel).await {
                    Ok(result) => RemoteReply::Triggered { result, services },
                    Err(e) => RemoteReply::Fault(RemoteFault::from(&e)),
                }
            }
            RemoteCall::CrossDomainRequest {
                identity,
                target_intent,
            } => match self.dispatch.cross_domain_request(&identity, &target_intent, &cancel).await {
                Ok(data) => RemoteReply::CrossDomainRequested(data),
                Err(e) => RemoteReply::Fault(RemoteFault::from(&e)),
            },
            RemoteCall::CrossDomainResponse {
                identity,
                context,
                mut services,
            } => {
                services.attach_file_system(self.file_system.clone());
                match self
                    .dispatch
                    .cross_domain_response(&identity, &context, &mut services, &cancel)
                    .await
                {
                    Ok(response) => RemoteReply::CrossDomainResponded { response, services },
                    Err(e) => RemoteReply::Fault(RemoteFault::from(&e)),
                }
            }
            RemoteCall::Load { identity, mut services } => {
                let host = match self.lifecycle_host() {
                    Ok(host) => host,
                    Err(fault) => return fault,
                };
                services.attach_file_system(self.file_system.clone());
                match host.load(&identity, &services).await {
                    Ok(plugin) => RemoteReply::Loaded(LoadedPluginSummary {
                        identity: plugin.identity().clone(),
                        plugin_info: plugin.plugin_info().clone(),
                        entry_points: plugin.conversation_tree().entry_points(),
                    }),
                    Err(e) => RemoteReply::Fault(RemoteFault::new(FaultKind::Host, e.to_string())),
                }
            }
            RemoteCall::Unload { identity, mut services } => {
                let host = match self.lifecycle_host() {
                    Ok(host) => host,
                    Err(fault) => return fault,
                };
                services.attach_file_system(self.file_system.clone());
                match host.unload(&identity, &services).await {
                    Ok(ok) => RemoteReply::Unloaded(ok),
                    Err(e) => RemoteReply::Fault(RemoteFault::new(FaultKind::Host, e.to_string())),
                }
            }
            RemoteCall::GetAvailable => {
                let host = match self.lifecycle_host() {
                    Ok(host) => host,
                    Err(fault) => return fault,
                };
                match host.get_all_available().await {
                    Ok(available) => RemoteReply::Available(available.into_iter().collect()),
                    Err(e) => RemoteReply::Fault(RemoteFault::new(FaultKind::Host, e.to_string())),
                }
            }
        }
    }

    fn lifecycle_host(&self) -> Result<&Arc<PluginHost>, RemoteReply> {
        self.host.as_ref().ok_or_else(|| {
            RemoteReply::Fault(RemoteFault::new(
                FaultKind::Host,
                "this container does not accept lifecycle calls",
            ))
        })
    }
}
