//! Wire format between the host and a plugin container.
//!
//! Every frame is a big-endian `u32` length, a one-byte protocol id and the
//! encoded message. The length counts the id byte and the payload. Each side
//! answers a call in the protocol the call arrived in.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DispatchError;
use crate::identity::PluginIdentity;
use crate::model::{
    CrossDomainContext, CrossDomainRequestData, CrossDomainResponseResponse, ExecutionRequest, ExecutionResult,
    PluginServices, QueryContext, TriggerResult,
};
use crate::plugin::PluginInfo;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A request from the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteCall {
    Launch {
        identity: PluginIdentity,
        request: ExecutionRequest,
    },
    Trigger {
        identity: PluginIdentity,
        query: QueryContext,
        services: PluginServices,
    },
    CrossDomainRequest {
        identity: PluginIdentity,
        target_intent: String,
    },
    CrossDomainResponse {
        identity: PluginIdentity,
        context: CrossDomainContext,
        services: PluginServices,
    },
    Load {
        identity: PluginIdentity,
        services: PluginServices,
    },
    Unload {
        identity: PluginIdentity,
        services: PluginServices,
    },
    GetAvailable,
}

/// The container's answer to a [`RemoteCall`]. Operations that take
/// services send the updated copy back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteReply {
    Launched {
        result: ExecutionResult,
        services: PluginServices,
    },
    Triggered {
        result: TriggerResult,
        services: PluginServices,
    },
    CrossDomainRequested(CrossDomainRequestData),
    CrossDomainResponded {
        response: CrossDomainResponseResponse,
        services: PluginServices,
    },
    Loaded(LoadedPluginSummary),
    Unloaded(bool),
    Available(Vec<PluginIdentity>),
    Fault(RemoteFault),
}

/// What the host learns about a plugin the container loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedPluginSummary {
    pub identity: PluginIdentity,
    pub plugin_info: PluginInfo,
    pub entry_points: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    NotLoaded,
    EntryPointNotFound,
    Plugin,
    Cancelled,
    /// Lifecycle failure inside the container
    Host,
    Protocol,
}

/// An error carried across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub message: String,
    /// Entry point for `EntryPointNotFound`
    pub entry_point: Option<String>,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            entry_point: None,
        }
    }

    /// Rebuild the dispatch error on the host side.
    pub fn into_dispatch_error(self, identity: &PluginIdentity) -> DispatchError {
        match self.kind {
            FaultKind::NotLoaded => DispatchError::NotLoaded(identity.clone()),
            FaultKind::EntryPointNotFound => DispatchError::EntryPointNotFound {
                identity: identity.clone(),
                entry_point: self.entry_point.unwrap_or_default(),
            },
            FaultKind::Plugin => DispatchError::Plugin {
                identity: identity.clone(),
                message: self.message,
            },
            FaultKind::Cancelled => DispatchError::Cancelled(identity.clone()),
            FaultKind::Host => DispatchError::Transport(self.message),
            FaultKind::Protocol => DispatchError::Protocol(self.message),
        }
    }
}

impl From<&DispatchError> for RemoteFault {
    fn from(error: &DispatchError) -> Self {
        match error {
            DispatchError::NotLoaded(_) => RemoteFault::new(FaultKind::NotLoaded, error.to_string()),
            DispatchError::EntryPointNotFound { entry_point, .. } => RemoteFault {
                kind: FaultKind::EntryPointNotFound,
                message: error.to_string(),
                entry_point: Some(entry_point.clone()),
            },
            // Keep the plugin's own text so the host can re-mark it.
            DispatchError::Plugin { message, .. } => RemoteFault::new(FaultKind::Plugin, message.clone()),
            DispatchError::Cancelled(_) => RemoteFault::new(FaultKind::Cancelled, error.to_string()),
            DispatchError::Transport(_) => RemoteFault::new(FaultKind::Host, error.to_string()),
            DispatchError::Protocol(_) => RemoteFault::new(FaultKind::Protocol, error.to_string()),
        }
    }
}

/// Envelope of every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteMessage {
    Call { call_id: u64, call: RemoteCall },
    Reply { call_id: u64, reply: RemoteReply },
    /// Stop working on a call; no reply is expected
    Cancel { call_id: u64 },
}

/// Encodes and decodes [`RemoteMessage`]s.
pub trait WireProtocol: Send + Sync + fmt::Debug {
    /// Id written into each frame header.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    fn encode(&self, message: &RemoteMessage) -> Result<Vec<u8>, DispatchError>;

    fn decode(&self, payload: &[u8]) -> Result<RemoteMessage, DispatchError>;
}

/// Self-describing JSON; handy when reading traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonProtocol;

impl WireProtocol for JsonProtocol {
    fn id(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, message: &RemoteMessage) -> Result<Vec<u8>, DispatchError> {
        serde_json::to_vec(message).map_err(|e| DispatchError::Protocol(format!("json encode: {}", e)))
    }

    fn decode(&self, payload: &[u8]) -> Result<RemoteMessage, DispatchError> {
        serde_json::from_slice(payload).map_err(|e| DispatchError::Protocol(format!("json decode: {}", e)))
    }
}

/// Dense binary encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeProtocol;

impl WireProtocol for BincodeProtocol {
    fn id(&self) -> u8 {
        2
    }

    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode(&self, message: &RemoteMessage) -> Result<Vec<u8>, DispatchError> {
        bincode::serialize(message).map_err(|e| DispatchError::Protocol(format!("bincode encode: {}", e)))
    }

    fn decode(&self, payload: &[u8]) -> Result<RemoteMessage, DispatchError> {
        bincode::deserialize(payload).map_err(|e| DispatchError::Protocol(format!("bincode decode: {}", e)))
    }
}

/// Configurable choice of wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocolKind {
    #[default]
    Json,
    Bincode,
}

impl WireProtocolKind {
    pub fn protocol(&self) -> Arc<dyn WireProtocol> {
        match self {
            WireProtocolKind::Json => Arc::new(JsonProtocol),
            WireProtocolKind::Bincode => Arc::new(BincodeProtocol),
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(WireProtocolKind::Json),
            2 => Some(WireProtocolKind::Bincode),
            _ => None,
        }
    }
}

/// Encode and write one frame.
pub async fn write_frame<W>(writer: &mut W, protocol: &dyn WireProtocol, message: &RemoteMessage) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    let payload = protocol.encode(message)?;
    if payload.len() + 1 > MAX_FRAME_LEN {
        return Err(DispatchError::Protocol(format!("frame of {} bytes is too large", payload.len())));
    }
    let io = |e: std::io::Error| DispatchError::Transport(e.to_string());
    writer.write_u32(payload.len() as u32 + 1).await.map_err(io)?;
    writer.write_u8(protocol.id()).await.map_err(io)?;
    writer.write_all(&payload).await.map_err(io)?;
    writer.flush().await.map_err(io)
}

/// Read one frame. Returns `None` when the stream ends cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(WireProtocolKind, Vec<u8>)>, DispatchError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DispatchError::Transport(e.to_string())),
    };
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(DispatchError::Protocol(format!("invalid frame length {}", len)));
    }
    let io = |e: std::io::Error| DispatchError::Transport(e.to_string());
    let id = reader.read_u8().await.map_err(io)?;
    let kind = WireProtocolKind::from_id(id)
        .ok_or_else(|| DispatchError::Protocol(format!("unknown protocol id {}", id)))?;
    let mut payload = vec![0u8; len - 1];
    reader.read_exact(&mut payload).await.map_err(io)?;
    Ok(Some((kind, payload)))
}
