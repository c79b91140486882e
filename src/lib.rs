//! Plugin execution runtime for conversational answer plugins.
//!
//! Discovers plugin modules in a directory, loads versioned plugins out of
//! them, and dispatches conversational calls into the loaded plugins behind
//! a configurable isolation boundary. Also serves the static view content
//! plugins ship with.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lib_answer_host::{
//!     AnswerRuntime, BasicExecutionEngine, ExecutionRequest, PluginIdentity, QueryContext, RuntimeConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::new("/srv/answers/plugins", "/srv/answers/content");
//!     let runtime = AnswerRuntime::new(config, Arc::new(BasicExecutionEngine::new()))?;
//!
//!     let weather = PluginIdentity::new("weather", 1, 0);
//!     let services = runtime.services_for(&weather);
//!     runtime.load(&weather, &services).await?;
//!
//!     let query = QueryContext::new("will it rain today?", "weather");
//!     let mut request = ExecutionRequest::new("start", query, services);
//!     let result = runtime.launch(&weather, &mut request, &CancellationToken::new()).await?;
//!     println!("{:?}", result);
//!
//!     Ok(())
//! }
//! ```

mod boundary;
mod config;
mod dispatcher;
mod engine;
mod error;
mod fs;
mod host;
mod identity;
mod loader;
mod model;
mod plugin;
mod registry;
mod remote;
mod runtime;
mod sandbox;
mod views;
mod watcher;

#[cfg(test)]
mod testing;

pub use boundary::*;
pub use config::*;
pub use dispatcher::*;
pub use engine::*;
pub use error::*;
pub use fs::*;
pub use host::*;
pub use identity::*;
pub use loader::*;
pub use model::*;
pub use plugin::*;
pub use registry::*;
pub use remote::*;
pub use runtime::*;
pub use sandbox::*;
pub use views::*;
pub use watcher::*;

// Re-exported for plugin crates implementing the async trait.
pub use async_trait::async_trait;
