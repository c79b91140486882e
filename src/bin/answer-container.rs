//! Plugin container for the Remoted isolation strategy.
//!
//! Loads plugins from a directory and serves remote calls on stdin/stdout.
//! Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use lib_answer_host::{
    build_local_host, BasicExecutionEngine, ConcurrencyPolicy, DylibLoader, ExecutionDispatcher, FileSystem,
    RealFileSystem, RemoteServer, RuntimeConfig,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "answer-container", about = "Runs answer plugins out of process")]
struct Args {
    /// Directory scanned for plugin modules
    #[arg(long)]
    plugins_dir: PathBuf,

    /// Root of plugin data and view content
    #[arg(long)]
    content_dir: PathBuf,

    /// Where shadow copies of plugin modules are written
    #[arg(long)]
    shadow_dir: Option<PathBuf>,

    /// Open plugin modules in place instead of from a shadow copy
    #[arg(long)]
    no_shadow_copy: bool,

    /// Plugin module file extension, without the dot
    #[arg(long)]
    extension: Option<String>,

    /// Run at most one call at a time per plugin
    #[arg(long)]
    serialize_calls: bool,
}

impl Args {
    fn config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::new(&self.plugins_dir, &self.content_dir).shadow_copy(!self.no_shadow_copy);
        if let Some(dir) = &self.shadow_dir {
            config = config.with_shadow_dir(dir);
        }
        if let Some(extension) = &self.extension {
            config = config.with_module_extension(extension);
        }
        if self.serialize_calls {
            config = config.with_concurrency(ConcurrencyPolicy::SingleCallPerIdentity);
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.config();
    if let Err(e) = config.validate().and_then(|_| config.ensure_dirs().map_err(Into::into)) {
        error!("Invalid container configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let host = match build_local_host(&config, Arc::new(DylibLoader::new())) {
        Ok(host) => host,
        Err(e) => {
            error!("Failed to set up the plugin host: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let dispatcher = Arc::new(
        ExecutionDispatcher::new(host.clone(), Arc::new(BasicExecutionEngine::new())).with_policy(config.concurrency),
    );
    let content: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new(config.content_dir.clone()));
    let server = Arc::new(RemoteServer::new(dispatcher, content).with_host(host));

    info!("Plugin container serving {} on stdio", config.plugins_dir.display());
    match server.serve(tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(()) => {
            info!("Host closed the connection; exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Plugin container stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}
