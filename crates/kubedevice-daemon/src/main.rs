//! kubedevice daemon
//!
//! Registers the local node, brings up its device plugins and serves the
//! allocation API.

use anyhow::Context;
use clap::Parser;
use kubedevice_api::create_router;
use kubedevice_coordinator::Coordinator;
use kubedevice_core::{DaemonConfig, LogFormat, TracingLogger};
use kubedevice_plugin::PluginRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// kubedevice daemon - device plugin host for one node
#[derive(Parser, Debug)]
#[command(name = "kubedeviced")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Name of the node to register
    #[arg(long)]
    node_name: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the config file, if any, and apply flag overrides
    fn load_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DaemonConfig::default(),
        };
        if let Some(address) = &self.address {
            config.api.address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(name) = &self.node_name {
            config.node.name = name.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        config.node.validate()?;
        Ok(config)
    }
}

fn init_tracing(config: &DaemonConfig) {
    let filter = EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    init_tracing(&config);
    info!("Starting kubedevice daemon v{}", env!("CARGO_PKG_VERSION"));

    let coordinator = Arc::new(Coordinator::new(
        PluginRegistry::with_builtin(),
        TracingLogger::shared(config.logging.verbosity),
    ));

    let registration = coordinator
        .register_node(&config.node)
        .await
        .with_context(|| format!("registering node {}", config.node.name))?;
    for (plugin, error) in &registration.excluded {
        warn!(plugin = %plugin, error = %error, "Plugin excluded from node");
    }
    info!(
        node = %registration.node.name,
        resources = registration.node.capacity.len(),
        "Node ready"
    );

    let router = create_router(coordinator, &config.api);

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, router).await.context("server error")?;
    Ok(())
}
