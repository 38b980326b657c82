//! The capsule-js server binary: load configuration, build the registries
//! and sandbox, then serve the protocol on stdio and/or HTTP.

mod config;
mod http;
mod ops;
mod rpc;
mod stdio;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use capsule_js::fetch::{HttpClient, OutboundHttp};
use capsule_js::{http_adapter, AdapterRegistry, Sandbox, SkillRegistry};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::ops::Service;

/// Serve the capsule-js sandbox over JSON-RPC.
///
/// With no transport selected, frames are read line-by-line from stdin.
#[derive(clap::Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the server configuration file.
    #[arg(long, default_value = "capsule.config.json")]
    config: PathBuf,

    /// Listen address for the HTTP transport (overrides the config file).
    #[arg(long)]
    http: Option<String>,

    /// Serve line-delimited JSON-RPC on stdio.
    #[arg(long)]
    stdio: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        ServerConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "no configuration file, using defaults");
        ServerConfig::default()
    };

    let adapters = Arc::new(AdapterRegistry::new());
    let outbound: Arc<dyn OutboundHttp> = Arc::new(HttpClient::new());
    for spec in &config.adapters {
        adapters.register(http_adapter::build(spec, Arc::clone(&outbound)));
    }
    let skills = Arc::new(SkillRegistry::new());

    let sandbox = Sandbox::new(config.sandbox.clone(), Arc::clone(&adapters))
        .with_env(config.resolved_env())
        .with_outbound_http(outbound);
    let service = Arc::new(Service::new(sandbox, Arc::clone(&adapters), skills));

    info!(
        adapters = adapters.len(),
        timeout_ms = config.sandbox.timeout_ms,
        "capsule-js server starting"
    );

    let http_addr = cli.http.or(config.http_addr.clone());
    let use_stdio = cli.stdio || config.stdio || http_addr.is_none();

    match (http_addr, use_stdio) {
        (Some(addr), true) => {
            let http_service = Arc::clone(&service);
            let http_task = tokio::spawn(async move { http::serve(&addr, http_service).await });
            stdio::serve(service).await?;
            http_task.abort();
        }
        (Some(addr), false) => {
            tokio::select! {
                result = http::serve(&addr, Arc::clone(&service)) => {
                    result.context("http transport failed")?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                }
            }
        }
        (None, _) => stdio::serve(service).await?,
    }

    adapters.dispose_all();
    Ok(())
}
