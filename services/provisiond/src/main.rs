//! provisiond - workload provisioning engine.
//!
//! Consumes reservations from the local pipe (and, with `--url`, from a
//! polling source), applies them through the per-kind handlers, and keeps
//! the on-disk reservation cache in sync.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use plfm_gridtypes::Workload;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_provisiond::config::Config;
use plfm_provisiond::engine::{Engine, EngineOptions};
use plfm_provisiond::feedback::LogFeedback;
use plfm_provisiond::provisioner::{Handler, KeySigner, Primitives};
use plfm_provisiond::source::{CombinedSource, FifoSource, HttpSource, Source};
use plfm_provisiond::storage::FsStore;

#[derive(Parser)]
#[command(name = "provisiond", about = "Workload provisioning engine")]
struct Args {
    /// Connection string to the message broker.
    #[arg(long, default_value = "unix:///var/run/redis.sock")]
    broker: String,

    /// Reservation URL to poll from; without it only the local pipe is read.
    #[arg(long)]
    url: Option<String>,

    /// Override the reservation cache directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// Placeholder handler until the host integration (container runtime,
/// storage and network daemons behind the broker) is wired in. Logs the
/// intent and succeeds, so the engine and cache behave as in production.
struct AnnounceHandler {
    kind: &'static str,
}

#[async_trait]
impl Handler for AnnounceHandler {
    async fn provision(&self, workload: &Workload) -> Result<serde_json::Value> {
        info!(id = %workload.id, kind = self.kind, "would provision workload on this host");
        Ok(serde_json::json!({ "id": workload.id.as_str() }))
    }

    async fn decommission(&self, workload: &Workload) -> Result<()> {
        info!(id = %workload.id, kind = self.kind, "would decommission workload on this host");
        Ok(())
    }
}

fn primitives(node_secret: &str) -> Primitives {
    Primitives {
        container: Box::new(AnnounceHandler { kind: "container" }),
        volume: Box::new(AnnounceHandler { kind: "volume" }),
        network: Box::new(AnnounceHandler { kind: "network" }),
        zdb: Box::new(AnnounceHandler { kind: "zdb" }),
        kubernetes: Box::new(AnnounceHandler { kind: "kubernetes" }),
        public_ip: Box::new(AnnounceHandler { kind: "ipv4" }),
        signer: Box::new(KeySigner::new(node_secret.as_bytes().to_vec())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    let mut config = Config::from_env()?;
    config.broker = args.broker;
    if args.url.is_some() {
        config.source_url = args.url;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    info!(
        broker = %config.broker,
        data_dir = %config.data_dir.display(),
        "starting provision module"
    );

    let store = Arc::new(
        FsStore::open_at_boot(&config.data_dir, config.boot_marker())
            .context("failed to open reservation store")?,
    );

    let fifo = FifoSource::new(&config.fifo_path)
        .context("failed to allocate reservation pipe")?;
    let mut sources: Vec<Box<dyn Source>> = vec![Box::new(fifo)];
    if let Some(url) = &config.source_url {
        info!(url = %url, "polling remote reservation source");
        sources.push(Box::new(HttpSource::new(url.clone())));
    }
    let source = CombinedSource::new(sources);

    let engine = Engine::new(
        Arc::new(primitives(&config.node_secret)),
        store,
        // janitor comes up with the host integration; without an inventory
        // there is nothing it could safely delete
        None,
        Arc::new(LogFeedback),
        EngineOptions::default(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(source, shutdown_rx).await
}
