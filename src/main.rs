//! # Background Controller
//!
//! Runs the UpdateRequest background controller and the cleanup controller
//! against the cluster in the current kubeconfig context.
//!
//! ```bash
//! background-controller --namespace kyverno --workers 4
//! ```
//!
//! Every flag falls back to its environment variable (see `config`).

use anyhow::Result;
use clap::Parser;
use kyverno_background_controller::client::cache::{PolicyCache, UpdateRequestIndex};
use kyverno_background_controller::client::cluster::KubeCluster;
use kyverno_background_controller::client::Clients;
use kyverno_background_controller::config::load_config;
use kyverno_background_controller::controller::background::BackgroundController;
use kyverno_background_controller::controller::cleanup::CleanupController;
use kyverno_background_controller::engine::{Engine, StaticEngine};
use kyverno_background_controller::event::{EventSink, KubeEventSink};
use kyverno_background_controller::runtime::{initialize, spawn_watches};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Kyverno background controller
#[derive(Parser, Debug)]
#[command(name = "background-controller")]
#[command(about = "Reconciles Kyverno UpdateRequests", long_about = None)]
struct Args {
    /// Namespace holding UpdateRequests (env: KYVERNO_NAMESPACE)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Background worker count (env: BACKGROUND_WORKERS)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Port for /metrics, /healthz and /readyz (env: METRICS_PORT)
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (mut controller_config, mut server_config) = load_config();
    if let Some(namespace) = args.namespace {
        controller_config.namespace = namespace;
    }
    if let Some(workers) = args.workers {
        controller_config.background_workers = workers;
    }
    if let Some(port) = args.metrics_port {
        server_config.metrics_port = port;
    }

    let init = initialize(&controller_config, &server_config).await?;

    let index = Arc::new(UpdateRequestIndex::new());
    let cache = Arc::new(PolicyCache::new());
    let cluster = Arc::new(KubeCluster::new(
        init.client.clone(),
        &controller_config.namespace,
        Arc::clone(&index),
        Arc::clone(&cache),
    ));
    let clients = Clients::new(&cluster);
    let engine: Arc<dyn Engine> = Arc::new(StaticEngine::new());
    let events: Arc<dyn EventSink> = Arc::new(KubeEventSink::new(
        init.client.clone(),
        &controller_config.instance,
    ));

    let background =
        BackgroundController::new(clients.clone(), &engine, &events, controller_config.clone());
    let cleanup = CleanupController::new(clients, controller_config.clone());

    let watches = spawn_watches(
        &init.client,
        &controller_config.namespace,
        &index,
        &cache,
        &background,
        &cleanup,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let wait_for = |mut rx: watch::Receiver<bool>| async move {
        // sender dropped counts as shutdown
        let _closed = rx.wait_for(|stop| *stop).await;
    };
    let background_task = tokio::spawn(Arc::clone(&background).run(wait_for(shutdown_rx.clone())));
    let cleanup_task = tokio::spawn(Arc::clone(&cleanup).run(wait_for(shutdown_rx)));

    init.server_state.mark_ready();
    info!("✅ controllers running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    init.server_state
        .is_ready
        .store(false, std::sync::atomic::Ordering::Relaxed);
    for handle in &watches {
        handle.abort();
    }
    if shutdown_tx.send(true).is_err() {
        warn!("controllers already stopped");
    }
    let (background_result, cleanup_result) = tokio::join!(background_task, cleanup_task);
    background_result?;
    cleanup_result?;
    info!("background controller exited");
    Ok(())
}
