//! keeld — the Keel daemon.
//!
//! Runs the reconciliation engine as a standalone control loop:
//! - State store (redb)
//! - Kubernetes API client, or an in-memory platform with `--dry-run`
//! - Reconciliation engine + worker pool
//! - Periodic resync
//!
//! # Usage
//!
//! ```text
//! keeld run --config /etc/keel/keel.toml --data-dir /var/lib/keel
//! keeld run --dry-run
//! keeld render --spec api.json --release r42.json
//! keeld status --data-dir /var/lib/keel --service shop/api
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use keel_cluster::{KubeCluster, MemoryCluster, Resource, ResourceClient};
use keel_core::{ClusterBackend, KeelConfig};
use keel_reconcile::{
    Engine, EngineSettings, RecordedDomains, StoreSignals, SystemClock, TrafficPlan, compose,
};
use keel_state::{PendingHost, Release, ServiceSpec, StateStore};

#[derive(Parser)]
#[command(name = "keeld", about = "Keel service reconciliation daemon")]
struct Cli {
    /// Path to keel.toml. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until interrupted.
    Run {
        /// Data directory for persistent state. Overrides `state.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Worker count. Overrides `engine.workers`.
        #[arg(long)]
        workers: Option<usize>,

        /// Reconcile against an in-memory platform instead of the cluster.
        #[arg(long)]
        dry_run: bool,
    },
    /// Compose the resources a spec and release would produce, without
    /// touching any platform.
    Render {
        /// Service spec as JSON.
        #[arg(long)]
        spec: PathBuf,

        /// Release as JSON.
        #[arg(long)]
        release: PathBuf,
    },
    /// Print the stored reconciliation record of a service.
    Status {
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Service id, `{project}/{name}`.
        #[arg(long)]
        service: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => KeelConfig::from_file(path)?,
        None => KeelConfig::default(),
    };

    match cli.command {
        Command::Run {
            data_dir,
            workers,
            dry_run,
        } => {
            if let Some(dir) = data_dir {
                config.state.data_dir = dir;
            }
            if let Some(workers) = workers {
                config.engine.workers = workers;
            }
            if dry_run {
                config.cluster.backend = ClusterBackend::DryRun;
            }
            config.validate()?;
            run(config).await
        }
        Command::Render { spec, release } => render(&config, &spec, &release),
        Command::Status { data_dir, service } => {
            let dir = data_dir.unwrap_or(config.state.data_dir);
            status(&dir, &service)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keeld=debug,keel=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(config: KeelConfig) -> anyhow::Result<()> {
    info!("Keel daemon starting");

    std::fs::create_dir_all(&config.state.data_dir)?;
    let db_path = config.state.data_dir.join("keel.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let client = resource_client(&config).await?;

    let settings = EngineSettings::from_config(&config);
    let engine = Arc::new(Engine::new(
        store.clone(),
        client,
        Arc::new(StoreSignals::new(store)),
        Arc::new(RecordedDomains),
        Arc::new(SystemClock),
        settings,
    ));
    engine.start().await;
    info!(workers = config.engine.workers, "engine started");

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let resync_engine = engine.clone();
    let resync_handle = tokio::spawn(async move {
        resync_engine.run_resync(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    stop_resync(&shutdown_tx, resync_handle).await;
    engine.shutdown().await;

    info!("Keel daemon stopped");
    Ok(())
}

/// Flip the shutdown signal and wait for the resync loop to notice.
async fn stop_resync(shutdown: &watch::Sender<bool>, resync: JoinHandle<()>) {
    shutdown.send_replace(true);
    if let Err(e) = resync.await {
        warn!(error = %e, "resync task ended abnormally");
    }
}

/// The platform the engine writes to.
async fn resource_client(config: &KeelConfig) -> anyhow::Result<Arc<dyn ResourceClient>> {
    match config.cluster.backend {
        ClusterBackend::Kubernetes => {
            let cluster = KubeCluster::try_default(config.cluster.field_manager.as_str()).await?;
            info!(field_manager = %config.cluster.field_manager, "connected to Kubernetes");
            Ok(Arc::new(cluster))
        }
        ClusterBackend::DryRun => {
            warn!("dry run: resources are kept in memory and never reach a cluster");
            Ok(Arc::new(MemoryCluster::new()))
        }
    }
}

#[derive(Serialize)]
struct Rendered {
    resources: Vec<Resource>,
    claims: Vec<Resource>,
    pending_hosts: Vec<PendingHost>,
}

fn render(config: &KeelConfig, spec: &Path, release: &Path) -> anyhow::Result<()> {
    let spec: ServiceSpec = serde_json::from_str(&std::fs::read_to_string(spec)?)?;
    let release: Release = serde_json::from_str(&std::fs::read_to_string(release)?)?;
    let settings = EngineSettings::from_config(config);

    let desired = compose(&spec, &TrafficPlan::Single(release), &settings.compose)?;
    let rendered = Rendered {
        resources: desired.resources,
        claims: desired.claims,
        pending_hosts: desired.pending_hosts,
    };
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

fn status(data_dir: &Path, service_id: &str) -> anyhow::Result<()> {
    let store = StateStore::open(&data_dir.join("keel.redb"))?;
    match store.get_record(service_id)? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => anyhow::bail!("no reconciliation record for {service_id}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_overrides() {
        let cli = Cli::parse_from(["keeld", "run", "--data-dir", "/tmp/keel", "--workers", "8"]);
        match cli.command {
            Command::Run {
                data_dir,
                workers,
                dry_run,
            } => {
                assert_eq!(data_dir, Some(PathBuf::from("/tmp/keel")));
                assert_eq!(workers, Some(8));
                assert!(!dry_run);
            }
            _ => panic!("expected run"),
        }
        assert!(!cli.json_logs);

        let cli = Cli::parse_from(["keeld", "run", "--dry-run"]);
        assert!(matches!(cli.command, Command::Run { dry_run: true, .. }));
    }

    #[tokio::test]
    async fn shutdown_stops_the_resync_loop() {
        let store = StateStore::open_in_memory().unwrap();
        let engine = Arc::new(Engine::new(
            store.clone(),
            Arc::new(MemoryCluster::new()),
            Arc::new(StoreSignals::new(store)),
            Arc::new(RecordedDomains),
            Arc::new(SystemClock),
            EngineSettings::default(),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_resync(rx).await }
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), stop_resync(&tx, handle))
            .await
            .unwrap();
        assert!(*tx.borrow());
    }

    #[tokio::test]
    async fn dry_run_backend_needs_no_cluster() {
        let mut config = KeelConfig::default();
        config.cluster.backend = ClusterBackend::DryRun;
        let client = resource_client(&config).await.unwrap();
        assert!(client.ensure_namespace("shop").await.unwrap());
        assert!(!client.ensure_namespace("shop").await.unwrap());
    }

    #[test]
    fn render_composes_from_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let spec = serde_json::json!({
            "id": "shop/api",
            "name": "api",
            "namespace": "shop",
            "project": "shop",
            "version": 1,
            "replicas": { "min": 1, "max": 2 },
            "created_at": 0,
            "updated_at": 0
        });
        let release = serde_json::json!({
            "id": "r1",
            "service_id": "shop/api",
            "version": 1,
            "image": "registry.local/api:r1",
            "status": "ready",
            "created_at": 0
        });
        let spec_path = dir.path().join("spec.json");
        let release_path = dir.path().join("release.json");
        std::fs::write(&spec_path, spec.to_string()).unwrap();
        std::fs::write(&release_path, release.to_string()).unwrap();

        render(&KeelConfig::default(), &spec_path, &release_path).unwrap();
    }

    #[test]
    fn status_reports_missing_records() {
        let dir = tempfile::tempdir().unwrap();
        assert!(status(dir.path(), "shop/api").is_err());
    }
}
