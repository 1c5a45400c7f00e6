//! Volume QoS Controller
//!
//! Converges storage-side QoS rules to the annotations on bound
//! PersistentVolumeClaims.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      qos-controller                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ Claim Source │───▶│  Controller  │───▶│   Backends   │       │
//! │  │   (Eyes)     │    │   (Brain)    │    │   (Hands)    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          ▲                  │                                    │
//! │          └── Lease leader election gates the controller ──┘     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_qos_controller::adapters::{KubeClaimSource, KubeEventRecorder};
use volume_qos_controller::backend::BackendRegistry;
use volume_qos_controller::config::{self, Config, RbdConfig};
use volume_qos_controller::controller::QosController;
use volume_qos_controller::domain::{ClaimCache, CLAIM_EVENT_CAPACITY};
use volume_qos_controller::error::{Error, Result};
use volume_qos_controller::leader::{self, LeaderElector};
use volume_qos_controller::metrics::ControllerMetrics;
use volume_qos_controller::server;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume QoS Controller - converge volume QoS rules to PVC annotations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags given alongside it take precedence
    #[arg(long, env = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Period for re-enqueueing every claim (e.g. 30m)
    #[arg(long, env = "RESYNC_PERIOD", value_parser = duration_arg)]
    resync_period: Option<Duration>,

    /// Number of reconcile workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Enable Lease-based leader election
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace holding the leader Lease
    #[arg(long, env = "LEADER_ELECT_NAMESPACE")]
    leader_elect_namespace: Option<String>,

    /// Name of the leader Lease
    #[arg(long, env = "LEADER_ELECT_NAME")]
    leader_elect_name: Option<String>,

    /// CSI provisioner served by the Ceph RBD backend
    #[arg(long, env = "RBD_PROVISIONER")]
    rbd_provisioner: Option<String>,

    /// Comma-separated Ceph monitor addresses
    #[arg(long, env = "CEPH_MONITORS")]
    ceph_monitors: Option<String>,

    /// Ceph user (without the `client.` prefix)
    #[arg(long, env = "CEPH_USER")]
    ceph_user: Option<String>,

    /// Ceph user key
    #[arg(long, env = "CEPH_KEY", hide_env_values = true)]
    ceph_key: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

fn duration_arg(s: &str) -> std::result::Result<Duration, String> {
    config::parse_duration(s).map_err(|e| e.to_string())
}

impl Args {
    /// Load the config file (if any) and apply flag overrides.
    fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config_file {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(period) = self.resync_period {
            cfg.controller.resync_period = period;
        }
        if let Some(workers) = self.workers {
            cfg.controller.workers = workers;
        }
        if self.leader_elect {
            cfg.leader_election.leader_elect = true;
        }
        if let Some(ns) = self.leader_elect_namespace {
            cfg.leader_election.resource_namespace = ns;
        }
        if let Some(name) = self.leader_elect_name {
            cfg.leader_election.resource_name = name;
        }

        let rbd_flags = [
            &self.rbd_provisioner,
            &self.ceph_monitors,
            &self.ceph_user,
            &self.ceph_key,
        ];
        if rbd_flags.iter().any(|f| f.is_some()) {
            let rbd = cfg.controller.ceph_rbd.get_or_insert_with(RbdConfig::default);
            if let Some(p) = self.rbd_provisioner {
                rbd.provisioner = p;
            }
            if let Some(m) = self.ceph_monitors {
                rbd.monitors = m;
            }
            if let Some(u) = self.ceph_user {
                rbd.user = u;
            }
            if let Some(k) = self.ceph_key {
                rbd.key = k;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let metrics_addr = args.metrics_addr.clone();
    let health_addr = args.health_addr.clone();
    let cfg = args.into_config()?;

    info!("Starting Volume QoS Controller");
    info!("  Resync period: {}", config::format_duration(cfg.controller.resync_period));
    info!("  Workers: {}", cfg.controller.workers);
    info!("  Leader election: {}", cfg.leader_election.leader_elect);

    let client = Client::try_default().await.map_err(|e| {
        error!("Failed to create Kubernetes client: {}", e);
        Error::Internal(format!("Kubernetes client creation failed: {}", e))
    })?;
    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    let metrics = ControllerMetrics::new()?;
    let identity = leader::identity();

    // Claim source and cache
    let (source, cache) = KubeClaimSource::new(client.clone());
    let cache: Arc<dyn ClaimCache> = Arc::new(cache);
    let (events_tx, events_rx) = mpsc::channel(CLAIM_EVENT_CAPACITY);

    // Start health server
    tokio::spawn({
        let cache = cache.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = server::run_health_server(&health_addr, cache, cancel).await {
                error!("Health server error: {}", e);
            }
        }
    });

    // Start metrics server
    tokio::spawn({
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = server::run_metrics_server(&metrics_addr, metrics, cancel).await {
                error!("Metrics server error: {}", e);
            }
        }
    });

    let backends = Arc::new(BackendRegistry::from_config(&cfg.controller)?);
    let recorder = Arc::new(KubeEventRecorder::new(client.clone(), Some(identity.clone())));
    let controller = QosController::new(
        &cfg.controller,
        cache,
        backends,
        recorder,
        metrics.clone(),
    );

    // The source runs on every replica so standbys keep a warm cache and
    // report ready; only the leader reconciles.
    let source_task = tokio::spawn(source.run(events_tx, cancel.clone()));

    let result = if cfg.leader_election.leader_elect {
        let elector = LeaderElector::new(
            client,
            cfg.leader_election.clone(),
            identity,
            metrics,
        );
        elector
            .run(cancel.clone(), |leading| controller.run(events_rx, leading))
            .await
    } else {
        controller.run(events_rx, cancel.clone()).await
    };

    cancel.cancel();
    match source_task.await {
        Ok(Err(e)) => error!("Claim source error: {}", e),
        Err(e) => error!("Claim source task failed: {}", e),
        Ok(Ok(())) => {}
    }

    match &result {
        Ok(()) => info!("Controller shutdown complete"),
        Err(e) => error!("Controller exited with error: {}", e),
    }
    result
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
