//! Node Route Reconciliation Daemon
//!
//! Main entry point for the routesyncd daemon.
//! Periodically reconciles the kernel routing table against the cluster's
//! routing decision.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CP-10: System Recovery - Level-triggered reconciliation

use anyhow::{Context, Result};
use clap::Parser;
use routesyncd::config::DEFAULT_CONFIG_PATH;
use routesyncd::{
    InMemoryRouteTable, NetlinkRouteTable, Node, RouteSynchronizer, RouteTable, RoutesyncConfig,
};
use routesyncd_kvstore::{KvstoreClient, LeaseConfig, RedisModule};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Node route reconciliation daemon
#[derive(Parser, Debug)]
#[command(name = "routesyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Reconcile against an in-memory routing table instead of the kernel
    #[arg(long)]
    dry_run: bool,

    /// Run a single synchronization pass and exit
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = RoutesyncConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    config.validate().context("invalid configuration")?;

    info!("routesyncd: Starting route reconciliation daemon");

    match run_daemon(args, config).await {
        Ok(()) => {
            info!("routesyncd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "routesyncd: Daemon exiting with error");
            Err(e)
        }
    }
}

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over `log_level`.
fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .init();
}

fn build_route_table(config: &RoutesyncConfig, dry_run: bool) -> Result<Arc<dyn RouteTable>> {
    if dry_run {
        info!("routesyncd: Dry run, using in-memory routing table");
        let table = InMemoryRouteTable::new().with_link(&config.routing.host_device, 1);
        return Ok(Arc::new(table));
    }

    let table = NetlinkRouteTable::new().context("opening NETLINK_ROUTE socket")?;
    Ok(Arc::new(table))
}

/// Start the kvstore client and its lease renewal task
async fn start_kvstore(
    config: &RoutesyncConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<Arc<KvstoreClient>> {
    let owner = if config.local_node.name.is_empty() {
        "routesyncd".to_string()
    } else {
        config.local_node.name.clone()
    };

    let lease_config = LeaseConfig {
        key: format!("routesyncd/.leases/{}", owner),
        ttl_secs: config.kvstore.lease_ttl_secs,
        renewal_interval_secs: config.kvstore.renewal_interval_secs,
    };

    let client = Arc::new(
        KvstoreClient::new(owner, lease_config)
            .with_legacy_prefixes(config.kvstore.legacy_prefixes.clone()),
    );

    client
        .init(&RedisModule::new(config.kvstore.redis_url.clone()))
        .await
        .context("initializing kvstore client")?;

    let renewer = client.clone();
    tokio::spawn(async move {
        if let Err(e) = renewer.renew_periodically(shutdown).await {
            error!(error = %e, "routesyncd: Kvstore lease lost");
        }
    });

    Ok(client)
}

/// Replace the node set with the records stored under the node prefix
async fn refresh_nodes(kvstore: &KvstoreClient, sync: &RouteSynchronizer, prefix: &str) {
    let entries = match kvstore.list_prefix(prefix).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "routesyncd: Unable to list node records");
            return;
        }
    };

    let nodes: Vec<Node> = entries
        .iter()
        .filter_map(|(key, value)| match serde_json::from_slice::<Node>(value) {
            Ok(node) => Some(node),
            Err(e) => {
                warn!(key = %key, error = %e, "routesyncd: Ignoring malformed node record");
                None
            }
        })
        .collect();

    debug!(count = nodes.len(), "routesyncd: Refreshed node records");
    sync.cluster().replace_nodes(nodes);
}

/// Main daemon loop
async fn run_daemon(args: Args, config: RoutesyncConfig) -> Result<()> {
    let shutdown = setup_signal_handlers();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let table = build_route_table(&config, args.dry_run)?;
    let cluster = Arc::new(config.cluster_configuration());
    let sync = Arc::new(RouteSynchronizer::new(table, cluster));

    let kvstore = if config.kvstore.enabled {
        Some(start_kvstore(&config, shutdown_rx).await?)
    } else {
        None
    };

    info!(
        device = %config.routing.host_device,
        per_node_routes = config.routing.use_per_node_routes,
        direct_routing = config.routing.direct_routing,
        interval_secs = config.sync.interval_secs,
        "routesyncd: Initialized"
    );

    let mut ticker = tokio::time::interval(config.sync_interval());

    loop {
        ticker.tick().await;

        if shutdown.load(Ordering::Relaxed) {
            info!("routesyncd: Received shutdown signal");
            break;
        }

        if let Some(kvstore) = &kvstore {
            if kvstore.current_backend().is_none() {
                warn!("routesyncd: Kvstore backend unavailable, skipping synchronization");
                if args.once {
                    break;
                }
                continue;
            }
            refresh_nodes(kvstore, &sync, &config.kvstore.node_prefix).await;
        }

        let pass = sync.clone();
        match tokio::task::spawn_blocking(move || pass.synchronize()).await {
            Ok(Ok(report)) if report.is_clean() => {
                debug!(
                    nodes = report.nodes_synced,
                    applied = report.routes_applied,
                    "routesyncd: Synchronization pass complete"
                );
            }
            Ok(Ok(report)) => {
                warn!(
                    failures = report.failures.len(),
                    "routesyncd: Synchronization pass completed with failures"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    "routesyncd: Synchronization pass failed, retrying next interval"
                );
            }
            Err(e) => {
                error!(error = %e, "routesyncd: Synchronization task panicked");
            }
        }

        if args.once {
            break;
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(kvstore) = &kvstore {
        kvstore.close().await;
    }

    info!("routesyncd: Graceful shutdown complete");
    Ok(())
}

/// Setup signal handlers for graceful shutdown
fn setup_signal_handlers() -> Arc<AtomicBool> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("routesyncd: Received SIGINT");
            shutdown_flag_clone.store(true, Ordering::Relaxed);
        }
    });

    shutdown_flag
}
