//! grpclb
//!
//! Register a service instance in etcd, or watch a service's weighted
//! address set as clients see it.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use grpclb_core::config::parse_endpoints;
use grpclb_core::observability::{init_metrics, init_tracing, LogFormat, MetricsConfig, TracingConfig};
use grpclb_core::StoreConfig;
use grpclb_registrar::{Registrar, RegistrarConfig};
use grpclb_resolver::{Discoverer, DiscoveryConfig, LoggingConsumer, Target};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "grpclb")]
#[command(about = "Weighted service registration and discovery over etcd")]
struct Cli {
    /// etcd endpoints (comma-separated)
    #[arg(
        long,
        global = true,
        env = "ETCD_ENDPOINTS",
        default_value = "http://127.0.0.1:2379"
    )]
    etcd_endpoints: String,

    /// Give up connecting to etcd after this many seconds
    #[arg(long, global = true, env = "ETCD_DIAL_TIMEOUT_SECS", default_value_t = 5)]
    dial_timeout_secs: u64,

    /// Log output format: text or json
    #[arg(long, global = true, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an instance and keep it alive until interrupted
    Register {
        /// Service name
        #[arg(long)]
        service: String,
        /// Instance address, e.g. 10.0.0.5:50051
        #[arg(long)]
        address: String,
        /// Relative load balancing weight
        #[arg(long, default_value_t = 1)]
        weight: u64,
        /// Lease TTL in seconds
        #[arg(long, env = "LEASE_TTL", default_value_t = 10)]
        ttl: i64,
    },
    /// Log the service's address set on every change
    Watch {
        /// Service name
        #[arg(long)]
        service: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingConfig {
        log_format: cli.log_format,
    })
    .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    init_metrics(&MetricsConfig {
        listen_addr: cli.metrics_addr,
    })
    .map_err(|e| anyhow!("failed to initialize metrics: {e}"))?;

    let store_config = StoreConfig::new(parse_endpoints(&cli.etcd_endpoints))
        .with_dial_timeout(Duration::from_secs(cli.dial_timeout_secs));

    match cli.command {
        Commands::Register {
            service,
            address,
            weight,
            ttl,
        } => {
            let config = RegistrarConfig::new(service, address)
                .with_weight(weight)
                .with_lease_ttl(ttl);
            run_register(&store_config, config).await
        }
        Commands::Watch { service } => run_watch(&store_config, &service).await,
    }
}

async fn run_register(store_config: &StoreConfig, config: RegistrarConfig) -> anyhow::Result<()> {
    let mut registrar = Registrar::connect(store_config, config)
        .await
        .context("failed to register instance")?;
    info!(key = %registrar.key(), lease_id = registrar.lease_id(), "Registered, press ctrl-c to deregister");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Interrupted, deregistering");
        }
        _ = registrar.lease_lost() => {
            warn!(key = %registrar.key(), "Lease lost, instance is no longer registered");
        }
    }

    match registrar.close().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_lease_not_found() => {
            info!("Lease already expired");
            Ok(())
        }
        Err(e) => Err(e).context("failed to deregister instance"),
    }
}

async fn run_watch(store_config: &StoreConfig, service: &str) -> anyhow::Result<()> {
    let target = Target::new(service)?;
    let discoverer = Discoverer::connect(store_config, DiscoveryConfig::default())
        .await
        .context("failed to connect to etcd")?;

    let consumer = Arc::new(LoggingConsumer::new(service));
    let mut resolver = discoverer
        .build(&target, consumer)
        .await
        .with_context(|| format!("failed to resolve {target}"))?;
    info!(target = %target, "Watching, press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    resolver.close().await;
    Ok(())
}
