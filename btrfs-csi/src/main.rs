//! `btrfs-csi`: runs the btrfs subvolume CSI plugin on a Unix socket.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use libcsi::config::{
    DEFAULT_DRIVER_NAME, DEFAULT_ENDPOINT, DEFAULT_QUOTA_BYTES, DEFAULT_ROOT_PATH,
};
use libcsi::{CsiServer, Driver, DriverConfig, ProvisioningMode};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "btrfs-csi", version, about = "Btrfs subvolume CSI plugin")]
struct Args {
    /// Identity of this node, reported as its topology.
    #[arg(long = "nodeid", env = "NODE_ID")]
    node_id: String,

    /// CSI endpoint, `unix:///path/to/csi.sock`.
    #[arg(long, env = "CSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Directory holding one subvolume per volume.
    #[arg(long, env = "BTRFS_CSI_ROOT", default_value = DEFAULT_ROOT_PATH)]
    root: PathBuf,

    /// Quota in bytes for volumes published without a recorded capacity.
    #[arg(long, env = "BTRFS_CSI_DEFAULT_QUOTA", default_value_t = DEFAULT_QUOTA_BYTES)]
    default_quota: u64,

    /// `immediate` or `wait-for-first-consumer`.
    #[arg(long, env = "BTRFS_CSI_PROVISIONING", default_value = "immediate")]
    provisioning: ProvisioningMode,

    /// Maximum volumes per node reported by NodeGetInfo; 0 is unlimited.
    #[arg(long, default_value_t = 0)]
    max_volumes: i64,

    #[arg(long, default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn driver_config(&self) -> DriverConfig {
        let mut config = DriverConfig::new(self.node_id.clone())
            .with_endpoint(self.endpoint.clone())
            .with_root_path(self.root.clone())
            .with_default_quota(self.default_quota)
            .with_provisioning(self.provisioning);
        config.driver_name = self.driver_name.clone();
        config.max_volumes_per_node = self.max_volumes;
        config
    }
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Text => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_format)?;

    let config = args.driver_config();
    let socket = config.socket_path().context("invalid endpoint")?;
    let driver = Driver::new(config).context("invalid driver configuration")?;
    driver
        .check_support()
        .await
        .context("btrfs is not usable at the configured root")?;

    let server = CsiServer::bind(&socket, driver.services())
        .await
        .with_context(|| format!("failed to listen on {}", socket.display()))?;
    server
        .serve_until(shutdown_signal())
        .await
        .context("CSI server failed")?;

    info!("btrfs-csi stopped");
    Ok(())
}
