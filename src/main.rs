use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shard_client::heartbeat::{RetryPolicy, RpcTransport};
use shard_client::shutdown::install_shutdown_handler;
use shard_client::store::{FileStore, LocalStore, MemoryStore};
use shard_client::{ShardClient, ShardConfig, ShardError};

#[derive(Parser, Debug)]
#[command(name = "shard-client")]
#[command(version)]
#[command(about = "Heartbeat client that syncs a shard's jobs and hosts with the master")]
struct Args {
    /// Hostname or URL of the master AFE
    #[arg(long, env = "GLOBAL_AFE_HOSTNAME", default_value = "cautotest")]
    global_afe_hostname: String,

    /// This shard's hostname as registered on the master
    #[arg(long, env = "SHARD_HOSTNAME")]
    shard_hostname: Option<String>,

    /// Seconds to pause between two heartbeats
    #[arg(long, env = "HEARTBEAT_PAUSE_SEC", default_value = "60")]
    heartbeat_pause_sec: f64,

    /// Give up on a heartbeat RPC after this many minutes of retrying
    #[arg(long, default_value = "5")]
    rpc_timeout_min: u64,

    /// Seconds to wait between RPC retries
    #[arg(long, default_value = "5")]
    rpc_delay_sec: u64,

    /// Path of the local store; kept in memory if omitted
    #[arg(long, env = "SHARD_STORE_PATH")]
    store_path: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<ShardConfig, ShardError> {
        let heartbeat_pause = Duration::try_from_secs_f64(self.heartbeat_pause_sec)
            .map_err(|e| ShardError::Configuration(format!("invalid heartbeat pause: {}", e)))?;
        Ok(ShardConfig {
            global_afe_hostname: self.global_afe_hostname,
            shard_hostname: self.shard_hostname,
            heartbeat_pause,
            retry: RetryPolicy::from_minutes(self.rpc_timeout_min, self.rpc_delay_sec)?,
            store_path: self.store_path,
        })
    }
}

async fn run_client<S: LocalStore>(
    config: &ShardConfig,
    store: S,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let transport = RpcTransport::new(&config.global_afe_hostname, config.retry);
    tracing::info!(master = %transport.url(), "Using master RPC endpoint");

    let mut client = ShardClient::from_config(config, store, transport, shutdown)?;
    client.run().await?;
    Ok(())
}

async fn main_without_error_handling() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config()?;
    config.validate()?;

    match &config.store_path {
        Some(path) => run_client(&config, FileStore::open(path)?).await,
        None => {
            tracing::warn!("No store path configured, local state will not survive a restart");
            run_client(&config, MemoryStore::new()).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = main_without_error_handling().await {
        tracing::error!(error = %e, "Uncaught error; terminating shard client.");
        return Err(e);
    }
    Ok(())
}
