mod activity_pub;
mod config;
mod error;
mod http;
mod pod;
mod session;
#[cfg(test)]
mod testing;

use std::fs::{self, File};
use std::path::PathBuf;

use anyhow::{Context, Result};
use fd_lock::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, RuntimeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let flags = xflags::parse_or_exit! {
        /// Path to the configuration file
        optional -c,--config CONFIG: PathBuf
    };
    let config_path = flags.config.unwrap_or_else(|| PathBuf::from("podfed.toml"));
    let config = Config::load(&config_path)?;

    let data_dir = &config.server.data_dir;
    fs::create_dir_all(data_dir)
        .with_context(|| format!("unable to create data directory {}", data_dir.display()))?;
    let mut lock = RwLock::new(
        File::create(data_dir.join("lock")).context("unable to create the lock file")?,
    );
    let _guard = lock
        .try_write()
        .context("another process is using the data directory")?;
    let keyspace = fjall::Config::new(data_dir.join("keyspace"))
        .open()
        .context("unable to open the keyspace")?;

    info!(target: "lifecycle", config = %config_path.display(), "starting");
    let runtime = RuntimeConfig {
        init: config,
        keyspace,
    };
    http::serve(&runtime).await?;
    runtime.keyspace.persist(fjall::PersistMode::SyncAll)?;
    info!(target: "lifecycle", "stopped");
    Ok(())
}
