//! Environment-based node configuration

use std::time::Duration;

use anyhow::{Context, Result};

use jobgrid_cluster::ControllerConfig;
use jobgrid_pool::PoolConfig;

/// Configuration for one node process, loaded from the environment.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub database_url: String,
    pub max_connections: usize,
    pub controller: ControllerConfig,
    /// Peer listener addresses to connect to at startup
    pub peers: Vec<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid value for {key}")),
        Err(_) => Ok(default),
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let hostname = std::env::var("JOBGRID_HOSTNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "localhost".to_string());

        let controller = ControllerConfig::new()
            .with_hostname(hostname)
            .with_port(env_or("JOBGRID_PORT", 9741)?)
            .with_local_only(env_or("JOBGRID_LOCAL_ONLY", false)?)
            .with_lease_interval(Duration::from_secs(env_or("JOBGRID_LEASE_INTERVAL_SECS", 10)?))
            .with_heartbeat_interval(Duration::from_secs(env_or(
                "JOBGRID_HEARTBEAT_INTERVAL_SECS",
                30,
            )?))
            .with_overdue_timeout(Duration::from_secs(env_or(
                "JOBGRID_OVERDUE_TIMEOUT_SECS",
                3600,
            )?))
            .with_retry_cooldown(Duration::from_secs(env_or("JOBGRID_RETRY_COOLDOWN_SECS", 60)?));

        let peers = std::env::var("JOBGRID_PEERS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url,
            max_connections: env_or("JOBGRID_MAX_CONNECTIONS", 10)?,
            controller,
            peers,
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new().with_max_connections(self.max_connections)
    }
}
