//! Runnable node process
//!
//! Wires the pool, the SQL store, and a controller into one process.
//! Embedders call [`run`] with their populated registry; the shipped
//! binary runs with an empty registry, which is useful as a pure peer
//! that serves dispatched jobs it knows how to load.

pub mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use jobgrid_cluster::{Controller, PeerClient};
use jobgrid_pool::{ConnectionPool, PgConnector};
use jobgrid_queue::{SqlJobStore, SystemClock, WorkItemRegistry};

pub use config::NodeConfig;

/// Run one node until ctrl-c.
pub async fn run(config: NodeConfig, registry: WorkItemRegistry) -> Result<()> {
    let pool = ConnectionPool::new(
        PgConnector::new(config.database_url.clone()),
        config.pool_config(),
    );
    let store = SqlJobStore::new(pool.clone());
    store
        .ensure_schema(&registry)
        .await
        .context("schema setup failed")?;

    let controller = Controller::new(
        Arc::new(store),
        registry,
        Arc::new(SystemClock),
        config.controller.clone(),
    );

    for addr in &config.peers {
        match PeerClient::connect(addr).await {
            Ok(peer) => {
                info!(peer = %addr, "connected to peer");
                controller.add_peer(peer);
            }
            Err(e) => warn!(peer = %addr, error = %e, "peer connection failed"),
        }
    }

    controller.start().await.context("controller start failed")?;
    info!("node ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    controller.stop().await.context("controller stop failed")?;
    pool.stop().await;
    Ok(())
}
