use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobgrid_node::NodeConfig;
use jobgrid_queue::WorkItemRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobgrid=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env()?;
    tracing::info!(hostname = %config.controller.hostname, port = config.controller.port,
                   "jobgrid node starting");

    // Work types are registered by embedding applications; the stock
    // binary runs with an empty registry.
    jobgrid_node::run(config, WorkItemRegistry::new()).await
}
