use anyhow::Result;
use seedmesh::config::Config;
use seedmesh::{shutdown, tracker};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::new();
    let (shutdown_trigger, shutdown_rx) = shutdown::channel();

    let server = tokio::spawn({
        let listen = config.listen.clone();
        let observer = config.observer.clone();
        async move { tracker::serve(&listen, &observer, shutdown_rx).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown_trigger.fire().await;

    server.await??;
    Ok(())
}
