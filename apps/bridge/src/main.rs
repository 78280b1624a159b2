//! WatchMQTT bridge entry point.

mod app;
mod commands;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting WatchMQTT bridge"
    );

    let path = std::env::args_os().nth(1).map(Into::into);
    let config = config::Config::load(path)?;
    tracing::info!(
        broker = %format!("{}:{}{}", config.broker.host, config.broker.port, config.broker.path),
        topic = %config.topic,
        peer = %config.relay.peer_addr,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("bridge shut down cleanly");
    Ok(())
}
