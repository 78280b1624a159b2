//! WatchMQTT companion entry point.

mod config;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use watchmqtt_relay::RelayReceiver;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting WatchMQTT companion"
    );

    let path = std::env::args_os().nth(1).map(Into::into);
    let config = config::Config::load(path)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    tracing::info!("companion shut down cleanly");
    Ok(())
}

async fn run(config: config::Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let receiver = RelayReceiver::bind(&config.listen_addr, cancel.clone()).await?;
    let mut latest = receiver.subscribe();
    let server = tokio::spawn(receiver.run());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(message) = latest.borrow_and_update().clone() {
                    tracing::info!(
                        kind = ?message.kind,
                        received_at = %message.received_at.to_rfc3339(),
                        text = %message.text,
                        "last message"
                    );
                }
            }
        }
    }

    cancel.cancel();
    server.await??;
    Ok(())
}
