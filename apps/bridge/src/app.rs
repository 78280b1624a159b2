//! Application orchestrator: wires the relay link, the connection manager
//! and the stdin control loop together.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use watchmqtt_connection::{ConnectionError, ConnectionEvent, ConnectionManager};
use watchmqtt_relay::{ContextStore, PeerRelay};

use crate::commands::{self, Command};
use crate::config::Config;

/// Runs the bridge until `quit`, end of stdin or Ctrl-C.
pub async fn run(mut config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Relay link --
    let store = match &config.relay.context_path {
        Some(path) => ContextStore::open(path),
        None => ContextStore::in_memory(),
    };
    let relay = Arc::new(PeerRelay::spawn(
        config.relay.peer_addr.to_string(),
        store,
        config.relay_retry_interval(),
    ));
    tracing::info!(peer = %config.relay.peer_addr, "relay link started");

    // -- Connection manager --
    let manager = ConnectionManager::new(relay.clone(), config.reconnect_config());
    let mut events = manager
        .take_events()
        .await
        .ok_or_else(|| anyhow::anyhow!("connection events already taken"))?;

    manager.connect(config.connection_params()?).await?;

    // -- Control input --
    let (line_tx, mut line_rx) = mpsc::channel(16);
    tokio::spawn(read_stdin(line_tx, cancel.clone()));

    tracing::info!("bridge ready (commands: connect, disconnect, topic <filter>, status, quit)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            Some(event) = events.recv() => log_event(&event),
            line = line_rx.recv() => {
                let Some(line) = line else {
                    tracing::info!("stdin closed, shutting down");
                    break;
                };
                let command = match commands::parse(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("{e}");
                        continue;
                    }
                };
                if command == Command::Quit {
                    tracing::info!("quit requested");
                    break;
                }
                if let Err(e) = execute(&manager, &relay, &mut config, command).await {
                    tracing::warn!("command failed: {e}");
                }
            }
        }
    }

    // -- Graceful shutdown --
    tracing::info!("stopping services...");
    cancel.cancel();
    manager.shutdown().await;
    relay.shutdown();

    Ok(())
}

/// Runs one control command. A `topic` command also becomes the topic of
/// later `connect` commands.
async fn execute(
    manager: &ConnectionManager,
    relay: &PeerRelay,
    config: &mut Config,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Connect => {
            let session = manager.connect(config.connection_params()?).await?;
            tracing::info!(%session, topic = %config.topic, "connect requested");
        }
        Command::Disconnect => manager.disconnect().await,
        Command::Topic(topic) => {
            match manager.change_topic(topic.as_str()).await {
                Ok(()) => tracing::info!(%topic, "topic change requested"),
                Err(ConnectionError::NotConnected) => {
                    tracing::info!(%topic, "not connected, topic applies on next connect");
                }
                Err(e) => return Err(e.into()),
            }
            config.topic = topic;
        }
        Command::Status => {
            let last_error = manager.last_error().map(|e| e.to_string());
            tracing::info!(
                phase = %manager.phase(),
                topic = %config.topic,
                relay_reachable = relay.is_reachable(),
                last_message = manager.last_message().as_deref().unwrap_or("-"),
                last_error = last_error.as_deref().unwrap_or("-"),
                pending_context = relay.store().current().is_some(),
                "status"
            );
        }
        Command::Quit => {}
    }
    Ok(())
}

async fn read_stdin(lines: mpsc::Sender<String>, cancel: CancellationToken) {
    let mut reader = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = reader.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if lines.send(line).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("stdin read failed: {e}");
                return;
            }
        }
    }
}

fn log_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::PhaseChanged { session, phase } => {
            tracing::debug!(%session, %phase, "phase changed");
        }
        ConnectionEvent::Connected { session, client_id } => {
            tracing::info!(%session, %client_id, "subscribed to broker");
        }
        ConnectionEvent::Refused { session, code } => {
            tracing::error!(%session, code = code.as_u8(), "broker refused connection: {code}");
        }
        ConnectionEvent::Message {
            session,
            topic,
            payload,
        } => {
            tracing::info!(%session, %topic, %payload, "message relayed");
        }
        ConnectionEvent::SendFailed { session, error } => {
            tracing::warn!(%session, %error, "send failed");
        }
        ConnectionEvent::Disconnected { session, reason } => {
            tracing::info!(%session, %reason, "disconnected");
        }
        ConnectionEvent::Reconnecting {
            attempt,
            next_retry_secs,
        } => {
            tracing::info!(attempt, "reconnecting in {next_retry_secs:.1}s");
        }
    }
}
