//! Relay receiver (companion side).
//!
//! Accepts relay links from the bridge and publishes the latest payload,
//! whether it arrived live or as stored context.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::wire::{FrameKind, read_frame};

/// The most recent payload seen by the companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedMessage {
    pub text: String,
    pub kind: FrameKind,
    pub received_at: DateTime<Utc>,
}

/// TCP listener for relay links.
pub struct RelayReceiver {
    listener: TcpListener,
    cancel: CancellationToken,
    latest: Arc<watch::Sender<Option<RelayedMessage>>>,
}

impl RelayReceiver {
    /// Binds the listener on `addr` (`host:port`).
    pub async fn bind(addr: &str, cancel: CancellationToken) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "relay receiver listening");
        let (latest, _) = watch::channel(None);
        Ok(Self {
            listener,
            cancel,
            latest: Arc::new(latest),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns a receiver that observes every new payload.
    pub fn subscribe(&self) -> watch::Receiver<Option<RelayedMessage>> {
        self.latest.subscribe()
    }

    /// Accepts links until cancelled. Each link is served on its own task.
    pub async fn run(self) -> Result<(), RelayError> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("relay receiver stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "relay link accepted");
                    tokio::spawn(serve_link(
                        stream,
                        peer,
                        self.latest.clone(),
                        self.cancel.child_token(),
                    ));
                }
                Err(e) => warn!(error = %e, "failed to accept relay link"),
            }
        }
    }
}

async fn serve_link(
    stream: TcpStream,
    peer: SocketAddr,
    latest: Arc<watch::Sender<Option<RelayedMessage>>>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stream);
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                debug!(%peer, kind = ?frame.kind, bytes = frame.payload.len(), "relay frame received");
                latest.send_replace(Some(RelayedMessage {
                    text: frame.payload,
                    kind: frame.kind,
                    received_at: Utc::now(),
                }));
            }
            Ok(None) => {
                info!(%peer, "relay link closed");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "relay link failed");
                return;
            }
        }
    }
}
