//! WebSocket write pump: sends encoded MQTT packets as binary messages.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::transport::{TaggedEvent, TransportEvent};
use crate::types::SessionId;

/// Writes queued packets until cancelled or the queue closes, then sends a
/// close frame. A failed write is reported as `SendFailed` and ends the pump.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    session: SessionId,
    events: mpsc::Sender<TaggedEvent>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(bytes) => {
                        let len = bytes.len();
                        if let Err(e) = write.send(tungstenite::Message::Binary(bytes.into())).await {
                            warn!(%session, error = %e, "WebSocket write error");
                            let _ = events
                                .send(TaggedEvent {
                                    session,
                                    event: TransportEvent::SendFailed(e.to_string()),
                                })
                                .await;
                            break;
                        }
                        trace!(%session, len, "frame written");
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}
