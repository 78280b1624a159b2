//! WebSocket read pump: turns inbound messages into transport events.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::{TaggedEvent, TransportEvent};
use crate::types::SessionId;

/// Reads messages until the stream ends, fails, or the pump is cancelled.
///
/// Ends with exactly one `Closed` or `Error` event unless cancelled, in
/// which case nothing more is reported.
pub(crate) async fn read_pump<S>(
    mut read: S,
    session: SessionId,
    events: mpsc::Sender<TaggedEvent>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let last = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = read.next() => match msg {
                Some(Ok(tungstenite::Message::Binary(data))) => TransportEvent::Message(data.to_vec()),
                Some(Ok(tungstenite::Message::Text(text))) => {
                    TransportEvent::Text(text.as_str().to_owned())
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    debug!(%session, ?frame, "close frame received");
                    break TransportEvent::Closed;
                }
                Some(Ok(other)) => {
                    trace!(%session, kind = ?other, "control frame");
                    continue;
                }
                Some(Err(e)) => {
                    warn!(%session, error = %e, "WebSocket read error");
                    break TransportEvent::Error(e.to_string());
                }
                None => break TransportEvent::Closed,
            },
        };

        if events.send(TaggedEvent { session, event }).await.is_err() {
            return;
        }
    };

    let _ = events.send(TaggedEvent { session, event: last }).await;
}
