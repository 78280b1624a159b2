//! WebSocket transport for MQTT frames.
//!
//! A [`Connector`] opens a transport without blocking the caller: the
//! handshake runs on a spawned task, which reports `Opened` or `Error`
//! through the event channel. Every event is tagged with the
//! [`SessionId`] of the attempt that opened it.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use watchmqtt_protocol::constants::WS_SUBPROTOCOL;

use crate::error::TransportError;
use crate::pumps::{read::read_pump, write::write_pump};
use crate::types::SessionId;

/// Maximum inbound WebSocket message size.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Timeout for the TCP connect plus WebSocket upgrade.
pub const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Depth of the outbound frame queue.
pub const WRITE_QUEUE_DEPTH: usize = 32;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake complete; frames may be sent.
    Opened,
    /// A binary WebSocket message.
    Message(Vec<u8>),
    /// A text WebSocket message. MQTT never uses these.
    Text(String),
    /// The peer closed the connection or the stream ended.
    Closed,
    /// The handshake or the connection failed.
    Error(String),
    /// An outbound frame could not be written.
    SendFailed(String),
}

/// A transport event together with the attempt it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub session: SessionId,
    pub event: TransportEvent,
}

/// What to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub session: SessionId,
    pub url: String,
    pub subprotocol: &'static str,
}

impl OpenRequest {
    pub fn new(session: SessionId, url: String) -> Self {
        Self {
            session,
            url,
            subprotocol: WS_SUBPROTOCOL,
        }
    }
}

/// Opens transports. Implementations must not block.
pub trait Connector: Send + Sync {
    fn open(&self, request: OpenRequest, events: mpsc::Sender<TaggedEvent>) -> TransportHandle;
}

/// Owner's side of an open or opening transport.
///
/// Dropping the handle tears the transport down like [`close`](Self::close).
pub struct TransportHandle {
    session: SessionId,
    write_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    _task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn new(
        session: SessionId,
        write_tx: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            session,
            write_tx,
            cancel,
            _task: task,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Queues a frame without waiting. Write failures arrive later as
    /// `SendFailed` events.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.write_tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Stops the pumps; the write pump sends a close frame on its way out.
    pub fn close(self) {
        self.cancel.cancel();
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// [`Connector`] backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    pub handshake_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            handshake_timeout: WS_HANDSHAKE_TIMEOUT,
            max_message_size: WS_MAX_MESSAGE_SIZE,
        }
    }
}

impl Connector for WsConnector {
    fn open(&self, request: OpenRequest, events: mpsc::Sender<TaggedEvent>) -> TransportHandle {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let session = request.session;

        let task = tokio::spawn(run_transport(
            self.clone(),
            request,
            write_rx,
            events,
            cancel.clone(),
        ));

        TransportHandle::new(session, write_tx, cancel, Some(task))
    }
}

async fn run_transport(
    connector: WsConnector,
    request: OpenRequest,
    write_rx: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<TaggedEvent>,
    cancel: CancellationToken,
) {
    let session = request.session;
    let handshake = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(connector.handshake_timeout, handshake(&connector, &request)) => {
            match result {
                Ok(result) => result,
                Err(_) => Err(TransportError::HandshakeTimeout),
            }
        }
    };

    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%session, url = %request.url, error = %e, "WebSocket handshake failed");
            let _ = events
                .send(TaggedEvent {
                    session,
                    event: TransportEvent::Error(e.to_string()),
                })
                .await;
            return;
        }
    };

    if events
        .send(TaggedEvent {
            session,
            event: TransportEvent::Opened,
        })
        .await
        .is_err()
    {
        return;
    }

    let (write, read) = ws.split();
    let writer = tokio::spawn(write_pump(
        write,
        write_rx,
        session,
        events.clone(),
        cancel.clone(),
    ));

    read_pump(read, session, events, cancel.clone()).await;

    // A finished reader means the connection is gone; stop the writer too.
    cancel.cancel();
    let _ = writer.await;
    debug!(%session, "transport finished");
}

async fn handshake(
    connector: &WsConnector,
    request: &OpenRequest,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TransportError> {
    let mut client_request = request.url.as_str().into_client_request()?;
    client_request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(request.subprotocol),
    );

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(connector.max_message_size);
    ws_config.max_frame_size = Some(connector.max_message_size);

    let (ws, response) =
        tokio_tungstenite::connect_async_with_config(client_request, Some(ws_config), false)
            .await?;

    let negotiated = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    info!(
        session = %request.session,
        url = %request.url,
        status = %response.status(),
        subprotocol = negotiated,
        "WebSocket connected"
    );
    Ok(ws)
}
