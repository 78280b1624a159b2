//! Connection manager driving one MQTT session at a time.
//!
//! A single event-loop task owns the current [`Session`], its transport
//! handle and the relay sink. Caller commands and transport events reach it
//! over two channels; transport events tagged with anything but the current
//! session are dropped, so nothing from a torn-down session is ever
//! forwarded or reported.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use watchmqtt_relay::RelaySink;

use crate::error::ConnectionError;
use crate::reconnection::{Backoff, PendingRetry};
use crate::session::{Session, SessionAction};
use crate::transport::{Connector, OpenRequest, TaggedEvent, TransportHandle, WsConnector};
use crate::types::{
    ConnectionEvent, ConnectionParams, ConnectionPhase, DisconnectReason, ReconnectConfig,
    SessionId, validate_topic,
};

/// Capacity of the outbound event channel.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Capacity of the command and transport event channels.
const INBOX_DEPTH: usize = 64;

/// Outcome of [`ConnectionManager::reconfigure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfigured {
    /// Nothing changed.
    Unchanged,
    /// Only the topic changed; a SUBSCRIBE was sent on the live session.
    TopicChanged,
    /// The session was replaced by a new one.
    Reconnected(SessionId),
}

enum Command {
    Connect {
        params: ConnectionParams,
        reply: oneshot::Sender<SessionId>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    ChangeTopic {
        topic: String,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Reconfigure {
        params: ConnectionParams,
        reply: oneshot::Sender<Result<Reconfigured, ConnectionError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the connection event loop.
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    phase_rx: watch::Receiver<ConnectionPhase>,
    last_message_rx: watch::Receiver<Option<String>>,
    end_reason_rx: watch::Receiver<Option<DisconnectReason>>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Creates a manager that connects over WebSocket.
    ///
    /// `reconnect` enables automatic reconnection after unexpected losses.
    /// Must be called from within a Tokio runtime.
    pub fn new(relay: Arc<dyn RelaySink>, reconnect: Option<ReconnectConfig>) -> Self {
        Self::with_connector(Arc::new(WsConnector::default()), relay, reconnect)
    }

    /// Creates a manager with a custom transport connector.
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        relay: Arc<dyn RelaySink>,
        reconnect: Option<ReconnectConfig>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::channel(INBOX_DEPTH);
        let (transport_tx, transport_rx) = mpsc::channel(INBOX_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Idle);
        let (last_message_tx, last_message_rx) = watch::channel(None);
        let (end_reason_tx, end_reason_rx) = watch::channel(None);

        let driver = Driver {
            connector,
            relay,
            backoff: Backoff::new(reconnect),
            retry: None,
            last_id: SessionId::new(0),
            active: None,
            transport_tx,
            events_tx,
            phase_tx,
            last_message_tx,
            end_reason_tx,
        };
        let task = tokio::spawn(driver.run(commands_rx, transport_rx));

        Self {
            commands,
            events_rx: Mutex::new(Some(events_rx)),
            phase_rx,
            last_message_rx,
            end_reason_rx,
            task,
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Current phase of the latest session.
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase_rx.borrow()
    }

    /// Receiver that observes every phase change.
    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_rx.clone()
    }

    /// The most recent payload forwarded to the relay.
    pub fn last_message(&self) -> Option<String> {
        self.last_message_rx.borrow().clone()
    }

    /// The failure that ended the latest session.
    ///
    /// `None` while a session is live or after a requested disconnect. A
    /// CONNACK refusal shows up as [`ConnectionError::ProtocolRefusal`].
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.end_reason_rx
            .borrow()
            .clone()
            .and_then(DisconnectReason::into_error)
    }

    /// Starts a new session, replacing any live one.
    ///
    /// Returns once the transport is opening. Progress arrives as events.
    pub async fn connect(&self, params: ConnectionParams) -> Result<SessionId, ConnectionError> {
        params.validate()?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::Connect { params, reply }, rx).await
    }

    /// Tears down the current session and cancels any pending reconnect.
    ///
    /// Idempotent. Once this returns, no further events for the torn-down
    /// session are emitted.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.request(Command::Disconnect { reply }, rx).await;
    }

    /// Switches the subscription of the live session without reconnecting.
    pub async fn change_topic(&self, topic: impl Into<String>) -> Result<(), ConnectionError> {
        let topic = topic.into();
        validate_topic(&topic)?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::ChangeTopic { topic, reply }, rx).await?
    }

    /// Applies new parameters: a topic-only difference takes the
    /// SUBSCRIBE path, anything else replaces the session.
    pub async fn reconfigure(
        &self,
        params: ConnectionParams,
    ) -> Result<Reconfigured, ConnectionError> {
        params.validate()?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::Reconfigure { params, reply }, rx).await?
    }

    /// Disconnects and stops the event loop. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(Command::Shutdown { reply }, rx).await.is_ok() {
            info!("connection manager shut down");
        }
    }

    async fn request<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, ConnectionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConnectionError::Stopped)?;
        reply.await.map_err(|_| ConnectionError::Stopped)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Active {
    session: Session,
    transport: TransportHandle,
}

/// State owned by the event loop.
struct Driver {
    connector: Arc<dyn Connector>,
    relay: Arc<dyn RelaySink>,
    backoff: Backoff,
    retry: Option<PendingRetry>,
    last_id: SessionId,
    active: Option<Active>,
    transport_tx: mpsc::Sender<TaggedEvent>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    phase_tx: watch::Sender<ConnectionPhase>,
    last_message_tx: watch::Sender<Option<String>>,
    end_reason_tx: watch::Sender<Option<DisconnectReason>>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_rx: mpsc::Receiver<TaggedEvent>,
    ) {
        loop {
            let retry_at = self.retry.as_ref().map(|r| r.deadline);
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.retry = None;
                        self.teardown(DisconnectReason::Requested);
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.teardown(DisconnectReason::Requested);
                        break;
                    }
                },
                Some(tagged) = transport_rx.recv() => self.handle_transport(tagged),
                () = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.fire_retry();
                }
            }
        }
        debug!("connection manager loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { params, reply } => {
                let id = self.connect(params);
                let _ = reply.send(id);
            }
            Command::Disconnect { reply } => {
                if self.retry.take().is_some() {
                    info!("pending reconnect cancelled");
                }
                self.teardown(DisconnectReason::Requested);
                let _ = reply.send(());
            }
            Command::ChangeTopic { topic, reply } => {
                let _ = reply.send(self.change_topic(topic));
            }
            Command::Reconfigure { params, reply } => {
                let _ = reply.send(self.reconfigure(params));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_transport(&mut self, tagged: TaggedEvent) {
        let Some(active) = self.active.as_mut() else {
            trace!(session = %tagged.session, event = ?tagged.event, "no active session, dropping event");
            return;
        };
        if active.session.id() != tagged.session {
            trace!(
                session = %tagged.session,
                current = %active.session.id(),
                "dropping event from stale session"
            );
            return;
        }
        let actions = active.session.handle(tagged.event);
        self.apply(actions);
    }

    /// User-initiated connect: replaces the live session and resets backoff.
    fn connect(&mut self, params: ConnectionParams) -> SessionId {
        self.retry = None;
        self.backoff.reset();
        self.teardown(DisconnectReason::Superseded);
        self.start(params)
    }

    fn start(&mut self, params: ConnectionParams) -> SessionId {
        self.last_id = self.last_id.next();
        let id = self.last_id;
        let url = params.url();
        info!(
            session = %id,
            %url,
            client_id = %params.client_id,
            topic = %params.topic,
            "connecting to broker"
        );

        let transport = self
            .connector
            .open(OpenRequest::new(id, url), self.transport_tx.clone());
        self.active = Some(Active {
            session: Session::new(id, params),
            transport,
        });
        self.end_reason_tx.send_replace(None);
        self.apply(vec![SessionAction::Emit(ConnectionEvent::PhaseChanged {
            session: id,
            phase: ConnectionPhase::Connecting,
        })]);
        id
    }

    fn change_topic(&mut self, topic: String) -> Result<(), ConnectionError> {
        if let Some(active) = self.active.as_mut() {
            let actions = active.session.change_topic(topic)?;
            self.apply(actions);
            return Ok(());
        }
        if let Some(retry) = self.retry.as_mut() {
            debug!(%topic, "topic recorded for pending reconnect");
            retry.params.topic = topic;
            return Ok(());
        }
        Err(ConnectionError::NotConnected)
    }

    fn reconfigure(&mut self, params: ConnectionParams) -> Result<Reconfigured, ConnectionError> {
        let (unchanged, same_endpoint) = match &self.active {
            Some(active) => {
                let current = active.session.params();
                (*current == params, current.same_endpoint(&params))
            }
            None => (false, false),
        };
        if unchanged {
            return Ok(Reconfigured::Unchanged);
        }
        if same_endpoint {
            self.change_topic(params.topic)?;
            return Ok(Reconfigured::TopicChanged);
        }
        Ok(Reconfigured::Reconnected(self.connect(params)))
    }

    fn fire_retry(&mut self) {
        let Some(retry) = self.retry.take() else {
            return;
        };
        info!(attempt = retry.attempt, "reconnect attempt");
        self.start(retry.params);
    }

    /// Forces the live session, if any, through `Disconnected`.
    fn teardown(&mut self, reason: DisconnectReason) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let actions = active.session.disconnect(reason);
        self.apply(actions);
        self.active = None;
    }

    fn apply(&mut self, actions: Vec<SessionAction>) {
        let mut ended: Option<DisconnectReason> = None;
        let mut closed: Option<Session> = None;

        for action in actions {
            match action {
                SessionAction::Send { packet, bytes } => {
                    let Some(active) = &self.active else {
                        continue;
                    };
                    if let Err(e) = active.transport.send(bytes) {
                        let session = active.session.id();
                        warn!(%session, packet, error = %e, "failed to queue frame");
                        self.emit(ConnectionEvent::SendFailed {
                            session,
                            error: e.to_string(),
                        });
                    }
                }
                SessionAction::Forward { topic, payload } => {
                    trace!(%topic, "forwarding payload to relay");
                    self.relay.forward(&payload);
                    self.last_message_tx.send_replace(Some(payload));
                }
                SessionAction::Emit(event) => {
                    match &event {
                        ConnectionEvent::PhaseChanged { phase, .. } => {
                            self.phase_tx.send_replace(*phase);
                        }
                        ConnectionEvent::Connected { .. } => self.backoff.reset(),
                        ConnectionEvent::Disconnected { reason, .. } => {
                            self.end_reason_tx.send_replace(Some(reason.clone()));
                            ended = Some(reason.clone());
                        }
                        _ => {}
                    }
                    self.emit(event);
                }
                SessionAction::CloseTransport => {
                    if let Some(Active { session, transport }) = self.active.take() {
                        debug!(session = %transport.session(), "closing transport");
                        transport.close();
                        closed = Some(session);
                    }
                }
            }
        }

        if let (Some(reason), Some(session)) = (ended, closed)
            && reason.is_unexpected()
        {
            self.schedule_retry(session.params().clone());
        }
    }

    fn schedule_retry(&mut self, params: ConnectionParams) {
        match self.backoff.next_attempt() {
            Some((attempt, delay)) => {
                let next_retry_secs = delay.as_secs_f64();
                info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                self.retry = Some(PendingRetry {
                    params,
                    attempt,
                    deadline: Instant::now() + delay,
                });
                self.emit(ConnectionEvent::Reconnecting {
                    attempt,
                    next_retry_secs,
                });
            }
            None if self.backoff.is_enabled() => {
                warn!("reconnect attempts exhausted, staying disconnected");
            }
            None => {}
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("failed to deliver connection event: {e}");
        }
    }
}
