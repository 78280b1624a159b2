//! Connection lifecycle of a single attempt, without I/O.
//!
//! ```text
//! Connecting --Opened--> AwaitingConnack --CONNACK ok--> Subscribed
//!      |                       |                             |
//!      +---- Closed/Error -----+---- refused / Closed -------+--> Disconnected
//! ```
//!
//! The caller feeds [`TransportEvent`]s to [`Session::handle`] and performs
//! the returned [`SessionAction`]s in order. SUBSCRIBE is only ever produced
//! by an accepted CONNACK or by a topic change while subscribed.

use tracing::{debug, info, trace, warn};

use watchmqtt_protocol::{
    CodecError, Packet, QoS, encode_connect, encode_subscribe, hex_dump, split_frames,
};

use crate::error::ConnectionError;
use crate::transport::TransportEvent;
use crate::types::{
    ConnectionEvent, ConnectionParams, ConnectionPhase, DisconnectReason, SessionId,
    validate_topic,
};

/// Side effect requested by a [`Session`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Write an encoded packet to the transport.
    Send { packet: &'static str, bytes: Vec<u8> },
    /// Hand a received payload to the relay sink.
    Forward { topic: String, payload: String },
    /// Report to observers.
    Emit(ConnectionEvent),
    /// Tear down the transport. Always the last action of a batch.
    CloseTransport,
}

/// State machine for one connection attempt.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    params: ConnectionParams,
    phase: ConnectionPhase,
    next_packet_id: u16,
}

impl Session {
    /// Creates a session in `Connecting`; its transport is being opened.
    pub fn new(id: SessionId, params: ConnectionParams) -> Self {
        Self {
            id,
            params,
            phase: ConnectionPhase::Connecting,
            next_packet_id: 1,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Reacts to one transport event.
    pub fn handle(&mut self, event: TransportEvent) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.phase.is_live() {
            trace!(session = %self.id, ?event, "ignoring event after disconnect");
            return actions;
        }

        match event {
            TransportEvent::Opened => self.on_opened(&mut actions),
            TransportEvent::Message(bytes) => self.on_message(&bytes, &mut actions),
            TransportEvent::Text(text) => {
                debug!(session = %self.id, len = text.len(), "ignoring text frame");
            }
            TransportEvent::SendFailed(error) => {
                warn!(session = %self.id, %error, "send failed");
                actions.push(SessionAction::Emit(ConnectionEvent::SendFailed {
                    session: self.id,
                    error,
                }));
            }
            TransportEvent::Closed => {
                info!(session = %self.id, phase = %self.phase, "transport closed");
                self.end(DisconnectReason::Closed, &mut actions);
            }
            TransportEvent::Error(error) => {
                warn!(session = %self.id, phase = %self.phase, %error, "transport error");
                self.end(DisconnectReason::Transport(error), &mut actions);
            }
        }
        actions
    }

    /// Forces the session to `Disconnected`. No actions when already there.
    pub fn disconnect(&mut self, reason: DisconnectReason) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.phase.is_live() {
            info!(session = %self.id, phase = %self.phase, %reason, "disconnecting");
            self.end(reason, &mut actions);
        }
        actions
    }

    /// Switches the subscription to `topic`.
    ///
    /// While subscribed a new SUBSCRIBE is emitted at once. Before CONNACK
    /// the topic is only recorded and used by the SUBSCRIBE that follows.
    pub fn change_topic(&mut self, topic: String) -> Result<Vec<SessionAction>, ConnectionError> {
        validate_topic(&topic)?;

        match self.phase {
            ConnectionPhase::Subscribed => {
                info!(session = %self.id, from = %self.params.topic, to = %topic, "changing topic");
                self.params.topic = topic;
                let mut actions = Vec::new();
                match self.subscribe() {
                    Ok(action) => actions.push(action),
                    Err(e) => self.end(DisconnectReason::Protocol(e.to_string()), &mut actions),
                }
                Ok(actions)
            }
            ConnectionPhase::Connecting | ConnectionPhase::AwaitingConnack => {
                debug!(session = %self.id, %topic, "topic recorded for pending SUBSCRIBE");
                self.params.topic = topic;
                Ok(Vec::new())
            }
            ConnectionPhase::Idle | ConnectionPhase::Disconnected => {
                Err(ConnectionError::NotConnected)
            }
        }
    }

    fn on_opened(&mut self, actions: &mut Vec<SessionAction>) {
        if self.phase != ConnectionPhase::Connecting {
            debug!(session = %self.id, phase = %self.phase, "ignoring duplicate open");
            return;
        }

        let p = &self.params;
        match encode_connect(&p.client_id, &p.username, &p.password, p.keep_alive) {
            Ok(bytes) => {
                debug!(
                    session = %self.id,
                    client_id = %p.client_id,
                    hex = %hex_dump(&bytes),
                    "sending CONNECT"
                );
                actions.push(SessionAction::Send {
                    packet: "CONNECT",
                    bytes,
                });
                self.transition(ConnectionPhase::AwaitingConnack, actions);
            }
            Err(e) => self.end(DisconnectReason::Protocol(e.to_string()), actions),
        }
    }

    fn on_message(&mut self, bytes: &[u8], actions: &mut Vec<SessionAction>) {
        debug!(session = %self.id, len = bytes.len(), hex = %hex_dump(bytes), "received frame");

        for packet in split_frames(bytes) {
            if !self.phase.is_live() {
                trace!(session = %self.id, "dropping frames after disconnect");
                break;
            }
            self.on_packet(packet, actions);
        }
    }

    fn on_packet(&mut self, packet: Packet, actions: &mut Vec<SessionAction>) {
        match (self.phase, packet) {
            (ConnectionPhase::AwaitingConnack, Packet::Connack { return_code }) => {
                if return_code.is_accepted() {
                    info!(session = %self.id, "CONNACK accepted");
                    match self.subscribe() {
                        Ok(action) => {
                            actions.push(action);
                            self.transition(ConnectionPhase::Subscribed, actions);
                            actions.push(SessionAction::Emit(ConnectionEvent::Connected {
                                session: self.id,
                                client_id: self.params.client_id.clone(),
                            }));
                        }
                        Err(e) => self.end(DisconnectReason::Protocol(e.to_string()), actions),
                    }
                } else {
                    warn!(session = %self.id, code = return_code.as_u8(), "{return_code}");
                    actions.push(SessionAction::Emit(ConnectionEvent::Refused {
                        session: self.id,
                        code: return_code,
                    }));
                    self.end(DisconnectReason::Refused(return_code), actions);
                }
            }
            (ConnectionPhase::Subscribed, Packet::Publish { topic, payload }) => {
                let payload = String::from_utf8_lossy(&payload).into_owned();
                debug!(session = %self.id, %topic, %payload, "PUBLISH received");
                actions.push(SessionAction::Forward {
                    topic: topic.clone(),
                    payload: payload.clone(),
                });
                actions.push(SessionAction::Emit(ConnectionEvent::Message {
                    session: self.id,
                    topic,
                    payload,
                }));
            }
            (phase, Packet::Unrecognized { raw }) => {
                debug!(session = %self.id, %phase, hex = %hex_dump(&raw), "ignoring unrecognized frame");
            }
            (phase, packet) => {
                debug!(session = %self.id, %phase, packet = packet.name(), "ignoring packet");
            }
        }
    }

    fn subscribe(&mut self) -> Result<SessionAction, CodecError> {
        let packet_id = self.next_packet_id();
        let bytes = encode_subscribe(packet_id, &self.params.topic, QoS::AtMostOnce)?;
        debug!(
            session = %self.id,
            topic = %self.params.topic,
            packet_id,
            hex = %hex_dump(&bytes),
            "sending SUBSCRIBE"
        );
        Ok(SessionAction::Send {
            packet: "SUBSCRIBE",
            bytes,
        })
    }

    /// Returns the next packet identifier, cycling through 1..=65535.
    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = id.checked_add(1).unwrap_or(1);
        id
    }

    fn transition(&mut self, phase: ConnectionPhase, actions: &mut Vec<SessionAction>) {
        if self.phase == phase {
            return;
        }
        debug!(session = %self.id, from = %self.phase, to = %phase, "phase change");
        self.phase = phase;
        actions.push(SessionAction::Emit(ConnectionEvent::PhaseChanged {
            session: self.id,
            phase,
        }));
    }

    fn end(&mut self, reason: DisconnectReason, actions: &mut Vec<SessionAction>) {
        self.transition(ConnectionPhase::Disconnected, actions);
        actions.push(SessionAction::Emit(ConnectionEvent::Disconnected {
            session: self.id,
            reason,
        }));
        actions.push(SessionAction::CloseTransport);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchmqtt_protocol::ConnackCode;

    const CONNACK_OK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    fn params() -> ConnectionParams {
        ConnectionParams::new("broker", 9001, "/mqtt", "id", "a/b")
            .unwrap()
            .with_credentials("u", "p")
    }

    fn session() -> Session {
        Session::new(SessionId::new(1), params())
    }

    fn subscribed() -> Session {
        let mut s = session();
        s.handle(TransportEvent::Opened);
        s.handle(TransportEvent::Message(CONNACK_OK.to_vec()));
        assert_eq!(s.phase(), ConnectionPhase::Subscribed);
        s
    }

    fn sent(actions: &[SessionAction]) -> Vec<&'static str> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Send { packet, .. } => Some(*packet),
                _ => None,
            })
            .collect()
    }

    fn publish(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);
        let mut frame = vec![0x30, body.len() as u8];
        frame.extend(body);
        frame
    }

    #[test]
    fn new_session_is_connecting() {
        let s = session();
        assert_eq!(s.phase(), ConnectionPhase::Connecting);
        assert_eq!(s.id(), SessionId::new(1));
    }

    #[test]
    fn open_sends_connect_only() {
        let mut s = session();
        let actions = s.handle(TransportEvent::Opened);

        assert_eq!(sent(&actions), vec!["CONNECT"]);
        assert_eq!(s.phase(), ConnectionPhase::AwaitingConnack);
        let SessionAction::Send { bytes, .. } = &actions[0] else {
            panic!("first action must be the CONNECT send");
        };
        assert_eq!(bytes, &encode_connect("id", "u", "p", 60).unwrap());
    }

    #[test]
    fn no_subscribe_without_connack() {
        let mut s = session();
        let mut all = s.handle(TransportEvent::Opened);
        all.extend(s.handle(TransportEvent::Text("hello".into())));
        all.extend(s.handle(TransportEvent::Message(vec![0x90, 0x03, 0x00, 0x01, 0x00])));
        all.extend(s.handle(TransportEvent::Message(publish("a/b", b"early"))));

        assert_eq!(sent(&all), vec!["CONNECT"]);
        assert!(!all.iter().any(|a| matches!(a, SessionAction::Forward { .. })));
        assert_eq!(s.phase(), ConnectionPhase::AwaitingConnack);
    }

    #[test]
    fn accepted_connack_subscribes_with_packet_id_one() {
        let mut s = session();
        s.handle(TransportEvent::Opened);
        let actions = s.handle(TransportEvent::Message(CONNACK_OK.to_vec()));

        assert_eq!(sent(&actions), vec!["SUBSCRIBE"]);
        let SessionAction::Send { bytes, .. } = &actions[0] else {
            panic!("expected SUBSCRIBE send");
        };
        assert_eq!(bytes, &encode_subscribe(1, "a/b", QoS::AtMostOnce).unwrap());
        assert!(actions.contains(&SessionAction::Emit(ConnectionEvent::PhaseChanged {
            session: SessionId::new(1),
            phase: ConnectionPhase::Subscribed,
        })));
        assert!(actions.contains(&SessionAction::Emit(ConnectionEvent::Connected {
            session: SessionId::new(1),
            client_id: "id".into(),
        })));
    }

    #[test]
    fn refused_connack_disconnects() {
        let mut s = session();
        s.handle(TransportEvent::Opened);
        let actions = s.handle(TransportEvent::Message(vec![0x20, 0x02, 0x00, 0x05]));

        assert!(sent(&actions).is_empty());
        assert_eq!(s.phase(), ConnectionPhase::Disconnected);
        assert!(actions.contains(&SessionAction::Emit(ConnectionEvent::Refused {
            session: SessionId::new(1),
            code: ConnackCode::NotAuthorized,
        })));
        assert!(actions.contains(&SessionAction::Emit(ConnectionEvent::Disconnected {
            session: SessionId::new(1),
            reason: DisconnectReason::Refused(ConnackCode::NotAuthorized),
        })));
        assert_eq!(actions.last(), Some(&SessionAction::CloseTransport));
    }

    #[test]
    fn publish_is_forwarded_when_subscribed() {
        let mut s = subscribed();
        let actions = s.handle(TransportEvent::Message(publish("a/b", b"hi")));

        assert_eq!(
            actions[0],
            SessionAction::Forward {
                topic: "a/b".into(),
                payload: "hi".into(),
            }
        );
        assert!(actions.contains(&SessionAction::Emit(ConnectionEvent::Message {
            session: SessionId::new(1),
            topic: "a/b".into(),
            payload: "hi".into(),
        })));
        assert_eq!(s.phase(), ConnectionPhase::Subscribed);
    }

    #[test]
    fn connack_and_publish_in_one_message() {
        let mut s = session();
        s.handle(TransportEvent::Opened);
        let mut bytes = CONNACK_OK.to_vec();
        bytes.extend(publish("a/b", b"retained"));
        let actions = s.handle(TransportEvent::Message(bytes));

        assert_eq!(sent(&actions), vec!["SUBSCRIBE"]);
        assert!(actions.contains(&SessionAction::Forward {
            topic: "a/b".into(),
            payload: "retained".into(),
        }));
    }

    #[test]
    fn non_utf8_payload_is_replaced_not_dropped() {
        let mut s = subscribed();
        let actions = s.handle(TransportEvent::Message(publish("a/b", &[0x68, 0xFF])));
        assert!(actions.contains(&SessionAction::Forward {
            topic: "a/b".into(),
            payload: "h\u{FFFD}".into(),
        }));
    }

    #[test]
    fn garbage_and_late_connack_are_absorbed() {
        let mut s = subscribed();
        let mut actions = s.handle(TransportEvent::Message(vec![0x20, 0x02]));
        actions.extend(s.handle(TransportEvent::Message(CONNACK_OK.to_vec())));
        actions.extend(s.handle(TransportEvent::Message(vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF])));
        assert!(actions.is_empty());
        assert_eq!(s.phase(), ConnectionPhase::Subscribed);
    }

    #[test]
    fn send_failure_keeps_phase() {
        let mut s = subscribed();
        let actions = s.handle(TransportEvent::SendFailed("broken pipe".into()));
        assert_eq!(
            actions,
            vec![SessionAction::Emit(ConnectionEvent::SendFailed {
                session: SessionId::new(1),
                error: "broken pipe".into(),
            })]
        );
        assert_eq!(s.phase(), ConnectionPhase::Subscribed);
    }

    #[test]
    fn transport_close_reports_once() {
        let mut s = subscribed();
        let actions = s.handle(TransportEvent::Closed);
        assert_eq!(s.phase(), ConnectionPhase::Disconnected);
        let reports = actions
            .iter()
            .filter(|a| matches!(a, SessionAction::Emit(ConnectionEvent::Disconnected { .. })))
            .count();
        assert_eq!(reports, 1);

        assert!(s.handle(TransportEvent::Error("late".into())).is_empty());
        assert!(s.handle(TransportEvent::Closed).is_empty());
    }

    #[test]
    fn transport_error_while_connecting() {
        let mut s = session();
        let actions = s.handle(TransportEvent::Error("connection refused".into()));
        assert_eq!(s.phase(), ConnectionPhase::Disconnected);
        assert!(actions.contains(&SessionAction::Emit(ConnectionEvent::Disconnected {
            session: SessionId::new(1),
            reason: DisconnectReason::Transport("connection refused".into()),
        })));
    }

    #[test]
    fn disconnect_while_awaiting_connack_ignores_later_frames() {
        let mut s = session();
        s.handle(TransportEvent::Opened);
        let actions = s.disconnect(DisconnectReason::Requested);
        assert_eq!(actions.last(), Some(&SessionAction::CloseTransport));
        assert_eq!(s.phase(), ConnectionPhase::Disconnected);

        assert!(s.handle(TransportEvent::Message(CONNACK_OK.to_vec())).is_empty());
        assert!(s.handle(TransportEvent::Message(publish("a/b", b"ghost"))).is_empty());
        assert_eq!(s.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn double_disconnect_equals_single() {
        let mut s = subscribed();
        let first = s.disconnect(DisconnectReason::Requested);
        assert!(!first.is_empty());
        assert!(s.disconnect(DisconnectReason::Requested).is_empty());
        assert_eq!(s.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn change_topic_while_subscribed_uses_next_packet_id() {
        let mut s = subscribed();
        let actions = s.change_topic("home/door".into()).unwrap();
        assert_eq!(
            actions,
            vec![SessionAction::Send {
                packet: "SUBSCRIBE",
                bytes: encode_subscribe(2, "home/door", QoS::AtMostOnce).unwrap(),
            }]
        );
        assert_eq!(s.params().topic, "home/door");
        assert_eq!(s.phase(), ConnectionPhase::Subscribed);
    }

    #[test]
    fn change_topic_before_connack_is_used_by_first_subscribe() {
        let mut s = session();
        assert!(s.change_topic("early/topic".into()).unwrap().is_empty());
        s.handle(TransportEvent::Opened);
        assert!(s.change_topic("later/topic".into()).unwrap().is_empty());

        let actions = s.handle(TransportEvent::Message(CONNACK_OK.to_vec()));
        let SessionAction::Send { bytes, .. } = &actions[0] else {
            panic!("expected SUBSCRIBE send");
        };
        assert_eq!(bytes, &encode_subscribe(1, "later/topic", QoS::AtMostOnce).unwrap());
    }

    #[test]
    fn change_topic_after_disconnect_rejected() {
        let mut s = subscribed();
        s.disconnect(DisconnectReason::Requested);
        assert!(matches!(
            s.change_topic("x".into()),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[test]
    fn change_topic_rejects_empty() {
        let mut s = subscribed();
        assert!(matches!(
            s.change_topic(String::new()),
            Err(ConnectionError::InvalidConfiguration(_))
        ));
        assert_eq!(s.params().topic, "a/b");
    }

    #[test]
    fn packet_ids_wrap_and_skip_zero() {
        let mut s = session();
        s.next_packet_id = u16::MAX;
        assert_eq!(s.next_packet_id(), u16::MAX);
        assert_eq!(s.next_packet_id(), 1);
        assert_eq!(s.next_packet_id(), 2);
    }
}
