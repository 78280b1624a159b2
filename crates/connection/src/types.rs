//! Public types for the connection engine.

use std::fmt;
use std::time::Duration;

use tokio_tungstenite::tungstenite::http::Uri;
use watchmqtt_protocol::ConnackCode;
use watchmqtt_protocol::constants::{DEFAULT_KEEP_ALIVE, MAX_STRING_LEN};

use crate::error::{ConnectionError, TransportError};

/// Prefix of generated client identifiers.
pub const DEFAULT_CLIENT_ID_PREFIX: &str = "WatchMQTT";

/// Identifies one connection attempt. Tags every transport event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle phase of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No connection has been requested yet.
    #[default]
    Idle,
    /// WebSocket handshake in progress.
    Connecting,
    /// CONNECT sent, waiting for CONNACK.
    AwaitingConnack,
    /// CONNACK accepted and SUBSCRIBE sent; PUBLISH frames are forwarded.
    Subscribed,
    /// Session torn down.
    Disconnected,
}

impl ConnectionPhase {
    /// Returns `true` for phases that own an open or opening transport.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingConnack | Self::Subscribed
        )
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingConnack => "awaiting CONNACK",
            Self::Subscribed => "subscribed",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Why a session left its live phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller asked for it.
    Requested,
    /// A new connect request replaced the session.
    Superseded,
    /// The broker or network closed the transport.
    Closed,
    /// The transport failed.
    Transport(String),
    /// The broker answered CONNACK with a refusal.
    Refused(ConnackCode),
    /// An outbound packet could not be encoded.
    Protocol(String),
}

impl DisconnectReason {
    /// Unexpected losses are the only ones eligible for automatic reconnect.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::Closed | Self::Transport(_))
    }

    /// The error equivalent of this reason, if it is a failure.
    pub fn into_error(self) -> Option<ConnectionError> {
        match self {
            Self::Requested | Self::Superseded => None,
            Self::Closed => Some(TransportError::Closed.into()),
            Self::Transport(desc) => Some(TransportError::Failed(desc).into()),
            Self::Refused(code) => Some(ConnectionError::ProtocolRefusal(code)),
            Self::Protocol(desc) => Some(ConnectionError::InvalidConfiguration(desc)),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("disconnect requested"),
            Self::Superseded => f.write_str("replaced by a new connection"),
            Self::Closed => f.write_str("connection closed"),
            Self::Transport(desc) => write!(f, "transport error: {desc}"),
            Self::Refused(code) => write!(f, "{code}"),
            Self::Protocol(desc) => write!(f, "protocol error: {desc}"),
        }
    }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The session moved to a new phase.
    PhaseChanged {
        session: SessionId,
        phase: ConnectionPhase,
    },
    /// The broker accepted CONNECT; SUBSCRIBE has been sent.
    Connected {
        session: SessionId,
        client_id: String,
    },
    /// The broker refused CONNECT.
    Refused {
        session: SessionId,
        code: ConnackCode,
    },
    /// A PUBLISH payload was received and relayed.
    Message {
        session: SessionId,
        topic: String,
        payload: String,
    },
    /// An outbound frame could not be written. The session stays up.
    SendFailed { session: SessionId, error: String },
    /// The session ended. Reported exactly once per session.
    Disconnected {
        session: SessionId,
        reason: DisconnectReason,
    },
    /// An automatic reconnect is scheduled.
    Reconnecting { attempt: u32, next_retry_secs: f64 },
}

/// Parameters for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    /// WebSocket path; normalized to start with `/`.
    pub path: String,
    pub client_id: String,
    /// Empty means no credentials are sent.
    pub username: String,
    pub password: String,
    pub topic: String,
    pub keep_alive: u16,
}

impl ConnectionParams {
    /// Builds validated parameters without credentials.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        path: &str,
        client_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Result<Self, ConnectionError> {
        let params = Self {
            host: host.into().trim().to_owned(),
            port,
            path: normalize_path(path),
            client_id: client_id.into(),
            username: String::new(),
            password: String::new(),
            topic: topic.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// The broker URL, `ws://{host}:{port}{path}`.
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("ws://{host}:{}{}", self.port, normalize_path(&self.path))
    }

    /// Checks everything that can be rejected before a transport is opened.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::InvalidConfiguration(
                "broker host is empty".into(),
            ));
        }
        if self.port == 0 {
            return Err(ConnectionError::InvalidConfiguration(
                "broker port must be between 1 and 65535".into(),
            ));
        }
        let url = self.url();
        let uri: Uri = url.parse().map_err(|e| {
            ConnectionError::InvalidConfiguration(format!("invalid broker URL {url}: {e}"))
        })?;
        if uri.host().is_none_or(str::is_empty) {
            return Err(ConnectionError::InvalidConfiguration(format!(
                "invalid broker URL {url}: missing host"
            )));
        }

        for (field, value) in [
            ("client id", &self.client_id),
            ("username", &self.username),
            ("password", &self.password),
        ] {
            check_string_len(field, value)?;
        }
        validate_topic(&self.topic)
    }

    /// Returns `true` when `other` differs from `self` at most in the topic.
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && normalize_path(&self.path) == normalize_path(&other.path)
            && self.client_id == other.client_id
            && self.username == other.username
            && self.password == other.password
            && self.keep_alive == other.keep_alive
    }
}

/// Rejects topic filters that cannot be sent in a SUBSCRIBE.
pub fn validate_topic(topic: &str) -> Result<(), ConnectionError> {
    if topic.is_empty() {
        return Err(ConnectionError::InvalidConfiguration(
            "topic is empty".into(),
        ));
    }
    check_string_len("topic", topic)
}

fn check_string_len(field: &str, value: &str) -> Result<(), ConnectionError> {
    if value.len() > MAX_STRING_LEN {
        return Err(ConnectionError::InvalidConfiguration(format!(
            "{field} too long: {} bytes (max {MAX_STRING_LEN})",
            value.len()
        )));
    }
    Ok(())
}

/// Prefixes `/` when missing. An empty path becomes `/`.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

/// Builds a per-launch client identifier, `{prefix}-{8 hex chars}`.
pub fn generate_client_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!("{prefix}-{}", &suffix[..8])
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Attempts before giving up. Reset once a session reaches Subscribed.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + jitter * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}
