//! Automatic reconnection after an unexpected loss.
//!
//! Disabled unless a [`ReconnectConfig`] is supplied. Attempts are counted
//! across consecutive failures and reset once a session is accepted.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::{ConnectionParams, ReconnectConfig};

/// Attempt counter for one run of consecutive failures.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: Option<ReconnectConfig>,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(config: Option<ReconnectConfig>) -> Self {
        Self { config, attempt: 0 }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Returns the next attempt number and its delay, or `None` when
    /// reconnection is disabled or the attempts are used up.
    pub(crate) fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        let config = self.config.as_ref()?;
        if self.attempt >= config.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some((self.attempt, config.delay_for_attempt(self.attempt)))
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// A reconnect waiting for its deadline.
#[derive(Debug)]
pub(crate) struct PendingRetry {
    pub(crate) params: ConnectionParams,
    pub(crate) attempt: u32,
    pub(crate) deadline: Instant,
}
