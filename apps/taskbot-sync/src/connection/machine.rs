//! Pure connection lifecycle: no IO, no timers. The driver feeds it events
//! and executes the [`Step`] it returns.

use std::time::Duration;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable snapshot of the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Reconnect attempt in progress; 0 outside a reconnect cycle.
    pub attempt: u32,
    pub last_error: Option<SyncError>,
}

impl ConnectionStatus {
    pub fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// `base_delay * 2^(attempt-1)`; attempt numbering starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_attempts: 5,
        }
    }
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Open a socket now.
    Open,
    /// Sleep, then report [`Machine::backoff_elapsed`].
    Backoff(Duration),
    /// Reconnect budget spent; the machine is now `Disconnected`.
    GiveUp,
    /// Nothing to do.
    Idle,
}

#[derive(Debug)]
pub struct Machine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
    last_error: Option<SyncError>,
}

impl Machine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempt: self.attempt,
            last_error: self.last_error.clone(),
        }
    }

    /// Caller asked to connect. Already connected is a no-op; anything else
    /// (including a pending backoff) starts over with a fresh budget.
    pub fn connect_requested(&mut self) -> Step {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => Step::Idle,
            _ => {
                self.state = ConnectionState::Connecting;
                self.attempt = 0;
                self.last_error = None;
                Step::Open
            }
        }
    }

    pub fn opened(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        self.last_error = None;
    }

    /// The socket could not be opened. The first, caller-initiated attempt
    /// fails into `Error`; attempts inside a reconnect cycle keep cycling.
    pub fn open_failed(&mut self, error: SyncError) -> Step {
        if self.state != ConnectionState::Connecting {
            return Step::Idle;
        }
        if self.attempt == 0 {
            self.state = ConnectionState::Error;
            self.last_error = Some(error);
            Step::Idle
        } else {
            self.schedule_retry(error)
        }
    }

    /// The socket ended without us asking (close frame, network loss,
    /// heartbeat timeout).
    pub fn unclean_close(&mut self, error: SyncError) -> Step {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.schedule_retry(error)
            }
            _ => Step::Idle,
        }
    }

    pub fn backoff_elapsed(&mut self) -> Step {
        if self.state != ConnectionState::Reconnecting {
            return Step::Idle;
        }
        self.state = ConnectionState::Connecting;
        Step::Open
    }

    /// Returns whether anything changed; disconnecting twice is harmless.
    pub fn disconnect(&mut self) -> bool {
        if self.state == ConnectionState::Disconnected && self.attempt == 0 {
            return false;
        }
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
        true
    }

    /// Unrecoverable failure such as a rejected token. Only an explicit
    /// `connect` leaves this state.
    pub fn fail(&mut self, error: SyncError) {
        self.state = ConnectionState::Error;
        self.attempt = 0;
        self.last_error = Some(error);
    }

    fn schedule_retry(&mut self, error: SyncError) -> Step {
        self.last_error = Some(error);
        if self.attempt < self.policy.max_attempts {
            self.attempt += 1;
            self.state = ConnectionState::Reconnecting;
            Step::Backoff(self.policy.delay_for(self.attempt))
        } else {
            let attempts = self.attempt;
            self.state = ConnectionState::Disconnected;
            self.attempt = 0;
            self.last_error = Some(SyncError::ReconnectExhausted(attempts));
            Step::GiveUp
        }
    }
}
