//! Server liveness tracking
//!
//! Each server walks a small state machine driven by connection outcomes:
//!
//! ```text
//! Up      -> Down     I/O or protocol failure on its connection
//! Down    -> Probing  backoff elapsed, reconnect attempt started
//! Probing -> Up       handshake completed
//! Probing -> Down     probe failed, backoff grows
//! ```
pub mod backoff;

pub use backoff::Backoff;

use std::fmt;
use std::time::{Duration, Instant};

/// Liveness state of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Up,
    Probing,
    Down,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Up => write!(f, "Up"),
            ServerState::Probing => write!(f, "Probing"),
            ServerState::Down => write!(f, "Down"),
        }
    }
}

/// Failure bookkeeping for one server
#[derive(Debug, Clone)]
pub struct Liveness {
    state: ServerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    retry_at: Option<Instant>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            state: ServerState::Up,
            consecutive_failures: 0,
            last_failure: None,
            retry_at: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == ServerState::Up
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Record a failure and schedule the next probe; returns the chosen delay
    pub fn mark_failed(&mut self, now: Instant, backoff: &Backoff) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        let delay = backoff.delay(self.consecutive_failures);
        self.retry_at = Some(now + delay);
        self.state = ServerState::Down;
        delay
    }

    pub fn mark_recovered(&mut self) {
        self.state = ServerState::Up;
        self.consecutive_failures = 0;
        self.retry_at = None;
    }

    /// Down and the backoff has elapsed
    pub fn probe_due(&self, now: Instant) -> bool {
        self.state == ServerState::Down && self.retry_at.map_or(true, |at| at <= now)
    }

    pub fn begin_probe(&mut self) {
        if self.state == ServerState::Down {
            self.state = ServerState::Probing;
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}
