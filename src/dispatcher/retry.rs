//! Retry decisions for failed commands
//!
//! A failed attempt is resubmitted through the live view of the ring when
//! the error is recoverable and the command still has retries left.
//! Reconnecting to a down server is paced separately by [`Backoff`].
use crate::core::QueuedCommand;
use crate::error::MemringError;
use crate::health::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reroute and resubmit
    Retry,
    /// Deliver the error to the caller
    Fail,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Reconnect pacing for down servers
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn decide(
        &self,
        command: &QueuedCommand,
        error: &MemringError,
        stopping: bool,
    ) -> RetryDecision {
        if stopping || !error.is_recoverable() || command.is_abandoned() {
            return RetryDecision::Fail;
        }
        if command.retries >= self.max_retries {
            RetryDecision::Fail
        } else {
            RetryDecision::Retry
        }
    }
}
