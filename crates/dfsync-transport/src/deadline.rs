//! Deadline propagation for RPC calls.
//!
//! Clients send a relative `timeout_ms`; the server turns it into an absolute
//! [`Deadline`] the moment the call arrives, so clock skew between hosts does
//! not matter.

use std::time::{Duration, Instant};

use crate::status::RpcStatus;

/// Absolute point in time after which a call is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Creates a new deadline from now + timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Creates a deadline `timeout_ms` milliseconds from now.
    pub fn from_timeout_ms(timeout_ms: u64) -> Self {
        Self::new(Duration::from_millis(timeout_ms))
    }

    /// Returns the remaining time, or `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
    }

    /// Returns `true` if the deadline has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// The instant the deadline fires.
    pub fn instant(&self) -> Instant {
        self.at
    }
}

/// Holds an optional deadline for one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineContext {
    deadline: Option<Deadline>,
}

impl DeadlineContext {
    /// Creates a new context with no deadline.
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Creates a context from an optional relative timeout.
    pub fn from_timeout_ms(timeout_ms: Option<u64>) -> Self {
        Self {
            deadline: timeout_ms.map(Deadline::from_timeout_ms),
        }
    }

    /// Creates a new context with a deadline set to now + timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Deadline::new(timeout)),
        }
    }

    /// Returns the deadline, if one is set.
    pub fn deadline(&self) -> Option<&Deadline> {
        self.deadline.as_ref()
    }

    /// Returns `true` if a deadline is set and has expired.
    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| d.is_expired()).unwrap_or(false)
    }

    /// Returns the remaining time. `None` if unset or expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.and_then(|d| d.remaining())
    }

    /// `Err(DEADLINE_EXCEEDED)` once expired.
    pub fn check(&self) -> Result<(), RpcStatus> {
        if self.is_expired() {
            return Err(RpcStatus::deadline_exceeded("deadline exceeded"));
        }
        Ok(())
    }
}
