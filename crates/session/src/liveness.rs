//! Ping/heartbeat deadline tracking.
//!
//! Heartbeats are sent every third of the negotiated ping interval so the
//! peer sees liveness well before its own timeout; the receive deadline is
//! the full interval. Crossing the receive deadline with no traffic since
//! the last reset is a fatal liveness failure, reported exactly once.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessCheck {
    Ok,
    /// Caller must send a heartbeat and report it via `mark_sent`.
    SendHeartbeat,
    /// Fatal; the session must be torn down.
    Violated,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    interval: Duration,
    send_deadline: Instant,
    recv_deadline: Instant,
    received_since_check: bool,
    violated: bool,
}

impl LivenessMonitor {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            send_deadline: now + interval / 3,
            recv_deadline: now + interval,
            received_since_check: false,
            violated: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record outbound traffic (heartbeat or data).
    pub fn mark_sent(&mut self, now: Instant) {
        self.send_deadline = now + self.interval / 3;
    }

    /// Record inbound traffic (data frame or explicit ping).
    pub fn observe_traffic(&mut self, now: Instant) {
        self.received_since_check = true;
        self.recv_deadline = now + self.interval;
    }

    /// Called once per loop iteration. Violation is latched so teardown is
    /// triggered exactly once, not on every subsequent tick.
    pub fn tick(&mut self, now: Instant) -> LivenessCheck {
        if self.violated {
            return LivenessCheck::Ok;
        }

        if now >= self.recv_deadline {
            if self.received_since_check {
                self.received_since_check = false;
                self.recv_deadline = now + self.interval;
            } else {
                self.violated = true;
                return LivenessCheck::Violated;
            }
        }

        if now >= self.send_deadline {
            return LivenessCheck::SendHeartbeat;
        }

        LivenessCheck::Ok
    }
}
