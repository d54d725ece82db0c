//! Transport seam.
//!
//! The event loop drives any `Transport` implementation; production uses
//! `TcpSession`, tests use a scripted mock. Every operation reports its
//! outcome through a tagged enum so callers pattern-match exhaustively
//! instead of comparing sentinel return codes. `Fatal` is terminal for the
//! session; `WouldBlock`/`Pending`/`InProgress` are routine backpressure.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::SessionError;

/// Raw readiness descriptor, surfaced so descriptor swaps during the
/// handshake can be observed by the driver.
pub type Descriptor = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Active,
    Closed,
}

/// Values fixed by the handshake; immutable once the session is Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub major: u8,
    pub minor: u8,
    pub ping_interval: Duration,
    pub max_fragment_size: usize,
}

#[derive(Debug)]
pub enum HandshakeStatus {
    InProgress,
    /// The negotiation moved to a new socket (e.g. a redirect mid
    /// handshake). The driver must swap its readiness registration from
    /// `old` to `new` before continuing.
    DescriptorChanged { old: Descriptor, new: Descriptor },
    Active(Negotiated),
    Failed(SessionError),
}

#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    /// Enqueued but not fully drained; retry via `flush` before assuming
    /// delivery.
    PartiallySent,
    /// Outbound queue is full; nothing was enqueued.
    WouldBlock,
    Fatal(SessionError),
}

#[derive(Debug)]
pub enum FlushOutcome {
    Drained,
    Pending,
    Fatal(SessionError),
}

#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Bytes),
    /// Explicit liveness traffic, no payload to route.
    Ping,
    WouldBlock,
    Fatal(SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Bounded wait elapsed with nothing ready; a liveness-tick
    /// opportunity, not an error.
    pub timed_out: bool,
}

impl Readiness {
    pub fn timeout() -> Self {
        Self {
            readable: false,
            writable: false,
            timed_out: true,
        }
    }
}

#[async_trait]
pub trait Transport: Send {
    /// Drive connection establishment. Must be called repeatedly until it
    /// returns `Active` or `Failed`.
    async fn advance_handshake(&mut self) -> HandshakeStatus;

    /// Wait for readiness with a bounded timeout.
    async fn ready(&mut self, want_write: bool, max_wait: Duration)
        -> Result<Readiness, SessionError>;

    /// Enqueue one encoded frame, draining opportunistically.
    fn send(&mut self, frame: &[u8]) -> SendOutcome;

    /// Enqueue a heartbeat frame.
    fn send_ping(&mut self) -> SendOutcome;

    /// Push queued bytes toward the peer.
    fn flush(&mut self) -> FlushOutcome;

    /// Non-blocking pull of one inbound frame or ping.
    fn receive(&mut self) -> ReadOutcome;

    fn has_pending_output(&self) -> bool;

    fn state(&self) -> SessionState;

    fn negotiated(&self) -> Option<&Negotiated>;

    /// Release the connection and buffers. Idempotent.
    fn close(&mut self);
}
