//! TCP transport session.
//!
//! Owns the outbound connection, its handshake, and the framing layer:
//! a 4-byte big-endian payload length plus a 1-byte frame kind. Data and
//! control payloads inside frames belong to the codec and the handshake
//! respectively; this module never interprets message contents.
//!
//! All post-handshake I/O is non-blocking (`try_read`/`try_write`); the
//! only awaits are connection establishment and the driver's bounded
//! readiness wait.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, info, trace};

use crate::config::ConsumerConfig;
use crate::error::SessionError;
use crate::transport::{
    Descriptor, FlushOutcome, HandshakeStatus, Negotiated, ReadOutcome, Readiness, SendOutcome,
    SessionState, Transport,
};

/// Protocol version proposed in the hello frame.
pub const PROTOCOL_MAJOR: u8 = 14;
pub const PROTOCOL_MINOR: u8 = 1;

/// Ping interval proposed to the peer; the accept frame fixes the final
/// value.
const PROPOSED_PING_INTERVAL_SECS: u64 = 60;
const PROPOSED_MAX_FRAGMENT_SIZE: usize = 6144;

const FRAME_HEADER_LEN: usize = 5;
const MAX_FRAME_LEN: usize = 1024 * 1024;
/// Outbound queue high-water mark; sends beyond this would-block.
const OUTBOUND_HIGH_WATER: usize = 64 * 1024;

const FRAME_PING: u8 = 0x01;
const FRAME_MSG: u8 = 0x02;
const FRAME_HELLO: u8 = 0x10;
const FRAME_ACCEPT: u8 = 0x11;
const FRAME_REDIRECT: u8 = 0x12;

#[derive(Debug, Serialize, Deserialize)]
struct HelloFrame {
    major: u8,
    minor: u8,
    ping_interval_secs: u64,
    max_fragment_size: usize,
}

#[derive(Debug, Deserialize)]
struct RedirectFrame {
    host: Option<String>,
    port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakePhase {
    Connect,
    AwaitAccept,
}

pub struct TcpSession {
    host: String,
    port: u16,
    interface: Option<String>,
    stream: Option<TcpStream>,
    state: SessionState,
    phase: HandshakePhase,
    negotiated: Option<Negotiated>,
    inbound: BytesMut,
    outbound: BytesMut,
}

impl TcpSession {
    /// Prepare a session for the configured endpoint. No I/O happens here;
    /// the handshake is driven by `advance_handshake`.
    pub fn connect(config: &ConsumerConfig) -> Result<Self, SessionError> {
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            interface: config.interface.clone(),
            stream: None,
            state: SessionState::Connecting,
            phase: HandshakePhase::Connect,
            negotiated: None,
            inbound: BytesMut::with_capacity(8 * 1024),
            outbound: BytesMut::with_capacity(8 * 1024),
        })
    }

    async fn establish(&mut self, host: &str, port: u16) -> Result<(), SessionError> {
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| SessionError::AddressResolution(format!("{host}:{port}")))?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        if let Some(ref interface) = self.interface {
            let ip: IpAddr = interface
                .parse()
                .map_err(|_| SessionError::AddressResolution(interface.clone()))?;
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = %addr, "tcp connection established");
        self.stream = Some(stream);
        self.inbound.clear();
        Ok(())
    }

    async fn send_hello(&mut self) -> Result<(), SessionError> {
        let hello = HelloFrame {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            ping_interval_secs: PROPOSED_PING_INTERVAL_SECS,
            max_fragment_size: PROPOSED_MAX_FRAGMENT_SIZE,
        };
        let payload =
            serde_json::to_vec(&hello).map_err(|e| SessionError::Malformed(e.to_string()))?;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_u8(FRAME_HELLO);
        frame.put_slice(&payload);

        let stream = self.stream.as_mut().ok_or(SessionError::NotActive)?;
        stream.write_all(&frame).await?;
        Ok(())
    }

    /// Pull one complete frame out of the inbound buffer, if present.
    fn parse_frame(&mut self) -> Result<Option<(u8, Bytes)>, SessionError> {
        if self.inbound.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.inbound[0..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(SessionError::Malformed(format!(
                "frame length {len} exceeds limit"
            )));
        }
        if self.inbound.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let kind = self.inbound[4];
        self.inbound.advance(FRAME_HEADER_LEN);
        let payload = self.inbound.split_to(len).freeze();
        Ok(Some((kind, payload)))
    }

    /// Blocking read of one frame; only used while the handshake owns the
    /// socket.
    async fn read_control_frame(&mut self) -> Result<(u8, Bytes), SessionError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }
            let read = match self.stream.as_mut() {
                Some(stream) => stream.read_buf(&mut self.inbound).await?,
                None => return Err(SessionError::NotActive),
            };
            if read == 0 {
                return Err(SessionError::PeerClosed);
            }
        }
    }

    async fn await_accept(&mut self) -> Result<HandshakeStatus, SessionError> {
        let (kind, payload) = self.read_control_frame().await?;
        match kind {
            FRAME_ACCEPT => {
                let accept: HelloFrame = serde_json::from_slice(&payload)
                    .map_err(|e| SessionError::Malformed(e.to_string()))?;
                if accept.major != PROTOCOL_MAJOR {
                    return Err(SessionError::HandshakeRejected(format!(
                        "peer negotiated protocol {}.{}, expected major {}",
                        accept.major, accept.minor, PROTOCOL_MAJOR
                    )));
                }
                if accept.ping_interval_secs == 0 {
                    return Err(SessionError::HandshakeRejected(
                        "zero ping interval".to_string(),
                    ));
                }
                let negotiated = Negotiated {
                    major: accept.major,
                    minor: accept.minor,
                    ping_interval: Duration::from_secs(accept.ping_interval_secs),
                    max_fragment_size: accept.max_fragment_size,
                };
                self.negotiated = Some(negotiated);
                self.state = SessionState::Active;
                info!(
                    major = negotiated.major,
                    minor = negotiated.minor,
                    ping_interval_secs = accept.ping_interval_secs,
                    max_fragment_size = negotiated.max_fragment_size,
                    "session active"
                );
                Ok(HandshakeStatus::Active(negotiated))
            }
            FRAME_REDIRECT => {
                let redirect: RedirectFrame = serde_json::from_slice(&payload)
                    .map_err(|e| SessionError::Malformed(e.to_string()))?;
                let old = self.descriptor().ok_or(SessionError::NotActive)?;
                let host = redirect.host.unwrap_or_else(|| self.host.clone());
                info!(host = %host, port = redirect.port, "handshake redirected");
                self.establish(&host, redirect.port).await?;
                self.send_hello().await?;
                let new = self.descriptor().ok_or(SessionError::NotActive)?;
                Ok(HandshakeStatus::DescriptorChanged { old, new })
            }
            other => Err(SessionError::Malformed(format!(
                "unexpected frame kind {other:#x} during handshake"
            ))),
        }
    }

    fn descriptor(&self) -> Option<Descriptor> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn enqueue_frame(&mut self, kind: u8, payload: &[u8]) -> SendOutcome {
        if self.state != SessionState::Active {
            return SendOutcome::Fatal(SessionError::NotActive);
        }
        if let Some(neg) = self.negotiated {
            if payload.len() > neg.max_fragment_size {
                return SendOutcome::Fatal(SessionError::FrameTooLarge {
                    len: payload.len(),
                    max: neg.max_fragment_size,
                });
            }
        }
        if self.outbound.len() + FRAME_HEADER_LEN + payload.len() > OUTBOUND_HIGH_WATER {
            return SendOutcome::WouldBlock;
        }
        self.outbound.put_u32(payload.len() as u32);
        self.outbound.put_u8(kind);
        self.outbound.put_slice(payload);

        match self.flush() {
            FlushOutcome::Drained => SendOutcome::Sent,
            FlushOutcome::Pending => SendOutcome::PartiallySent,
            FlushOutcome::Fatal(e) => SendOutcome::Fatal(e),
        }
    }
}

#[async_trait]
impl Transport for TcpSession {
    async fn advance_handshake(&mut self) -> HandshakeStatus {
        match self.state {
            SessionState::Active => {
                if let Some(negotiated) = self.negotiated {
                    return HandshakeStatus::Active(negotiated);
                }
                return HandshakeStatus::Failed(SessionError::NotActive);
            }
            SessionState::Closed | SessionState::Disconnected => {
                return HandshakeStatus::Failed(SessionError::NotActive);
            }
            SessionState::Connecting => {}
        }

        match self.phase {
            HandshakePhase::Connect => {
                let host = self.host.clone();
                let port = self.port;
                if let Err(e) = self.establish(&host, port).await {
                    self.state = SessionState::Closed;
                    return HandshakeStatus::Failed(e);
                }
                if let Err(e) = self.send_hello().await {
                    self.state = SessionState::Closed;
                    return HandshakeStatus::Failed(e);
                }
                self.phase = HandshakePhase::AwaitAccept;
                HandshakeStatus::InProgress
            }
            HandshakePhase::AwaitAccept => match self.await_accept().await {
                Ok(status) => status,
                Err(e) => {
                    self.state = SessionState::Closed;
                    HandshakeStatus::Failed(e)
                }
            },
        }
    }

    async fn ready(
        &mut self,
        want_write: bool,
        max_wait: Duration,
    ) -> Result<Readiness, SessionError> {
        let stream = self.stream.as_ref().ok_or(SessionError::NotActive)?;
        let interest = if want_write {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        match tokio::time::timeout(max_wait, stream.ready(interest)).await {
            Err(_) => Ok(Readiness::timeout()),
            Ok(Ok(ready)) => Ok(Readiness {
                readable: ready.is_readable(),
                writable: ready.is_writable(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(SessionError::Io(e)),
        }
    }

    fn send(&mut self, frame: &[u8]) -> SendOutcome {
        self.enqueue_frame(FRAME_MSG, frame)
    }

    fn send_ping(&mut self) -> SendOutcome {
        trace!("sending heartbeat");
        self.enqueue_frame(FRAME_PING, &[])
    }

    fn flush(&mut self) -> FlushOutcome {
        let stream = match (self.state, self.stream.as_ref()) {
            (SessionState::Active, Some(stream)) => stream,
            _ => return FlushOutcome::Fatal(SessionError::NotActive),
        };
        while !self.outbound.is_empty() {
            match stream.try_write(&self.outbound) {
                Ok(written) => {
                    self.outbound.advance(written);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return FlushOutcome::Pending;
                }
                Err(e) => return FlushOutcome::Fatal(SessionError::Io(e)),
            }
        }
        FlushOutcome::Drained
    }

    fn receive(&mut self) -> ReadOutcome {
        if self.state != SessionState::Active {
            return ReadOutcome::Fatal(SessionError::NotActive);
        }
        loop {
            match self.parse_frame() {
                Err(e) => return ReadOutcome::Fatal(e),
                Ok(Some((FRAME_PING, _))) => {
                    trace!("ping observed");
                    return ReadOutcome::Ping;
                }
                Ok(Some((FRAME_MSG, payload))) => return ReadOutcome::Frame(payload),
                Ok(Some((kind, _))) => {
                    return ReadOutcome::Fatal(SessionError::Malformed(format!(
                        "unexpected frame kind {kind:#x} on active session"
                    )))
                }
                Ok(None) => {}
            }

            let read = match self.stream.as_ref() {
                Some(stream) => stream.try_read_buf(&mut self.inbound),
                None => return ReadOutcome::Fatal(SessionError::NotActive),
            };
            match read {
                Ok(0) => return ReadOutcome::Fatal(SessionError::PeerClosed),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return ReadOutcome::WouldBlock;
                }
                Err(e) => return ReadOutcome::Fatal(SessionError::Io(e)),
            }
        }
    }

    fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        debug!("closing session");
        self.state = SessionState::Closed;
        self.stream = None;
        self.inbound.clear();
        self.outbound.clear();
    }
}
