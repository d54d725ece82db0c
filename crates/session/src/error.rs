use thiserror::Error;

/// Errors terminal for the transport session. Anything routine
/// (backpressure, partial writes, handshake still in flight) is reported
/// through the outcome enums in `transport`, never as an error.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("session is not active")]
    NotActive,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame of {len} bytes exceeds negotiated fragment size {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("could not resolve {0}")]
    AddressResolution(String),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("undecodable message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DictionaryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad dictionary line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("dictionary part declared type {declared}, expected {expected}")]
    KindMismatch { declared: String, expected: String },
    #[error("malformed dictionary part: {0}")]
    MalformedPart(String),
}

/// Fatal bootstrap outcomes. None of these are retried within a run.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("login denied: {0}")]
    LoginDenied(String),
    #[error("service {0} not found in source directory")]
    ServiceNotFound(String),
    #[error("service {0} is down or not accepting requests")]
    ServiceDown(String),
    #[error("service {service} does not support the {domain} domain")]
    DomainNotSupported { service: String, domain: String },
    #[error("dictionary {0} is not available for download")]
    DictionaryUnavailable(String),
    #[error("dictionary error: {0}")]
    Dictionary(#[from] DictionaryError),
    #[error("service {0} withdrawn while streams were open")]
    ServiceWithdrawn(String),
    #[error("malformed {domain} message: {reason}")]
    Malformed { domain: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top-level error for a consumer run. The binary maps any of these to a
/// non-zero exit code; a clean run-time expiry returns `Ok`.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("connection failed: {0}")]
    ConnectFailed(SessionError),
    #[error("session error: {0}")]
    Session(SessionError),
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("no traffic from peer within the negotiated ping interval")]
    LivenessViolation,
    #[error("outbound queue full, request could not be enqueued")]
    Backpressure,
}
