//! Market-data consumer session core.
//!
//! Transport session with framing and handshake, liveness monitoring,
//! message codec boundary, login/directory/dictionary bootstrap, item
//! subscription tracking, and the single-task event loop that drives them.

pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dictionary;
pub mod directory;
pub mod error;
pub mod liveness;
pub mod message;
pub mod session;
pub mod subscription;
pub mod transport;

pub use bootstrap::{Bootstrap, BootstrapPhase};
pub use codec::{JsonCodec, MessageCodec};
pub use config::ConsumerConfig;
pub use consumer::{run_consumer, Consumer};
pub use dictionary::{DataDictionary, DictionaryKind, DictionaryStore};
pub use directory::{DirectoryBounds, ServiceInfo};
pub use error::{
    BootstrapError, CodecError, ConfigError, ConsumerError, DictionaryError, SessionError,
};
pub use liveness::{LivenessCheck, LivenessMonitor};
pub use message::{DataState, DomainType, MessageClass, MsgState, StreamState, TypedMessage};
pub use session::TcpSession;
pub use subscription::{DecodedField, Subscription, SubscriptionManager};
pub use transport::{
    FlushOutcome, HandshakeStatus, Negotiated, ReadOutcome, Readiness, SendOutcome, SessionState,
    Transport,
};
