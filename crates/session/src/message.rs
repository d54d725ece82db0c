//! Typed message model shared by the codec boundary and the state machines.
//!
//! The wire encoding is the codec's business; everything above it routes on
//! message class, domain and stream id, and inspects the tri-part state
//! carried by refresh and status messages.

use serde::{Deserialize, Serialize};

/// Login stream id, fixed for the life of the session.
pub const LOGIN_STREAM_ID: i32 = 1;
/// Source directory stream id.
pub const SRCDIR_STREAM_ID: i32 = 2;
/// Field definitions dictionary download stream id.
pub const FIELD_DICTIONARY_STREAM_ID: i32 = 3;
/// Enumerated types dictionary download stream id.
pub const ENUM_TYPE_DICTIONARY_STREAM_ID: i32 = 4;
/// Item streams are allocated from here; ids below are reserved.
pub const FIRST_ITEM_STREAM_ID: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Request,
    Refresh,
    Update,
    Status,
    Close,
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainType {
    Login,
    Directory,
    Dictionary,
    MarketPrice,
}

impl DomainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Login => "login",
            DomainType::Directory => "directory",
            DomainType::Dictionary => "dictionary",
            DomainType::MarketPrice => "market_price",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Open,
    NonStreaming,
    Closed,
    ClosedRecover,
}

impl StreamState {
    /// Closed and ClosedRecover both end the stream; only ClosedRecover
    /// invites a later re-open.
    pub fn is_final(&self) -> bool {
        matches!(self, StreamState::Closed | StreamState::ClosedRecover)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataState {
    Ok,
    Suspect,
}

/// Tri-part state carried by refresh and status messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgState {
    pub stream_state: StreamState,
    pub data_state: DataState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl MsgState {
    pub fn open_ok() -> Self {
        Self {
            stream_state: StreamState::Open,
            data_state: DataState::Ok,
            text: None,
        }
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// Decoded message as exposed by the codec boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedMessage {
    pub class: MessageClass,
    pub domain: DomainType,
    pub stream_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<MsgState>,
    /// True when a refresh answers our request rather than being pushed.
    #[serde(default)]
    pub solicited: bool,
    /// Refresh-complete flag; multi-part refreshes clear it on all but the
    /// last part.
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl TypedMessage {
    /// Streaming request with an attribute payload.
    pub fn request(domain: DomainType, stream_id: i32, payload: serde_json::Value) -> Self {
        Self {
            class: MessageClass::Request,
            domain,
            stream_id,
            state: None,
            solicited: false,
            complete: false,
            payload: Some(payload),
        }
    }

    /// Close message for an open stream.
    pub fn close(domain: DomainType, stream_id: i32) -> Self {
        Self {
            class: MessageClass::Close,
            domain,
            stream_id,
            state: None,
            solicited: false,
            complete: false,
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_state_finality() {
        assert!(!StreamState::Open.is_final());
        assert!(!StreamState::NonStreaming.is_final());
        assert!(StreamState::Closed.is_final());
        assert!(StreamState::ClosedRecover.is_final());
    }

    #[test]
    fn test_reserved_stream_ids_precede_item_ids() {
        assert!(LOGIN_STREAM_ID < SRCDIR_STREAM_ID);
        assert!(ENUM_TYPE_DICTIONARY_STREAM_ID < FIRST_ITEM_STREAM_ID);
    }
}
