//! Message codec boundary.
//!
//! The session core never touches wire bytes directly; it hands frames to a
//! `MessageCodec` and works with `TypedMessage` values. The JSON codec below
//! is the in-tree implementation; anything satisfying the trait can replace
//! it.

use bytes::Bytes;

use crate::error::CodecError;
use crate::message::TypedMessage;

pub trait MessageCodec: Send {
    fn encode(&self, msg: &TypedMessage) -> Result<Bytes, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<TypedMessage, CodecError>;
}

/// JSON encoding of `TypedMessage`, one message per frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, msg: &TypedMessage) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(msg)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<TypedMessage, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
