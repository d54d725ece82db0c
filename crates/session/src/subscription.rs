//! Item subscription tracking.
//!
//! One `Subscription` per outstanding item stream. Stream ids are unique
//! for the life of the session and never reused; per-stream state only
//! moves toward Closed, and a Closed stream ignores any further traffic.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::dictionary::DictionaryStore;
use crate::message::{
    DataState, DomainType, MessageClass, StreamState, TypedMessage, FIRST_ITEM_STREAM_ID,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub stream_id: i32,
    pub item_name: String,
    pub service_id: u16,
    pub streaming: bool,
    pub stream_state: StreamState,
    pub data_state: DataState,
    /// Set once the initial refresh arrived; updates before it indicate a
    /// misbehaving provider.
    pub refresh_seen: bool,
}

/// Field value decoded against the dictionary, surfaced to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    pub fid: u16,
    pub name: String,
    pub value: String,
}

pub struct SubscriptionManager {
    next_stream_id: i32,
    subscriptions: HashMap<i32, Subscription>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            next_stream_id: FIRST_ITEM_STREAM_ID,
            subscriptions: HashMap::new(),
        }
    }

    pub fn get(&self, stream_id: i32) -> Option<&Subscription> {
        self.subscriptions.get(&stream_id)
    }

    pub fn open_count(&self) -> usize {
        self.subscriptions
            .values()
            .filter(|s| !s.stream_state.is_final())
            .count()
    }

    /// Allocate a stream id and build the item request. Ids are never
    /// reused, even after the stream closes.
    pub fn open(
        &mut self,
        service_id: u16,
        item_name: &str,
        streaming: bool,
    ) -> (i32, TypedMessage) {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;

        self.subscriptions.insert(
            stream_id,
            Subscription {
                stream_id,
                item_name: item_name.to_string(),
                service_id,
                streaming,
                stream_state: StreamState::Open,
                data_state: DataState::Ok,
                refresh_seen: false,
            },
        );
        info!(stream_id, item = %item_name, service_id, streaming, "opening item stream");

        let request = TypedMessage::request(
            DomainType::MarketPrice,
            stream_id,
            serde_json::json!({
                "item_name": item_name,
                "service_id": service_id,
                "streaming": streaming,
            }),
        );
        (stream_id, request)
    }

    /// Route an inbound market-price message to its stream. Decoded field
    /// values are returned for display; stream/data state updates happen
    /// here.
    pub fn on_message(
        &mut self,
        msg: &TypedMessage,
        dictionary: &dyn DictionaryStore,
    ) -> Vec<DecodedField> {
        let Some(sub) = self.subscriptions.get_mut(&msg.stream_id) else {
            warn!(stream_id = msg.stream_id, "message for unknown item stream");
            return Vec::new();
        };
        if sub.stream_state.is_final() {
            // Closed is terminal; late traffic for the stream is dropped.
            debug!(stream_id = sub.stream_id, "ignoring traffic on closed stream");
            return Vec::new();
        }

        match msg.class {
            MessageClass::Refresh => {
                if let Some(state) = &msg.state {
                    apply_state(sub, state.stream_state, state.data_state, state.text());
                }
                sub.refresh_seen = true;
                decode_payload(msg, dictionary)
            }
            MessageClass::Update => {
                if !sub.refresh_seen {
                    warn!(
                        stream_id = sub.stream_id,
                        "update before initial refresh on item stream"
                    );
                }
                decode_payload(msg, dictionary)
            }
            MessageClass::Status => {
                if let Some(state) = &msg.state {
                    apply_state(sub, state.stream_state, state.data_state, state.text());
                }
                Vec::new()
            }
            other => {
                warn!(class = ?other, stream_id = sub.stream_id, "unexpected item message class");
                Vec::new()
            }
        }
    }

    /// Close one stream: returns the close message to send if the stream
    /// was still open. The local state is torn down regardless of whether
    /// the send later succeeds.
    pub fn close(&mut self, stream_id: i32) -> Option<TypedMessage> {
        let sub = self.subscriptions.get_mut(&stream_id)?;
        if sub.stream_state.is_final() {
            return None;
        }
        sub.stream_state = StreamState::Closed;
        info!(stream_id, item = %sub.item_name, "closing item stream");
        Some(TypedMessage::close(DomainType::MarketPrice, stream_id))
    }

    /// Close every open stream; used during graceful shutdown.
    pub fn close_all(&mut self) -> Vec<TypedMessage> {
        let open: Vec<i32> = self
            .subscriptions
            .values()
            .filter(|s| !s.stream_state.is_final())
            .map(|s| s.stream_id)
            .collect();
        open.into_iter().filter_map(|id| self.close(id)).collect()
    }
}

fn apply_state(
    sub: &mut Subscription,
    stream_state: StreamState,
    data_state: DataState,
    text: &str,
) {
    match stream_state {
        StreamState::Closed => {
            info!(stream_id = sub.stream_id, text = %text, "item stream closed by provider");
        }
        StreamState::ClosedRecover => {
            // Recoverable: the provider dropped the stream but a later
            // re-open may succeed. Surfaced, not automated.
            warn!(stream_id = sub.stream_id, text = %text, "item stream closed, recovery possible");
        }
        StreamState::Open if data_state == DataState::Suspect => {
            warn!(stream_id = sub.stream_id, text = %text, "item stream suspect");
        }
        _ => {}
    }
    sub.stream_state = stream_state;
    sub.data_state = data_state;
}

fn decode_payload(msg: &TypedMessage, dictionary: &dyn DictionaryStore) -> Vec<DecodedField> {
    let Some(fields) = msg
        .payload
        .as_ref()
        .and_then(|p| p.get("fields"))
        .and_then(|f| f.as_object())
    else {
        return Vec::new();
    };

    let mut decoded = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        let Ok(fid) = key.parse::<u16>() else {
            warn!(field = %key, "non-numeric field id in payload");
            continue;
        };
        match dictionary.lookup(fid) {
            Some(def) => {
                let display = if def.field_type == "enum" {
                    value
                        .as_i64()
                        .and_then(|v| dictionary.enum_display(fid, v))
                        .map(str::to_string)
                        .unwrap_or_else(|| value.to_string())
                } else {
                    value.to_string()
                };
                decoded.push(DecodedField {
                    fid,
                    name: def.name.clone(),
                    value: display,
                });
            }
            None => {
                debug!(fid, "field id not in dictionary");
                decoded.push(DecodedField {
                    fid,
                    name: format!("FID_{fid}"),
                    value: value.to_string(),
                });
            }
        }
    }
    decoded
}
