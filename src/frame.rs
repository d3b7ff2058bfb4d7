//! Wire frames exchanged with clients.
//!
//! All frames are JSON arrays whose first element is the opcode:
//!
//! **Client → relay:**
//! - `["EVENT", <event>]`
//! - `["REQ", <sub-id>, <filter>, ...]`
//! - `["CLOSE", <sub-id>]`
//!
//! **Relay → client:**
//! - `["EVENT", <sub-id>, <event>]`
//! - `["OK", <event-id>, <bool>, <reason>]`
//! - `["EOSE", <sub-id>]`
//! - `["CLOSED", <sub-id>, <reason>]`
//! - `["NOTICE", <text>]`

use serde_json::Value;

use crate::error::FrameError;
use crate::event::Event;
use crate::filter::Filter;

/// Frames sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Publish an event.
    Event(Event),
    /// Open (or overwrite) a subscription.
    Req { sub_id: String, filters: Vec<Filter> },
    /// Close a subscription.
    Close { sub_id: String },
}

impl ClientFrame {
    /// Parse a raw text frame.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(raw).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        if arr.is_empty() {
            return Err(FrameError::InvalidFormat("empty array".into()));
        }
        let opcode = arr[0]
            .as_str()
            .ok_or_else(|| FrameError::InvalidFormat("first element not a string".into()))?;
        match opcode {
            "EVENT" => {
                let raw_event = arr.get(1).ok_or(FrameError::MissingField("event".into()))?;
                let event: Event = serde_json::from_value(raw_event.clone())
                    .map_err(|e| FrameError::InvalidFormat(format!("invalid event: {e}")))?;
                Ok(ClientFrame::Event(event))
            }
            "REQ" => {
                let sub_id = arr
                    .get(1)
                    .and_then(|v| v.as_str())
                    .ok_or(FrameError::MissingField("subscription id".into()))?
                    .to_string();
                if arr.len() < 3 {
                    return Err(FrameError::MissingField("filter".into()));
                }
                let mut filters = Vec::with_capacity(arr.len() - 2);
                for raw_filter in arr.iter().skip(2) {
                    let filter: Filter = serde_json::from_value(raw_filter.clone())
                        .map_err(|e| FrameError::InvalidFormat(format!("invalid filter: {e}")))?;
                    filters.push(filter);
                }
                Ok(ClientFrame::Req { sub_id, filters })
            }
            "CLOSE" => {
                let sub_id = arr
                    .get(1)
                    .and_then(|v| v.as_str())
                    .ok_or(FrameError::MissingField("subscription id".into()))?
                    .to_string();
                Ok(ClientFrame::Close { sub_id })
            }
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }

    /// Serialize back to the wire form.
    pub fn to_json(&self) -> String {
        match self {
            ClientFrame::Event(event) => serde_json::json!(["EVENT", event]).to_string(),
            ClientFrame::Req { sub_id, filters } => {
                let mut arr = vec![Value::String("REQ".into()), Value::String(sub_id.clone())];
                for f in filters {
                    arr.push(serde_json::to_value(f).unwrap_or(Value::Null));
                }
                Value::Array(arr).to_string()
            }
            ClientFrame::Close { sub_id } => serde_json::json!(["CLOSE", sub_id]).to_string(),
        }
    }
}

/// Frames sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// An event matching a subscription.
    Event { sub_id: String, event: Event },
    /// Result of an EVENT submission.
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
    /// End of stored events for a subscription.
    Eose { sub_id: String },
    /// Subscription rejected or terminated by the relay.
    Closed { sub_id: String, reason: String },
    /// Human-readable notice.
    Notice { message: String },
}

impl RelayFrame {
    /// Serialize to the wire form.
    pub fn to_json(&self) -> String {
        match self {
            RelayFrame::Event { sub_id, event } => {
                serde_json::json!(["EVENT", sub_id, event]).to_string()
            }
            RelayFrame::Ok {
                event_id,
                accepted,
                reason,
            } => serde_json::json!(["OK", event_id, accepted, reason]).to_string(),
            RelayFrame::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]).to_string(),
            RelayFrame::Closed { sub_id, reason } => {
                serde_json::json!(["CLOSED", sub_id, reason]).to_string()
            }
            RelayFrame::Notice { message } => serde_json::json!(["NOTICE", message]).to_string(),
        }
    }

    /// An `OK` acknowledging acceptance.
    pub fn ok_accepted(event_id: impl Into<String>) -> Self {
        RelayFrame::Ok {
            event_id: event_id.into(),
            accepted: true,
            reason: String::new(),
        }
    }

    /// An `OK` acknowledging acceptance with a reason, e.g. a duplicate.
    pub fn ok_with_reason(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayFrame::Ok {
            event_id: event_id.into(),
            accepted: true,
            reason: reason.into(),
        }
    }

    /// An `OK` rejecting the event.
    pub fn ok_rejected(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayFrame::Ok {
            event_id: event_id.into(),
            accepted: false,
            reason: reason.into(),
        }
    }

    /// An `EVENT` delivery for a subscription.
    pub fn event(sub_id: impl Into<String>, event: Event) -> Self {
        RelayFrame::Event {
            sub_id: sub_id.into(),
            event,
        }
    }

    /// An `EOSE` marker.
    pub fn eose(sub_id: impl Into<String>) -> Self {
        RelayFrame::Eose {
            sub_id: sub_id.into(),
        }
    }

    /// A `CLOSED` rejection.
    pub fn closed(sub_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayFrame::Closed {
            sub_id: sub_id.into(),
            reason: reason.into(),
        }
    }

    /// A `NOTICE`.
    pub fn notice(message: impl Into<String>) -> Self {
        RelayFrame::Notice {
            message: message.into(),
        }
    }
}
