//! Typed messages flowing between the relay components.

use uuid::Uuid;

use crate::event::Event;
use crate::filter::Subscription;
use crate::frame::RelayFrame;

/// Traffic read off a live connection, tagged with its session id.
#[derive(Debug)]
pub enum Inbound {
    /// A raw text frame.
    Frame { conn_id: Uuid, payload: String },
    /// The session closed; downstream state for it must be purged.
    Disconnect { conn_id: Uuid },
}

/// An outbound frame addressed to a single session.
#[derive(Debug)]
pub struct Outbound {
    pub conn_id: Uuid,
    pub frame: RelayFrame,
    /// Set when this frame answers a message that failed to parse; the hub
    /// may use it for strike-count disconnect logic.
    pub unparseable: bool,
}

impl Outbound {
    pub fn new(conn_id: Uuid, frame: RelayFrame) -> Self {
        Self {
            conn_id,
            frame,
            unparseable: false,
        }
    }

    pub fn unparseable(conn_id: Uuid, frame: RelayFrame) -> Self {
        Self {
            conn_id,
            frame,
            unparseable: true,
        }
    }
}

/// Parsed commands handed from the ingester to the fan-out layer.
#[derive(Debug)]
pub enum FanoutMsg {
    /// A freshly accepted event to match against live subscriptions.
    Event { event: Event },
    /// Serve history for, then register, a subscription.
    Subscribe {
        conn_id: Uuid,
        subscription: Subscription,
    },
    /// Drop one subscription.
    Close { conn_id: Uuid, sub_id: String },
    /// Drop all state for a connection.
    Disconnect { conn_id: Uuid },
}
