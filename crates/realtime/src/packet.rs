use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame exchanged between client and server.
///
/// Packets travel as JSON text frames tagged by `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// Sent once by the server right after the upgrade.
    Connect {
        /// Identifier the server assigned to the connection.
        sid: String,
    },

    /// An application event.
    Event {
        /// Event name.
        event: String,
        /// Event payload.
        data: Value,
    },
}

impl Packet {
    /// Builds an event packet.
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: event.into(),
            data,
        }
    }

    /// Encodes the packet as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a valid packet.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// An event received by a socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// Event payload.
    pub data: Value,
}

impl Event {
    pub(crate) fn from_packet(packet: Packet) -> Option<Self> {
        match packet {
            Packet::Event { event, data } => Some(Self { name: event, data }),
            Packet::Connect { .. } => None,
        }
    }
}
