//! Protocol packets and request specs.
//!
//! A packet is a JSON object addressed to an actor (`to`) on the way out and
//! stamped with its sender (`from`) on the way in. Every packet has a `type`;
//! failed replies additionally carry an `error` marker and usually a
//! human-readable `message`.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Actor id of the root actor. It greets every new connection.
pub const ROOT_ACTOR: &str = "root";

/// Broadcast notifications the target sends without a matching request.
///
/// Packets of these types are never correlated with in-flight requests.
pub const UNSOLICITED_EVENTS: &[&str] = &[
    "tabNavigated",
    "styleApplied",
    "propertyChange",
    "networkEventUpdate",
    "networkEvent",
    "newMutations",
    "frameUpdate",
    "tabListChanged",
];

/// A decoded protocol message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Packet(Map<String, Value>);

impl Packet {
    /// Create an outbound packet of the given type addressed to `to`.
    pub fn new(to: impl Into<String>, kind: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("to".to_string(), Value::String(to.into()));
        map.insert("type".to_string(), Value::String(kind.into()));
        Self(map)
    }

    /// Add a field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String field accessor; non-string values read as absent.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Target actor of an outbound packet.
    pub fn target(&self) -> Option<&str> {
        self.get_str("to")
    }

    /// Sending actor of an inbound packet.
    pub fn sender(&self) -> Option<&str> {
        self.get_str("from")
    }

    pub fn kind(&self) -> Option<&str> {
        self.get_str("type")
    }

    /// Error marker of a failed reply.
    pub fn error(&self) -> Option<&str> {
        self.get_str("error")
    }

    pub fn message(&self) -> Option<&str> {
        self.get_str("message")
    }

    /// Whether this packet is a broadcast notification rather than a reply.
    pub fn is_unsolicited(&self) -> bool {
        self.kind()
            .map(|kind| UNSOLICITED_EVENTS.contains(&kind))
            .unwrap_or(false)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Packet {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// What a caller hands to `ProtocolClient::request`.
///
/// A bare request type is addressed to the root actor; a full packet must
/// name its target actor itself.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestSpec {
    Type(String),
    Packet(Packet),
}

impl RequestSpec {
    /// Resolve the target actor and the packet to put on the wire.
    ///
    /// Fails without side effects when no `to` field can be determined.
    pub fn resolve(self) -> Result<(String, Packet)> {
        match self {
            RequestSpec::Type(kind) => Ok((ROOT_ACTOR.to_string(), Packet::new(ROOT_ACTOR, kind))),
            RequestSpec::Packet(packet) => match packet.target() {
                Some(to) if !to.is_empty() => Ok((to.to_string(), packet)),
                _ => Err(HarnessError::Request {
                    actor: String::new(),
                    message: format!(
                        "request {} has no `to` field",
                        packet.kind().unwrap_or("<untyped>")
                    ),
                    error: None,
                }),
            },
        }
    }
}

impl From<&str> for RequestSpec {
    fn from(kind: &str) -> Self {
        RequestSpec::Type(kind.to_string())
    }
}

impl From<String> for RequestSpec {
    fn from(kind: String) -> Self {
        RequestSpec::Type(kind)
    }
}

impl From<Packet> for RequestSpec {
    fn from(packet: Packet) -> Self {
        RequestSpec::Packet(packet)
    }
}
