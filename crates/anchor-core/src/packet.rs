//! Relay packets
//!
//! A packet is one JSON object dispatched on its `type` field. The relay
//! understands a closed set of types ([`PacketBody`]) plus a handful of
//! envelope fields (`clientId`, `roomId`, `quiet`, `targetClientId`).
//! Anything else on the object is kept in [`Packet::extra`] and written back
//! out untouched when the packet is relayed, which is how save-state payloads
//! travel through without the relay knowing their shape.

use crate::error::{RelayError, Result};
use crate::types::{ClientData, ClientId, ClientSnapshot, RoomId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every `type` value the relay accepts
pub const PACKET_TYPES: &[&str] = &[
    "UPDATE_CLIENT_DATA",
    "ALL_CLIENT_DATA",
    "REQUEST_SAVE_STATE",
    "PUSH_SAVE_STATE",
    "SERVER_MESSAGE",
    "DISABLE_ANCHOR",
    "HEARTBEAT",
];

/// Typed payload, one variant per packet type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketBody {
    /// Client replaces its mirrored metadata
    UpdateClientData {
        #[serde(default)]
        data: ClientData,
    },

    /// Room roster as seen by the recipient (everyone but the recipient)
    AllClientData {
        #[serde(default)]
        clients: Vec<ClientSnapshot>,
    },

    /// Ask the room for a save state
    RequestSaveState,

    /// Answer to every outstanding save-state request in the room
    PushSaveState,

    /// Operator text shown to the player
    ServerMessage {
        #[serde(default)]
        message: String,
    },

    /// Tell the client to switch itself off
    DisableAnchor,

    /// Liveness check; never relayed
    Heartbeat,
}

impl PacketBody {
    /// Wire name of this packet type
    pub fn kind(&self) -> &'static str {
        match self {
            PacketBody::UpdateClientData { .. } => "UPDATE_CLIENT_DATA",
            PacketBody::AllClientData { .. } => "ALL_CLIENT_DATA",
            PacketBody::RequestSaveState => "REQUEST_SAVE_STATE",
            PacketBody::PushSaveState => "PUSH_SAVE_STATE",
            PacketBody::ServerMessage { .. } => "SERVER_MESSAGE",
            PacketBody::DisableAnchor => "DISABLE_ANCHOR",
            PacketBody::Heartbeat => "HEARTBEAT",
        }
    }

    /// Object keys owned by this variant's payload
    fn payload_keys(&self) -> &'static [&'static str] {
        match self {
            PacketBody::UpdateClientData { .. } => &["data"],
            PacketBody::AllClientData { .. } => &["clients"],
            PacketBody::ServerMessage { .. } => &["message"],
            _ => &[],
        }
    }
}

/// A decoded packet: typed body, envelope fields, and pass-through extras
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub body: PacketBody,
    /// Sender identity, stamped by the relay. Never taken from the wire.
    pub client_id: Option<ClientId>,
    /// Room to join; only meaningful on a client's first packet
    pub room_id: Option<RoomId>,
    /// Suppresses traffic logging for this packet
    pub quiet: bool,
    /// Unicast destination inside the sender's room
    pub target_client_id: Option<ClientId>,
    /// Unrecognized top-level fields, preserved for relaying
    pub extra: Map<String, Value>,
}

impl Packet {
    /// Bare packet with no envelope fields set
    pub fn new(body: PacketBody) -> Self {
        Self {
            body,
            client_id: None,
            room_id: None,
            quiet: false,
            target_client_id: None,
            extra: Map::new(),
        }
    }

    pub fn server_message(message: impl Into<String>) -> Self {
        Self::new(PacketBody::ServerMessage {
            message: message.into(),
        })
    }

    pub fn disable_anchor() -> Self {
        Self::new(PacketBody::DisableAnchor)
    }

    pub fn heartbeat() -> Self {
        Self::new(PacketBody::Heartbeat).quiet()
    }

    pub fn all_client_data(clients: Vec<ClientSnapshot>) -> Self {
        Self::new(PacketBody::AllClientData { clients })
    }

    pub fn with_room(mut self, room_id: impl Into<RoomId>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn with_target(mut self, target: ClientId) -> Self {
        self.target_client_id = Some(target);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Wire name of this packet's type
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Decode one frame (delimiter included or not) into a packet.
    ///
    /// Any `clientId` the peer supplied is discarded. An empty `roomId` is
    /// treated as absent.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(frame)
            .map_err(|e| RelayError::MalformedFrame(format!("invalid UTF-8: {}", e)))?;
        let value: Value = serde_json::from_str(text.trim_end())
            .map_err(|e| RelayError::MalformedFrame(e.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(RelayError::MalformedFrame(
                "expected a JSON object".to_string(),
            ));
        };

        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => {
                return Err(RelayError::MalformedFrame(
                    "`type` must be a string".to_string(),
                ));
            }
            None => return Err(RelayError::MalformedFrame("missing `type`".to_string())),
        };
        if !PACKET_TYPES.contains(&kind.as_str()) {
            return Err(RelayError::UnknownPacketType(kind));
        }

        fields.remove("clientId");
        let room_id = take_field::<RoomId>(&mut fields, "roomId")?.filter(|id| !id.0.is_empty());
        let quiet = take_field::<bool>(&mut fields, "quiet")?.unwrap_or(false);
        let target_client_id = take_field::<ClientId>(&mut fields, "targetClientId")?;

        let object = Value::Object(fields);
        let body = PacketBody::deserialize(&object)
            .map_err(|e| RelayError::MalformedFrame(format!("{}: {}", kind, e)))?;

        let mut extra = match object {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        extra.remove("type");
        for key in body.payload_keys() {
            extra.remove(*key);
        }

        Ok(Self {
            body,
            client_id: None,
            room_id,
            quiet,
            target_client_id,
            extra,
        })
    }

    /// Render the packet as a JSON object
    pub fn to_value(&self) -> Result<Value> {
        let mut object = self.extra.clone();
        match serde_json::to_value(&self.body)? {
            Value::Object(body) => object.extend(body),
            other => {
                return Err(RelayError::SerializationError(format!(
                    "packet body serialized to {}",
                    other
                )));
            }
        }
        if let Some(id) = self.client_id {
            object.insert("clientId".to_string(), Value::from(id.0));
        }
        if let Some(room_id) = &self.room_id {
            object.insert("roomId".to_string(), Value::from(room_id.as_str()));
        }
        if self.quiet {
            object.insert("quiet".to_string(), Value::Bool(true));
        }
        if let Some(target) = self.target_client_id {
            object.insert("targetClientId".to_string(), Value::from(target.0));
        }
        Ok(Value::Object(object))
    }

    /// Compact JSON text, no trailing delimiter
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }
}

/// Remove `key` and decode it, treating `null` like absence
fn take_field<T: DeserializeOwned>(fields: &mut Map<String, Value>, key: &str) -> Result<Option<T>> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RelayError::MalformedFrame(format!("`{}`: {}", key, e))),
    }
}
