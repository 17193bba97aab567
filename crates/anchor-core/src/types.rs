//! Identity and metadata types shared by the relay and its clients

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Relay-assigned identity of one connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ClientId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(ClientId)
    }
}

/// Caller-chosen room name. First packet naming an unseen id creates the room.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        RoomId(s)
    }
}

impl Borrow<str> for RoomId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Arbitrary per-client metadata mirrored to room peers
pub type ClientData = serde_json::Map<String, serde_json::Value>;

/// One entry of an `ALL_CLIENT_DATA` listing: the client's id plus its
/// last reported metadata, flattened into a single object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    #[serde(rename = "clientId")]
    pub client_id: ClientId,
    #[serde(flatten)]
    pub data: ClientData,
}

impl ClientSnapshot {
    /// Build a snapshot, dropping any `clientId` key the peer put in its own
    /// metadata so the relay-assigned id is the only one emitted
    pub fn new(client_id: ClientId, data: &ClientData) -> Self {
        let mut data = data.clone();
        data.remove("clientId");
        Self { client_id, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_flattens_metadata() {
        let mut data = ClientData::new();
        data.insert("x".into(), json!(2));
        data.insert("scene".into(), json!("forest"));

        let snapshot = ClientSnapshot::new(ClientId(4), &data);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value, json!({"clientId": 4, "x": 2, "scene": "forest"}));

        let back: ClientSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_snapshot_ignores_peer_client_id() {
        let mut data = ClientData::new();
        data.insert("clientId".into(), json!(999));
        let snapshot = ClientSnapshot::new(ClientId(1), &data);
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({"clientId": 1})
        );
    }

    #[test]
    fn test_client_id_parse() {
        assert_eq!("12".parse::<ClientId>().unwrap(), ClientId(12));
        assert!("abc".parse::<ClientId>().is_err());
    }
}
