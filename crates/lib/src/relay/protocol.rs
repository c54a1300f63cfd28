//! Application messages carried in text frames.

use serde::{Deserialize, Serialize};

/// Server → new client: you are in; carries the owner's name when joining an existing room.
pub const SERVER_JOIN: &str = "server:join";
/// Server → room owner: a second member joined.
pub const ROOM_JOIN: &str = "room:join";
/// Server → client: the requested room already has two members.
pub const ROOM_FULL: &str = "room:full";
/// Server → remaining member: the peer left.
pub const SERVER_LEAVE: &str = "server:leave";
/// Client → server (and peer): change display name.
pub const ACTION_RENAME: &str = "action:rename";

/// Server-originated notification: `{ "type", "id", "name"?, "ownerName"?, "roomId" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    pub room_id: String,
}

impl ServerMessage {
    pub fn join(id: &str, name: &str, room_id: &str, owner_name: Option<String>) -> Self {
        Self {
            typ: SERVER_JOIN.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            owner_name,
            room_id: room_id.to_string(),
        }
    }

    pub fn room_join(id: &str, name: &str, room_id: &str) -> Self {
        Self {
            typ: ROOM_JOIN.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            owner_name: None,
            room_id: room_id.to_string(),
        }
    }

    pub fn room_full(id: &str, room_id: &str) -> Self {
        Self {
            typ: ROOM_FULL.to_string(),
            id: id.to_string(),
            name: String::new(),
            owner_name: None,
            room_id: room_id.to_string(),
        }
    }

    pub fn leave(id: &str, name: &str, room_id: &str) -> Self {
        Self {
            typ: SERVER_LEAVE.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            owner_name: None,
            room_id: room_id.to_string(),
        }
    }
}

/// Fields the relay reads from a client message. Everything else is passed through untouched,
/// since the received text is what gets relayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub room_id: String,
}
