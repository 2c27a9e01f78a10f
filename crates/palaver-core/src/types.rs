//! Request and response records for the service surface.
//!
//! These mirror the RPC operations one-to-one; the HTTP layer deserializes
//! straight into the request records and serializes the response records, so
//! the transcoder stays thin.

use serde::{Deserialize, Serialize};

use palaver_store::{Message, Room, RoomSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub settings: Option<RoomSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
}

fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkAsReadRequest {
    pub user_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Wire view of a message: content decrypted, reader list cleaned.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub read_by: Vec<String>,
}

/// Wire view of a room member.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MemberView {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
    pub joined_at: i64,
    pub last_seen: i64,
}

/// Wire view of a room: preview decrypted, timestamps as unix seconds.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoomView {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: String,
    pub owner_id: String,
    pub settings: RoomSettings,
    pub members: Vec<MemberView>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_message: String,
    pub last_message_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesPage {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomsPage {
    pub rooms: Vec<RoomView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Strip the sender and deduplicate the reader list, preserving order.
pub fn clean_read_by(message: &Message) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    message
        .read_by
        .iter()
        .filter(|r| r.user_id != message.sender_id)
        .filter(|r| seen.insert(r.user_id.clone()))
        .map(|r| r.user_id.clone())
        .collect()
}

/// Build the wire view of a message from its stored form and the rendered
/// (decrypted or sentinel) content.
pub fn message_view(message: &Message, content: String) -> ChatMessage {
    ChatMessage {
        id: message.id.clone(),
        room_id: message.room_id.clone(),
        sender_id: message.sender_id.clone(),
        content,
        message_type: message.message_type.clone(),
        created_at: message.created_at.timestamp(),
        updated_at: message.updated_at.timestamp(),
        read_by: clean_read_by(message),
    }
}

/// Build the wire view of a room from its stored form and the rendered
/// preview.
pub fn room_view(room: &Room, last_message: String, unread_count: Option<u32>) -> RoomView {
    RoomView {
        id: room.id.clone(),
        name: room.name.clone(),
        room_type: room.room_type.clone(),
        owner_id: room.owner_id.clone(),
        settings: room.settings.clone(),
        members: room
            .members
            .iter()
            .map(|m| MemberView {
                user_id: m.user_id.clone(),
                display_name: m.display_name.clone(),
                role: m.role.clone(),
                joined_at: m.joined_at.timestamp(),
                last_seen: m.last_seen.timestamp(),
            })
            .collect(),
        created_at: room.created_at.timestamp(),
        updated_at: room.updated_at.timestamp(),
        last_message,
        last_message_time: room.last_message_time.map(|t| t.timestamp()).unwrap_or(0),
        unread_count,
    }
}
