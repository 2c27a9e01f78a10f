use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Room type discriminator values.
pub const ROOM_TYPE_DIRECT: &str = "direct";
pub const ROOM_TYPE_GROUP: &str = "group";

/// Sender id used for service-authored membership messages.
pub const SYSTEM_SENDER: &str = "system";

/// Message type for service-authored membership messages.
pub const MESSAGE_TYPE_SYSTEM: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: String,
    pub owner_id: String,
    pub settings: RoomSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub last_message: String,
    pub last_message_time: Option<DateTime<Utc>>,
    pub members: Vec<RoomMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMember {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
    pub status: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_read_at: DateTime<Utc>,
}

impl RoomMember {
    /// A freshly joined member. Every member carries role `member`; no
    /// explicit admin role is assigned by the current design.
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            role: "member".to_string(),
            status: "active".to_string(),
            joined_at: now,
            last_seen: now,
            last_read_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoomSettings {
    pub allow_invite: bool,
    pub allow_edit_messages: bool,
    pub allow_delete_messages: bool,
    pub allow_pin_messages: bool,
    pub max_members: u32,
    pub welcome_message: String,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            allow_invite: true,
            allow_edit_messages: true,
            allow_delete_messages: true,
            allow_pin_messages: true,
            max_members: palaver_shared::constants::DEFAULT_MAX_ROOM_MEMBERS as u32,
            welcome_message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<String>,
    pub read_by: Vec<ReadReceipt>,
    pub delivered_to: Vec<DeliveryReceipt>,
}

impl Message {
    /// True for service-authored membership messages, which are stored as
    /// plaintext.
    pub fn is_system(&self) -> bool {
        self.message_type == MESSAGE_TYPE_SYSTEM
    }
}

/// Optional payload for file, image and location messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_height: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub user_id: String,
    pub delivered_at: DateTime<Utc>,
}

/// A DEK wrapped under the master key, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomKeyRecord {
    pub room_id: String,
    pub key_version: i64,
    pub wrapped_key: String,
    pub created_at: DateTime<Utc>,
    pub rotated_at: DateTime<Utc>,
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
}
