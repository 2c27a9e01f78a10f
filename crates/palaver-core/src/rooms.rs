//! Room operations: create with direct-chat deduplication, join/leave with
//! system messages, room info and the paginated room list.

use std::collections::HashSet;

use chrono::Utc;

use palaver_shared::constants::MAX_QUERY_LIMIT;
use palaver_shared::ids::{valid_object_id, valid_user_id};
use palaver_shared::RequestMetadata;

use palaver_store::{Room, RoomMember, ROOM_TYPE_DIRECT, ROOM_TYPE_GROUP};

use crate::error::CoreError;
use crate::service::ChatService;
use crate::types::{room_view, CreateRoomRequest, RoomView, RoomsPage};

/// Sentinel shown in room lists when a preview cannot be rendered.
pub(crate) const PREVIEW_FALLBACK: &str = "[message]";

impl ChatService {
    /// Create a room. For a two-member direct room, an existing room with the
    /// same member set is returned instead of creating a duplicate.
    pub async fn create_room(
        &self,
        req: CreateRoomRequest,
        meta: &RequestMetadata,
    ) -> Result<RoomView, CoreError> {
        if !valid_user_id(&req.owner_id) {
            return Err(CoreError::InvalidArgument("invalid owner id".to_string()));
        }
        for member_id in &req.member_ids {
            if !valid_user_id(member_id) {
                return Err(CoreError::InvalidArgument("invalid member id".to_string()));
            }
        }
        if req.member_ids.len() > self.limits.max_members {
            return Err(CoreError::InvalidArgument("too many members".to_string()));
        }
        let name_len = req.name.chars().count();
        if name_len == 0 || name_len > self.limits.max_name_len {
            return Err(CoreError::InvalidArgument("invalid room name".to_string()));
        }
        if req.room_type != ROOM_TYPE_DIRECT && req.room_type != ROOM_TYPE_GROUP {
            return Err(CoreError::InvalidArgument("invalid room type".to_string()));
        }

        // Direct-chat dedup: scan a bounded prefix of the owner's rooms for
        // one holding exactly the requested pair.
        if req.room_type == ROOM_TYPE_DIRECT && req.member_ids.len() == 2 {
            let requested: HashSet<&str> = req.member_ids.iter().map(String::as_str).collect();

            let (rooms, _, _) = {
                let db = self.db.lock().await;
                db.list_user_rooms(&req.owner_id, MAX_QUERY_LIMIT, None)
            }?;

            for existing in &rooms {
                if existing.room_type != ROOM_TYPE_DIRECT || existing.members.len() != 2 {
                    continue;
                }
                let existing_set: HashSet<&str> =
                    existing.members.iter().map(|m| m.user_id.as_str()).collect();
                if existing_set == requested {
                    tracing::info!(
                        room_id = %existing.id,
                        request_id = %meta.request_id,
                        "direct room already exists"
                    );
                    return Ok(self.render_room(existing, None).await);
                }
            }
        }

        // Owner joins automatically; duplicates in the request collapse.
        let mut member_ids: Vec<String> = Vec::new();
        for member_id in &req.member_ids {
            if !member_ids.contains(member_id) {
                member_ids.push(member_id.clone());
            }
        }
        if !member_ids.contains(&req.owner_id) {
            member_ids.insert(0, req.owner_id.clone());
        }

        if req.room_type == ROOM_TYPE_DIRECT && member_ids.len() != 2 {
            return Err(CoreError::InvalidArgument(
                "direct rooms have exactly two members".to_string(),
            ));
        }

        let now = Utc::now();
        let mut room = Room {
            id: String::new(),
            name: req.name,
            room_type: req.room_type.clone(),
            owner_id: req.owner_id.clone(),
            settings: req.settings.unwrap_or_default(),
            created_at: now,
            updated_at: now,
            last_message_at: now,
            last_message: String::new(),
            last_message_time: None,
            members: member_ids
                .iter()
                .map(|id| RoomMember::new(id, now))
                .collect(),
        };

        {
            let db = self.db.lock().await;
            db.create_room(&mut room)
        }?;

        self.audit
            .room_created(meta, &req.owner_id, &room.id, &req.room_type);

        tracing::info!(
            room_id = %room.id,
            owner_id = %req.owner_id,
            room_type = %req.room_type,
            members = room.members.len(),
            request_id = %meta.request_id,
            "room created"
        );

        Ok(room_view(&room, String::new(), None))
    }

    /// Add a user to a room. Returns `true` when membership actually changed;
    /// only then is a system message emitted.
    pub async fn join_room(
        &self,
        room_id: &str,
        user_id: &str,
        meta: &RequestMetadata,
    ) -> Result<bool, CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }
        if !valid_user_id(user_id) {
            return Err(CoreError::InvalidArgument("invalid user id".to_string()));
        }

        let already_member = {
            let db = self.db.lock().await;
            db.is_member(room_id, user_id)
        }?;
        if already_member {
            tracing::info!(room_id, user_id, "user is already a member");
            return Ok(false);
        }

        let (room, occupancy) = {
            let db = self.db.lock().await;
            let room = db.get_room(room_id)?;
            let occupancy = db.member_count(room_id)?;
            (room, occupancy)
        };
        let cap = room.settings.max_members as usize;
        if cap > 0 && occupancy >= cap {
            return Err(CoreError::InvalidArgument("room is full".to_string()));
        }

        let member = RoomMember::new(user_id, Utc::now());
        let added = {
            let db = self.db.lock().await;
            db.add_member(room_id, &member)
        }?;
        if !added {
            // Lost a race with a concurrent join.
            return Ok(false);
        }

        self.emit_system_message(room_id, &format!("{user_id} joined the group"))
            .await;

        self.audit.room_joined(meta, user_id, room_id);

        tracing::info!(room_id, user_id, request_id = %meta.request_id, "user joined room");
        Ok(true)
    }

    /// Remove a user from a room. Removal of a non-member is a no-op, but the
    /// system message is emitted either way.
    pub async fn leave_room(
        &self,
        room_id: &str,
        user_id: &str,
        meta: &RequestMetadata,
    ) -> Result<(), CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }
        if !valid_user_id(user_id) {
            return Err(CoreError::InvalidArgument("invalid user id".to_string()));
        }

        // Surfaces NotFound before any mutation.
        {
            let db = self.db.lock().await;
            db.get_room(room_id)
        }?;

        {
            let db = self.db.lock().await;
            db.remove_member(room_id, user_id)
        }?;

        self.emit_system_message(room_id, &format!("{user_id} left the group"))
            .await;

        self.audit.room_left(meta, user_id, room_id);

        tracing::info!(room_id, user_id, request_id = %meta.request_id, "user left room");
        Ok(())
    }

    /// Fetch one room, preview decrypted.
    pub async fn get_room_info(
        &self,
        room_id: &str,
        _meta: &RequestMetadata,
    ) -> Result<RoomView, CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }

        let room = {
            let db = self.db.lock().await;
            db.get_room(room_id)
        }?;

        Ok(self.render_room(&room, None).await)
    }

    /// Page through a user's rooms by recent activity, previews decrypted and
    /// unread counts attached.
    pub async fn list_user_rooms(
        &self,
        user_id: &str,
        limit: u32,
        cursor: Option<&str>,
        meta: &RequestMetadata,
    ) -> Result<RoomsPage, CoreError> {
        if !valid_user_id(user_id) {
            return Err(CoreError::InvalidArgument("invalid user id".to_string()));
        }

        let (rooms, next_cursor, has_more) = {
            let db = self.db.lock().await;
            db.list_user_rooms(user_id, limit, cursor)
        }?;

        let mut views = Vec::with_capacity(rooms.len());
        for room in &rooms {
            views.push(self.render_room(room, Some(user_id)).await);
        }

        tracing::info!(
            user_id,
            count = views.len(),
            has_more,
            request_id = %meta.request_id,
            "listed user rooms"
        );

        Ok(RoomsPage {
            rooms: views,
            next_cursor,
            has_more,
        })
    }

    /// Build the wire view of a room: decrypt the preview when it carries the
    /// envelope tag, fall back to the sentinel when it cannot be rendered,
    /// and attach the unread count when a user context is given.
    pub(crate) async fn render_room(&self, room: &Room, unread_for: Option<&str>) -> RoomView {
        let preview = if room.last_message.is_empty() {
            String::new()
        } else {
            match self
                .encryption
                .decrypt_message(&room.last_message, &room.id, None)
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(room_id = %room.id, error = %e, "preview unreadable");
                    PREVIEW_FALLBACK.to_string()
                }
            }
        };

        let unread_count = match unread_for {
            Some(user_id) => {
                let db = self.db.lock().await;
                match db.unread_count(&room.id, user_id) {
                    Ok(count) => Some(count),
                    Err(e) => {
                        tracing::warn!(room_id = %room.id, error = %e, "unread count failed");
                        None
                    }
                }
            }
            None => None,
        };

        room_view(room, preview, unread_count)
    }
}
