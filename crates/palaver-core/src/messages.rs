//! Message operations: the send pipeline, decrypting reads, read and
//! delivery marks, unread counts.

use chrono::Utc;

use palaver_shared::constants::PREVIEW_MAX_CHARS;
use palaver_shared::ids::{valid_object_id, valid_user_id};
use palaver_shared::RequestMetadata;

use palaver_store::{Message, MESSAGE_TYPE_SYSTEM, SYSTEM_SENDER};

use crate::encryption::{DecryptError, MessageEncryption};
use crate::error::CoreError;
use crate::service::ChatService;
use crate::types::{message_view, ChatMessage, MarkAsReadRequest, MessagesPage, SendMessageRequest};

/// Sentinel for content that could not be decrypted.
pub(crate) const DECRYPTION_FAILED: &str = "[decryption failed]";

/// Sentinel for decrypted content that is not valid text.
pub(crate) const FORMAT_ERROR: &str = "[message format error]";

impl ChatService {
    /// The send pipeline: encrypt, persist, refresh the room preview, audit,
    /// and echo the message back decrypted.
    pub async fn send_message(
        &self,
        room_id: &str,
        req: SendMessageRequest,
        meta: &RequestMetadata,
    ) -> Result<ChatMessage, CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }
        if !valid_user_id(&req.sender_id) {
            return Err(CoreError::InvalidArgument("invalid sender id".to_string()));
        }
        if req.content.is_empty() {
            return Err(CoreError::InvalidArgument(
                "message content cannot be empty".to_string(),
            ));
        }
        if req.content.chars().count() > self.limits.max_message_len {
            return Err(CoreError::InvalidArgument("message too long".to_string()));
        }
        if req.message_type.is_empty() || req.message_type == MESSAGE_TYPE_SYSTEM {
            return Err(CoreError::InvalidArgument("invalid message type".to_string()));
        }

        let is_member = {
            let db = self.db.lock().await;
            db.is_member(room_id, &req.sender_id)
        }?;
        if !is_member {
            self.audit
                .access_denied(meta, &req.sender_id, room_id, "sender is not a member");
            return Err(CoreError::ForbiddenMember);
        }

        let (stored_content, key_version) = self
            .encryption
            .encrypt_message(&req.content, room_id)
            .await?;

        let now = Utc::now();
        let mut message = Message {
            id: String::new(),
            room_id: room_id.to_string(),
            sender_id: req.sender_id.clone(),
            content: stored_content,
            message_type: req.message_type.clone(),
            status: String::new(),
            created_at: now,
            updated_at: now,
            key_version,
            metadata: None,
            reply_to: None,
            forwarded_from: None,
            read_by: Vec::new(),
            delivered_to: Vec::new(),
        };

        {
            let db = self.db.lock().await;
            db.create_message(&mut message)
        }?;

        // Preview: plaintext excerpt or media sentinel, sealed like the
        // message itself. A failure here degrades the room list, not the
        // send.
        let preview = build_preview(&req.content, &req.message_type);
        let stored_preview = match self.encryption.encrypt_message(&preview, room_id).await {
            Ok((sealed, _)) => sealed,
            Err(e) => {
                tracing::warn!(room_id, error = %e, "preview encryption failed");
                preview
            }
        };

        let preview_result = {
            let db = self.db.lock().await;
            db.update_room_preview(room_id, &stored_preview, message.created_at)
        };
        if let Err(e) = preview_result {
            tracing::error!(room_id, error = %e, "failed to update room preview");
        }

        self.audit.message_sent(
            meta,
            &req.sender_id,
            room_id,
            &message.id,
            &req.message_type,
        );

        tracing::info!(
            room_id,
            message_id = %message.id,
            sender_id = %req.sender_id,
            message_type = %req.message_type,
            encrypted = key_version.is_some(),
            request_id = %meta.request_id,
            "message sent"
        );

        let content = render_content(&self.encryption, &message).await;
        Ok(message_view(&message, content))
    }

    /// Paginated decrypting read, newest first. Requires membership.
    pub async fn get_messages(
        &self,
        room_id: &str,
        user_id: &str,
        limit: u32,
        cursor: Option<&str>,
        meta: &RequestMetadata,
    ) -> Result<MessagesPage, CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }
        if !valid_user_id(user_id) {
            return Err(CoreError::InvalidArgument("invalid user id".to_string()));
        }

        let is_member = {
            let db = self.db.lock().await;
            db.is_member(room_id, user_id)
        }?;
        if !is_member {
            self.audit
                .access_denied(meta, user_id, room_id, "reader is not a member");
            return Err(CoreError::ForbiddenMember);
        }

        let (messages, next_cursor, has_more) = {
            let db = self.db.lock().await;
            db.get_messages(room_id, limit, cursor, None, None)
        }?;

        let mut views = Vec::with_capacity(messages.len());
        for message in &messages {
            let content = render_content(&self.encryption, message).await;
            views.push(message_view(message, content));
        }

        tracing::info!(
            room_id,
            count = views.len(),
            has_more,
            request_id = %meta.request_id,
            "fetched messages"
        );

        Ok(MessagesPage {
            messages: views,
            next_cursor,
            has_more,
        })
    }

    /// History read: ascending, system messages excluded, stricter cap.
    pub async fn get_history(
        &self,
        room_id: &str,
        limit: u32,
        cursor: Option<&str>,
        meta: &RequestMetadata,
    ) -> Result<MessagesPage, CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }

        let (messages, next_cursor, has_more) = {
            let db = self.db.lock().await;
            db.get_history(room_id, limit, cursor)
        }?;

        let mut views = Vec::with_capacity(messages.len());
        for message in &messages {
            let content = render_content(&self.encryption, message).await;
            views.push(message_view(message, content));
        }

        tracing::info!(
            room_id,
            count = views.len(),
            has_more,
            request_id = %meta.request_id,
            "fetched history"
        );

        Ok(MessagesPage {
            messages: views,
            next_cursor,
            has_more,
        })
    }

    /// Mark one message or the whole room as read for a user. Idempotent.
    pub async fn mark_as_read(
        &self,
        room_id: &str,
        req: MarkAsReadRequest,
        meta: &RequestMetadata,
    ) -> Result<(), CoreError> {
        {
            let db = self.db.lock().await;
            db.mark_as_read(room_id, &req.user_id, req.message_id.as_deref())
        }?;

        self.audit
            .message_read(meta, &req.user_id, room_id, req.message_id.as_deref());

        tracing::info!(
            room_id,
            user_id = %req.user_id,
            request_id = %meta.request_id,
            "marked as read"
        );
        Ok(())
    }

    /// Mark one message or the whole room as delivered for a user.
    pub async fn mark_as_delivered(
        &self,
        room_id: &str,
        req: MarkAsReadRequest,
        meta: &RequestMetadata,
    ) -> Result<(), CoreError> {
        {
            let db = self.db.lock().await;
            db.mark_as_delivered(room_id, &req.user_id, req.message_id.as_deref())
        }?;

        tracing::info!(
            room_id,
            user_id = %req.user_id,
            request_id = %meta.request_id,
            "marked as delivered"
        );
        Ok(())
    }

    /// Messages in the room the user has neither sent nor read.
    pub async fn unread_count(
        &self,
        room_id: &str,
        user_id: &str,
        _meta: &RequestMetadata,
    ) -> Result<u32, CoreError> {
        let count = {
            let db = self.db.lock().await;
            db.unread_count(room_id, user_id)
        }?;
        Ok(count)
    }

    /// Persist a service-authored membership message and move the room
    /// preview to it. Failures degrade to a log line; the membership change
    /// itself already happened.
    pub(crate) async fn emit_system_message(&self, room_id: &str, content: &str) {
        let now = Utc::now();
        let mut message = Message {
            id: String::new(),
            room_id: room_id.to_string(),
            sender_id: SYSTEM_SENDER.to_string(),
            content: content.to_string(),
            message_type: MESSAGE_TYPE_SYSTEM.to_string(),
            status: String::new(),
            created_at: now,
            updated_at: now,
            key_version: None,
            metadata: None,
            reply_to: None,
            forwarded_from: None,
            read_by: Vec::new(),
            delivered_to: Vec::new(),
        };

        let created = {
            let db = self.db.lock().await;
            db.create_message(&mut message)
        };

        match created {
            Ok(()) => {
                let preview_result = {
                    let db = self.db.lock().await;
                    db.update_room_preview(room_id, content, message.created_at)
                };
                if let Err(e) = preview_result {
                    tracing::warn!(room_id, error = %e, "failed to update preview for system message");
                }
            }
            Err(e) => {
                tracing::warn!(room_id, error = %e, "failed to create system message");
            }
        }
    }
}

/// Render stored content for a response: system messages pass through, the
/// rest decrypt under their recorded key version, and failures become the
/// sentinels instead of errors so one bad message cannot break a page.
pub(crate) async fn render_content(encryption: &MessageEncryption, message: &Message) -> String {
    if message.is_system() {
        return message.content.clone();
    }

    match encryption
        .decrypt_message(&message.content, &message.room_id, message.key_version)
        .await
    {
        Ok(text) => text,
        Err(DecryptError::Utf8) => {
            tracing::warn!(
                message_id = %message.id,
                room_id = %message.room_id,
                "decrypted content is not valid UTF-8"
            );
            FORMAT_ERROR.to_string()
        }
        Err(DecryptError::Failed) => DECRYPTION_FAILED.to_string(),
    }
}

/// Last-message preview: a bounded excerpt for text, a sentinel for known
/// media types, `[message]` for anything else.
fn build_preview(content: &str, message_type: &str) -> String {
    match message_type {
        "text" => {
            let mut chars = content.chars();
            let excerpt: String = chars.by_ref().take(PREVIEW_MAX_CHARS).collect();
            if chars.next().is_some() {
                format!("{excerpt}...")
            } else {
                excerpt
            }
        }
        "image" => "[image]".to_string(),
        "file" => "[file]".to_string(),
        "audio" => "[voice]".to_string(),
        "video" => "[video]".to_string(),
        "location" => "[location]".to_string(),
        _ => "[message]".to_string(),
    }
}
