//! Best-effort audit trail.
//!
//! Events flow through an unbounded channel to a writer task that serializes
//! them as single-line JSON on the `audit` tracing target, so emission never
//! blocks a request. When the service is disabled every emit is a no-op.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use palaver_shared::RequestMetadata;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub action: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub request_id: String,
}

#[derive(Clone)]
pub struct AuditService {
    tx: Option<mpsc::UnboundedSender<AuditEvent>>,
}

impl AuditService {
    /// Start the writer task. Call once at startup, inside the runtime.
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            return Self { tx: None };
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!(target: "audit", "{json}"),
                    Err(e) => {
                        tracing::error!(target: "audit", error = %e, "failed to encode audit event")
                    }
                }
            }
        });

        Self { tx: Some(tx) }
    }

    /// An audit service that drops everything. For tests and disabled
    /// configurations outside a runtime.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    fn emit(&self, event: AuditEvent) {
        if let Some(tx) = &self.tx {
            // Best-effort: a closed sink must not fail the caller.
            let _ = tx.send(event);
        }
    }

    fn base(&self, event_type: &str, action: &str, result: &str, meta: &RequestMetadata) -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            user_id: None,
            room_id: None,
            message_id: None,
            action: action.to_string(),
            result: result.to_string(),
            details: None,
            ip_address: Some(meta.ip_address.clone()),
            user_agent: Some(meta.user_agent.clone()),
            request_id: meta.request_id.clone(),
        }
    }

    pub fn room_created(&self, meta: &RequestMetadata, user_id: &str, room_id: &str, room_type: &str) {
        let mut event = self.base("room.create", "create_room", "success", meta);
        event.user_id = Some(user_id.to_string());
        event.room_id = Some(room_id.to_string());
        event.details = Some(serde_json::json!({ "room_type": room_type }));
        self.emit(event);
    }

    pub fn room_joined(&self, meta: &RequestMetadata, user_id: &str, room_id: &str) {
        let mut event = self.base("room.join", "join_room", "success", meta);
        event.user_id = Some(user_id.to_string());
        event.room_id = Some(room_id.to_string());
        self.emit(event);
    }

    pub fn room_left(&self, meta: &RequestMetadata, user_id: &str, room_id: &str) {
        let mut event = self.base("room.leave", "leave_room", "success", meta);
        event.user_id = Some(user_id.to_string());
        event.room_id = Some(room_id.to_string());
        self.emit(event);
    }

    pub fn message_sent(
        &self,
        meta: &RequestMetadata,
        user_id: &str,
        room_id: &str,
        message_id: &str,
        message_type: &str,
    ) {
        let mut event = self.base("message.send", "send_message", "success", meta);
        event.user_id = Some(user_id.to_string());
        event.room_id = Some(room_id.to_string());
        event.message_id = Some(message_id.to_string());
        event.details = Some(serde_json::json!({ "message_type": message_type }));
        self.emit(event);
    }

    pub fn message_read(
        &self,
        meta: &RequestMetadata,
        user_id: &str,
        room_id: &str,
        message_id: Option<&str>,
    ) {
        let mut event = self.base("message.read", "mark_as_read", "success", meta);
        event.user_id = Some(user_id.to_string());
        event.room_id = Some(room_id.to_string());
        event.message_id = message_id.map(str::to_string);
        self.emit(event);
    }

    pub fn member_added(&self, meta: &RequestMetadata, operator_id: &str, room_id: &str, member_id: &str) {
        let mut event = self.base("member.add", "add_member", "success", meta);
        event.user_id = Some(operator_id.to_string());
        event.room_id = Some(room_id.to_string());
        event.details = Some(serde_json::json!({ "member_id": member_id }));
        self.emit(event);
    }

    pub fn member_removed(&self, meta: &RequestMetadata, operator_id: &str, room_id: &str, member_id: &str) {
        let mut event = self.base("member.remove", "remove_member", "success", meta);
        event.user_id = Some(operator_id.to_string());
        event.room_id = Some(room_id.to_string());
        event.details = Some(serde_json::json!({ "member_id": member_id }));
        self.emit(event);
    }

    pub fn auth_failure(&self, meta: &RequestMetadata, user_id: &str, reason: &str) {
        let mut event = self.base("auth.failure", "authenticate", "failure", meta);
        event.user_id = Some(user_id.to_string());
        event.details = Some(serde_json::json!({ "reason": reason }));
        self.emit(event);
    }

    pub fn rate_limit_exceeded(&self, meta: &RequestMetadata, endpoint: &str) {
        let mut event = self.base("rate_limit.exceeded", "api_request", "blocked", meta);
        event.details = Some(serde_json::json!({ "endpoint": endpoint }));
        self.emit(event);
    }

    pub fn suspicious_activity(&self, meta: &RequestMetadata, user_id: &str, description: &str) {
        let mut event = self.base("suspicious_activity", "flag_activity", "flagged", meta);
        event.user_id = Some(user_id.to_string());
        event.details = Some(serde_json::json!({ "description": description }));
        self.emit(event);
    }

    pub fn access_denied(&self, meta: &RequestMetadata, user_id: &str, room_id: &str, reason: &str) {
        let mut event = self.base("access.denied", "access_resource", "denied", meta);
        event.user_id = Some(user_id.to_string());
        event.room_id = Some(room_id.to_string());
        event.details = Some(serde_json::json!({ "reason": reason }));
        self.emit(event);
    }

    pub fn data_modification(
        &self,
        meta: &RequestMetadata,
        user_id: &str,
        resource_type: &str,
        resource_id: &str,
        operation: &str,
    ) {
        let mut event = self.base("data.modification", operation, "success", meta);
        event.user_id = Some(user_id.to_string());
        event.details = Some(serde_json::json!({
            "resource_type": resource_type,
            "resource_id": resource_id,
        }));
        self.emit(event);
    }

    pub fn security_event(&self, meta: &RequestMetadata, kind: &str, severity: &str, description: &str) {
        let mut event = self.base("security.event", kind, severity, meta);
        event.details = Some(serde_json::json!({ "description": description }));
        self.emit(event);
    }
}
