//! Request metadata propagated through every core operation.

use uuid::Uuid;

/// Caller context captured at the transport edge: client IP (after proxy
/// headers), user agent, and a correlation id. Audit events and logs carry
/// these fields.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    pub ip_address: String,
    pub user_agent: String,
    pub request_id: String,
}

impl RequestMetadata {
    /// Build metadata for a request, generating a request id when the caller
    /// did not supply one.
    pub fn new(ip_address: String, user_agent: String, request_id: Option<String>) -> Self {
        Self {
            ip_address,
            user_agent,
            request_id: request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }

    /// Placeholder metadata for internal callers (startup tasks, tests).
    pub fn internal() -> Self {
        Self {
            ip_address: "unknown".to_string(),
            user_agent: "internal".to_string(),
            request_id: Uuid::new_v4().to_string(),
        }
    }
}
