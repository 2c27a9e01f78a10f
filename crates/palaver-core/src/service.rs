//! The orchestration layer behind the RPC surface.
//!
//! [`ChatService`] owns the store handle, the key manager, the encryption
//! service and the audit emitter; the room and message operations are
//! implemented in the sibling `rooms` and `messages` modules, stream sessions
//! in `stream`.

use std::sync::Arc;

use palaver_shared::constants::{DEFAULT_MAX_ROOM_MEMBERS, MAX_MESSAGE_LEN, MAX_ROOM_NAME_LEN};

use crate::audit::AuditService;
use crate::encryption::MessageEncryption;
use crate::keymanager::KeyManager;
use crate::SharedDb;

/// Validation bounds for room and message inputs.
#[derive(Debug, Clone)]
pub struct ServiceLimits {
    pub max_members: usize,
    pub max_name_len: usize,
    pub max_message_len: usize,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            max_members: DEFAULT_MAX_ROOM_MEMBERS,
            max_name_len: MAX_ROOM_NAME_LEN,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

pub struct ChatService {
    pub(crate) db: SharedDb,
    pub(crate) key_manager: Arc<KeyManager>,
    pub(crate) encryption: MessageEncryption,
    pub(crate) audit: AuditService,
    pub(crate) limits: ServiceLimits,
}

impl ChatService {
    pub fn new(
        db: SharedDb,
        key_manager: Arc<KeyManager>,
        encryption: MessageEncryption,
        audit: AuditService,
        limits: ServiceLimits,
    ) -> Self {
        Self {
            db,
            key_manager,
            encryption,
            audit,
            limits,
        }
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    pub fn audit(&self) -> &AuditService {
        &self.audit
    }
}
