//! Message-level encryption service.
//!
//! Wraps the cipher and the key manager behind the two calls the service
//! layer needs. When encryption is disabled by configuration, content is
//! stored with a `plaintext:` prefix instead of an envelope.

use std::sync::Arc;

use thiserror::Error;

use palaver_shared::constants::PLAINTEXT_PREFIX;
use palaver_shared::{crypto, CryptoError};

use crate::error::CoreError;
use crate::keymanager::KeyManager;

/// Why a stored value could not be rendered back to text. The read path maps
/// `Utf8` to the format-error sentinel and everything else to the
/// decryption-failed sentinel.
#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("decryption failed")]
    Failed,

    #[error("decrypted content is not valid UTF-8")]
    Utf8,
}

#[derive(Clone)]
pub struct MessageEncryption {
    enabled: bool,
    key_manager: Arc<KeyManager>,
}

impl MessageEncryption {
    pub fn new(enabled: bool, key_manager: Arc<KeyManager>) -> Self {
        Self {
            enabled,
            key_manager,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Seal content under the room's active DEK. Returns the stored form and
    /// the key version it was sealed under (`None` when encryption is off).
    pub async fn encrypt_message(
        &self,
        content: &str,
        room_id: &str,
    ) -> Result<(String, Option<i64>), CoreError> {
        if !self.enabled {
            tracing::warn!(room_id, "encryption disabled, storing message as plaintext");
            return Ok((format!("{PLAINTEXT_PREFIX}{content}"), None));
        }

        let handle = self.key_manager.get_or_create_room_key(room_id).await?;

        let envelope = crypto::encrypt(content, &handle.key).map_err(|e| match e {
            CryptoError::EmptyPlaintext => {
                CoreError::InvalidArgument("message content cannot be empty".to_string())
            }
            other => {
                tracing::error!(room_id, error = %other, "message encryption failed");
                CoreError::Encryption
            }
        })?;

        Ok((envelope, Some(handle.version)))
    }

    /// Render stored content back to text.
    ///
    /// Pass the key version recorded with the message; `None` falls back to
    /// the active key. Values without an envelope tag (plaintext-prefixed or
    /// historical raw text) pass through untouched.
    pub async fn decrypt_message(
        &self,
        content: &str,
        room_id: &str,
        key_version: Option<i64>,
    ) -> Result<String, DecryptError> {
        if let Some(rest) = content.strip_prefix(PLAINTEXT_PREFIX) {
            return Ok(rest.to_string());
        }

        if !crypto::is_encrypted(content) {
            return Ok(content.to_string());
        }

        let key = match key_version {
            Some(version) => self
                .key_manager
                .get_key_for_decryption(room_id, version)
                .await,
            None => self
                .key_manager
                .get_or_create_room_key(room_id)
                .await
                .map(|h| h.key),
        }
        .map_err(|e| {
            tracing::warn!(room_id, ?key_version, error = %e, "no key available for decryption");
            DecryptError::Failed
        })?;

        match crypto::decrypt(content, &key) {
            Ok(text) => Ok(text),
            Err(CryptoError::InvalidUtf8) => Err(DecryptError::Utf8),
            Err(e) => {
                tracing::warn!(room_id, error = %e, "message decryption failed");
                Err(DecryptError::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymanager::RotationPolicy;
    use crate::SharedDb;
    use palaver_shared::ids::new_object_id;
    use palaver_store::Database;
    use tokio::sync::Mutex;

    fn encryption(enabled: bool) -> MessageEncryption {
        let db: SharedDb = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let km = KeyManager::new(&crypto::generate_key(), db, RotationPolicy::default()).unwrap();
        MessageEncryption::new(enabled, Arc::new(km))
    }

    #[tokio::test]
    async fn round_trip_with_version() {
        let enc = encryption(true);
        let room_id = new_object_id();

        let (stored, version) = enc.encrypt_message("hello", &room_id).await.unwrap();
        assert!(crypto::is_encrypted(&stored));
        assert_eq!(version, Some(1));

        let text = enc.decrypt_message(&stored, &room_id, version).await.unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn disabled_mode_uses_plaintext_prefix() {
        let enc = encryption(false);
        let room_id = new_object_id();

        let (stored, version) = enc.encrypt_message("hello", &room_id).await.unwrap();
        assert_eq!(stored, "plaintext:hello");
        assert_eq!(version, None);

        let text = enc.decrypt_message(&stored, &room_id, None).await.unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn untagged_content_passes_through() {
        let enc = encryption(true);
        let room_id = new_object_id();

        let text = enc
            .decrypt_message("just text", &room_id, None)
            .await
            .unwrap();
        assert_eq!(text, "just text");
    }

    #[tokio::test]
    async fn empty_content_rejected() {
        let enc = encryption(true);
        let room_id = new_object_id();

        assert!(matches!(
            enc.encrypt_message("", &room_id).await,
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn survives_rotation_via_recorded_version() {
        let db: SharedDb = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let km = Arc::new(
            KeyManager::new(&crypto::generate_key(), db, RotationPolicy::default()).unwrap(),
        );
        let enc = MessageEncryption::new(true, Arc::clone(&km));
        let room_id = new_object_id();

        let (stored, version) = enc.encrypt_message("before", &room_id).await.unwrap();
        km.force_rotate(&room_id).await.unwrap();

        let text = enc.decrypt_message(&stored, &room_id, version).await.unwrap();
        assert_eq!(text, "before");
    }
}
