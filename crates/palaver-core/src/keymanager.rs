//! Persistent room-key management.
//!
//! Each room gets a 256-bit DEK used to seal message bodies. DEKs live in the
//! `encryption_keys` collection wrapped under the master key and are cached
//! here behind a read/write lock. The reader fast path never takes the write
//! lock; a miss re-checks under the write lock before loading or generating,
//! so concurrent callers agree on a single DEK per room.
//!
//! Callers always receive copies of key material, never cache slots. Evicted
//! and dropped entries are zeroed.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{oneshot, Mutex, RwLock};
use zeroize::{Zeroize, Zeroizing};

use palaver_shared::constants::{
    KEEP_OLD_KEYS, KEY_MAX_AGE_DAYS, KEY_ROTATION_INTERVAL_HOURS, MASTER_KEY_SIZE,
};
use palaver_shared::crypto::{self, SymmetricKey};
use palaver_shared::ids::valid_object_id;

use palaver_store::RoomKeyRecord;

use crate::error::CoreError;
use crate::SharedDb;

/// Rotation policy for room DEKs.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub enabled: bool,
    pub rotation_interval: Duration,
    pub max_key_age: Duration,
    pub keep_old_keys: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            rotation_interval: Duration::hours(KEY_ROTATION_INTERVAL_HOURS),
            max_key_age: Duration::days(KEY_MAX_AGE_DAYS),
            keep_old_keys: KEEP_OLD_KEYS,
        }
    }
}

/// A DEK copy handed to callers, zeroed on drop, tagged with its version so
/// messages can record which key sealed them.
pub struct RoomKeyHandle {
    pub key: Zeroizing<SymmetricKey>,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyManagerStats {
    pub total: usize,
    pub active: usize,
    pub archived: usize,
    pub revoked: usize,
}

struct CachedKey {
    value: SymmetricKey,
    version: i64,
    created_at: DateTime<Utc>,
}

impl CachedKey {
    fn handle(&self) -> RoomKeyHandle {
        RoomKeyHandle {
            key: Zeroizing::new(self.value),
            version: self.version,
        }
    }
}

impl Drop for CachedKey {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

#[derive(Default)]
struct KeyCache {
    active: HashMap<String, CachedKey>,
    archived: HashMap<String, Vec<CachedKey>>,
}

struct RotationTask {
    stop: oneshot::Sender<()>,
}

/// Key manager backed by the durable key store.
pub struct KeyManager {
    cache: RwLock<KeyCache>,
    master_key: SymmetricKey,
    db: SharedDb,
    policy: RotationPolicy,
    rotation: Mutex<Option<RotationTask>>,
}

impl KeyManager {
    /// Create a manager around its own copy of the master key.
    pub fn new(master_key: &[u8], db: SharedDb, policy: RotationPolicy) -> Result<Self, CoreError> {
        if master_key.len() != MASTER_KEY_SIZE {
            return Err(CoreError::InvalidArgument(format!(
                "master key must be {MASTER_KEY_SIZE} bytes"
            )));
        }

        let mut key = [0u8; MASTER_KEY_SIZE];
        key.copy_from_slice(master_key);

        Ok(Self {
            cache: RwLock::new(KeyCache::default()),
            master_key: key,
            db,
            policy,
            rotation: Mutex::new(None),
        })
    }

    /// Return a copy of the room's active DEK, creating and persisting one on
    /// first use.
    pub async fn get_or_create_room_key(&self, room_id: &str) -> Result<RoomKeyHandle, CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }

        // Reader fast path.
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.active.get(room_id) {
                return Ok(cached.handle());
            }
        }

        let mut cache = self.cache.write().await;

        // Re-check: another writer may have filled the slot while we waited.
        if let Some(cached) = cache.active.get(room_id) {
            return Ok(cached.handle());
        }

        let record = {
            let db = self.db.lock().await;
            db.get_active_key(room_id)
        }
        .map_err(CoreError::from)?;

        if let Some(record) = record {
            let value = self.unwrap_key(&record.wrapped_key)?;
            let cached = CachedKey {
                value,
                version: record.key_version,
                created_at: record.created_at,
            };
            let handle = cached.handle();
            cache.active.insert(room_id.to_string(), cached);
            return Ok(handle);
        }

        // No key yet: generate and persist version 1.
        let value = crypto::generate_key();
        let wrapped = self.wrap_key(&value)?;

        let now = Utc::now();
        let record = RoomKeyRecord {
            room_id: room_id.to_string(),
            key_version: 1,
            wrapped_key: wrapped,
            created_at: now,
            rotated_at: now,
            is_active: true,
            expires_at: now + self.policy.max_key_age,
        };

        {
            let db = self.db.lock().await;
            db.save_key(&record)
        }
        .map_err(|e| {
            tracing::error!(room_id, error = %e, "failed to persist new room key");
            CoreError::KeyPersistence
        })?;

        let cached = CachedKey {
            value,
            version: 1,
            created_at: now,
        };
        let handle = cached.handle();
        cache.active.insert(room_id.to_string(), cached);

        tracing::info!(room_id, version = 1, "generated room key");
        Ok(handle)
    }

    /// Return a copy of the DEK for a specific version, active or archived.
    pub async fn get_key_for_decryption(
        &self,
        room_id: &str,
        version: i64,
    ) -> Result<Zeroizing<SymmetricKey>, CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.active.get(room_id) {
                if cached.version == version {
                    return Ok(Zeroizing::new(cached.value));
                }
            }
            if let Some(archive) = cache.archived.get(room_id) {
                if let Some(cached) = archive.iter().find(|k| k.version == version) {
                    return Ok(Zeroizing::new(cached.value));
                }
            }
        }

        let mut cache = self.cache.write().await;

        if let Some(archive) = cache.archived.get(room_id) {
            if let Some(cached) = archive.iter().find(|k| k.version == version) {
                return Ok(Zeroizing::new(cached.value));
            }
        }

        let record = {
            let db = self.db.lock().await;
            db.get_key_by_version(room_id, version)
        }
        .map_err(CoreError::from)?
        .ok_or(CoreError::KeyNotFound)?;

        let value = self.unwrap_key(&record.wrapped_key)?;
        let copy = Zeroizing::new(value);

        let cached = CachedKey {
            value,
            version: record.key_version,
            created_at: record.created_at,
        };
        if record.is_active && !cache.active.contains_key(room_id) {
            cache.active.insert(room_id.to_string(), cached);
        } else {
            cache
                .archived
                .entry(room_id.to_string())
                .or_default()
                .push(cached);
        }

        Ok(copy)
    }

    /// Rotate the room's DEK regardless of policy. Returns the new version.
    pub async fn force_rotate(&self, room_id: &str) -> Result<i64, CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }

        let mut cache = self.cache.write().await;
        self.rotate_locked(&mut cache, room_id).await
    }

    /// Rotation body; callers hold the write lock, so generate-and-persist is
    /// exclusive per process.
    async fn rotate_locked(
        &self,
        cache: &mut KeyCache,
        room_id: &str,
    ) -> Result<i64, CoreError> {
        let (current_version, current_created_at) = match cache.active.get(room_id) {
            Some(cached) => (cached.version, cached.created_at),
            None => {
                let record = {
                    let db = self.db.lock().await;
                    db.get_active_key(room_id)
                }
                .map_err(CoreError::from)?
                .ok_or(CoreError::KeyNotFound)?;

                let value = self.unwrap_key(&record.wrapped_key)?;
                cache.active.insert(
                    room_id.to_string(),
                    CachedKey {
                        value,
                        version: record.key_version,
                        created_at: record.created_at,
                    },
                );
                (record.key_version, record.created_at)
            }
        };

        let new_version = current_version + 1;
        let value = crypto::generate_key();
        let wrapped = self.wrap_key(&value)?;

        let now = Utc::now();
        let record = RoomKeyRecord {
            room_id: room_id.to_string(),
            key_version: new_version,
            wrapped_key: wrapped,
            created_at: current_created_at,
            rotated_at: now,
            is_active: true,
            expires_at: now + self.policy.max_key_age,
        };

        // Persistence failure aborts the rotation; the cache keeps serving
        // the prior DEK.
        {
            let db = self.db.lock().await;
            db.save_key(&record)
        }
        .map_err(|e| {
            tracing::error!(room_id, error = %e, "failed to persist rotated key");
            CoreError::KeyPersistence
        })?;

        if let Some(old) = cache.active.remove(room_id) {
            let archive = cache.archived.entry(room_id.to_string()).or_default();
            archive.push(old);
            // Evicted entries zero themselves on drop.
            while archive.len() > self.policy.keep_old_keys {
                archive.remove(0);
            }
        }

        cache.active.insert(
            room_id.to_string(),
            CachedKey {
                value,
                version: new_version,
                created_at: current_created_at,
            },
        );

        tracing::info!(room_id, version = new_version, "rotated room key");
        Ok(new_version)
    }

    /// Delete expired inactive wrapped keys. Run once at startup and from
    /// the rotation ticker.
    pub async fn delete_expired(&self) -> Result<usize, CoreError> {
        let count = {
            let db = self.db.lock().await;
            db.delete_expired_keys()
        }
        .map_err(CoreError::from)?;

        if count > 0 {
            tracing::info!(count, "deleted expired room keys");
        }
        Ok(count)
    }

    /// Start the hourly rotation check. Idempotent; a second call while the
    /// ticker runs is a no-op.
    pub async fn start_auto_rotation(self: Arc<Self>) {
        let mut guard = self.rotation.lock().await;
        if guard.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let manager = Arc::clone(&self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = ticker.tick() => manager.check_and_rotate().await,
                }
            }
        });

        *guard = Some(RotationTask { stop: stop_tx });
        tracing::info!("key auto-rotation started");
    }

    /// Stop the rotation ticker.
    pub async fn stop_auto_rotation(&self) {
        if let Some(task) = self.rotation.lock().await.take() {
            let _ = task.stop.send(());
            tracing::info!("key auto-rotation stopped");
        }
    }

    /// One pass of the rotation check: rotate every active key whose last
    /// rotation or age exceeds policy, then sweep expired ones.
    pub async fn check_and_rotate(&self) {
        if !self.policy.enabled {
            return;
        }

        let due = {
            let db = self.db.lock().await;
            db.keys_due_for_rotation(self.policy.rotation_interval)
        };

        let due = match due {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "failed to list keys due for rotation");
                return;
            }
        };

        let now = Utc::now();
        for record in due {
            let overdue = now - record.rotated_at > self.policy.rotation_interval
                || now - record.created_at > self.policy.max_key_age;
            if !overdue {
                continue;
            }
            match self.force_rotate(&record.room_id).await {
                Ok(version) => {
                    tracing::info!(room_id = %record.room_id, version, "auto-rotated room key")
                }
                Err(e) => {
                    tracing::error!(room_id = %record.room_id, error = %e, "auto-rotation failed")
                }
            }
        }

        if let Err(e) = self.delete_expired().await {
            tracing::error!(error = %e, "expired key sweep failed");
        }
    }

    /// Cache statistics.
    pub async fn stats(&self) -> KeyManagerStats {
        let cache = self.cache.read().await;
        let active = cache.active.len();
        let archived = cache.archived.values().map(Vec::len).sum();
        KeyManagerStats {
            total: active + archived,
            active,
            archived,
            revoked: 0,
        }
    }

    fn wrap_key(&self, dek: &SymmetricKey) -> Result<String, CoreError> {
        let framed = crypto::encrypt_bytes(dek, &self.master_key).map_err(|e| {
            tracing::error!(error = %e, "failed to wrap room key");
            CoreError::KeyGeneration
        })?;
        Ok(BASE64.encode(framed))
    }

    fn unwrap_key(&self, wrapped: &str) -> Result<SymmetricKey, CoreError> {
        let data = BASE64
            .decode(wrapped)
            .map_err(|_| CoreError::KeyDecryption)?;
        let mut bytes = crypto::decrypt_bytes(&data, &self.master_key)
            .map_err(|_| CoreError::KeyDecryption)?;

        if bytes.len() != MASTER_KEY_SIZE {
            bytes.zeroize();
            return Err(CoreError::KeyDecryption);
        }

        let mut key = [0u8; MASTER_KEY_SIZE];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(key)
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_shared::ids::new_object_id;
    use palaver_store::Database;

    fn shared_db() -> SharedDb {
        Arc::new(Mutex::new(Database::open_in_memory().unwrap()))
    }

    fn manager(db: SharedDb) -> KeyManager {
        let master = crypto::generate_key();
        KeyManager::new(&master, db, RotationPolicy::default()).unwrap()
    }

    #[test]
    fn rejects_short_master_key() {
        let db = shared_db();
        assert!(matches!(
            KeyManager::new(&[0u8; 16], db, RotationPolicy::default()),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn creates_and_caches_room_key() {
        let db = shared_db();
        let km = manager(db.clone());
        let room_id = new_object_id();

        let first = km.get_or_create_room_key(&room_id).await.unwrap();
        assert_eq!(first.version, 1);

        // Same key on repeat, from cache.
        let second = km.get_or_create_room_key(&room_id).await.unwrap();
        assert_eq!(*first.key, *second.key);

        // Persisted wrapped, not in the clear.
        let record = db
            .lock()
            .await
            .get_active_key(&room_id)
            .unwrap()
            .expect("record persisted");
        assert!(record.is_active);
        assert_ne!(record.wrapped_key.as_bytes(), &first.key[..]);
    }

    #[tokio::test]
    async fn reloads_key_from_store() {
        let db = shared_db();
        let master = crypto::generate_key();

        let km = KeyManager::new(&master, db.clone(), RotationPolicy::default()).unwrap();
        let room_id = new_object_id();
        let original = km.get_or_create_room_key(&room_id).await.unwrap();
        drop(km);

        // A fresh manager over the same store and master key recovers the DEK.
        let km = KeyManager::new(&master, db, RotationPolicy::default()).unwrap();
        let reloaded = km.get_or_create_room_key(&room_id).await.unwrap();
        assert_eq!(*original.key, *reloaded.key);
        assert_eq!(reloaded.version, 1);
    }

    #[tokio::test]
    async fn wrong_master_key_yields_different_dek() {
        let db = shared_db();
        let room_id = new_object_id();

        let km = manager(db.clone());
        let original = km.get_or_create_room_key(&room_id).await.unwrap();
        drop(km);

        // CTR unwrap has no integrity check: a manager with a different
        // master key recovers garbage, never the original DEK.
        let km = manager(db);
        let recovered = km.get_or_create_room_key(&room_id).await.unwrap();
        assert_eq!(recovered.version, 1);
        assert_ne!(*recovered.key, *original.key);
    }

    #[tokio::test]
    async fn force_rotate_bumps_version_and_archives() {
        let db = shared_db();
        let km = manager(db.clone());
        let room_id = new_object_id();

        let v1 = km.get_or_create_room_key(&room_id).await.unwrap();
        let new_version = km.force_rotate(&room_id).await.unwrap();
        assert_eq!(new_version, 2);

        let v2 = km.get_or_create_room_key(&room_id).await.unwrap();
        assert_eq!(v2.version, 2);
        assert_ne!(*v1.key, *v2.key);

        // Old version still available for decryption.
        let archived = km.get_key_for_decryption(&room_id, 1).await.unwrap();
        assert_eq!(*archived, *v1.key);

        // Exactly one active record in the store.
        let all = db.lock().await.get_all_keys(&room_id).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|k| k.is_active).count(), 1);
        assert_eq!(all[0].key_version, 2);
    }

    #[tokio::test]
    async fn force_rotate_unknown_room() {
        let db = shared_db();
        let km = manager(db);
        assert!(matches!(
            km.force_rotate(&new_object_id()).await,
            Err(CoreError::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn decryption_key_for_missing_version() {
        let db = shared_db();
        let km = manager(db);
        let room_id = new_object_id();
        km.get_or_create_room_key(&room_id).await.unwrap();

        assert!(matches!(
            km.get_key_for_decryption(&room_id, 7).await,
            Err(CoreError::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn archived_ring_is_bounded() {
        let db = shared_db();
        let master = crypto::generate_key();
        let policy = RotationPolicy {
            keep_old_keys: 2,
            ..RotationPolicy::default()
        };
        let km = KeyManager::new(&master, db, policy).unwrap();
        let room_id = new_object_id();

        km.get_or_create_room_key(&room_id).await.unwrap();
        for _ in 0..4 {
            km.force_rotate(&room_id).await.unwrap();
        }

        let stats = km.stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.archived, 2);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.revoked, 0);
    }

    #[tokio::test]
    async fn concurrent_callers_get_one_key() {
        let db = shared_db();
        let km = Arc::new(manager(db));
        let room_id = new_object_id();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let km = Arc::clone(&km);
            let room_id = room_id.clone();
            tasks.push(tokio::spawn(async move {
                km.get_or_create_room_key(&room_id).await.unwrap().key
            }));
        }

        let mut keys = Vec::new();
        for task in tasks {
            keys.push(task.await.unwrap());
        }
        assert!(keys.windows(2).all(|w| *w[0] == *w[1]));

        let stats = km.stats().await;
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn check_and_rotate_rotates_stale_keys() {
        let db = shared_db();
        let master = crypto::generate_key();
        let policy = RotationPolicy {
            enabled: true,
            ..RotationPolicy::default()
        };
        let km = KeyManager::new(&master, db.clone(), policy).unwrap();
        let room_id = new_object_id();

        km.get_or_create_room_key(&room_id).await.unwrap();

        // Age the record past the rotation interval.
        let mut record = db
            .lock()
            .await
            .get_active_key(&room_id)
            .unwrap()
            .unwrap();
        record.rotated_at = Utc::now() - Duration::hours(48);
        db.lock().await.save_key(&record).unwrap();

        km.check_and_rotate().await;

        let active = db.lock().await.get_active_key(&room_id).unwrap().unwrap();
        assert_eq!(active.key_version, 2);
    }

    #[tokio::test]
    async fn check_and_rotate_noop_when_disabled() {
        let db = shared_db();
        let km = manager(db.clone());
        let room_id = new_object_id();

        km.get_or_create_room_key(&room_id).await.unwrap();
        let mut record = db
            .lock()
            .await
            .get_active_key(&room_id)
            .unwrap()
            .unwrap();
        record.rotated_at = Utc::now() - Duration::hours(48);
        db.lock().await.save_key(&record).unwrap();

        km.check_and_rotate().await;

        let active = db.lock().await.get_active_key(&room_id).unwrap().unwrap();
        assert_eq!(active.key_version, 1);
    }

    #[tokio::test]
    async fn auto_rotation_start_stop() {
        let db = shared_db();
        let km = Arc::new(manager(db));

        Arc::clone(&km).start_auto_rotation().await;
        // Second start is a no-op.
        Arc::clone(&km).start_auto_rotation().await;
        km.stop_auto_rotation().await;
        // Stopping again does nothing.
        km.stop_auto_rotation().await;
    }

    #[tokio::test]
    async fn expired_sweep() {
        let db = shared_db();
        let km = manager(db.clone());
        let room_id = new_object_id();

        let now = Utc::now();
        db.lock()
            .await
            .save_key(&RoomKeyRecord {
                room_id: room_id.clone(),
                key_version: 1,
                wrapped_key: "stale".to_string(),
                created_at: now - Duration::days(60),
                rotated_at: now - Duration::days(60),
                is_active: false,
                expires_at: now - Duration::days(30),
            })
            .unwrap();

        assert_eq!(km.delete_expired().await.unwrap(), 1);
    }
}
