mod api;
mod config;
mod error;
mod rate_limit;
mod request_meta;
mod sse_limit;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use palaver_core::audit::AuditService;
use palaver_core::encryption::MessageEncryption;
use palaver_core::keymanager::{KeyManager, RotationPolicy};
use palaver_core::service::ServiceLimits;
use palaver_core::{ChatService, SharedDb};
use palaver_shared::crypto;
use palaver_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::sse_limit::SseLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,palaver_server=debug")),
        )
        .init();

    info!("starting palaver chat server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {e}");
    }
    info!(?config, "loaded configuration");

    if config.tls.enabled {
        info!(
            cert = ?config.tls.cert_file,
            mutual = config.tls.ca_file.is_some(),
            "tls block present, termination delegated to the fronting proxy"
        );
    }

    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let db: SharedDb = Arc::new(Mutex::new(database));

    let master_key = match config.master_key {
        Some(key) => key,
        None => {
            warn!(
                "PALAVER_MASTER_KEY is not set; using an ephemeral master key. \
                 Encrypted history will be unreadable after restart (dev-only)."
            );
            crypto::generate_key()
        }
    };

    let policy = RotationPolicy {
        enabled: config.key_rotation_enabled,
        ..RotationPolicy::default()
    };
    let key_manager = Arc::new(KeyManager::new(&master_key, Arc::clone(&db), policy)?);

    // Startup sweep of expired wrapped keys.
    match key_manager.delete_expired().await {
        Ok(count) if count > 0 => info!(count, "cleaned up expired room keys"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "expired key sweep failed"),
    }

    if config.key_rotation_enabled {
        Arc::clone(&key_manager).start_auto_rotation().await;
    }

    let key_stats = key_manager.stats().await;
    info!(
        active_keys = key_stats.active,
        archived_keys = key_stats.archived,
        "key manager initialized"
    );

    if !config.encryption_enabled {
        warn!("message encryption is DISABLED; content will be stored in plain text");
    }
    let encryption = MessageEncryption::new(config.encryption_enabled, Arc::clone(&key_manager));

    let audit = AuditService::new(config.audit_enabled);

    let limits = ServiceLimits {
        max_members: config.max_room_members,
        max_name_len: config.max_room_name_len,
        max_message_len: config.max_message_len,
    };

    let service = Arc::new(ChatService::new(
        db,
        key_manager,
        encryption,
        audit,
        limits,
    ));

    let rate_limiter = RateLimiter::new(config.rate_limit_rps, config.rate_limit_burst);
    let sse_limiter = SseLimiter::new(
        config.sse.max_per_ip,
        config.sse.max_total,
        config.sse.min_interval,
    );

    let state = AppState {
        service,
        rate_limiter: rate_limiter.clone(),
        sse_limiter: sse_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // Rate-limit buckets purge every 5 min, evicting entries idle >10 min;
    // SSE inter-arrival records age out on the same cadence.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.purge_stale(std::time::Duration::from_secs(600));
            sse_limiter.purge_stale(std::time::Duration::from_secs(600));
        }
    });

    let http_addr = config.http_addr;

    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl+c, shutting down");
        }
    }

    Ok(())
}
