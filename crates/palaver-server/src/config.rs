//! Server configuration from environment variables.
//!
//! Invalid values never abort startup: they are logged and replaced with the
//! default. The one hard failure is an enabled TLS block without certificate
//! paths, caught by [`ServerConfig::validate`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use palaver_shared::constants::{
    DEFAULT_MAX_ROOM_MEMBERS, MASTER_KEY_SIZE, MAX_MESSAGE_LEN, MAX_ROOM_NAME_LEN,
    SSE_HEARTBEAT_SECS, SSE_MAX_PER_IP, SSE_MAX_TOTAL, SSE_MIN_INTERVAL_SECS,
};

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SseConfig {
    pub max_per_ip: usize,
    pub max_total: usize,
    pub min_interval: Duration,
    pub heartbeat_interval: Duration,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    pub db_path: Option<PathBuf>,
    /// Decoded master key; `None` means generate an ephemeral one (dev only).
    pub master_key: Option<[u8; MASTER_KEY_SIZE]>,
    pub encryption_enabled: bool,
    pub audit_enabled: bool,
    pub key_rotation_enabled: bool,
    pub tls: TlsConfig,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: f64,
    pub sse: SseConfig,
    pub max_room_members: usize,
    pub max_room_name_len: usize,
    pub max_message_len: usize,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("db_path", &self.db_path)
            .field("master_key", &self.master_key.map(|_| "<set>"))
            .field("encryption_enabled", &self.encryption_enabled)
            .field("audit_enabled", &self.audit_enabled)
            .field("key_rotation_enabled", &self.key_rotation_enabled)
            .field("tls", &self.tls)
            .field("rate_limit_rps", &self.rate_limit_rps)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("sse", &self.sse)
            .field("max_room_members", &self.max_room_members)
            .field("max_room_name_len", &self.max_room_name_len)
            .field("max_message_len", &self.max_message_len)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            db_path: None,
            master_key: None,
            encryption_enabled: true,
            audit_enabled: true,
            key_rotation_enabled: false,
            tls: TlsConfig {
                enabled: false,
                cert_file: None,
                key_file: None,
                ca_file: None,
            },
            rate_limit_rps: 10.0,
            rate_limit_burst: 30.0,
            sse: SseConfig {
                max_per_ip: SSE_MAX_PER_IP,
                max_total: SSE_MAX_TOTAL,
                min_interval: Duration::from_secs(SSE_MIN_INTERVAL_SECS),
                heartbeat_interval: Duration::from_secs(SSE_HEARTBEAT_SECS),
            },
            max_room_members: DEFAULT_MAX_ROOM_MEMBERS,
            max_room_name_len: MAX_ROOM_NAME_LEN,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PALAVER_HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "invalid PALAVER_HTTP_ADDR, using default"),
            }
        }

        if let Ok(path) = std::env::var("PALAVER_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Ok(encoded) = std::env::var("PALAVER_MASTER_KEY") {
            match parse_master_key(&encoded) {
                Ok(key) => config.master_key = Some(key),
                Err(e) => tracing::warn!(
                    error = %e,
                    "invalid PALAVER_MASTER_KEY, falling back to an ephemeral key (dev-only)"
                ),
            }
        }

        config.encryption_enabled = env_bool("PALAVER_ENCRYPTION_ENABLED", true);
        config.audit_enabled = env_bool("PALAVER_AUDIT_ENABLED", true);
        config.key_rotation_enabled = env_bool("PALAVER_KEY_ROTATION_ENABLED", false);

        config.tls.enabled = env_bool("PALAVER_TLS_ENABLED", false);
        if let Ok(path) = std::env::var("PALAVER_TLS_CERT") {
            config.tls.cert_file = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("PALAVER_TLS_KEY") {
            config.tls.key_file = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("PALAVER_TLS_CA") {
            config.tls.ca_file = Some(PathBuf::from(path));
        }

        env_parse("PALAVER_RATE_LIMIT_RPS", &mut config.rate_limit_rps);
        env_parse("PALAVER_RATE_LIMIT_BURST", &mut config.rate_limit_burst);

        env_parse("PALAVER_SSE_MAX_PER_IP", &mut config.sse.max_per_ip);
        env_parse("PALAVER_SSE_MAX_TOTAL", &mut config.sse.max_total);
        if let Some(secs) = env_u64("PALAVER_SSE_MIN_INTERVAL_SECS") {
            config.sse.min_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("PALAVER_SSE_HEARTBEAT_SECS") {
            config.sse.heartbeat_interval = Duration::from_secs(secs);
        }

        env_parse("PALAVER_ROOM_MAX_MEMBERS", &mut config.max_room_members);
        env_parse("PALAVER_ROOM_MAX_NAME_LEN", &mut config.max_room_name_len);
        env_parse("PALAVER_MESSAGE_MAX_LEN", &mut config.max_message_len);

        config
    }

    /// Hard configuration errors that should stop startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.tls.enabled && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
            return Err(
                "PALAVER_TLS_ENABLED is set but PALAVER_TLS_CERT/PALAVER_TLS_KEY are missing"
                    .to_string(),
            );
        }
        Ok(())
    }
}

fn parse_master_key(encoded: &str) -> Result<[u8; MASTER_KEY_SIZE], String> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| format!("not valid base64: {e}"))?;
    if bytes.len() != MASTER_KEY_SIZE {
        return Err(format!(
            "expected {MASTER_KEY_SIZE} bytes, got {}",
            bytes.len()
        ));
    }
    let mut key = [0u8; MASTER_KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => val != "false" && val != "0",
        Err(_) => default,
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = name, value = %val, "invalid value, using default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert!(config.encryption_enabled);
        assert!(config.master_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_master_key_round_trip() {
        let key = [0xAB_u8; 32];
        let encoded = BASE64.encode(key);
        assert_eq!(parse_master_key(&encoded).unwrap(), key);
    }

    #[test]
    fn parse_master_key_wrong_length() {
        let encoded = BASE64.encode([0u8; 16]);
        assert!(parse_master_key(&encoded).is_err());
    }

    #[test]
    fn parse_master_key_bad_base64() {
        assert!(parse_master_key("!!definitely not base64!!").is_err());
    }

    #[test]
    fn tls_enabled_requires_cert_and_key() {
        let mut config = ServerConfig::default();
        config.tls.enabled = true;
        assert!(config.validate().is_err());

        config.tls.cert_file = Some(PathBuf::from("/tmp/cert.pem"));
        config.tls.key_file = Some(PathBuf::from("/tmp/key.pem"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debug_never_prints_key_material() {
        let mut config = ServerConfig::default();
        config.master_key = Some([0x42; 32]);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("66, 66"));
        assert!(rendered.contains("<set>"));
    }
}
