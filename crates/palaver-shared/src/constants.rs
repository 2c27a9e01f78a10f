/// Envelope prefix for AES-256-CTR encrypted content
pub const ENVELOPE_PREFIX: &str = "aes256ctr:";

/// Prefix used when encryption is disabled and content is stored as-is
pub const PLAINTEXT_PREFIX: &str = "plaintext:";

/// Symmetric key size in bytes (AES-256)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Master key size in bytes
pub const MASTER_KEY_SIZE: usize = 32;

/// CTR-mode IV size in bytes (AES block size)
pub const IV_SIZE: usize = 16;

/// Object id length in hex characters (12 random bytes)
pub const OBJECT_ID_LEN: usize = 24;

/// Maximum user id length
pub const MAX_USER_ID_LEN: usize = 100;

/// Default page size for paginated reads
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Hard cap on a single paginated read
pub const MAX_PAGE_SIZE: u32 = 100;

/// Stricter cap for history reads
pub const MAX_HISTORY_PAGE_SIZE: u32 = 50;

/// Cap for internal bounded scans (direct-chat dedup, room prefix)
pub const MAX_QUERY_LIMIT: u32 = 100;

/// Upper bound on rows examined by an unread-count query
pub const UNREAD_SCAN_LIMIT: u32 = 1000;

/// Default maximum members per room
pub const DEFAULT_MAX_ROOM_MEMBERS: usize = 1000;

/// Maximum room name length in characters
pub const MAX_ROOM_NAME_LEN: usize = 100;

/// Maximum message length in characters
pub const MAX_MESSAGE_LEN: usize = 10_000;

/// Unicode scalars kept in a text last-message preview before truncation
pub const PREVIEW_MAX_CHARS: usize = 30;

/// Live-tail poll interval in seconds
pub const STREAM_POLL_SECS: u64 = 2;

/// Messages fetched per live-tail poll, and for snapshot seeding
pub const STREAM_FETCH_LIMIT: u32 = 100;

/// Buffered channel capacity between the stream fetcher and the sender
pub const STREAM_CHANNEL_BUFFER: usize = 10;

/// Default heartbeat interval for push streams, in seconds
pub const SSE_HEARTBEAT_SECS: u64 = 15;

/// Default concurrent push streams allowed per client IP
pub const SSE_MAX_PER_IP: usize = 3;

/// Default total concurrent push streams
pub const SSE_MAX_TOTAL: usize = 1000;

/// Default minimum seconds between stream openings from one IP
pub const SSE_MIN_INTERVAL_SECS: u64 = 10;

/// Default key rotation interval in hours
pub const KEY_ROTATION_INTERVAL_HOURS: i64 = 24;

/// Default maximum key age in days
pub const KEY_MAX_AGE_DAYS: i64 = 30;

/// Archived keys retained per room after rotation
pub const KEEP_OLD_KEYS: usize = 5;
