//! Opaque ids and input hygiene.
//!
//! Rooms and messages use 24-hex-character ids (12 random bytes). User ids
//! are caller-supplied and only constrained by length and a forbidden
//! character set; every id is validated before it reaches a query.

use rand::RngCore;

use crate::constants::{MAX_USER_ID_LEN, OBJECT_ID_LEN};

/// Characters never allowed in a user id: NUL plus the set significant to
/// document-store query syntax.
const FORBIDDEN_USER_ID_CHARS: &[char] = &['\0', '$', '{', '}', '[', ']'];

/// Generate a fresh 24-hex object id.
pub fn new_object_id() -> String {
    let mut raw = [0u8; OBJECT_ID_LEN / 2];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// True if `id` is exactly 24 hex characters (either case).
pub fn valid_object_id(id: &str) -> bool {
    id.len() == OBJECT_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// True if `id` is a usable user id: non-empty, length-bounded, and free of
/// forbidden characters.
pub fn valid_user_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_USER_ID_LEN
        && !id.chars().any(|c| FORBIDDEN_USER_ID_CHARS.contains(&c))
}

/// Strip query-operator characters from a field name used in a patch.
pub fn sanitize_field_name(name: &str) -> String {
    name.chars().filter(|c| *c != '$' && *c != '.').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_object_id_shape() {
        let id = new_object_id();
        assert_eq!(id.len(), 24);
        assert!(valid_object_id(&id));
    }

    #[test]
    fn test_object_ids_unique() {
        assert_ne!(new_object_id(), new_object_id());
    }

    #[test]
    fn test_valid_object_id() {
        assert!(valid_object_id("0123456789abcdef01234567"));
        assert!(valid_object_id("0123456789ABCDEF01234567"));
        assert!(!valid_object_id("0123456789abcdef0123456")); // 23 chars
        assert!(!valid_object_id("0123456789abcdef012345678")); // 25 chars
        assert!(!valid_object_id("0123456789abcdef0123456z"));
        assert!(!valid_object_id(""));
    }

    #[test]
    fn test_valid_user_id() {
        assert!(valid_user_id("u_alice"));
        assert!(valid_user_id("alice@example.com"));
        assert!(!valid_user_id(""));
        assert!(!valid_user_id("a$b"));
        assert!(!valid_user_id("a{b}"));
        assert!(!valid_user_id("a[b]"));
        assert!(!valid_user_id("a\0b"));
        assert!(!valid_user_id(&"x".repeat(101)));
    }

    #[test]
    fn test_sanitize_field_name() {
        assert_eq!(sanitize_field_name("last_message"), "last_message");
        assert_eq!(sanitize_field_name("$where"), "where");
        assert_eq!(sanitize_field_name("a.b.c"), "abc");
    }
}
