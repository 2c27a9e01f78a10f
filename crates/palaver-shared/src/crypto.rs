//! AES-256-CTR envelope cipher.
//!
//! Encrypted values travel and rest as `aes256ctr:<base64(IV || ciphertext)>`
//! with a fresh random 16-byte IV per encryption. CTR mode gives stream-cipher
//! semantics with no padding; the envelope carries no authentication tag.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroize;

use crate::constants::{ENVELOPE_PREFIX, IV_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// A 256-bit symmetric key (room DEK or master KEK).
pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Generate a fresh 256-bit key from the OS random source.
pub fn generate_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypt a message body into the tagged envelope format.
///
/// Rejects empty plaintext. The working buffer is encrypted in place and
/// zeroed before returning, so no plaintext copy outlives the call.
pub fn encrypt(plaintext: &str, key: &SymmetricKey) -> Result<String, CryptoError> {
    if plaintext.is_empty() {
        return Err(CryptoError::EmptyPlaintext);
    }

    let mut buf = plaintext.as_bytes().to_vec();
    let iv = generate_iv();

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut buf);

    let mut framed = Vec::with_capacity(IV_SIZE + buf.len());
    framed.extend_from_slice(&iv);
    framed.extend_from_slice(&buf);

    let encoded = BASE64.encode(&framed);

    buf.zeroize();
    framed.zeroize();

    Ok(format!("{ENVELOPE_PREFIX}{encoded}"))
}

/// Decrypt a tagged envelope back to the plaintext string.
///
/// Fails on a missing tag, bad base64, or a payload shorter than the IV.
/// A [`CryptoError::InvalidUtf8`] result means the key stream was applied but
/// the output is not text; callers substitute their sentinel for that case.
pub fn decrypt(envelope: &str, key: &SymmetricKey) -> Result<String, CryptoError> {
    let encoded = envelope
        .strip_prefix(ENVELOPE_PREFIX)
        .ok_or(CryptoError::MissingPrefix)?;

    let mut data = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidBase64)?;

    if data.len() < IV_SIZE {
        data.zeroize();
        return Err(CryptoError::CiphertextTooShort);
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&data[..IV_SIZE]);

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut data[IV_SIZE..]);

    let plaintext = match String::from_utf8(data[IV_SIZE..].to_vec()) {
        Ok(s) => s,
        Err(_) => {
            data.zeroize();
            return Err(CryptoError::InvalidUtf8);
        }
    };

    data.zeroize();
    Ok(plaintext)
}

/// Encrypt raw bytes, returning `IV || ciphertext` without the text framing.
///
/// Used for wrapping DEKs under the master key; the caller base64-encodes the
/// result for storage.
pub fn encrypt_bytes(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    if plaintext.is_empty() {
        return Err(CryptoError::EmptyPlaintext);
    }

    let iv = generate_iv();
    let mut out = Vec::with_capacity(IV_SIZE + plaintext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plaintext);

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut out[IV_SIZE..]);

    Ok(out)
}

/// Decrypt `IV || ciphertext` produced by [`encrypt_bytes`].
pub fn decrypt_bytes(data: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_SIZE {
        return Err(CryptoError::CiphertextTooShort);
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&data[..IV_SIZE]);

    let mut plaintext = data[IV_SIZE..].to_vec();
    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);

    Ok(plaintext)
}

/// True if the string carries the envelope tag.
pub fn is_encrypted(text: &str) -> bool {
    text.starts_with(ENVELOPE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_key();
        let plaintext = "a perfectly ordinary message";

        let envelope = encrypt(plaintext, &key).unwrap();
        assert!(envelope.starts_with(ENVELOPE_PREFIX));

        let decrypted = decrypt(&envelope, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_unicode_roundtrip() {
        let key = generate_key();
        let plaintext = "héllo wörld 你好 🎉";

        let envelope = encrypt(plaintext, &key).unwrap();
        assert_eq!(decrypt(&envelope, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_same_plaintext_distinct_envelopes() {
        let key = generate_key();

        let first = encrypt("repeated content", &key).unwrap();
        let second = encrypt("repeated content", &key).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_empty_plaintext_rejected() {
        let key = generate_key();
        assert!(matches!(
            encrypt("", &key),
            Err(CryptoError::EmptyPlaintext)
        ));
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let key = generate_key();
        assert!(matches!(
            decrypt("definitely not an envelope", &key),
            Err(CryptoError::MissingPrefix)
        ));
    }

    #[test]
    fn test_bad_base64_rejected() {
        let key = generate_key();
        assert!(matches!(
            decrypt("aes256ctr:!!!not-base64!!!", &key),
            Err(CryptoError::InvalidBase64)
        ));
    }

    #[test]
    fn test_short_payload_rejected() {
        let key = generate_key();
        let envelope = format!("{ENVELOPE_PREFIX}{}", BASE64.encode([0u8; 4]));
        assert!(matches!(
            decrypt(&envelope, &key),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn test_wrong_key_garbles() {
        let key1 = generate_key();
        let key2 = generate_key();

        let envelope = encrypt("secret", &key1).unwrap();
        // CTR has no authentication: the wrong key yields garbage or a
        // UTF-8 error, never the original text.
        match decrypt(&envelope, &key2) {
            Ok(s) => assert_ne!(s, "secret"),
            Err(CryptoError::InvalidUtf8) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let key = generate_key();
        let dek = generate_key();

        let wrapped = encrypt_bytes(&dek, &key).unwrap();
        assert_eq!(wrapped.len(), IV_SIZE + dek.len());

        let unwrapped = decrypt_bytes(&wrapped, &key).unwrap();
        assert_eq!(unwrapped, dek);
    }

    #[test]
    fn test_is_encrypted() {
        assert!(is_encrypted("aes256ctr:abcd"));
        assert!(!is_encrypted("plaintext:hello"));
        assert!(!is_encrypted("hello"));
        assert!(!is_encrypted(""));
    }
}
