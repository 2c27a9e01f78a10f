use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("plaintext cannot be empty")]
    EmptyPlaintext,

    #[error("invalid ciphertext format: missing envelope prefix")]
    MissingPrefix,

    #[error("invalid ciphertext format: bad base64")]
    InvalidBase64,

    #[error("ciphertext too short: missing IV")]
    CiphertextTooShort,

    #[error("decrypted content is not valid UTF-8")]
    InvalidUtf8,

    #[error("key must be {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}
