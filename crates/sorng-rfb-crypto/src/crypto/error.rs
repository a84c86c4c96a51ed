//! Error type shared by every primitive in this crate.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Input is not a usable size (not block aligned, wrong key size, ...).
    #[error("invalid length: {0}")]
    InvalidLength(String),
    /// PKCS#1 v1.5 padding did not verify on decryption.
    #[error("invalid PKCS#1 padding")]
    InvalidPadding,
    /// Plaintext does not fit in one RSA block.
    #[error("message too long: {len} bytes, at most {max} allowed")]
    MessageTooLong { len: usize, max: usize },
    /// An authentication tag did not match.
    #[error("authentication tag mismatch")]
    AuthenticationFailed,
    /// DER structure could not be parsed.
    #[error("malformed key: {0}")]
    MalformedKey(String),
    /// A known-answer vector did not reproduce.
    #[error("self test failed: {0}")]
    SelfTestFailed(&'static str),
}
