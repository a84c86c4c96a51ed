//! Crypto primitives – top-level module.

pub mod aes;
pub mod eax;
mod error;
pub mod rsa;
pub mod sha1;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use aes::{self_test as aes_self_test, verified as aes_verified, Aes128};
pub use eax::AesEax;
pub use error::CryptoError;
pub use rsa::{RsaPrivateKey, RsaPublicKey};
pub use sha1::{sha1, Sha1};
