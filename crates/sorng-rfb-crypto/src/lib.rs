//! # sorng-rfb-crypto
//!
//! Crypto primitives used by the RFB engine (`sorng-rfb`).
//!
//! Everything here is synchronous and free of protocol knowledge: a
//! table-driven AES-128 block cipher with ECB and CBC helpers, AES-EAX
//! authenticated encryption, RSA PKCS#1 v1.5 with DER public-key parsing,
//! and SHA-1.

pub mod crypto;

pub use crypto::{
    aes_self_test, aes_verified, sha1, Aes128, AesEax, CryptoError, RsaPrivateKey, RsaPublicKey, Sha1,
};
pub use crypto::rsa::to_fixed_be;
