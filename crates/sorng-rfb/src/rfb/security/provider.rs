//! Crypto provider facility.
//!
//! Key agreement, hashing, and the legacy ciphers used during
//! authentication are reached through [`CryptoProvider`], an async trait
//! so a host can back it with a platform crypto service. The engine never
//! awaits these calls itself: the handshake packages them into a
//! [`CryptoTask`](super::CryptoTask) which the owner drives and reports
//! back through `RfbEngine::crypto_complete`.
//!
//! [`LocalCryptoProvider`] is the in-process implementation.

use async_trait::async_trait;
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit};
use des::Des;
use md5::{Digest, Md5};
use num_bigint::BigUint;
use num_traits::One;
use rand::RngCore;
use sorng_rfb_crypto::{to_fixed_be, RsaPublicKey};

use crate::rfb::errors::RfbError;

/// A finite-field Diffie-Hellman key pair. Both halves are big-endian and
/// padded to the length of the prime they were generated for.
#[derive(Clone)]
pub struct DhKeyPair {
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("private_key", &"***")
            .field("public_key", &self.public_key.len())
            .finish()
    }
}

#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Generate a key pair for group `(generator, prime)`.
    async fn generate_dh(&self, generator: &[u8], prime: &[u8]) -> Result<DhKeyPair, RfbError>;

    /// Shared secret between `keys` and the peer's public value, padded
    /// to the prime length.
    async fn derive_dh(&self, keys: &DhKeyPair, prime: &[u8], peer_public: &[u8]) -> Result<Vec<u8>, RfbError>;

    async fn md5(&self, data: &[u8]) -> [u8; 16];

    /// DES-ECB with the VNC key convention (each key byte bit-reversed).
    /// `data` must be a multiple of 8 bytes.
    async fn des_ecb_encrypt(&self, key: &[u8; 8], data: &[u8]) -> Result<Vec<u8>, RfbError>;

    /// DES-CBC with the VNC key convention.
    async fn des_cbc_encrypt(&self, key: &[u8; 8], iv: &[u8; 8], data: &[u8]) -> Result<Vec<u8>, RfbError>;

    /// RSA PKCS#1 v1.5 encryption.
    async fn rsa_pkcs1_encrypt(&self, key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, RfbError>;

    async fn random_bytes(&self, len: usize) -> Vec<u8>;
}

// ── DES helpers ──────────────────────────────────────────────────────────

/// VNC passwords key DES with every byte mirrored.
pub(crate) fn vnc_des_key(key: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    let len = key.len().min(8);
    out[..len].copy_from_slice(&key[..len]);
    for b in out.iter_mut() {
        *b = b.reverse_bits();
    }
    out
}

pub(crate) fn vnc_des_cipher(key: &[u8; 8]) -> Result<Des, RfbError> {
    Des::new_from_slice(&vnc_des_key(key))
        .map_err(|e| RfbError::Internal(format!("Failed to create DES cipher: {e}")))
}

fn check_block_aligned(data: &[u8]) -> Result<(), RfbError> {
    if data.len() % 8 != 0 {
        return Err(RfbError::Internal(format!(
            "DES input of {} bytes is not block aligned",
            data.len()
        )));
    }
    Ok(())
}

/// DES-ECB encrypt of an 8-byte aligned buffer.
pub(crate) fn des_ecb(key: &[u8; 8], data: &[u8]) -> Result<Vec<u8>, RfbError> {
    check_block_aligned(data)?;
    let cipher = vnc_des_cipher(key)?;
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

fn des_cbc(key: &[u8; 8], iv: &[u8; 8], data: &[u8]) -> Result<Vec<u8>, RfbError> {
    check_block_aligned(data)?;
    let cipher = vnc_des_cipher(key)?;
    let mut out = data.to_vec();
    let mut prev = *iv;
    for chunk in out.chunks_exact_mut(8) {
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }
    Ok(out)
}

// ── Local provider ───────────────────────────────────────────────────────

/// Pure-Rust provider: `num-bigint` for DH, `md-5`, `des`, and the RSA
/// code from `sorng-rfb-crypto`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCryptoProvider;

impl LocalCryptoProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CryptoProvider for LocalCryptoProvider {
    async fn generate_dh(&self, generator: &[u8], prime: &[u8]) -> Result<DhKeyPair, RfbError> {
        let key_len = prime.len();
        let p = BigUint::from_bytes_be(prime);
        if p <= BigUint::one() {
            return Err(RfbError::auth("DH prime modulus is too small"));
        }
        let g = BigUint::from_bytes_be(generator);

        let mut private_bytes = vec![0u8; key_len];
        rand::thread_rng().fill_bytes(&mut private_bytes);
        let private_key = BigUint::from_bytes_be(&private_bytes);
        let public_key = g.modpow(&private_key, &p);

        Ok(DhKeyPair {
            private_key: to_fixed_be(&private_key, key_len),
            public_key: to_fixed_be(&public_key, key_len),
        })
    }

    async fn derive_dh(&self, keys: &DhKeyPair, prime: &[u8], peer_public: &[u8]) -> Result<Vec<u8>, RfbError> {
        let p = BigUint::from_bytes_be(prime);
        if p <= BigUint::one() {
            return Err(RfbError::auth("DH prime modulus is too small"));
        }
        let private_key = BigUint::from_bytes_be(&keys.private_key);
        let peer = BigUint::from_bytes_be(peer_public);
        let shared = peer.modpow(&private_key, &p);
        Ok(to_fixed_be(&shared, prime.len()))
    }

    async fn md5(&self, data: &[u8]) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    async fn des_ecb_encrypt(&self, key: &[u8; 8], data: &[u8]) -> Result<Vec<u8>, RfbError> {
        des_ecb(key, data)
    }

    async fn des_cbc_encrypt(&self, key: &[u8; 8], iv: &[u8; 8], data: &[u8]) -> Result<Vec<u8>, RfbError> {
        des_cbc(key, iv, data)
    }

    async fn rsa_pkcs1_encrypt(&self, key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, RfbError> {
        Ok(key.encrypt(&mut rand::thread_rng(), data)?)
    }

    async fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use sorng_rfb_crypto::RsaPrivateKey;

    #[test]
    fn key_bytes_are_mirrored() {
        assert_eq!(vnc_des_key(b"\x01\x80"), [0x80, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(vnc_des_key(b"123456789")[7], b'8'.reverse_bits());
    }

    #[test]
    fn ecb_known_answer_after_mirroring() {
        // FIPS 81 vector: key 0123456789abcdef, "Now is t" -> 3fa40e8a984d4815.
        let mut key = [0u8; 8];
        for (k, b) in key.iter_mut().zip(hex::decode("0123456789abcdef").unwrap()) {
            *k = b.reverse_bits();
        }
        let mut block = hex::decode("4e6f772069732074").unwrap();
        block.extend_from_slice(&block.clone());
        let out = des_ecb(&key, &block).unwrap();
        assert_eq!(hex::encode(&out[..8]), "3fa40e8a984d4815");
        assert_eq!(out[..8], out[8..]);
    }

    #[test]
    fn cbc_chains_blocks() {
        let key = *b"k3y-k3y!";
        let iv = [7u8; 8];
        let cbc = des_cbc(&key, &iv, &[0u8; 16]).unwrap();
        let first = des_ecb(&key, &iv).unwrap();
        assert_eq!(&cbc[..8], &first[..]);
        let second = des_ecb(&key, &cbc[..8]).unwrap();
        assert_eq!(&cbc[8..], &second[..]);
    }

    #[test]
    fn des_rejects_unaligned_input() {
        assert!(des_ecb(b"abcdefgh", &[0u8; 5]).is_err());
    }

    #[test]
    fn dh_agreement_matches() {
        let p = LocalCryptoProvider::new();
        // 2^64 - 59, the largest 64-bit prime.
        let prime = 0xffff_ffff_ffff_ffc5u64.to_be_bytes();
        let g = [5u8];
        let a = block_on(p.generate_dh(&g, &prime)).unwrap();
        let b = block_on(p.generate_dh(&g, &prime)).unwrap();
        assert_eq!(a.public_key.len(), 8);
        let s1 = block_on(p.derive_dh(&a, &prime, &b.public_key)).unwrap();
        let s2 = block_on(p.derive_dh(&b, &prime, &a.public_key)).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn degenerate_prime_is_rejected() {
        let p = LocalCryptoProvider::new();
        assert!(block_on(p.generate_dh(&[2], &[1])).is_err());
    }

    #[test]
    fn md5_known_answer() {
        let d = block_on(LocalCryptoProvider.md5(b"abc"));
        assert_eq!(hex::encode(d), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn rsa_roundtrip_through_provider() {
        let key = RsaPrivateKey::generate(&mut rand::thread_rng(), 512).unwrap();
        let ct = block_on(LocalCryptoProvider.rsa_pkcs1_encrypt(key.public_key(), b"session key")).unwrap();
        assert_eq!(ct.len(), 64);
        assert_eq!(key.decrypt(&ct).unwrap(), b"session key");
    }

    #[test]
    fn random_bytes_length() {
        assert_eq!(block_on(LocalCryptoProvider.random_bytes(16)).len(), 16);
    }
}
