//! AES-EAX authenticated encryption (Bellare, Rogaway, Wagner).
//!
//! Output layout is `ciphertext || tag` with a 16-byte tag. The tag is
//! verified before any plaintext is produced.

use super::aes::{Aes128, BLOCK_SIZE};
use super::error::CryptoError;

pub const TAG_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct AesEax {
    cipher: Aes128,
    k1: [u8; BLOCK_SIZE],
    k2: [u8; BLOCK_SIZE],
}

fn dbl(block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut out = [0u8; BLOCK_SIZE];
    let carry = block[0] >> 7;
    for i in 0..BLOCK_SIZE - 1 {
        out[i] = (block[i] << 1) | (block[i + 1] >> 7);
    }
    out[BLOCK_SIZE - 1] = (block[BLOCK_SIZE - 1] << 1) ^ (carry * 0x87);
    out
}

impl AesEax {
    pub fn new(key: &[u8; 16]) -> Self {
        let cipher = Aes128::new(key);
        let l = cipher.encrypt_block(&[0u8; BLOCK_SIZE]);
        let k1 = dbl(&l);
        let k2 = dbl(&k1);
        Self { cipher, k1, k2 }
    }

    /// OMAC over `[0; 15] || tweak` followed by `data`.
    fn omac(&self, tweak: u8, data: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut prefix = [0u8; BLOCK_SIZE];
        prefix[BLOCK_SIZE - 1] = tweak;

        let mut state = self.cipher.encrypt_block(&prefix);
        if data.is_empty() {
            // The prefix block alone is the final, complete block.
            let mut x = prefix;
            for i in 0..BLOCK_SIZE {
                x[i] ^= self.k1[i];
            }
            return self.cipher.encrypt_block(&x);
        }

        let full = (data.len() - 1) / BLOCK_SIZE;
        for chunk in data[..full * BLOCK_SIZE].chunks_exact(BLOCK_SIZE) {
            for i in 0..BLOCK_SIZE {
                state[i] ^= chunk[i];
            }
            state = self.cipher.encrypt_block(&state);
        }

        let last = &data[full * BLOCK_SIZE..];
        let mut x = [0u8; BLOCK_SIZE];
        x[..last.len()].copy_from_slice(last);
        let pad = if last.len() == BLOCK_SIZE {
            &self.k1
        } else {
            x[last.len()] = 0x80;
            &self.k2
        };
        for i in 0..BLOCK_SIZE {
            state[i] ^= x[i] ^ pad[i];
        }
        self.cipher.encrypt_block(&state)
    }

    fn ctr(&self, counter: &[u8; BLOCK_SIZE], data: &mut [u8]) {
        let mut ctr = u128::from_be_bytes(*counter);
        for chunk in data.chunks_mut(BLOCK_SIZE) {
            let ks = self.cipher.encrypt_block(&ctr.to_be_bytes());
            for (v, k) in chunk.iter_mut().zip(ks.iter()) {
                *v ^= k;
            }
            ctr = ctr.wrapping_add(1);
        }
    }

    fn tag(&self, n: &[u8; BLOCK_SIZE], ad: &[u8], ct: &[u8]) -> [u8; TAG_SIZE] {
        let h = self.omac(1, ad);
        let c = self.omac(2, ct);
        let mut tag = [0u8; TAG_SIZE];
        for i in 0..TAG_SIZE {
            tag[i] = n[i] ^ h[i] ^ c[i];
        }
        tag
    }

    pub fn encrypt(&self, nonce: &[u8], ad: &[u8], message: &[u8]) -> Vec<u8> {
        let n = self.omac(0, nonce);
        let mut out = message.to_vec();
        self.ctr(&n, &mut out);
        let tag = self.tag(&n, ad, &out);
        out.extend_from_slice(&tag);
        out
    }

    pub fn decrypt(&self, nonce: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        super::aes::verified()?;
        if data.len() < TAG_SIZE {
            return Err(CryptoError::InvalidLength(format!(
                "EAX input of {} bytes is shorter than the tag",
                data.len()
            )));
        }
        let (ct, tag) = data.split_at(data.len() - TAG_SIZE);
        let n = self.omac(0, nonce);
        let expect = self.tag(&n, ad, ct);

        let diff = expect.iter().zip(tag).fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(CryptoError::AuthenticationFailed);
        }

        let mut out = ct.to_vec();
        self.ctr(&n, &mut out);
        Ok(out)
    }
}
