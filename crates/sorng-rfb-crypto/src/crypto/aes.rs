//! AES-128 block cipher.
//!
//! A T-table implementation with 44-word encryption and decryption key
//! schedules (the decryption schedule is the "equivalent inverse cipher"
//! form, i.e. InvMixColumns applied to the middle round keys). ECB and CBC
//! helpers operate on whole blocks only; callers pad.

use std::sync::OnceLock;

use super::error::CryptoError;

pub const BLOCK_SIZE: usize = 16;

static SELF_TEST: OnceLock<Result<(), CryptoError>> = OnceLock::new();

#[rustfmt::skip]
const SBOX: [u8; 256] = [
    0x63,0x7c,0x77,0x7b,0xf2,0x6b,0x6f,0xc5,0x30,0x01,0x67,0x2b,0xfe,0xd7,0xab,0x76,
    0xca,0x82,0xc9,0x7d,0xfa,0x59,0x47,0xf0,0xad,0xd4,0xa2,0xaf,0x9c,0xa4,0x72,0xc0,
    0xb7,0xfd,0x93,0x26,0x36,0x3f,0xf7,0xcc,0x34,0xa5,0xe5,0xf1,0x71,0xd8,0x31,0x15,
    0x04,0xc7,0x23,0xc3,0x18,0x96,0x05,0x9a,0x07,0x12,0x80,0xe2,0xeb,0x27,0xb2,0x75,
    0x09,0x83,0x2c,0x1a,0x1b,0x6e,0x5a,0xa0,0x52,0x3b,0xd6,0xb3,0x29,0xe3,0x2f,0x84,
    0x53,0xd1,0x00,0xed,0x20,0xfc,0xb1,0x5b,0x6a,0xcb,0xbe,0x39,0x4a,0x4c,0x58,0xcf,
    0xd0,0xef,0xaa,0xfb,0x43,0x4d,0x33,0x85,0x45,0xf9,0x02,0x7f,0x50,0x3c,0x9f,0xa8,
    0x51,0xa3,0x40,0x8f,0x92,0x9d,0x38,0xf5,0xbc,0xb6,0xda,0x21,0x10,0xff,0xf3,0xd2,
    0xcd,0x0c,0x13,0xec,0x5f,0x97,0x44,0x17,0xc4,0xa7,0x7e,0x3d,0x64,0x5d,0x19,0x73,
    0x60,0x81,0x4f,0xdc,0x22,0x2a,0x90,0x88,0x46,0xee,0xb8,0x14,0xde,0x5e,0x0b,0xdb,
    0xe0,0x32,0x3a,0x0a,0x49,0x06,0x24,0x5c,0xc2,0xd3,0xac,0x62,0x91,0x95,0xe4,0x79,
    0xe7,0xc8,0x37,0x6d,0x8d,0xd5,0x4e,0xa9,0x6c,0x56,0xf4,0xea,0x65,0x7a,0xae,0x08,
    0xba,0x78,0x25,0x2e,0x1c,0xa6,0xb4,0xc6,0xe8,0xdd,0x74,0x1f,0x4b,0xbd,0x8b,0x8a,
    0x70,0x3e,0xb5,0x66,0x48,0x03,0xf6,0x0e,0x61,0x35,0x57,0xb9,0x86,0xc1,0x1d,0x9e,
    0xe1,0xf8,0x98,0x11,0x69,0xd9,0x8e,0x94,0x9b,0x1e,0x87,0xe9,0xce,0x55,0x28,0xdf,
    0x8c,0xa1,0x89,0x0d,0xbf,0xe6,0x42,0x68,0x41,0x99,0x2d,0x0f,0xb0,0x54,0xbb,0x16,
];

#[rustfmt::skip]
const INV_SBOX: [u8; 256] = [
    0x52,0x09,0x6a,0xd5,0x30,0x36,0xa5,0x38,0xbf,0x40,0xa3,0x9e,0x81,0xf3,0xd7,0xfb,
    0x7c,0xe3,0x39,0x82,0x9b,0x2f,0xff,0x87,0x34,0x8e,0x43,0x44,0xc4,0xde,0xe9,0xcb,
    0x54,0x7b,0x94,0x32,0xa6,0xc2,0x23,0x3d,0xee,0x4c,0x95,0x0b,0x42,0xfa,0xc3,0x4e,
    0x08,0x2e,0xa1,0x66,0x28,0xd9,0x24,0xb2,0x76,0x5b,0xa2,0x49,0x6d,0x8b,0xd1,0x25,
    0x72,0xf8,0xf6,0x64,0x86,0x68,0x98,0x16,0xd4,0xa4,0x5c,0xcc,0x5d,0x65,0xb6,0x92,
    0x6c,0x70,0x48,0x50,0xfd,0xed,0xb9,0xda,0x5e,0x15,0x46,0x57,0xa7,0x8d,0x9d,0x84,
    0x90,0xd8,0xab,0x00,0x8c,0xbc,0xd3,0x0a,0xf7,0xe4,0x58,0x05,0xb8,0xb3,0x45,0x06,
    0xd0,0x2c,0x1e,0x8f,0xca,0x3f,0x0f,0x02,0xc1,0xaf,0xbd,0x03,0x01,0x13,0x8a,0x6b,
    0x3a,0x91,0x11,0x41,0x4f,0x67,0xdc,0xea,0x97,0xf2,0xcf,0xce,0xf0,0xb4,0xe6,0x73,
    0x96,0xac,0x74,0x22,0xe7,0xad,0x35,0x85,0xe2,0xf9,0x37,0xe8,0x1c,0x75,0xdf,0x6e,
    0x47,0xf1,0x1a,0x71,0x1d,0x29,0xc5,0x89,0x6f,0xb7,0x62,0x0e,0xaa,0x18,0xbe,0x1b,
    0xfc,0x56,0x3e,0x4b,0xc6,0xd2,0x79,0x20,0x9a,0xdb,0xc0,0xfe,0x78,0xcd,0x5a,0xf4,
    0x1f,0xdd,0xa8,0x33,0x88,0x07,0xc7,0x31,0xb1,0x12,0x10,0x59,0x27,0x80,0xec,0x5f,
    0x60,0x51,0x7f,0xa9,0x19,0xb5,0x4a,0x0d,0x2d,0xe5,0x7a,0x9f,0x93,0xc9,0x9c,0xef,
    0xa0,0xe0,0x3b,0x4d,0xae,0x2a,0xf5,0xb0,0xc8,0xeb,0xbb,0x3c,0x83,0x53,0x99,0x61,
    0x17,0x2b,0x04,0x7e,0xba,0x77,0xd6,0x26,0xe1,0x69,0x14,0x63,0x55,0x21,0x0c,0x7d,
];

const RCON: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36];

// ── Round tables ─────────────────────────────────────────────────────────

struct Tables {
    /// MixColumns∘SubBytes, one table per byte position.
    te: [[u32; 256]; 4],
    /// InvMixColumns∘InvSubBytes.
    td: [[u32; 256]; 4],
}

static TABLES: Tables = build_tables();

const fn xtime(a: u8) -> u8 {
    (a << 1) ^ (((a >> 7) & 1) * 0x1b)
}

const fn build_tables() -> Tables {
    let mut te = [[0u32; 256]; 4];
    let mut td = [[0u32; 256]; 4];
    let mut i = 0;
    while i < 256 {
        let s = SBOX[i];
        let s2 = xtime(s);
        let (s, s2, s3) = (s as u32, s2 as u32, (s2 ^ s) as u32);
        te[0][i] = (s2 << 24) | (s << 16) | (s << 8) | s3;
        te[1][i] = (s3 << 24) | (s2 << 16) | (s << 8) | s;
        te[2][i] = (s << 24) | (s3 << 16) | (s2 << 8) | s;
        te[3][i] = (s << 24) | (s << 16) | (s3 << 8) | s2;

        let si = INV_SBOX[i];
        let si2 = xtime(si);
        let si4 = xtime(si2);
        let si8 = xtime(si4);
        let x9 = (si8 ^ si) as u32;
        let xb = (si8 ^ si2 ^ si) as u32;
        let xd = (si8 ^ si4 ^ si) as u32;
        let xe = (si8 ^ si4 ^ si2) as u32;
        td[0][i] = (xe << 24) | (x9 << 16) | (xd << 8) | xb;
        td[1][i] = (xb << 24) | (xe << 16) | (x9 << 8) | xd;
        td[2][i] = (xd << 24) | (xb << 16) | (xe << 8) | x9;
        td[3][i] = (x9 << 24) | (xd << 16) | (xb << 8) | xe;
        i += 1;
    }
    Tables { te, td }
}

#[inline]
fn b(w: u32, n: u32) -> usize {
    ((w >> (24 - 8 * n)) & 0xff) as usize
}

#[inline]
fn sub_word(w: u32, sbox: &[u8; 256], a: u32, bb: u32, c: u32, d: u32) -> u32 {
    ((u32::from(sbox[b(a, 0)]) << 24)
        | (u32::from(sbox[b(bb, 1)]) << 16)
        | (u32::from(sbox[b(c, 2)]) << 8)
        | u32::from(sbox[b(d, 3)]))
        ^ w
}

fn load(block: &[u8; BLOCK_SIZE]) -> [u32; 4] {
    let mut s = [0u32; 4];
    for (i, word) in s.iter_mut().enumerate() {
        *word = u32::from_be_bytes([
            block[4 * i],
            block[4 * i + 1],
            block[4 * i + 2],
            block[4 * i + 3],
        ]);
    }
    s
}

fn store(s: [u32; 4]) -> [u8; BLOCK_SIZE] {
    let mut out = [0u8; BLOCK_SIZE];
    for (i, word) in s.iter().enumerate() {
        out[4 * i..4 * i + 4].copy_from_slice(&word.to_be_bytes());
    }
    out
}

// ── Cipher ───────────────────────────────────────────────────────────────

/// AES-128 with precomputed round keys.
#[derive(Clone)]
pub struct Aes128 {
    enc: [u32; 44],
    dec: [u32; 44],
}

impl std::fmt::Debug for Aes128 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Aes128 { .. }")
    }
}

impl Aes128 {
    pub fn new(key: &[u8; 16]) -> Self {
        let mut enc = [0u32; 44];
        for (i, word) in enc.iter_mut().take(4).enumerate() {
            *word = u32::from_be_bytes([key[4 * i], key[4 * i + 1], key[4 * i + 2], key[4 * i + 3]]);
        }
        for i in 4..44 {
            let mut t = enc[i - 1];
            if i % 4 == 0 {
                // RotWord + SubWord + Rcon
                t = (u32::from(SBOX[b(t, 1)]) << 24)
                    | (u32::from(SBOX[b(t, 2)]) << 16)
                    | (u32::from(SBOX[b(t, 3)]) << 8)
                    | u32::from(SBOX[b(t, 0)]);
                t ^= u32::from(RCON[i / 4 - 1]) << 24;
            }
            enc[i] = enc[i - 4] ^ t;
        }

        let td = &TABLES.td;
        let mut dec = enc;
        for i in 4..40 {
            let w = enc[i];
            dec[i] = td[0][SBOX[b(w, 0)] as usize]
                ^ td[1][SBOX[b(w, 1)] as usize]
                ^ td[2][SBOX[b(w, 2)] as usize]
                ^ td[3][SBOX[b(w, 3)] as usize];
        }

        Self { enc, dec }
    }

    /// Build from an arbitrary slice, rejecting anything but 16 bytes.
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: &[u8; 16] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidLength(format!("AES-128 key must be 16 bytes, got {}", key.len())))?;
        Ok(Self::new(key))
    }

    pub fn encrypt_block(&self, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let te = &TABLES.te;
        let k = &self.enc;
        let mut s = load(block);
        for (w, kw) in s.iter_mut().zip(&k[..4]) {
            *w ^= kw;
        }

        for r in 1..10 {
            let ki = r * 4;
            let [s0, s1, s2, s3] = s;
            s = [
                te[0][b(s0, 0)] ^ te[1][b(s1, 1)] ^ te[2][b(s2, 2)] ^ te[3][b(s3, 3)] ^ k[ki],
                te[0][b(s1, 0)] ^ te[1][b(s2, 1)] ^ te[2][b(s3, 2)] ^ te[3][b(s0, 3)] ^ k[ki + 1],
                te[0][b(s2, 0)] ^ te[1][b(s3, 1)] ^ te[2][b(s0, 2)] ^ te[3][b(s1, 3)] ^ k[ki + 2],
                te[0][b(s3, 0)] ^ te[1][b(s0, 1)] ^ te[2][b(s1, 2)] ^ te[3][b(s2, 3)] ^ k[ki + 3],
            ];
        }

        // Final round: no MixColumns.
        let [s0, s1, s2, s3] = s;
        store([
            sub_word(k[40], &SBOX, s0, s1, s2, s3),
            sub_word(k[41], &SBOX, s1, s2, s3, s0),
            sub_word(k[42], &SBOX, s2, s3, s0, s1),
            sub_word(k[43], &SBOX, s3, s0, s1, s2),
        ])
    }

    pub fn decrypt_block(&self, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let td = &TABLES.td;
        let k = &self.dec;
        let ek = &self.enc;
        let mut s = load(block);
        for (w, kw) in s.iter_mut().zip(&ek[40..44]) {
            *w ^= kw;
        }

        for r in (1..10).rev() {
            let ki = r * 4;
            let [s0, s1, s2, s3] = s;
            s = [
                td[0][b(s0, 0)] ^ td[1][b(s3, 1)] ^ td[2][b(s2, 2)] ^ td[3][b(s1, 3)] ^ k[ki],
                td[0][b(s1, 0)] ^ td[1][b(s0, 1)] ^ td[2][b(s3, 2)] ^ td[3][b(s2, 3)] ^ k[ki + 1],
                td[0][b(s2, 0)] ^ td[1][b(s1, 1)] ^ td[2][b(s0, 2)] ^ td[3][b(s3, 3)] ^ k[ki + 2],
                td[0][b(s3, 0)] ^ td[1][b(s2, 1)] ^ td[2][b(s1, 2)] ^ td[3][b(s0, 3)] ^ k[ki + 3],
            ];
        }

        let [s0, s1, s2, s3] = s;
        store([
            sub_word(ek[0], &INV_SBOX, s0, s3, s2, s1),
            sub_word(ek[1], &INV_SBOX, s1, s0, s3, s2),
            sub_word(ek[2], &INV_SBOX, s2, s1, s0, s3),
            sub_word(ek[3], &INV_SBOX, s3, s2, s1, s0),
        ])
    }

    // ── Modes ────────────────────────────────────────────────────────────

    pub fn encrypt_ecb(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_aligned(data)?;
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(BLOCK_SIZE) {
            out.extend_from_slice(&self.encrypt_block(as_block(chunk)));
        }
        Ok(out)
    }

    pub fn decrypt_ecb(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_aligned(data)?;
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(BLOCK_SIZE) {
            out.extend_from_slice(&self.decrypt_block(as_block(chunk)));
        }
        Ok(out)
    }

    /// CBC encryption. Returns the ciphertext; its last block is the IV
    /// for a continuing stream.
    pub fn encrypt_cbc(&self, iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_aligned(data)?;
        let mut out = Vec::with_capacity(data.len());
        let mut prev = *iv;
        for chunk in data.chunks_exact(BLOCK_SIZE) {
            let mut x = [0u8; BLOCK_SIZE];
            for (i, v) in x.iter_mut().enumerate() {
                *v = chunk[i] ^ prev[i];
            }
            prev = self.encrypt_block(&x);
            out.extend_from_slice(&prev);
        }
        Ok(out)
    }

    pub fn decrypt_cbc(&self, iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_aligned(data)?;
        let mut out = Vec::with_capacity(data.len());
        let mut prev = *iv;
        for chunk in data.chunks_exact(BLOCK_SIZE) {
            let block = as_block(chunk);
            let x = self.decrypt_block(block);
            for i in 0..BLOCK_SIZE {
                out.push(x[i] ^ prev[i]);
            }
            prev = *block;
        }
        Ok(out)
    }
}

/// Known-answer check against FIPS-197 Appendix B. Run once before the
/// cipher is trusted with session traffic.
pub fn self_test() -> Result<(), CryptoError> {
    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
    ];
    const PLAIN: [u8; 16] = [
        0x32, 0x43, 0xf6, 0xa8, 0x88, 0x5a, 0x30, 0x8d, 0x31, 0x31, 0x98, 0xa2, 0xe0, 0x37, 0x07, 0x34,
    ];
    const CIPHER: [u8; 16] = [
        0x39, 0x25, 0x84, 0x1d, 0x02, 0xdc, 0x09, 0xfb, 0xdc, 0x11, 0x85, 0x97, 0x19, 0x6a, 0x0b, 0x32,
    ];
    let aes = Aes128::new(&KEY);
    if aes.encrypt_block(&PLAIN) != CIPHER || aes.decrypt_block(&CIPHER) != PLAIN {
        return Err(CryptoError::SelfTestFailed("AES-128 FIPS-197 appendix B"));
    }
    Ok(())
}

/// Result of [`self_test`], computed on first use. The mode helpers refuse
/// to run when it failed.
pub fn verified() -> Result<(), CryptoError> {
    run_once(&SELF_TEST, self_test)
}

fn run_once(
    cell: &OnceLock<Result<(), CryptoError>>,
    check: fn() -> Result<(), CryptoError>,
) -> Result<(), CryptoError> {
    cell.get_or_init(|| {
        let result = check();
        match &result {
            Ok(()) => log::debug!("AES-128 self test passed"),
            Err(e) => log::error!("AES-128 disabled: {e}"),
        }
        result
    })
    .clone()
}

fn check_aligned(data: &[u8]) -> Result<(), CryptoError> {
    verified()?;
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(format!(
            "{} bytes is not a multiple of the AES block size",
            data.len()
        )));
    }
    Ok(())
}

fn as_block(chunk: &[u8]) -> &[u8; BLOCK_SIZE] {
    // chunks_exact guarantees the size
    chunk.try_into().unwrap_or(&[0u8; BLOCK_SIZE])
}
