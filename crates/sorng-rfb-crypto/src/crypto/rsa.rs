//! RSA PKCS#1 v1.5 encryption.
//!
//! Public keys come from DER, either a bare PKCS#1 `RSAPublicKey` or an
//! X.509 `SubjectPublicKeyInfo` wrapping one. Private keys exist for key
//! generation and decryption on the client side of RSA-based handshakes.

use num_bigint::{BigInt, BigUint, RandBigInt, Sign};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{Rng, RngCore};

use super::error::CryptoError;

/// Left-pad (or left-truncate) a big-endian integer to exactly `len` bytes.
pub fn to_fixed_be(n: &BigUint, len: usize) -> Vec<u8> {
    let bytes = n.to_bytes_be();
    if bytes.len() >= len {
        bytes[bytes.len() - len..].to_vec()
    } else {
        let mut out = vec![0u8; len - bytes.len()];
        out.extend_from_slice(&bytes);
        out
    }
}

// ── Public key ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    n: BigUint,
    e: BigUint,
    size: usize,
}

impl RsaPublicKey {
    /// Build from big-endian modulus and exponent bytes.
    pub fn new(n: &[u8], e: &[u8]) -> Result<Self, CryptoError> {
        let n = BigUint::from_bytes_be(n);
        let e = BigUint::from_bytes_be(e);
        if n.is_zero() || e.is_zero() {
            return Err(CryptoError::MalformedKey("zero modulus or exponent".into()));
        }
        let size = ((n.bits() + 7) / 8) as usize;
        if size < 12 {
            return Err(CryptoError::MalformedKey(format!("{size}-byte modulus is too small")));
        }
        Ok(Self { n, e, size })
    }

    /// Parse a DER `RSAPublicKey` or `SubjectPublicKeyInfo`.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let mut r = DerReader { der, pos: 0 };
        r.expect_tag(0x30, "SEQUENCE")?;
        r.read_length()?;

        if r.peek()? == 0x30 {
            // SPKI: AlgorithmIdentifier, then BIT STRING { RSAPublicKey }
            r.pos += 1;
            let alg_len = r.read_length()?;
            r.skip(alg_len)?;
            r.expect_tag(0x03, "BIT STRING")?;
            r.read_length()?;
            r.skip(1)?; // unused-bits byte
            r.expect_tag(0x30, "inner SEQUENCE")?;
            r.read_length()?;
        }

        let n = r.read_integer()?;
        let e = r.read_integer()?;
        Self::new(n, e)
    }

    /// Modulus size in bytes (`k`).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn modulus(&self) -> Vec<u8> {
        to_fixed_be(&self.n, self.size)
    }

    pub fn exponent(&self) -> Vec<u8> {
        self.e.to_bytes_be()
    }

    /// PKCS#1 v1.5 type 2 encryption: `00 02 PS 00 M` with non-zero random PS.
    pub fn encrypt<R: RngCore>(&self, rng: &mut R, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let k = self.size;
        if message.len() + 11 > k {
            return Err(CryptoError::MessageTooLong {
                len: message.len(),
                max: k - 11,
            });
        }
        let mut em = vec![0u8; k];
        em[1] = 0x02;
        let ps_len = k - message.len() - 3;
        for v in em[2..2 + ps_len].iter_mut() {
            *v = rng.gen_range(1..=255u8);
        }
        em[k - message.len()..].copy_from_slice(message);

        let c = BigUint::from_bytes_be(&em).modpow(&self.e, &self.n);
        Ok(to_fixed_be(&c, k))
    }
}

// ── Private key ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RsaPrivateKey {
    public: RsaPublicKey,
    d: BigUint,
}

impl std::fmt::Debug for RsaPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaPrivateKey")
            .field("size", &self.public.size)
            .finish_non_exhaustive()
    }
}

const PUBLIC_EXPONENT: u32 = 65537;

impl RsaPrivateKey {
    pub fn from_components(n: &[u8], e: &[u8], d: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            public: RsaPublicKey::new(n, e)?,
            d: BigUint::from_bytes_be(d),
        })
    }

    /// Generate a fresh key with a `bits`-bit modulus and e = 65537.
    pub fn generate<R: RngCore>(rng: &mut R, bits: u64) -> Result<Self, CryptoError> {
        if bits < 128 || bits % 2 != 0 {
            return Err(CryptoError::InvalidLength(format!("unsupported modulus size {bits}")));
        }
        let e = BigUint::from(PUBLIC_EXPONENT);
        loop {
            let p = random_prime(rng, bits / 2);
            let q = random_prime(rng, bits / 2);
            if p == q {
                continue;
            }
            let n = &p * &q;
            if n.bits() != bits {
                continue;
            }
            let phi = (&p - 1u32) * (&q - 1u32);
            let Some(d) = mod_inverse(&e, &phi) else {
                continue;
            };
            log::debug!("generated {bits}-bit RSA key");
            let size = (bits / 8) as usize;
            return Ok(Self {
                public: RsaPublicKey { n, e, size },
                d,
            });
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let k = self.public.size;
        if ciphertext.len() != k {
            return Err(CryptoError::InvalidLength(format!(
                "RSA ciphertext must be {k} bytes, got {}",
                ciphertext.len()
            )));
        }
        let m = BigUint::from_bytes_be(ciphertext).modpow(&self.d, &self.public.n);
        let em = to_fixed_be(&m, k);
        if em[0] != 0x00 || em[1] != 0x02 {
            return Err(CryptoError::InvalidPadding);
        }
        let sep = em[2..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(CryptoError::InvalidPadding)?;
        Ok(em[2 + sep + 1..].to_vec())
    }
}

// ── Prime generation ─────────────────────────────────────────────────────

const SMALL_PRIMES: [u32; 24] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

fn random_prime<R: RngCore>(rng: &mut R, bits: u64) -> BigUint {
    loop {
        let mut c = rng.gen_biguint(bits);
        // Top two bits set so p*q has exactly 2*bits bits; odd.
        c.set_bit(bits - 1, true);
        c.set_bit(bits - 2, true);
        c.set_bit(0, true);
        if is_probable_prime(rng, &c, 20) {
            return c;
        }
    }
}

fn is_probable_prime<R: RngCore>(rng: &mut R, n: &BigUint, rounds: usize) -> bool {
    for &sp in &SMALL_PRIMES {
        let sp = BigUint::from(sp);
        if *n == sp {
            return true;
        }
        if (n % &sp).is_zero() {
            return false;
        }
    }

    let one = BigUint::one();
    let two = BigUint::from(2u32);
    let n_minus_1 = n - &one;
    let s = n_minus_1.trailing_zeros().unwrap_or(0);
    let d = &n_minus_1 >> s;

    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_1);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_1 {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let a = BigInt::from_biguint(Sign::Plus, a.clone());
    let m = BigInt::from_biguint(Sign::Plus, m.clone());
    let egcd = a.extended_gcd(&m);
    if !egcd.gcd.is_one() {
        return None;
    }
    egcd.x.mod_floor(&m).to_biguint()
}

// ── DER ──────────────────────────────────────────────────────────────────

struct DerReader<'a> {
    der: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn need(&self, n: usize) -> Result<(), CryptoError> {
        if self.pos.checked_add(n).map_or(true, |end| end > self.der.len()) {
            return Err(CryptoError::MalformedKey(format!(
                "DER truncated at offset {} (need {n}, have {})",
                self.pos,
                self.der.len().saturating_sub(self.pos)
            )));
        }
        Ok(())
    }

    fn peek(&self) -> Result<u8, CryptoError> {
        self.need(1)?;
        Ok(self.der[self.pos])
    }

    fn next(&mut self) -> Result<u8, CryptoError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn skip(&mut self, n: usize) -> Result<(), CryptoError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    fn expect_tag(&mut self, tag: u8, what: &str) -> Result<(), CryptoError> {
        if self.next()? != tag {
            return Err(CryptoError::MalformedKey(format!("expected {what} tag in DER")));
        }
        Ok(())
    }

    fn read_length(&mut self) -> Result<usize, CryptoError> {
        let first = self.next()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 {
            return Err(CryptoError::MalformedKey(format!("unsupported DER length form 0x{first:02x}")));
        }
        self.need(count)?;
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | self.next()? as usize;
        }
        Ok(len)
    }

    fn read_integer(&mut self) -> Result<&'a [u8], CryptoError> {
        self.expect_tag(0x02, "INTEGER")?;
        let mut len = self.read_length()?;
        self.need(len)?;
        // Strip the sign byte.
        if len >= 2 && self.der[self.pos] == 0 && self.der[self.pos + 1] & 0x80 != 0 {
            self.pos += 1;
            len -= 1;
        }
        let value = &self.der[self.pos..self.pos + len];
        self.pos += len;
        Ok(value)
    }
}
