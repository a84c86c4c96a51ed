//! UltraVNC MS-Logon II (type 113).
//!
//! The server sends an 8-byte DH group and its public value. The 8-byte
//! shared secret keys DES-CBC (and doubles as the IV) over a 256-byte
//! username block and a 64-byte password block.

use std::sync::Arc;

use super::provider::CryptoProvider;
use super::{AuthContext, AuthStep, Authenticator, CryptoOutcome};
use crate::rfb::constants::security;
use crate::rfb::errors::RfbError;

const USERNAME_BLOCK: usize = 256;
const PASSWORD_BLOCK: usize = 64;

/// NUL-terminated `value` over random fill, truncated to `size - 1` bytes.
fn padded(mut fill: Vec<u8>, size: usize, value: &str) -> Vec<u8> {
    fill.resize(size, 0);
    let bytes = value.as_bytes();
    let len = bytes.len().min(size - 1);
    fill[..len].copy_from_slice(&bytes[..len]);
    fill[len] = 0;
    fill
}

async fn compute(
    crypto: Arc<dyn CryptoProvider>,
    generator: Vec<u8>,
    prime: Vec<u8>,
    server_public: Vec<u8>,
    username: String,
    password: String,
) -> Result<CryptoOutcome, RfbError> {
    let keys = crypto.generate_dh(&generator, &prime).await?;
    let shared = crypto.derive_dh(&keys, &prime, &server_public).await?;
    let mut secret = [0u8; 8];
    secret.copy_from_slice(&shared[shared.len().saturating_sub(8)..]);

    let user = padded(crypto.random_bytes(USERNAME_BLOCK).await, USERNAME_BLOCK, &username);
    let pass = padded(crypto.random_bytes(PASSWORD_BLOCK).await, PASSWORD_BLOCK, &password);
    Ok(CryptoOutcome::MsLogon {
        public_key: keys.public_key,
        username: crypto.des_cbc_encrypt(&secret, &secret, &user).await?,
        password: crypto.des_cbc_encrypt(&secret, &secret, &pass).await?,
    })
}

#[derive(Debug, Default)]
pub struct MsLogonAuth {
    computing: bool,
    result: Option<(Vec<u8>, Vec<u8>, Vec<u8>)>,
}

impl Authenticator for MsLogonAuth {
    fn security_type(&self) -> u32 {
        security::MS_LOGON_II
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        if let Some((public_key, user, pass)) = self.result.take() {
            ctx.sock.sq_push_bytes(&public_key);
            ctx.sock.sq_push_bytes(&user);
            ctx.sock.sq_push_bytes(&pass);
            ctx.sock.flush();
            return Ok(AuthStep::SecurityResult);
        }
        if self.computing {
            return Ok(AuthStep::Pending);
        }

        if ctx.sock.rq_wait("mslogonii dh param", 24, 0)? {
            return Ok(AuthStep::Pending);
        }
        let Some((username, password)) = ctx.user_password() else {
            return Ok(AuthStep::Pending);
        };

        let generator = ctx.sock.shift_vec(8);
        let prime = ctx.sock.shift_vec(8);
        let server_public = ctx.sock.shift_vec(8);
        self.computing = true;
        let crypto = Arc::clone(ctx.crypto);
        ctx.start_task(Box::pin(compute(
            crypto,
            generator,
            prime,
            server_public,
            username,
            password,
        )));
        Ok(AuthStep::Pending)
    }

    fn crypto_complete(&mut self, outcome: CryptoOutcome) -> Result<(), RfbError> {
        match outcome {
            CryptoOutcome::MsLogon {
                public_key,
                username,
                password,
            } => {
                self.computing = false;
                self.result = Some((public_key, username, password));
                Ok(())
            }
            other => Err(RfbError::Internal(format!("MS-Logon II auth got {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::Harness;
    use super::*;
    use crate::rfb::config::Credentials;
    use crate::rfb::security::provider::{vnc_des_cipher, LocalCryptoProvider};
    use cipher::generic_array::GenericArray;
    use cipher::BlockDecrypt;
    use futures::executor::block_on;

    fn des_cbc_decrypt(key: &[u8; 8], data: &[u8]) -> Vec<u8> {
        let cipher = vnc_des_cipher(key).unwrap();
        let mut prev = *key;
        let mut out = data.to_vec();
        for chunk in out.chunks_exact_mut(8) {
            let ct: [u8; 8] = chunk.try_into().unwrap();
            cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
            for (b, p) in chunk.iter_mut().zip(prev) {
                *b ^= p;
            }
            prev = ct;
        }
        out
    }

    #[test]
    fn padding_is_nul_terminated() {
        let block = padded(vec![7; 64], 64, "pw");
        assert_eq!(&block[..3], b"pw\0");
        assert_eq!(block[3], 7);
        let long = padded(vec![7; 64], 64, &"z".repeat(100));
        assert_eq!(long[62], b'z');
        assert_eq!(long[63], 0);
    }

    #[test]
    fn server_recovers_credentials() {
        let p = LocalCryptoProvider;
        let prime = 0xffff_ffff_ffff_ffc5u64.to_be_bytes();
        let generator = 5u64.to_be_bytes();
        let server = block_on(p.generate_dh(&generator, &prime)).unwrap();

        let mut h = Harness::new(Credentials::user_password("DOMAIN\\bob", "hunter2"));
        let mut auth = MsLogonAuth::default();
        let mut wire = generator.to_vec();
        wire.extend_from_slice(&prime);
        wire.extend_from_slice(&server.public_key);
        h.feed(&wire);
        assert_eq!(h.step(&mut auth).unwrap(), AuthStep::Pending);
        h.finish_task(&mut auth);
        assert_eq!(h.step(&mut auth).unwrap(), AuthStep::SecurityResult);

        let sent = h.wire.take_sent();
        assert_eq!(sent.len(), 8 + 256 + 64);
        let shared = block_on(p.derive_dh(&server, &prime, &sent[..8])).unwrap();
        let mut secret = [0u8; 8];
        secret.copy_from_slice(&shared);
        let user = des_cbc_decrypt(&secret, &sent[8..264]);
        assert_eq!(&user[..11], b"DOMAIN\\bob\0");
        let pass = des_cbc_decrypt(&secret, &sent[264..]);
        assert_eq!(&pass[..8], b"hunter2\0");
    }

    #[test]
    fn waits_for_params_before_credentials() {
        let mut h = Harness::new(Credentials::default());
        h.feed(&[0u8; 23]);
        assert_eq!(h.step(&mut MsLogonAuth::default()).unwrap(), AuthStep::Pending);
        assert!(h.events().is_empty());
    }
}
