//! Apple Remote Desktop Diffie-Hellman authentication (type 30).
//!
//! The server sends `[generator: 2][key_length: u16][prime][server_pub]`.
//! The client answers with 128 bytes of AES-ECB encrypted credentials
//! followed by its own public value. The AES key is `MD5(shared_secret)`
//! and is kept afterwards to unwrap the session key of encoding 1103.

use std::sync::Arc;

use sorng_rfb_crypto::Aes128;

use super::provider::CryptoProvider;
use super::{AuthContext, AuthStep, Authenticator, CryptoOutcome};
use crate::rfb::constants::security;
use crate::rfb::errors::RfbError;

/// Build the 128-byte credential block from 128 bytes of `random` fill:
/// username at 0 and password at 64, each at most 63 bytes of UTF-8 and
/// NUL-terminated.
pub fn pack_credentials(random: &[u8], username: &str, password: &str) -> [u8; 128] {
    let mut buf = [0u8; 128];
    let fill = random.len().min(128);
    buf[..fill].copy_from_slice(&random[..fill]);

    let user = username.as_bytes();
    let user_len = user.len().min(63);
    buf[..user_len].copy_from_slice(&user[..user_len]);
    buf[user_len] = 0;

    let pass = password.as_bytes();
    let pass_len = pass.len().min(63);
    buf[64..64 + pass_len].copy_from_slice(&pass[..pass_len]);
    buf[64 + pass_len] = 0;
    buf
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
    let dh_key = crypto.md5(&shared).await;

    let random = crypto.random_bytes(128).await;
    let creds = pack_credentials(&random, &username, &password);
    let encrypted_credentials = Aes128::new(&dh_key).encrypt_ecb(&creds)?;

    Ok(CryptoOutcome::Ard {
        encrypted_credentials,
        client_public_key: keys.public_key,
        dh_key,
    })
}

#[derive(Debug, Default)]
pub struct ArdAuth {
    computing: bool,
    result: Option<(Vec<u8>, Vec<u8>)>,
}

impl Authenticator for ArdAuth {
    fn security_type(&self) -> u32 {
        security::ARD
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        let Some((username, password)) = ctx.user_password() else {
            return Ok(AuthStep::Pending);
        };

        if let Some((credentials, public_key)) = self.result.take() {
            ctx.sock.sq_push_bytes(&credentials);
            ctx.sock.sq_push_bytes(&public_key);
            ctx.sock.flush();
            log::info!("ARD: sent DH credentials");
            return Ok(AuthStep::SecurityResult);
        }
        if self.computing {
            return Ok(AuthStep::Pending);
        }

        if ctx.sock.rq_wait("read ard", 4, 0)? {
            return Ok(AuthStep::Pending);
        }
        let generator = ctx.sock.shift_vec(2);
        let key_length = ctx.sock.shift16() as usize;
        if ctx.sock.rq_wait("read ard keylength", key_length * 2, 4)? {
            return Ok(AuthStep::Pending);
        }
        let prime = ctx.sock.shift_vec(key_length);
        let server_public = ctx.sock.shift_vec(key_length);
        log::info!("ARD (type 30) authentication, {}-bit DH group", key_length * 8);

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
            CryptoOutcome::Ard {
                encrypted_credentials,
                client_public_key,
                ..
            } => {
                self.computing = false;
                self.result = Some((encrypted_credentials, client_public_key));
                Ok(())
            }
            other => Err(RfbError::Internal(format!("ARD auth got {other:?}"))),
        }
    }
}
