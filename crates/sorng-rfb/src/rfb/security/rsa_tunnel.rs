//! RSA-Tunnel authentication (type 33).
//!
//! Every tunnel message is `[u32be length][payload]`; payloads start with
//! `[u16le version = 1][u32le "RSA1"]`. The client fetches the server's
//! RSA key (or reuses a cached one), encrypts the ARD credential block
//! under a random AES key, and sends that key wrapped in RSA.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sorng_rfb_crypto::{Aes128, RsaPublicKey};

use super::ard::pack_credentials;
use super::provider::CryptoProvider;
use super::{AuthContext, AuthStep, Authenticator, CryptoOutcome};
use crate::rfb::collab::KeyValueCache;
use crate::rfb::constants::{security, RSA_TUNNEL_MAGIC};
use crate::rfb::errors::RfbError;

const MAX_KEY_RESPONSE: usize = 8192;
const MAX_AUTH_RESPONSE: usize = 4096;
const SUBPROTO_KEY_REQUEST: u16 = 0;
const SUBPROTO_PLAIN: u16 = 1;

/// Cache entry name for the server key of `url`.
pub fn rsa_key_cache_key(url: &str) -> String {
    format!("rsa_tunnel_key:{url}")
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedKey {
    n: Vec<u8>,
    e: Vec<u8>,
}

fn load_cached(cache: &dyn KeyValueCache, url: Option<&str>) -> Option<RsaPublicKey> {
    let stored = cache.get(&rsa_key_cache_key(url?))?;
    let parsed: CachedKey = serde_json::from_str(&stored).ok()?;
    RsaPublicKey::new(&parsed.n, &parsed.e).ok()
}

fn store_cached(cache: &mut dyn KeyValueCache, url: Option<&str>, key: &RsaPublicKey) {
    let Some(url) = url else { return };
    let entry = CachedKey {
        n: key.modulus(),
        e: key.exponent(),
    };
    match serde_json::to_string(&entry) {
        Ok(json) => cache.set(&rsa_key_cache_key(url), json),
        Err(e) => log::warn!("Failed to cache RSA key: {e}"),
    }
}

fn clear_cached(cache: &mut dyn KeyValueCache, url: Option<&str>) {
    if let Some(url) = url {
        cache.remove(&rsa_key_cache_key(url));
    }
}

fn tunnel_header(sock: &mut crate::rfb::framed::FramedTransport, length: u32, subproto: u16) {
    sock.sq_push32(length);
    sock.sq_push_bytes(&1u16.to_le_bytes());
    sock.sq_push_bytes(&RSA_TUNNEL_MAGIC.to_le_bytes());
    sock.sq_push16(subproto);
}

async fn compute(
    crypto: Arc<dyn CryptoProvider>,
    server_key: RsaPublicKey,
    username: String,
    password: String,
) -> Result<CryptoOutcome, RfbError> {
    // The random key is used as-is, not hashed.
    let random = crypto.random_bytes(16).await;
    let mut dh_key = [0u8; 16];
    dh_key.copy_from_slice(&random[..16]);

    let fill = crypto.random_bytes(128).await;
    let creds = pack_credentials(&fill, &username, &password);
    let encrypted_credentials = Aes128::new(&dh_key).encrypt_ecb(&creds)?;
    let encrypted_key = crypto.rsa_pkcs1_encrypt(&server_key, &dh_key).await?;

    Ok(CryptoOutcome::RsaTunnel {
        encrypted_credentials,
        encrypted_key,
        dh_key,
    })
}

#[derive(Debug, Default)]
enum Stage {
    #[default]
    Start,
    AwaitKey,
    Encrypt(RsaPublicKey),
    Computing,
    Send(Vec<u8>, Vec<u8>),
    AwaitResponse,
}

#[derive(Debug, Default)]
pub struct RsaTunnelAuth {
    stage: Stage,
}

impl Authenticator for RsaTunnelAuth {
    fn security_type(&self) -> u32 {
        security::RSA_TUNNEL
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        let Some((username, password)) = ctx.user_password() else {
            return Ok(AuthStep::Pending);
        };

        if let Stage::Send(creds, wrapped_key) = &self.stage {
            let blob_size = 8 + 128 + 2 + wrapped_key.len();
            tunnel_header(ctx.sock, blob_size as u32, SUBPROTO_PLAIN);
            ctx.sock.sq_push_bytes(creds);
            ctx.sock.sq_push_bytes(&(wrapped_key.len() as u16).to_le_bytes());
            ctx.sock.sq_push_bytes(wrapped_key);
            ctx.sock.flush();
            log::info!("RSATunnel: sent credential blob ({blob_size} bytes)");
            self.stage = Stage::AwaitResponse;
        }

        if let Stage::AwaitResponse = self.stage {
            if ctx.sock.rq_wait("RSATunnel response", 4, 0)? {
                return Ok(AuthStep::Pending);
            }
            let len = ctx.sock.shift32() as usize;
            if len > MAX_AUTH_RESPONSE {
                return Err(RfbError::protocol(format!(
                    "RSATunnel: response too large ({len} bytes)"
                )));
            }
            if len > 0 {
                if ctx.sock.rq_wait("RSATunnel response body", len, 4)? {
                    return Ok(AuthStep::Pending);
                }
                let body = ctx.sock.shift_vec(len);
                if body.len() >= 2 {
                    let status = u16::from_le_bytes([body[0], body[1]]);
                    if status != 0 {
                        log::warn!("RSATunnel: server response status: {status}, clearing cached RSA key");
                        clear_cached(ctx.cache, ctx.url);
                        if status == 81 || status == 255 {
                            return Err(RfbError::auth("RSATunnel authentication denied"));
                        }
                        return Err(RfbError::auth(format!(
                            "RSATunnel authentication failed (status {status}), please retry"
                        )));
                    }
                }
            }
            self.stage = Stage::Start;
            return Ok(AuthStep::SecurityResult);
        }

        if let Stage::Start = self.stage {
            if let Some(key) = load_cached(ctx.cache, ctx.url) {
                log::debug!("RSATunnel: using cached server key");
                self.stage = Stage::Encrypt(key);
            } else {
                log::debug!("RSATunnel: requesting server public key");
                tunnel_header(ctx.sock, 10, SUBPROTO_KEY_REQUEST);
                ctx.sock.sq_push16(0);
                ctx.sock.flush();
                self.stage = Stage::AwaitKey;
            }
        }

        if let Stage::AwaitKey = self.stage {
            if ctx.sock.rq_wait("RSATunnel key response length", 4, 0)? {
                return Ok(AuthStep::Pending);
            }
            let len = ctx.sock.shift32() as usize;
            if len > MAX_KEY_RESPONSE {
                return Err(RfbError::protocol(format!(
                    "RSATunnel: key response too large ({len} bytes)"
                )));
            }
            if ctx.sock.rq_wait("RSATunnel key response", len, 4)? {
                return Ok(AuthStep::Pending);
            }
            // [u16le version][u16le type][u16be key length][DER key]
            let payload = ctx.sock.shift_vec(len);
            if payload.len() < 6 {
                return Err(RfbError::protocol(format!(
                    "RSATunnel: key response too short ({len} bytes)"
                )));
            }
            let key_len = u16::from_be_bytes([payload[4], payload[5]]) as usize;
            let der = &payload[6..(6 + key_len).min(payload.len())];
            let key = RsaPublicKey::from_der(der)?;
            log::info!("RSATunnel: received server key ({}-bit)", key.size() * 8);
            store_cached(ctx.cache, ctx.url, &key);
            self.stage = Stage::Encrypt(key);
        }

        if let Stage::Encrypt(_) = self.stage {
            let Stage::Encrypt(key) = std::mem::replace(&mut self.stage, Stage::Computing) else {
                return Ok(AuthStep::Pending);
            };
            let crypto = Arc::clone(ctx.crypto);
            ctx.start_task(Box::pin(async move {
                compute(crypto, key, username, password)
                    .await
                    .map_err(|e| RfbError::auth(format!("RSATunnel auth error: {e}")))
            }));
        }
        Ok(AuthStep::Pending)
    }

    fn crypto_complete(&mut self, outcome: CryptoOutcome) -> Result<(), RfbError> {
        match outcome {
            CryptoOutcome::RsaTunnel {
                encrypted_credentials,
                encrypted_key,
                ..
            } => {
                self.stage = Stage::Send(encrypted_credentials, encrypted_key);
                Ok(())
            }
            other => Err(RfbError::Internal(format!("RSATunnel auth got {other:?}"))),
        }
    }
}
