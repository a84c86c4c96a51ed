use super::provider::des_ecb;
use super::{AuthContext, AuthStep, Authenticator};
use crate::rfb::constants::security;
use crate::rfb::errors::RfbError;

/// Encrypt a 16-byte challenge with the password as a DES key.
///
/// The password is truncated or zero-padded to 8 bytes; each key byte is
/// bit-reversed (the VNC convention) and both challenge halves are
/// encrypted independently.
pub fn vnc_challenge_response(password: &str, challenge: &[u8; 16]) -> Result<[u8; 16], RfbError> {
    let mut key = [0u8; 8];
    let bytes = password.as_bytes();
    let len = bytes.len().min(8);
    key[..len].copy_from_slice(&bytes[..len]);

    let encrypted = des_ecb(&key, challenge)?;
    let mut response = [0u8; 16];
    response.copy_from_slice(&encrypted);
    Ok(response)
}

/// Standard VNC authentication (type 2).
#[derive(Debug, Default)]
pub struct VncAuth;

impl Authenticator for VncAuth {
    fn security_type(&self) -> u32 {
        security::VNC_AUTH
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        if ctx.sock.rq_wait("auth challenge", 16, 0)? {
            return Ok(AuthStep::Pending);
        }
        let Some(password) = ctx.credentials.password.as_deref() else {
            ctx.request_credentials(&["password"]);
            return Ok(AuthStep::Pending);
        };

        let mut challenge = [0u8; 16];
        challenge.copy_from_slice(ctx.sock.shift_bytes(16));
        let response = vnc_challenge_response(password, &challenge)?;
        ctx.sock.sq_push_bytes(&response);
        ctx.sock.flush();
        Ok(AuthStep::SecurityResult)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::Harness;
    use super::*;
    use crate::rfb::config::Credentials;
    use crate::rfb::types::RfbEvent;

    #[test]
    fn challenge_waits_before_asking_for_password() {
        let mut h = Harness::new(Credentials::default());
        h.feed(&[0u8; 10]);
        assert_eq!(h.step(&mut VncAuth).unwrap(), AuthStep::Pending);
        assert!(h.events().is_empty());

        h.feed(&[0u8; 6]);
        assert_eq!(h.step(&mut VncAuth).unwrap(), AuthStep::Pending);
        assert_eq!(
            h.events(),
            vec![RfbEvent::CredentialsRequired {
                types: vec!["password".into()]
            }]
        );
        assert_eq!(h.sock.rq_len(), 16);
    }

    #[test]
    fn sends_des_response() {
        let mut h = Harness::new(Credentials::password("secret"));
        let challenge: [u8; 16] = core::array::from_fn(|i| i as u8);
        h.feed(&challenge);
        assert_eq!(h.step(&mut VncAuth).unwrap(), AuthStep::SecurityResult);
        let sent = h.wire.take_sent();
        assert_eq!(sent, vnc_challenge_response("secret", &challenge).unwrap().to_vec());
    }

    #[test]
    fn long_passwords_are_truncated() {
        let c = [9u8; 16];
        assert_eq!(
            vnc_challenge_response("12345678", &c).unwrap(),
            vnc_challenge_response("123456789abc", &c).unwrap()
        );
        assert_ne!(
            vnc_challenge_response("1234567", &c).unwrap(),
            vnc_challenge_response("12345678", &c).unwrap()
        );
    }
}
