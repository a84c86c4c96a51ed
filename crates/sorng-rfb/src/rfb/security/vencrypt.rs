//! VeNCrypt (type 19) version 0.2 and its Plain subtype (256).

use super::{is_supported, AuthContext, AuthStep, Authenticator};
use crate::rfb::constants::security;
use crate::rfb::errors::RfbError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Stage {
    #[default]
    Version,
    Ack,
    SubtypeCount,
    Subtypes(usize),
}

#[derive(Debug, Default)]
pub struct VeNCryptAuth {
    stage: Stage,
}

impl Authenticator for VeNCryptAuth {
    fn security_type(&self) -> u32 {
        security::VENCRYPT
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        let sock = &mut *ctx.sock;

        if self.stage == Stage::Version {
            if sock.rq_wait("vencrypt version", 2, 0)? {
                return Ok(AuthStep::Pending);
            }
            let major = sock.shift8();
            let minor = sock.shift8();
            if !(major == 0 && minor == 2) {
                return Err(RfbError::protocol(format!(
                    "Unsupported VeNCrypt version {major}.{minor}"
                )));
            }
            sock.sq_push8(0);
            sock.sq_push8(2);
            sock.flush();
            self.stage = Stage::Ack;
        }

        if self.stage == Stage::Ack {
            if sock.rq_wait("vencrypt ack", 1, 0)? {
                return Ok(AuthStep::Pending);
            }
            let res = sock.shift8();
            if res != 0 {
                return Err(RfbError::auth(format!("VeNCrypt failure {res}")));
            }
            self.stage = Stage::SubtypeCount;
        }

        // The count and the list may arrive together with the ack, so
        // every stage falls through.
        if self.stage == Stage::SubtypeCount {
            if sock.rq_wait("vencrypt subtypes length", 1, 0)? {
                return Ok(AuthStep::Pending);
            }
            let count = sock.shift8() as usize;
            if count < 1 {
                return Err(RfbError::protocol("VeNCrypt subtypes empty"));
            }
            self.stage = Stage::Subtypes(count);
        }

        let Stage::Subtypes(count) = self.stage else {
            return Ok(AuthStep::Pending);
        };
        if sock.rq_wait("vencrypt subtypes", 4 * count, 0)? {
            return Ok(AuthStep::Pending);
        }
        let subtypes: Vec<u32> = (0..count).map(|_| sock.shift32()).collect();
        log::debug!("VeNCrypt subtypes: {subtypes:?}");

        let chosen = subtypes
            .iter()
            .copied()
            .find(|&t| t != security::VENCRYPT && is_supported(t))
            .ok_or_else(|| RfbError::UnsupportedSecurity(subtypes.clone()))?;

        sock.sq_push32(chosen);
        sock.flush();
        Ok(AuthStep::Chain(chosen))
    }
}

/// Plain (256): cleartext username and password.
#[derive(Debug, Default)]
pub struct PlainAuth;

impl Authenticator for PlainAuth {
    fn security_type(&self) -> u32 {
        security::PLAIN
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        let Some((user, pass)) = ctx.user_password() else {
            return Ok(AuthStep::Pending);
        };
        ctx.sock.sq_push32(user.len() as u32);
        ctx.sock.sq_push32(pass.len() as u32);
        ctx.sock.sq_push_bytes(user.as_bytes());
        ctx.sock.sq_push_bytes(pass.as_bytes());
        ctx.sock.flush();
        Ok(AuthStep::SecurityResult)
    }
}
