//! TightVNC security (type 16): tunnel and sub-auth capability
//! negotiation, plus the Unix-logon sub-auth (129).

use std::collections::HashMap;

use super::{AuthContext, AuthStep, Authenticator};
use crate::rfb::constants::security;
use crate::rfb::errors::RfbError;

const NOTUNNEL: (&str, &str) = ("TGHT", "NOTUNNEL");
const SIEMENS_TUNNEL: (&str, &str) = ("SICR", "SCHANNEL");

/// Sub-auth capability names, in client preference order.
const SUB_AUTH_TYPES: [(&str, u32); 3] = [
    ("STDVNOAUTH__", security::NONE),
    ("STDVVNCAUTH_", security::VNC_AUTH),
    ("TGHTULGNAUTH", security::TIGHT_UNIX_LOGON),
];

#[derive(Debug, Default)]
pub struct TightAuth {
    tunnels_done: bool,
}

impl TightAuth {
    fn negotiate_tunnels(ctx: &mut AuthContext<'_>, count: usize) -> Result<(), RfbError> {
        let mut offered: HashMap<u32, (String, String)> = HashMap::new();
        for _ in 0..count {
            let code = ctx.sock.shift32();
            let vendor = ctx.sock.shift_str(4);
            let signature = ctx.sock.shift_str(8);
            offered.insert(code, (vendor, signature));
        }
        log::debug!("Server Tight tunnel types: {offered:?}");

        // Siemens touch panels support NOTUNNEL without announcing it.
        if offered
            .get(&1)
            .is_some_and(|(v, s)| v == SIEMENS_TUNNEL.0 && s == SIEMENS_TUNNEL.1)
        {
            log::debug!("Detected Siemens server. Assuming NOTUNNEL support.");
            offered.insert(0, (NOTUNNEL.0.into(), NOTUNNEL.1.into()));
        }

        match offered.get(&0) {
            Some((vendor, signature)) if vendor == NOTUNNEL.0 && signature == NOTUNNEL.1 => {
                log::debug!("Selected tunnel type: NOTUNNEL");
                ctx.sock.sq_push32(0);
                ctx.sock.flush();
                Ok(())
            }
            Some(_) => Err(RfbError::protocol(
                "Client's tunnel type had the incorrect vendor or signature",
            )),
            None => Err(RfbError::protocol(
                "Server wanted tunnels, but doesn't support the notunnel type",
            )),
        }
    }
}

impl Authenticator for TightAuth {
    fn security_type(&self) -> u32 {
        security::TIGHT
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        if !self.tunnels_done {
            if ctx.sock.rq_wait("num tunnels", 4, 0)? {
                return Ok(AuthStep::Pending);
            }
            let tunnels = ctx.sock.shift32() as usize;
            if tunnels > 0 && ctx.sock.rq_wait("tunnel capabilities", 16 * tunnels, 4)? {
                return Ok(AuthStep::Pending);
            }
            *ctx.tight_vnc = true;
            self.tunnels_done = true;
            if tunnels > 0 {
                Self::negotiate_tunnels(ctx, tunnels)?;
            }
        }

        if ctx.sock.rq_wait("sub auth count", 4, 0)? {
            return Ok(AuthStep::Pending);
        }
        let count = ctx.sock.shift32() as usize;
        if count == 0 {
            return Ok(AuthStep::SecurityResult);
        }
        if ctx.sock.rq_wait("sub auth capabilities", 16 * count, 4)? {
            return Ok(AuthStep::Pending);
        }

        let mut offered = Vec::with_capacity(count);
        for _ in 0..count {
            ctx.sock.shift32();
            offered.push(ctx.sock.shift_str(12));
        }
        log::debug!("Server Tight authentication types: {offered:?}");

        let Some(&(name, code)) = SUB_AUTH_TYPES
            .iter()
            .find(|(name, _)| offered.iter().any(|o| o == name))
        else {
            return Err(RfbError::auth("No supported sub-auth types!"));
        };

        ctx.sock.sq_push32(code);
        ctx.sock.flush();
        log::debug!("Selected authentication type: {name}");
        Ok(match code {
            security::NONE => AuthStep::SecurityResult,
            other => AuthStep::Chain(other),
        })
    }
}

/// Tight Unix logon: length-prefixed username and password.
#[derive(Debug, Default)]
pub struct TightUnixLogonAuth;

impl Authenticator for TightUnixLogonAuth {
    fn security_type(&self) -> u32 {
        security::TIGHT_UNIX_LOGON
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        let Some((user, pass)) = ctx.user_password() else {
            return Ok(AuthStep::Pending);
        };
        ctx.sock.sq_push32(user.chars().count() as u32);
        ctx.sock.sq_push32(pass.chars().count() as u32);
        ctx.sock.sq_push_str(&user);
        ctx.sock.sq_push_str(&pass);
        ctx.sock.flush();
        Ok(AuthStep::SecurityResult)
    }
}
