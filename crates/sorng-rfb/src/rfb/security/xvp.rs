use super::{AuthContext, AuthStep, Authenticator};
use crate::rfb::constants::security;
use crate::rfb::errors::RfbError;

/// XVP authentication (type 22): user and target name, then a regular
/// VNC challenge.
#[derive(Debug, Default)]
pub struct XvpAuth;

impl Authenticator for XvpAuth {
    fn security_type(&self) -> u32 {
        security::XVP
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        let creds = ctx.credentials;
        let (Some(username), Some(_), Some(target)) = (&creds.username, &creds.password, &creds.target) else {
            ctx.request_credentials(&["username", "password", "target"]);
            return Ok(AuthStep::Pending);
        };

        ctx.sock.sq_push8(username.chars().count() as u8);
        ctx.sock.sq_push8(target.chars().count() as u8);
        ctx.sock.sq_push_str(username);
        ctx.sock.sq_push_str(target);
        ctx.sock.flush();
        Ok(AuthStep::Chain(security::VNC_AUTH))
    }
}
