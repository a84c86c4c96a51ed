//! RA2ne (type 6): RSA-AES encapsulated authentication.
//!
//! The exchange itself belongs to an external delegate. The engine polls
//! it on every handshake pass, relays what it asks for, and moves on to
//! SecurityResult once it reports completion.

use super::{AuthContext, AuthStep, Authenticator};
use crate::rfb::config::Credentials;
use crate::rfb::constants::security;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::RfbEvent;

/// Error text a delegate uses when the user aborted; not a failure.
pub const DISCONNECT_NORMALLY: &str = "disconnect normally";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ra2nePoll {
    Pending,
    CredentialsRequired(Vec<String>),
    ServerVerification { kind: String, public_key: Vec<u8> },
    Complete,
}

pub trait Ra2neDelegate: Send {
    /// Advance the exchange using whatever input is buffered.
    fn poll(&mut self, sock: &mut FramedTransport, credentials: &Credentials) -> Result<Ra2nePoll, String>;
    /// The user accepted the server identity.
    fn approve_server(&mut self);
    fn disconnect(&mut self);
}

#[derive(Debug, Default)]
pub struct Ra2neAuth;

impl Authenticator for Ra2neAuth {
    fn security_type(&self) -> u32 {
        security::RA2NE
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        let Some(delegate) = ctx.ra2ne.as_deref_mut() else {
            return Err(RfbError::auth("RA2ne authentication is not available"));
        };
        match delegate.poll(ctx.sock, ctx.credentials) {
            Ok(Ra2nePoll::Pending) => Ok(AuthStep::Pending),
            Ok(Ra2nePoll::CredentialsRequired(types)) => {
                ctx.events.emit(RfbEvent::CredentialsRequired { types });
                Ok(AuthStep::Pending)
            }
            Ok(Ra2nePoll::ServerVerification { kind, public_key }) => {
                ctx.events.emit(RfbEvent::ServerVerification { kind, public_key });
                Ok(AuthStep::Pending)
            }
            Ok(Ra2nePoll::Complete) => Ok(AuthStep::SecurityResult),
            Err(msg) if msg == DISCONNECT_NORMALLY => {
                log::info!("RA2ne: {msg}");
                Ok(AuthStep::SecurityResult)
            }
            Err(msg) => Err(RfbError::Auth(msg)),
        }
    }
}
