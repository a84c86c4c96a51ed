//! Security negotiation and the authentication schemes.
//!
//! Every scheme implements [`Authenticator`]. The engine creates one when
//! the Authentication phase starts and calls [`Authenticator::step`] each
//! time new input arrives. A step either waits ([`AuthStep::Pending`]),
//! finishes, or hands over to another scheme ([`AuthStep::Chain`]), which
//! is how XVP falls through to VNC-DES and how VeNCrypt and Tight pick a
//! subtype.
//!
//! Schemes that need key agreement or public-key work never block. They
//! park a [`CryptoTask`] in the context and report `Pending`; the owner
//! runs the task and hands the [`CryptoOutcome`] back to the engine.

mod ard;
mod mslogon;
pub mod provider;
mod ra2ne;
mod rsa_tunnel;
mod tight;
mod vencrypt;
mod vnc;
mod xvp;

use std::sync::Arc;

use futures::future::BoxFuture;

use super::collab::{EventSink, KeyValueCache};
use super::config::Credentials;
use super::constants::security;
use super::errors::RfbError;
use super::framed::FramedTransport;
use super::types::{RfbEvent, RfbVersion};

pub use ard::{pack_credentials, ArdAuth};
pub use mslogon::MsLogonAuth;
pub use provider::{CryptoProvider, DhKeyPair, LocalCryptoProvider};
pub use ra2ne::{Ra2neAuth, Ra2neDelegate, Ra2nePoll, DISCONNECT_NORMALLY};
pub use rsa_tunnel::{rsa_key_cache_key, RsaTunnelAuth};
pub use tight::{TightAuth, TightUnixLogonAuth};
pub use vencrypt::{PlainAuth, VeNCryptAuth};
pub use vnc::{vnc_challenge_response, VncAuth};
pub use xvp::XvpAuth;

/// Client-supported security types.
pub const SUPPORTED_TYPES: [u32; 10] = [
    security::NONE,
    security::VNC_AUTH,
    security::RA2NE,
    security::TIGHT,
    security::VENCRYPT,
    security::XVP,
    security::ARD,
    security::RSA_TUNNEL,
    security::MS_LOGON_II,
    security::PLAIN,
];

pub fn is_supported(ty: u32) -> bool {
    SUPPORTED_TYPES.contains(&ty)
}

/// Pick a type from the server's list: the first one we support, except
/// that RSA-Tunnel wins whenever it is offered.
pub fn select_security_type(types: &[u8]) -> Option<u32> {
    let mut chosen = None;
    for &ty in types {
        let ty = ty as u32;
        if !is_supported(ty) {
            continue;
        }
        if ty == security::RSA_TUNNEL {
            return Some(ty);
        }
        chosen.get_or_insert(ty);
    }
    chosen
}

// ── Async crypto hand-off ────────────────────────────────────────────────

/// Deferred crypto work produced by a scheme. Owned and driven by whoever
/// owns the engine.
pub type CryptoTask = BoxFuture<'static, Result<CryptoOutcome, RfbError>>;

/// Result of a [`CryptoTask`].
#[derive(Clone)]
pub enum CryptoOutcome {
    Ard {
        encrypted_credentials: Vec<u8>,
        client_public_key: Vec<u8>,
        dh_key: [u8; 16],
    },
    RsaTunnel {
        encrypted_credentials: Vec<u8>,
        encrypted_key: Vec<u8>,
        dh_key: [u8; 16],
    },
    MsLogon {
        public_key: Vec<u8>,
        username: Vec<u8>,
        password: Vec<u8>,
    },
}

impl CryptoOutcome {
    /// AES key later used to unwrap the ARD session key.
    pub fn dh_key(&self) -> Option<[u8; 16]> {
        match self {
            Self::Ard { dh_key, .. } | Self::RsaTunnel { dh_key, .. } => Some(*dh_key),
            Self::MsLogon { .. } => None,
        }
    }
}

impl std::fmt::Debug for CryptoOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ard { .. } => f.write_str("CryptoOutcome::Ard"),
            Self::RsaTunnel { .. } => f.write_str("CryptoOutcome::RsaTunnel"),
            Self::MsLogon { .. } => f.write_str("CryptoOutcome::MsLogon"),
        }
    }
}

// ── Authenticator ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    /// Waiting for input, credentials, or a crypto task.
    Pending,
    /// Authentication sent; the server answers with SecurityResult.
    SecurityResult,
    /// No SecurityResult follows (None on 3.3/3.7).
    ClientInit,
    /// Continue with another scheme.
    Chain(u32),
}

/// Everything a scheme may touch while it runs.
pub struct AuthContext<'a> {
    pub sock: &'a mut FramedTransport,
    pub credentials: &'a Credentials,
    pub events: &'a EventSink,
    pub cache: &'a mut dyn KeyValueCache,
    pub crypto: &'a Arc<dyn CryptoProvider>,
    pub task: &'a mut Option<CryptoTask>,
    pub version: RfbVersion,
    /// Endpoint identity, used to key cached server keys.
    pub url: Option<&'a str>,
    /// Set once the TightVNC security extension is in use; ServerInit
    /// then carries a capability block.
    pub tight_vnc: &'a mut bool,
    pub ra2ne: Option<&'a mut (dyn Ra2neDelegate + 'static)>,
}

impl AuthContext<'_> {
    pub(crate) fn request_credentials(&self, types: &[&str]) {
        self.events.emit(RfbEvent::CredentialsRequired {
            types: types.iter().map(|t| t.to_string()).collect(),
        });
    }

    /// Username and password, or `None` after asking for them.
    pub(crate) fn user_password(&self) -> Option<(String, String)> {
        match (&self.credentials.username, &self.credentials.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => {
                self.request_credentials(&["username", "password"]);
                None
            }
        }
    }

    pub(crate) fn start_task(&mut self, task: CryptoTask) {
        *self.task = Some(task);
    }
}

pub trait Authenticator: Send {
    fn security_type(&self) -> u32;

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError>;

    /// Deliver the result of the task this scheme started.
    fn crypto_complete(&mut self, outcome: CryptoOutcome) -> Result<(), RfbError> {
        Err(RfbError::Internal(format!(
            "security type {} received unexpected crypto result {outcome:?}",
            self.security_type()
        )))
    }
}

/// `None` auth. Only a SecurityResult on 3.8.
#[derive(Debug, Default)]
pub struct NoneAuth;

impl Authenticator for NoneAuth {
    fn security_type(&self) -> u32 {
        security::NONE
    }

    fn step(&mut self, ctx: &mut AuthContext<'_>) -> Result<AuthStep, RfbError> {
        if ctx.version >= RfbVersion::V3_8 {
            Ok(AuthStep::SecurityResult)
        } else {
            Ok(AuthStep::ClientInit)
        }
    }
}

/// Construct the scheme for a negotiated security type.
pub fn authenticator_for(ty: u32) -> Option<Box<dyn Authenticator>> {
    let auth: Box<dyn Authenticator> = match ty {
        security::NONE => Box::new(NoneAuth),
        security::VNC_AUTH => Box::new(VncAuth::default()),
        security::RA2NE => Box::new(Ra2neAuth),
        security::TIGHT => Box::new(TightAuth::default()),
        security::VENCRYPT => Box::new(VeNCryptAuth::default()),
        security::XVP => Box::new(XvpAuth),
        security::ARD => Box::new(ArdAuth::default()),
        security::RSA_TUNNEL => Box::new(RsaTunnelAuth::default()),
        security::MS_LOGON_II => Box::new(MsLogonAuth::default()),
        security::TIGHT_UNIX_LOGON => Box::new(TightUnixLogonAuth),
        security::PLAIN => Box::new(PlainAuth),
        _ => return None,
    };
    Some(auth)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::rfb::collab::MemoryCache;
    use crate::rfb::mock::MockTransport;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    pub use super::rsa_tunnel::test_util::key_response as rsa_key_response;

    /// Owned pieces for building an [`AuthContext`] in tests.
    pub struct Harness {
        pub sock: FramedTransport,
        pub wire: MockTransport,
        pub credentials: Credentials,
        pub events: EventSink,
        pub rx: UnboundedReceiver<RfbEvent>,
        pub cache: MemoryCache,
        pub crypto: Arc<dyn CryptoProvider>,
        pub task: Option<CryptoTask>,
        pub version: RfbVersion,
        pub url: Option<String>,
        pub tight_vnc: bool,
    }

    impl Harness {
        pub fn new(credentials: Credentials) -> Self {
            let wire = MockTransport::new();
            let (tx, rx) = unbounded_channel();
            Self {
                sock: FramedTransport::new(Box::new(wire.clone())),
                wire,
                credentials,
                events: EventSink::new(tx),
                rx,
                cache: MemoryCache::new(),
                crypto: Arc::new(LocalCryptoProvider),
                task: None,
                version: RfbVersion::V3_8,
                url: Some("wss://mac.local/websockify".into()),
                tight_vnc: false,
            }
        }

        pub fn feed(&mut self, bytes: &[u8]) {
            self.sock.push_incoming(bytes).unwrap();
        }

        pub fn step(&mut self, auth: &mut dyn Authenticator) -> Result<AuthStep, RfbError> {
            let mut ctx = AuthContext {
                sock: &mut self.sock,
                credentials: &self.credentials,
                events: &self.events,
                cache: &mut self.cache,
                crypto: &self.crypto,
                task: &mut self.task,
                version: self.version,
                url: self.url.as_deref(),
                tight_vnc: &mut self.tight_vnc,
                ra2ne: None,
            };
            auth.step(&mut ctx)
        }

        /// Run the parked crypto task to completion and hand it back.
        pub fn finish_task(&mut self, auth: &mut dyn Authenticator) -> CryptoOutcome {
            let task = self.task.take().expect("no crypto task started");
            let outcome = futures::executor::block_on(task).unwrap();
            auth.crypto_complete(outcome.clone()).unwrap();
            outcome
        }

        pub fn events(&mut self) -> Vec<RfbEvent> {
            let mut out = Vec::new();
            while let Ok(ev) = self.rx.try_recv() {
                out.push(ev);
            }
            out
        }
    }
}
