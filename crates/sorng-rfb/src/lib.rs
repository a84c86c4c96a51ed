//! # sorng-rfb
//!
//! RFB (VNC) client engine for SortOfRemoteNG.
//!
//! Implements the RFB 3.3–3.8 handshake with the common security schemes
//! (None, VNC, ARD Diffie-Hellman, delegated RA2ne, RSA-AES tunnel, MS-Logon II,
//! VeNCrypt plain, TightVNC, XVP), the standard and ARD framebuffer
//! encodings, the extended clipboard, and Apple Remote Desktop session
//! control: curtain mode, display selection, pasteboard sync and AES
//! stream encryption.

pub mod rfb;

pub use rfb::collab::{
    Clipboard, Display, EventClipboard, EventSink, KeyValueCache, MemoryCache, Timer, TimerId, Transport,
};
pub use rfb::config::{ArdControlMode, Credentials, EngineConfig, QualityPreset, SessionConfig};
pub use rfb::engine::{EngineDeps, RfbEngine};
pub use rfb::errors::RfbError;
pub use rfb::framebuffer::{Framebuffer, SharedFramebuffer};
pub use rfb::security::{CryptoOutcome, CryptoProvider, CryptoTask, LocalCryptoProvider, Ra2neDelegate};
pub use rfb::session_runner::{launch_session, SessionCommand, SessionHandle};
pub use rfb::types::{ArdDisplay, ConnectionState, Cursor, InitPhase, Rect, RfbEvent, RfbVersion};
