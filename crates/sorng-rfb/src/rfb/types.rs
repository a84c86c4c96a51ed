//! Core data types shared across the engine.

use serde::{Deserialize, Serialize};

// ── Connection state ─────────────────────────────────────────────────────

/// Top-level connection state.
///
/// Legal transitions: `Unstarted → Connecting → Connected`,
/// `Connecting | Connected → Disconnecting → Disconnected`.
/// `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unstarted,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake sub-phase while `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    ProtocolVersion,
    Security,
    Authentication,
    SecurityResult,
    SecurityReason,
    ClientInit,
    ServerInit,
    SessionSelectInfo,
    SessionSelectResult,
}

/// Negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RfbVersion {
    V3_3,
    V3_7,
    V3_8,
}

impl RfbVersion {
    /// Parse the `ddd.ddd` part of a server version line.
    ///
    /// Returns `None` for the repeater marker and for unknown versions;
    /// callers distinguish those themselves.
    pub fn from_server(ver: &str) -> Option<Self> {
        match ver {
            "003.003" | "003.006" => Some(Self::V3_3),
            "003.007" => Some(Self::V3_7),
            "003.008" | "003.889" | "004.000" | "004.001" | "005.000" => Some(Self::V3_8),
            _ => None,
        }
    }

    pub fn client_line(&self) -> &'static [u8; 12] {
        match self {
            Self::V3_3 => b"RFB 003.003\n",
            Self::V3_7 => b"RFB 003.007\n",
            Self::V3_8 => b"RFB 003.008\n",
        }
    }
}

impl std::fmt::Display for RfbVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V3_3 => f.write_str("3.3"),
            Self::V3_7 => f.write_str("3.7"),
            Self::V3_8 => f.write_str("3.8"),
        }
    }
}

// ── Rectangles and cursors ───────────────────────────────────────────────

/// Header of one FramebufferUpdate rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// An RGBA cursor image with hotspot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cursor {
    pub rgba: Vec<u8>,
    pub hot_x: u16,
    pub hot_y: u16,
    pub width: u16,
    pub height: u16,
}

impl Cursor {
    /// A fully transparent 1×1 cursor, used to hide the pointer.
    pub fn hidden() -> Self {
        Self {
            rgba: vec![0, 0, 0, 0],
            hot_x: 0,
            hot_y: 0,
            width: 1,
            height: 1,
        }
    }
}

// ── ARD data ─────────────────────────────────────────────────────────────

/// One physical display reported by DisplayInfo / DisplayInfo2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArdDisplay {
    pub id: u32,
    /// Logical size in points.
    pub width: u32,
    pub height: u32,
    /// Physical backing size in pixels.
    pub backing_width: u32,
    pub backing_height: u32,
    pub backing_scale: f64,
    pub display_scale: f64,
    pub left: i32,
    pub top: i32,
    pub primary: bool,
}

impl ArdDisplay {
    pub fn simple(id: u32, width: u32, height: u32) -> Self {
        Self {
            id,
            width,
            height,
            backing_width: width,
            backing_height: height,
            backing_scale: 1.0,
            display_scale: 1.0,
            left: 0,
            top: 0,
            primary: false,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────

/// Notifications emitted by the engine to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum RfbEvent {
    Connect,
    Disconnect { clean: bool },
    /// Credentials needed to continue; `types` names the missing fields.
    CredentialsRequired { types: Vec<String> },
    /// The encapsulated authenticator wants the server identity approved.
    ServerVerification { kind: String, public_key: Vec<u8> },
    SecurityFailure { status: u32, reason: Option<String> },
    DesktopName { name: String },
    Capabilities { power: bool },
    Bell,
    Clipboard { text: String },
    ArdDisplayList { displays: Vec<ArdDisplay> },
    ArdCurtainChange { active: bool },
    ArdConsoleState { active: bool },
    ArdUserInfo { username: String, has_avatar: bool },
}
