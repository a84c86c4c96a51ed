//! Engine and session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Timing constants ─────────────────────────────────────────────────────

/// SecurityResult must arrive within this window.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Hard deadline for transport teardown once `disconnecting` is entered.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// ARD freeze watchdog period.
pub const FREEZE_WATCHDOG_PERIOD: Duration = Duration::from_secs(5);
/// Update age past which the freeze watchdog logs a stall.
pub const FREEZE_STALL_THRESHOLD: Duration = Duration::from_secs(5);
/// Delay before the ARD init tail / full-update request is sent again.
pub const ARD_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Minimum spacing between remote resize requests.
pub const RESIZE_RATE_LIMIT: Duration = Duration::from_millis(100);
/// Minimum spacing between ARD pasteboard requests triggered by the server.
pub const ARD_CLIPBOARD_REQUEST_THROTTLE: Duration = Duration::from_millis(500);

// ── Session driver constants ─────────────────────────────────────────────

pub const DEFAULT_PORT: u16 = 5900;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

// ── Enums ────────────────────────────────────────────────────────────────

/// ARD image quality preset, selecting the pixel encoding family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    /// 1-bit halftone (1000).
    Halftone,
    /// 4-bit grayscale (1001).
    Gray,
    /// 16-bit RGB555 (1002).
    #[default]
    Thousands,
    /// Full colour via ZRLE/Zlib.
    Millions,
}

impl QualityPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Halftone => "halftone",
            Self::Gray => "gray",
            Self::Thousands => "thousands",
            Self::Millions => "millions",
        }
    }
}

/// ARD control mode as carried by SetMode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArdControlMode {
    Observe,
    #[default]
    Control,
    Exclusive,
}

impl ArdControlMode {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Observe => 0,
            Self::Control => 1,
            Self::Exclusive => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Observe),
            1 => Some(Self::Control),
            2 => Some(Self::Exclusive),
            _ => None,
        }
    }
}

// ── Credentials ──────────────────────────────────────────────────────────

/// Credentials supplied by the caller, possibly after a
/// `CredentialsRequired` event.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// XVP target host name.
    pub target: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("target", &self.target)
            .finish()
    }
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }

    pub fn user_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            target: None,
        }
    }

    /// Merge newly supplied fields over the existing ones.
    pub fn merge(&mut self, other: Credentials) {
        if other.username.is_some() {
            self.username = other.username;
        }
        if other.password.is_some() {
            self.password = other.password;
        }
        if other.target.is_some() {
            self.target = other.target;
        }
    }
}

// ── Engine configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Ask for a shared session in ClientInit.
    pub shared: bool,
    /// UltraVNC repeater id, sent when the server answers 000.000.
    pub repeater_id: String,
    pub view_only: bool,
    /// JPEG quality level 0-9 (pseudo-encoding -32 + q).
    pub quality_level: u8,
    /// Compression level 0-9 (pseudo-encoding -256 + c).
    pub compression_level: u8,
    pub ard_quality_preset: QualityPreset,
    /// Ask the server to follow the local viewport size.
    pub resize_session: bool,
    /// Endpoint identity used as the RSA-tunnel key-cache key.
    pub url: Option<String>,
    pub credentials: Credentials,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shared: true,
            repeater_id: String::new(),
            view_only: false,
            quality_level: 6,
            compression_level: 2,
            ard_quality_preset: QualityPreset::default(),
            resize_session: false,
            url: None,
            credentials: Credentials::default(),
        }
    }
}

/// Configuration for the tokio session driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub engine: EngineConfig,
    pub auto_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            engine: EngineConfig::default(),
            auto_reconnect: true,
        }
    }
}

impl SessionConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults() {
        let c = EngineConfig::default();
        assert!(c.shared);
        assert_eq!(c.quality_level, 6);
        assert_eq!(c.compression_level, 2);
        assert_eq!(c.ard_quality_preset, QualityPreset::Thousands);
    }

    #[test]
    fn deserialize_partial_json() {
        let c: EngineConfig =
            serde_json::from_str(r#"{"viewOnly":true,"ardQualityPreset":"millions"}"#).unwrap();
        assert!(c.view_only);
        assert!(c.shared);
        assert_eq!(c.ard_quality_preset, QualityPreset::Millions);
    }

    #[test]
    fn session_defaults_and_address() {
        let s = SessionConfig {
            host: "mac.local".into(),
            ..SessionConfig::default()
        };
        assert_eq!(s.address(), "mac.local:5900");
        assert!(s.auto_reconnect);
    }

    #[test]
    fn credentials_merge_keeps_existing() {
        let mut c = Credentials::user_password("alice", "old");
        c.merge(Credentials::password("new"));
        assert_eq!(c.username.as_deref(), Some("alice"));
        assert_eq!(c.password.as_deref(), Some("new"));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let c = Credentials::password("hunter2");
        assert!(!format!("{c:?}").contains("hunter2"));
    }

    #[test]
    fn control_mode_bytes() {
        for b in 0..3u8 {
            assert_eq!(ArdControlMode::from_byte(b).unwrap().to_byte(), b);
        }
        assert!(ArdControlMode::from_byte(3).is_none());
    }
}
