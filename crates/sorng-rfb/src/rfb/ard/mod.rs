//! Apple Remote Desktop extension.
//!
//! Parsers for the ARD pseudo-encodings and server messages live in the
//! submodules; `handlers` wires them into the engine. [`ArdState`] holds
//! everything the extension tracks for one connection.

pub mod cursor;
pub mod display_info;
mod handlers;
pub mod pasteboard;
pub mod session_select;
pub mod user_info;

use std::time::Instant;

use sorng_rfb_crypto::Aes128;

use super::config::{ArdControlMode, QualityPreset};
use super::constants::encoding;
use super::errors::RfbError;
use super::types::ArdDisplay;
use cursor::{ActiveCursor, CursorCache};

/// Outcome of reading a variable-length ARD payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    /// More bytes are needed; nothing was consumed.
    Incomplete,
    /// Consumed and deliberately discarded.
    Ignored,
    Complete(T),
}

/// StateChange (0x14) status codes.
pub mod state_code {
    pub const LOCAL_USER_CLOSED: u16 = 1;
    pub const PASTEBOARD_CHANGED: u16 = 2;
    pub const PASTEBOARD_DATA_NEEDED: u16 = 3;
    pub const TICKLE: u16 = 4;
    pub const DISPLAY_SLEEP: u16 = 5;
    pub const DISPLAY_WAKE: u16 = 6;
    pub const CURSOR_HIDDEN: u16 = 11;
    pub const CURSOR_VISIBLE: u16 = 12;
}

/// SetEncryption commands.
pub const ENCRYPTION_REQUEST: u16 = 1;
pub const ENCRYPTION_ACKNOWLEDGE: u16 = 2;

/// Inbound pasteboards larger than this are dropped.
pub const MAX_CLIPBOARD_SIZE: u32 = 10 * 1024 * 1024;

const CURTAIN_PREFIX: &str = "curtain\r\r";

/// Encoding list for a quality preset, followed by the ARD pseudo-encodings.
pub fn preset_encodings(preset: QualityPreset) -> Vec<i32> {
    let mut encs = match preset {
        QualityPreset::Halftone => vec![encoding::ARD_HALFTONE, encoding::ZRLE, encoding::ZLIB],
        QualityPreset::Gray => vec![encoding::ARD_GRAY16, encoding::ZRLE, encoding::ZLIB],
        QualityPreset::Thousands => vec![encoding::ARD_THOUSANDS, encoding::ZRLE, encoding::ZLIB],
        QualityPreset::Millions => vec![encoding::ZRLE, encoding::ZLIB],
    };
    encs.extend_from_slice(&[
        encoding::CURSOR,
        encoding::ARD_CURSOR_ALPHA,
        encoding::ARD_CURSOR_POS,
        encoding::DESKTOP_SIZE,
        encoding::ARD_DISPLAY_INFO,
        encoding::ARD_DISPLAY_INFO2,
        encoding::ARD_SESSION_ENCRYPTION,
        encoding::ARD_USER_INFO,
    ]);
    encs
}

/// Cleartext block of an encrypted key event.
pub fn key_event_block(keysym: u32, down: bool, timestamp_us: u32) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = 0xff;
    block[1] = u8::from(down);
    block[2..6].copy_from_slice(&keysym.to_be_bytes());
    block[6..10].copy_from_slice(&timestamp_us.to_be_bytes());
    block
}

/// Encrypt a key event block under the DH key.
pub fn encrypt_key_event(dh_key: &[u8; 16], keysym: u32, down: bool, timestamp_us: u32) -> Result<[u8; 16], RfbError> {
    let ct = Aes128::new(dh_key).encrypt_ecb(&key_event_block(keysym, down, timestamp_us))?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&ct);
    Ok(out)
}

/// SessionVisibility payload for engaging the curtain.
pub fn curtain_payload(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!("{CURTAIN_PREFIX}{message}")
    }
}

/// Fields parsed from the 22-byte binary prefix of an ARD desktop name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInitFlags {
    pub session_flags: u32,
    pub access_rights: u32,
}

impl ServerInitFlags {
    pub fn session_select_needed(&self) -> bool {
        self.session_flags & 0x04 != 0
    }

    /// Observe right granted and control not blocked.
    pub fn can_control(&self) -> bool {
        self.access_rights & 0x02 != 0 && self.access_rights & 0x100 == 0
    }

    pub fn power_management(&self) -> bool {
        self.access_rights & 0x80 != 0
    }
}

/// Split an ARD ServerInit name into its flag prefix and the readable
/// name that follows the last NUL.
pub fn split_server_name(raw: &[u8]) -> (Option<ServerInitFlags>, &[u8]) {
    if raw.len() < 22 || raw[0] != 0 {
        return (None, raw);
    }
    let flags = ServerInitFlags {
        session_flags: u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]),
        access_rights: u32::from_be_bytes([raw[6], raw[7], raw[8], raw[9]]),
    };
    let caps: Vec<String> = raw[6..22].iter().map(|b| format!("{b:02x}")).collect();
    log::info!(
        "ARD ServerInit: sessionFlags=0x{:08x} accessRights=0x{:08x} canControl={} power={} capabilityBitmap=[{}]",
        flags.session_flags,
        flags.access_rights,
        flags.can_control(),
        flags.power_management(),
        caps.join(" ")
    );
    let start = raw.iter().rposition(|&b| b == 0).map_or(0, |i| i + 1);
    (Some(flags), &raw[start..])
}

// ── Session state ────────────────────────────────────────────────────────

/// Per-connection ARD state. Created when the server announces 003.889.
#[derive(Debug)]
pub struct ArdState {
    pub enabled: bool,
    pub server_flags: Option<ServerInitFlags>,
    pub quality_preset: QualityPreset,
    pub control_mode: ArdControlMode,

    // Encryption
    pub dh_key: Option<[u8; 16]>,
    pub session_key: Option<([u8; 16], [u8; 16])>,
    pub pending_encryption: bool,
    pub encryption_enabled: bool,

    // Console and curtain
    pub curtain_active: bool,
    pub curtain_message: String,
    pub console_active: bool,
    pub username: String,
    pub avatar: Option<Vec<u8>>,

    // Displays
    pub displays: Vec<ArdDisplay>,
    pub combine_all: bool,
    pub selected_display: u32,
    pub first_display_info: bool,
    pub phase3_pending: bool,
    pub last_scaled: (u16, u16),
    pub last_display_count: u16,
    pub full_update_retry: Option<(u16, u16)>,

    // Cursors
    pub cursors: CursorCache,
    pub active_cursor: ActiveCursor,
    /// `Some(false)` until the first cursor arrives, `None` once the
    /// one-shot encoding resend has been spent.
    pub got_cursor: Option<bool>,

    // Clipboard
    pub clipboard_sync: bool,
    pub clipboard_session_id: u32,
    pub last_clipboard_sent: Option<String>,
    pub last_clipboard_received: Option<String>,
    pub manual_clipboard_request: bool,
    pub last_clipboard_request: Option<Instant>,

    // Freeze watchdog
    pub last_fbu: Option<Instant>,
    pub tickles: u32,
}

impl Default for ArdState {
    fn default() -> Self {
        Self {
            enabled: false,
            server_flags: None,
            quality_preset: QualityPreset::default(),
            control_mode: ArdControlMode::default(),
            dh_key: None,
            session_key: None,
            pending_encryption: false,
            encryption_enabled: false,
            curtain_active: false,
            curtain_message: String::new(),
            console_active: false,
            username: String::new(),
            avatar: None,
            displays: Vec::new(),
            combine_all: true,
            selected_display: 0,
            first_display_info: true,
            phase3_pending: false,
            last_scaled: (0, 0),
            last_display_count: 0,
            full_update_retry: None,
            cursors: CursorCache::new(),
            active_cursor: ActiveCursor::default(),
            got_cursor: None,
            clipboard_sync: true,
            clipboard_session_id: 0,
            last_clipboard_sent: None,
            last_clipboard_received: None,
            manual_clipboard_request: false,
            last_clipboard_request: None,
            last_fbu: None,
            tickles: 0,
        }
    }
}

impl ArdState {
    pub fn new(quality_preset: QualityPreset) -> Self {
        Self {
            quality_preset,
            ..Self::default()
        }
    }

    /// Session-level state cleared when the connection goes down.
    pub fn reset_session(&mut self) {
        self.control_mode = ArdControlMode::Control;
        self.curtain_active = false;
        self.console_active = false;
        self.username.clear();
        self.avatar = None;
    }

    /// Everything negotiated after Security, dropped on re-handshake.
    pub fn reset_encryption(&mut self) {
        self.dh_key = None;
        self.session_key = None;
        self.pending_encryption = false;
        self.encryption_enabled = false;
        self.first_display_info = true;
        self.phase3_pending = false;
        self.displays.clear();
    }

    /// Key events go through EncryptedEvent until the stream itself is
    /// encrypted.
    pub fn encrypts_key_events(&self) -> bool {
        self.enabled && self.dh_key.is_some() && !self.encryption_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_lists() {
        let t = preset_encodings(QualityPreset::Thousands);
        assert_eq!(&t[..3], &[1002, 16, 6]);
        assert_eq!(&t[3..], &[-239, 1104, 1100, -223, 1101, 1105, 1103, 1102]);
        let m = preset_encodings(QualityPreset::Millions);
        assert_eq!(&m[..2], &[16, 6]);
        assert_eq!(preset_encodings(QualityPreset::Halftone)[0], 1000);
        assert_eq!(preset_encodings(QualityPreset::Gray)[0], 1001);
    }

    #[test]
    fn key_block_layout() {
        let b = key_event_block(0xff0d, true, 0x0102_0304);
        assert_eq!(b, [0xff, 1, 0, 0, 0xff, 0x0d, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn encrypted_key_event_decrypts() {
        let key = [7u8; 16];
        let ct = encrypt_key_event(&key, 0x61, false, 99).unwrap();
        let pt = Aes128::new(&key).decrypt_ecb(&ct).unwrap();
        assert_eq!(pt, key_event_block(0x61, false, 99).to_vec());
    }

    #[test]
    fn curtain_payloads() {
        assert_eq!(curtain_payload(""), "");
        assert_eq!(curtain_payload("Back soon"), "curtain\r\rBack soon");
    }

    #[test]
    fn server_name_prefix() {
        let mut raw = vec![0u8, 0, 0, 0, 0, 0x04, 0, 0, 0x00, 0x82];
        raw.extend([0u8; 12]);
        raw.extend(b"Studio Mac");
        let (flags, name) = split_server_name(&raw);
        let flags = flags.unwrap();
        assert!(flags.session_select_needed());
        assert!(flags.can_control());
        assert!(flags.power_management());
        assert_eq!(name, b"Studio Mac");

        let (flags, name) = split_server_name(b"plain name");
        assert!(flags.is_none());
        assert_eq!(name, b"plain name");
    }

    #[test]
    fn control_blocked_bit() {
        let f = ServerInitFlags {
            session_flags: 0,
            access_rights: 0x102,
        };
        assert!(!f.can_control());
    }

    #[test]
    fn reset_clears_console_state() {
        let mut s = ArdState::new(QualityPreset::Gray);
        s.control_mode = ArdControlMode::Observe;
        s.curtain_active = true;
        s.username = "alice".into();
        s.avatar = Some(vec![1]);
        s.reset_session();
        assert_eq!(s.control_mode, ArdControlMode::Control);
        assert!(!s.curtain_active);
        assert!(s.username.is_empty());
        assert!(s.avatar.is_none());
        assert_eq!(s.quality_preset, QualityPreset::Gray);
    }
}
