//! Wire constants: encodings, message types, security types.

/// Pixel and pseudo encodings (signed 32-bit on the wire).
pub mod encoding {
    pub const RAW: i32 = 0;
    pub const COPY_RECT: i32 = 1;
    pub const RRE: i32 = 2;
    pub const HEXTILE: i32 = 5;
    pub const ZLIB: i32 = 6;
    pub const ZRLE: i32 = 16;

    pub const ARD_HALFTONE: i32 = 1000;
    pub const ARD_GRAY16: i32 = 1001;
    pub const ARD_THOUSANDS: i32 = 1002;

    pub const ARD_CURSOR_POS: i32 = 1100;
    pub const ARD_DISPLAY_INFO: i32 = 1101;
    pub const ARD_USER_INFO: i32 = 1102;
    pub const ARD_SESSION_ENCRYPTION: i32 = 1103;
    pub const ARD_CURSOR_ALPHA: i32 = 1104;
    pub const ARD_DISPLAY_INFO2: i32 = 1105;

    pub const QUALITY_LEVEL_0: i32 = -32;
    pub const COMPRESS_LEVEL_0: i32 = -256;
    pub const DESKTOP_SIZE: i32 = -223;
    pub const LAST_RECT: i32 = -224;
    pub const CURSOR: i32 = -239;
    pub const QEMU_EXTENDED_KEY_EVENT: i32 = -258;
    pub const QEMU_LED_EVENT: i32 = -261;
    pub const DESKTOP_NAME: i32 = -307;
    pub const EXTENDED_DESKTOP_SIZE: i32 = -308;
    pub const XVP: i32 = -309;
    pub const FENCE: i32 = -312;
    pub const CONTINUOUS_UPDATES: i32 = -313;
    pub const EXTENDED_MOUSE_BUTTONS: i32 = -316;
    pub const VMWARE_CURSOR: i32 = 0x574d_5664;
    pub const EXTENDED_CLIPBOARD: i32 = 0xc0a1_e5ce_u32 as i32;

    pub fn name(enc: i32) -> String {
        match enc {
            RAW => "Raw".into(),
            COPY_RECT => "CopyRect".into(),
            RRE => "RRE".into(),
            HEXTILE => "Hextile".into(),
            ZLIB => "Zlib".into(),
            ZRLE => "ZRLE".into(),
            ARD_HALFTONE => "ArdHalftone".into(),
            ARD_GRAY16 => "ArdGray16".into(),
            ARD_THOUSANDS => "ArdThousands".into(),
            ARD_SESSION_ENCRYPTION => "ArdSessionEncryption".into(),
            other => format!("[unknown encoding {other}]"),
        }
    }
}

/// Client → server message types.
pub mod client_msg {
    pub const SET_PIXEL_FORMAT: u8 = 0;
    pub const SET_ENCODINGS: u8 = 2;
    pub const FB_UPDATE_REQUEST: u8 = 3;
    pub const KEY_EVENT: u8 = 4;
    pub const POINTER_EVENT: u8 = 5;
    pub const CLIENT_CUT_TEXT: u8 = 6;
    pub const ARD_SET_SERVER_SCALING: u8 = 0x08;
    pub const ARD_AUTO_FB_UPDATE: u8 = 0x09;
    pub const ARD_SET_MODE: u8 = 0x0a;
    pub const ARD_CLIPBOARD_REQUEST: u8 = 0x0b;
    pub const ARD_SESSION_VISIBILITY: u8 = 0x0c;
    pub const ARD_SET_DISPLAY: u8 = 0x0d;
    pub const ARD_ENCRYPTED_EVENT: u8 = 0x10;
    pub const ARD_SET_ENCRYPTION: u8 = 0x12;
    pub const ARD_AUTO_PASTEBOARD: u8 = 0x15;
    pub const ARD_CLIPBOARD_SEND: u8 = 0x1f;
    pub const ARD_VIEWER_INFO: u8 = 0x21;
    pub const ENABLE_CONTINUOUS_UPDATES: u8 = 150;
    pub const CLIENT_FENCE: u8 = 248;
    pub const XVP: u8 = 250;
    pub const SET_DESKTOP_SIZE: u8 = 251;
    pub const QEMU: u8 = 255;
}

/// Server → client message types.
pub mod server_msg {
    pub const FRAMEBUFFER_UPDATE: u8 = 0;
    pub const SET_COLOUR_MAP_ENTRIES: u8 = 1;
    pub const BELL: u8 = 2;
    pub const SERVER_CUT_TEXT: u8 = 3;
    pub const ARD_STATE_CHANGE: u8 = 0x14;
    pub const ARD_CLIPBOARD_SEND: u8 = 0x1f;
    /// `'R'`: first byte of an in-band `"RFB 003.889\n"` re-handshake.
    pub const ARD_REHANDSHAKE: u8 = 0x52;
    pub const END_OF_CONTINUOUS_UPDATES: u8 = 150;
    pub const SERVER_FENCE: u8 = 248;
    pub const XVP: u8 = 250;
}

/// Security type codes.
pub mod security {
    pub const INVALID: u32 = 0;
    pub const NONE: u32 = 1;
    pub const VNC_AUTH: u32 = 2;
    pub const RA2NE: u32 = 6;
    pub const TIGHT: u32 = 16;
    pub const VENCRYPT: u32 = 19;
    pub const XVP: u32 = 22;
    pub const ARD: u32 = 30;
    pub const RSA_TUNNEL: u32 = 33;
    pub const MS_LOGON_II: u32 = 113;
    pub const TIGHT_UNIX_LOGON: u32 = 129;
    pub const PLAIN: u32 = 256;
}

/// `"RSA1"` little-endian, the RSA-tunnel sub-protocol magic.
pub const RSA_TUNNEL_MAGIC: u32 = 0x3141_5352;

/// Version line sent to ARD servers and echoed on re-handshake.
pub const ARD_VERSION_LINE: &[u8; 12] = b"RFB 003.889\n";
