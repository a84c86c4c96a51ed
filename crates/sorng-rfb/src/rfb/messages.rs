//! Client → server message builders.
//!
//! Builders push onto the send queue of a [`FramedTransport`]. Standard RFB
//! messages flush immediately; the ARD builders only queue so that an init
//! burst or a reconfiguration goes out as one write, and the caller flushes.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::constants::client_msg;
use super::errors::RfbError;
use super::framed::FramedTransport;

// ── Standard RFB ─────────────────────────────────────────────────────────

pub fn key_event(sock: &mut FramedTransport, keysym: u32, down: bool) {
    sock.sq_push8(client_msg::KEY_EVENT);
    sock.sq_push8(down as u8);
    sock.sq_push16(0);
    sock.sq_push32(keysym);
    sock.flush();
}

/// QEMU extended key event carrying an XT scancode. `0xE0`-prefixed codes
/// fold into the high bit.
pub fn qemu_extended_key_event(sock: &mut FramedTransport, keysym: u32, down: bool, keycode: u32) {
    let upper = keycode >> 8;
    let lower = keycode & 0xff;
    let rfb_keycode = if upper == 0xe0 && lower < 0x7f {
        lower | 0x80
    } else {
        keycode
    };
    sock.sq_push8(client_msg::QEMU);
    sock.sq_push8(0);
    sock.sq_push16(down as u16);
    sock.sq_push32(keysym);
    sock.sq_push32(rfb_keycode);
    sock.flush();
}

pub fn pointer_event(sock: &mut FramedTransport, x: u16, y: u16, mask: u16) {
    sock.sq_push8(client_msg::POINTER_EVENT);
    // The high bit marks the extended form, so it must stay clear here.
    sock.sq_push8((mask & 0x7f) as u8);
    sock.sq_push16(x);
    sock.sq_push16(y);
    sock.flush();
}

/// Pointer event with the two extra button bits of ExtendedMouseButtons.
pub fn extended_pointer_event(sock: &mut FramedTransport, x: u16, y: u16, mask: u16) -> Result<(), RfbError> {
    let higher = (mask >> 7) & 0xff;
    if higher & 0xfc != 0 {
        return Err(RfbError::Internal(format!("Invalid mouse button mask: {mask}")));
    }
    sock.sq_push8(client_msg::POINTER_EVENT);
    sock.sq_push8(((mask & 0x7f) | 0x80) as u8);
    sock.sq_push16(x);
    sock.sq_push16(y);
    sock.sq_push8(higher as u8);
    sock.flush();
    Ok(())
}

/// ClientCutText. Extended clipboard payloads carry a negated length.
pub fn client_cut_text(sock: &mut FramedTransport, data: &[u8], extended: bool) {
    sock.sq_push8(client_msg::CLIENT_CUT_TEXT);
    sock.sq_push8(0);
    sock.sq_push8(0);
    sock.sq_push8(0);
    let len = data.len() as u32;
    sock.sq_push32(if extended { len.wrapping_neg() } else { len });
    sock.sq_push_bytes(data);
    sock.flush();
}

pub fn set_desktop_size(sock: &mut FramedTransport, width: u16, height: u16, id: u32, flags: u32) {
    sock.sq_push8(client_msg::SET_DESKTOP_SIZE);
    sock.sq_push8(0);
    sock.sq_push16(width);
    sock.sq_push16(height);
    sock.sq_push8(1); // number of screens
    sock.sq_push8(0);
    sock.sq_push32(id);
    sock.sq_push16(0);
    sock.sq_push16(0);
    sock.sq_push16(width);
    sock.sq_push16(height);
    sock.sq_push32(flags);
    sock.flush();
}

pub fn client_fence(sock: &mut FramedTransport, flags: u32, payload: &[u8]) {
    sock.sq_push8(client_msg::CLIENT_FENCE);
    sock.sq_push8(0);
    sock.sq_push8(0);
    sock.sq_push8(0);
    sock.sq_push32(flags);
    sock.sq_push8(payload.len() as u8);
    sock.sq_push_bytes(payload);
    sock.flush();
}

pub fn enable_continuous_updates(sock: &mut FramedTransport, enable: bool, x: u16, y: u16, w: u16, h: u16) {
    sock.sq_push8(client_msg::ENABLE_CONTINUOUS_UPDATES);
    sock.sq_push8(enable as u8);
    sock.sq_push16(x);
    sock.sq_push16(y);
    sock.sq_push16(w);
    sock.sq_push16(h);
    sock.flush();
}

/// SetPixelFormat for a true-colour little-endian layout. Shifts default
/// to RGB byte order (`0, bits, 2 * bits`).
pub fn pixel_format(sock: &mut FramedTransport, depth: u8, shifts: Option<(u8, u8, u8)>) {
    let bpp = match depth {
        d if d > 16 => 32,
        d if d > 8 => 16,
        _ => 8,
    };
    let bits = depth / 3;
    let (rs, gs, bs) = shifts.unwrap_or((0, bits, bits * 2));
    let max = (1u16 << bits) - 1;

    sock.sq_push8(client_msg::SET_PIXEL_FORMAT);
    sock.sq_push8(0);
    sock.sq_push8(0);
    sock.sq_push8(0);
    sock.sq_push8(bpp);
    sock.sq_push8(depth);
    sock.sq_push8(0); // little-endian
    sock.sq_push8(1); // true colour
    sock.sq_push16(max);
    sock.sq_push16(max);
    sock.sq_push16(max);
    sock.sq_push8(rs);
    sock.sq_push8(gs);
    sock.sq_push8(bs);
    sock.sq_push8(0);
    sock.sq_push8(0);
    sock.sq_push8(0);
    sock.flush();
}

pub fn client_encodings(sock: &mut FramedTransport, encodings: &[i32]) {
    sock.sq_push8(client_msg::SET_ENCODINGS);
    sock.sq_push8(0);
    sock.sq_push16(encodings.len() as u16);
    for &enc in encodings {
        sock.sq_push32(enc as u32);
    }
    sock.flush();
}

pub fn fb_update_request(sock: &mut FramedTransport, incremental: bool, x: u16, y: u16, w: u16, h: u16) {
    sock.sq_push8(client_msg::FB_UPDATE_REQUEST);
    sock.sq_push8(incremental as u8);
    sock.sq_push16(x);
    sock.sq_push16(y);
    sock.sq_push16(w);
    sock.sq_push16(h);
    sock.flush();
}

pub fn xvp_op(sock: &mut FramedTransport, ver: u8, op: u8) {
    sock.sq_push8(client_msg::XVP);
    sock.sq_push8(0);
    sock.sq_push8(ver);
    sock.sq_push8(op);
    sock.flush();
}

// ── Extended clipboard ───────────────────────────────────────────────────

pub mod ext_clipboard {
    pub const FORMAT_TEXT: u32 = 1 << 0;
    pub const FORMAT_RTF: u32 = 1 << 1;
    pub const FORMAT_HTML: u32 = 1 << 2;
    pub const FORMAT_DIB: u32 = 1 << 3;
    pub const FORMAT_FILES: u32 = 1 << 4;

    pub const ACTION_CAPS: u32 = 1 << 24;
    pub const ACTION_REQUEST: u32 = 1 << 25;
    pub const ACTION_PEEK: u32 = 1 << 26;
    pub const ACTION_NOTIFY: u32 = 1 << 27;
    pub const ACTION_PROVIDE: u32 = 1 << 28;

    /// Largest inflated payload accepted per format.
    pub const MAX_TEXT_SIZE: u32 = 10 * 1024 * 1024;
}

fn ext_clipboard_flags(actions: u32, formats: u32) -> [u8; 4] {
    [(actions >> 24) as u8, 0, 0, formats as u8]
}

/// Provide text. Line endings are normalised to `\r\n` and a NUL
/// terminator appended before deflating.
pub fn extended_clipboard_provide(sock: &mut FramedTransport, text: &str) -> Result<(), RfbError> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n").replace('\n', "\r\n");
    let mut payload = normalized.into_bytes();
    payload.push(0);

    let mut raw = Vec::with_capacity(4 + payload.len());
    raw.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    raw.extend_from_slice(&payload);
    let deflated = deflate(&raw)?;

    let mut data = Vec::with_capacity(4 + deflated.len());
    data.extend_from_slice(&ext_clipboard_flags(ext_clipboard::ACTION_PROVIDE, ext_clipboard::FORMAT_TEXT));
    data.extend_from_slice(&deflated);
    client_cut_text(sock, &data, true);
    Ok(())
}

pub fn extended_clipboard_notify(sock: &mut FramedTransport, formats: u32) {
    client_cut_text(sock, &ext_clipboard_flags(ext_clipboard::ACTION_NOTIFY, formats), true);
}

pub fn extended_clipboard_request(sock: &mut FramedTransport, formats: u32) {
    client_cut_text(sock, &ext_clipboard_flags(ext_clipboard::ACTION_REQUEST, formats), true);
}

/// Announce our actions plus one max-size entry per supported format.
pub fn extended_clipboard_caps(sock: &mut FramedTransport, actions: u32, formats: &[(u32, u32)]) {
    let mut sorted = formats.to_vec();
    sorted.sort_by_key(|(bit, _)| *bit);
    let mut data = ext_clipboard_flags(actions, 0).to_vec();
    for (bit, size) in &sorted {
        data.extend_from_slice(&size.to_be_bytes());
        data[3] |= 1 << bit;
    }
    client_cut_text(sock, &data, true);
}

pub(crate) fn deflate(data: &[u8]) -> Result<Vec<u8>, RfbError> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

// ── ARD ──────────────────────────────────────────────────────────────────

/// EncryptedEvent (0x10) carrying one AES-ECB block.
pub fn ard_encrypted_event(sock: &mut FramedTransport, flags: u8, payload: &[u8; 16]) {
    sock.sq_push8(client_msg::ARD_ENCRYPTED_EVENT);
    sock.sq_push8(flags);
    sock.sq_push_bytes(payload);
    sock.flush();
}

pub fn ard_clipboard_request(sock: &mut FramedTransport, session_id: u32) {
    sock.sq_push8(client_msg::ARD_CLIPBOARD_REQUEST);
    sock.sq_push8(0); // plain text
    sock.sq_push16(0);
    sock.sq_push32(session_id);
    sock.flush();
}

pub fn ard_clipboard_send(sock: &mut FramedTransport, session_id: u32, uncompressed_size: u32, compressed: &[u8]) {
    sock.sq_push8(client_msg::ARD_CLIPBOARD_SEND);
    sock.sq_push8(0);
    sock.sq_push16(0);
    sock.sq_push32(session_id);
    sock.sq_push32(uncompressed_size);
    sock.sq_push32(compressed.len() as u32);
    sock.sq_push_bytes(compressed);
    sock.flush();
}

/// SetEncryption: command 1 requests AES-128, command 2 acknowledges.
pub fn ard_set_encryption(sock: &mut FramedTransport, command: u16) {
    sock.sq_push8(client_msg::ARD_SET_ENCRYPTION);
    sock.sq_push8(0);
    sock.sq_push16(command);
    sock.sq_push16(1); // level: all data
    if command == 1 {
        sock.sq_push16(1);
        sock.sq_push32(1); // AES-128
    } else {
        sock.sq_push16(0);
    }
    sock.flush();
}

pub fn ard_auto_pasteboard(sock: &mut FramedTransport, command: u16) {
    sock.sq_push8(client_msg::ARD_AUTO_PASTEBOARD);
    sock.sq_push8(0);
    sock.sq_push16(command);
    sock.sq_push32(0);
}

/// ViewerInfo (0x21): client identity and command-support bitmap.
pub fn ard_viewer_info(sock: &mut FramedTransport) {
    const COMMAND_SUPPORT: [u8; 12] = [0xb0, 0x00, 0x0c, 0x03, 0x90, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00];
    sock.sq_push8(client_msg::ARD_VIEWER_INFO);
    sock.sq_push8(0);
    sock.sq_push16(0x003e);
    sock.sq_push16(0x0001); // app class
    sock.sq_push32(2); // Screen Sharing
    for v in [6u32, 1, 0] {
        sock.sq_push32(v);
    }
    for v in [26u32, 2, 0] {
        sock.sq_push32(v);
    }
    sock.sq_push_bytes(&COMMAND_SUPPORT);
    sock.sq_push_bytes(&[0u8; 20]);
}

pub fn ard_set_mode(sock: &mut FramedTransport, mode: u8) {
    sock.sq_push8(client_msg::ARD_SET_MODE);
    sock.sq_push8(0);
    sock.sq_push8(0);
    sock.sq_push8(mode);
}

/// SessionVisibility: `visible = false` curtains the remote screen and
/// shows `message` (UTF-8); `visible = true` sends no text.
pub fn ard_session_visibility(sock: &mut FramedTransport, visible: bool, message: &str) {
    let msg: &[u8] = if visible { &[] } else { message.as_bytes() };
    sock.sq_push8(client_msg::ARD_SESSION_VISIBILITY);
    sock.sq_push8(0);
    sock.sq_push16(visible as u16);
    sock.sq_push16(msg.len() as u16);
    sock.sq_push_bytes(msg);
}

pub fn ard_set_display(sock: &mut FramedTransport, combine_all: bool, display_id: u32) {
    sock.sq_push8(client_msg::ARD_SET_DISPLAY);
    sock.sq_push8(combine_all as u8);
    sock.sq_push16(0);
    sock.sq_push32(display_id);
}

pub fn ard_set_server_scaling(sock: &mut FramedTransport, factor: f64) {
    sock.sq_push8(client_msg::ARD_SET_SERVER_SCALING);
    sock.sq_push8(0);
    sock.sq_push_bytes(&factor.to_be_bytes());
}

pub fn ard_auto_fb_update(sock: &mut FramedTransport, enabled: bool, x: u16, y: u16, w: u16, h: u16) {
    sock.sq_push8(client_msg::ARD_AUTO_FB_UPDATE);
    sock.sq_push8(0);
    sock.sq_push16(enabled as u16);
    sock.sq_push32(0); // interval: server default
    sock.sq_push16(x);
    sock.sq_push16(y);
    sock.sq_push16(w);
    sock.sq_push16(h);
}
