//! ServerCutText, the extended clipboard protocol and outbound paste.
//!
//! ARD pasteboards travel over their own messages; see `ard::handlers`.
//! Both paths end in [`RfbEngine::write_clipboard`].

use flate2::Decompress;

use super::decoders::inflate_stream;
use super::engine::RfbEngine;
use super::errors::RfbError;
use super::messages::{self, ext_clipboard};
use super::types::{ConnectionState, RfbEvent};

const FORMAT_BITS: std::ops::RangeInclusive<u32> = 0..=15;

/// Actions we answer a server Caps with.
const CLIENT_ACTIONS: u32 = ext_clipboard::ACTION_CAPS
    | ext_clipboard::ACTION_REQUEST
    | ext_clipboard::ACTION_PEEK
    | ext_clipboard::ACTION_NOTIFY
    | ext_clipboard::ACTION_PROVIDE;

/// ISO 8859-1 bytes for a standard ClientCutText.
fn latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Split an inflated Provide stream into `[u32 size][data]` chunks, one
/// per set format bit, and return the text chunk.
fn provided_text(formats: u32, data: &[u8]) -> Result<Option<Vec<u8>>, RfbError> {
    let mut off = 0;
    let mut text = None;
    for bit in FORMAT_BITS {
        let format = 1 << bit;
        if formats & format == 0 {
            continue;
        }
        let Some(size) = data.get(off..off + 4) else {
            return Err(RfbError::decoding("extended clipboard provide truncated"));
        };
        let size = u32::from_be_bytes([size[0], size[1], size[2], size[3]]) as usize;
        off += 4;
        let Some(chunk) = data.get(off..off + size) else {
            return Err(RfbError::decoding(format!("extended clipboard chunk of {size} bytes truncated")));
        };
        off += size;
        if format == ext_clipboard::FORMAT_TEXT {
            text = Some(chunk.to_vec());
        }
    }
    Ok(text)
}

impl RfbEngine {
    pub(crate) fn handle_server_cut_text(&mut self) -> Result<bool, RfbError> {
        log::debug!("ServerCutText");
        if self.sock.rq_wait("ServerCutText header", 7, 1)? {
            return Ok(false);
        }
        self.sock.skip(3);
        let length = self.sock.shift32() as i32;
        let size = length.unsigned_abs() as usize;
        if self.sock.rq_wait("ServerCutText content", size, 8)? {
            return Ok(false);
        }

        if length >= 0 {
            let text = self.sock.shift_str(size);
            if !self.view_only {
                self.write_clipboard(&text);
            }
            return Ok(true);
        }

        if size < 4 {
            self.sock.skip(size);
            return Err(RfbError::protocol(format!("Extended clipboard message too short ({size} bytes)")));
        }
        let payload = self.sock.shift_vec(size);
        self.handle_extended_clipboard(&payload)?;
        Ok(true)
    }

    fn handle_extended_clipboard(&mut self, payload: &[u8]) -> Result<(), RfbError> {
        let flags = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let body = &payload[4..];
        let formats = flags & 0x0000_ffff;
        let actions = flags & 0xff00_0000;

        if actions & ext_clipboard::ACTION_CAPS != 0 {
            self.clipboard_caps.enabled = true;
            self.clipboard_caps.formats = formats;
            self.clipboard_caps.actions = actions;
            let announced = FORMAT_BITS.filter(|bit| formats & (1 << bit) != 0).count();
            if body.len() < announced * 4 {
                log::warn!("Extended clipboard caps carry {} size bytes for {announced} formats", body.len());
            }
            log::debug!("Extended clipboard caps: formats=0x{formats:04x} actions=0x{actions:08x}");
            messages::extended_clipboard_caps(&mut self.sock, CLIENT_ACTIONS, &[(0, 0)]);
            return Ok(());
        }

        match actions {
            ext_clipboard::ACTION_REQUEST => {
                if self.view_only {
                    return Ok(());
                }
                if let Some(text) = self.clipboard_text.clone() {
                    if self.server_has_action(ext_clipboard::ACTION_PROVIDE) && formats & ext_clipboard::FORMAT_TEXT != 0 {
                        messages::extended_clipboard_provide(&mut self.sock, &text)?;
                    }
                }
            }
            ext_clipboard::ACTION_PEEK => {
                if self.view_only {
                    return Ok(());
                }
                if self.server_has_action(ext_clipboard::ACTION_NOTIFY) {
                    let offered = if self.clipboard_text.is_some() {
                        ext_clipboard::FORMAT_TEXT
                    } else {
                        0
                    };
                    messages::extended_clipboard_notify(&mut self.sock, offered);
                }
            }
            ext_clipboard::ACTION_NOTIFY => {
                if self.view_only {
                    return Ok(());
                }
                if self.server_has_action(ext_clipboard::ACTION_REQUEST) && formats & ext_clipboard::FORMAT_TEXT != 0 {
                    messages::extended_clipboard_request(&mut self.sock, ext_clipboard::FORMAT_TEXT);
                }
            }
            ext_clipboard::ACTION_PROVIDE => {
                if self.view_only || formats & ext_clipboard::FORMAT_TEXT == 0 {
                    return Ok(());
                }
                // Whatever we offered earlier is superseded.
                self.clipboard_text = None;

                let chunks = FORMAT_BITS.filter(|bit| formats & (1 << bit) != 0).count();
                let limit = chunks * (4 + ext_clipboard::MAX_TEXT_SIZE as usize);
                let mut z = Decompress::new(true);
                let data = inflate_stream(&mut z, body, body.len() * 4, limit)?;
                if let Some(raw) = provided_text(formats, &data)? {
                    let mut text = String::from_utf8_lossy(&raw).into_owned();
                    if text.ends_with('\0') {
                        text.pop();
                    }
                    let text = text.replace("\r\n", "\n");
                    self.write_clipboard(&text);
                }
            }
            other => {
                return Err(RfbError::protocol(format!(
                    "Unexpected action in extended clipboard message: {other}"
                )));
            }
        }
        Ok(())
    }

    fn server_has_action(&self, action: u32) -> bool {
        self.clipboard_caps.actions & action != 0
    }

    /// Hand remote clipboard text to the local side, falling back to a
    /// `Clipboard` event when the collaborator does not take it.
    pub(crate) fn write_clipboard(&mut self, text: &str) {
        if self.view_only {
            return;
        }
        if !self.clipboard.write_text(text) {
            self.events.emit(RfbEvent::Clipboard { text: text.to_string() });
        }
    }

    // ── Local → remote ───────────────────────────────────────────────────

    /// Offer local clipboard text to the server. Repeats of the last text
    /// are dropped.
    pub fn clipboard_paste_from(&mut self, text: &str) {
        if self.state != ConnectionState::Connected || self.view_only {
            return;
        }
        if self.ard.enabled && !self.ard.clipboard_sync {
            return;
        }
        if self.ard.last_clipboard_sent.as_deref() == Some(text) {
            return;
        }
        self.ard.last_clipboard_sent = Some(text.to_string());

        if self.ard.enabled {
            self.send_ard_clipboard(text);
            return;
        }

        let caps = &self.clipboard_caps;
        if caps.formats & ext_clipboard::FORMAT_TEXT != 0 && caps.actions & ext_clipboard::ACTION_NOTIFY != 0 {
            self.clipboard_text = Some(text.to_string());
            messages::extended_clipboard_notify(&mut self.sock, ext_clipboard::FORMAT_TEXT);
        } else {
            messages::client_cut_text(&mut self.sock, &latin1(text), false);
        }
    }

    /// Send `text` even if it matches the last paste or ARD auto-sync is
    /// off.
    pub fn force_clipboard_paste(&mut self, text: &str) {
        if self.state != ConnectionState::Connected || self.view_only {
            return;
        }
        self.ard.last_clipboard_sent = None;
        if self.ard.enabled {
            self.send_ard_clipboard(text);
            return;
        }
        self.clipboard_paste_from(text);
    }
}
