//! Steady-state server message handling.
//!
//! Every handler returns `Ok(false)` when the receive queue runs dry in the
//! middle of a message. Whatever was consumed up to that point is either
//! rewound with `rq_wait`'s go-back or remembered in [`super::engine::FbuState`],
//! so the same call can be repeated when more bytes arrive.

use super::constants::{encoding, server_msg};
use super::cursor::{decode_rich_cursor, decode_vmware_cursor};
use super::engine::RfbEngine;
use super::errors::RfbError;
use super::handshake::decode_name;
use super::messages;
use super::types::{Cursor, Rect, RfbEvent};

const MAX_FENCE_PAYLOAD: usize = 64;

const FENCE_BLOCK_BEFORE: u32 = 1 << 0;
const FENCE_BLOCK_AFTER: u32 = 1 << 1;
const FENCE_REQUEST: u32 = 1 << 31;

impl RfbEngine {
    pub(crate) fn normal_msg(&mut self) -> Result<bool, RfbError> {
        let msg_type = if self.fbu.rects > 0 {
            server_msg::FRAMEBUFFER_UPDATE
        } else {
            if self.sock.rq_wait("message type", 1, 0)? {
                return Ok(false);
            }
            self.sock.shift8()
        };

        match msg_type {
            server_msg::FRAMEBUFFER_UPDATE => {
                let done = self.framebuffer_update()?;
                if done && !self.ext.continuous_updates_enabled {
                    self.request_next_update();
                }
                Ok(done)
            }
            server_msg::SET_COLOUR_MAP_ENTRIES => Err(RfbError::protocol("Unexpected SetColorMapEntries message")),
            server_msg::BELL => {
                log::debug!("Bell");
                self.events.emit(RfbEvent::Bell);
                Ok(true)
            }
            server_msg::SERVER_CUT_TEXT => self.handle_server_cut_text(),
            server_msg::END_OF_CONTINUOUS_UPDATES => {
                let first = !self.ext.continuous_updates;
                self.ext.continuous_updates = true;
                self.ext.continuous_updates_enabled = false;
                if first {
                    self.ext.continuous_updates_enabled = true;
                    self.update_continuous_updates();
                    log::info!("Enabling continuous updates.");
                }
                Ok(true)
            }
            server_msg::SERVER_FENCE => self.handle_server_fence(),
            server_msg::XVP => self.handle_xvp(),
            server_msg::ARD_STATE_CHANGE if self.ard.enabled => self.handle_ard_state_change(),
            server_msg::ARD_CLIPBOARD_SEND if self.ard.enabled => self.handle_ard_clipboard_send(),
            server_msg::ARD_REHANDSHAKE if self.ard.enabled => self.handle_ard_rehandshake(),
            other => Err(RfbError::protocol(format!("Unexpected server message (type {other})"))),
        }
    }

    /// Follow-up request once an update has been fully drawn.
    fn request_next_update(&mut self) {
        let (w, h) = (self.fb_width, self.fb_height);
        if self.ard.enabled && self.ard.got_cursor == Some(false) {
            log::info!("ARD: first FBU had no cursor, re-sending SetEncodings");
            self.ard.got_cursor = None;
            self.send_encodings();
            messages::fb_update_request(&mut self.sock, false, 0, 0, w, h);
            messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, w, h);
            self.sock.flush();
        } else {
            messages::fb_update_request(&mut self.sock, true, 0, 0, w, h);
        }
    }

    // ── FramebufferUpdate ────────────────────────────────────────────────

    fn framebuffer_update(&mut self) -> Result<bool, RfbError> {
        if self.fbu.rects == 0 {
            if self.sock.rq_wait("FBU header", 3, 1)? {
                return Ok(false);
            }
            self.sock.skip(1);
            self.fbu.rects = self.sock.shift16();

            // Let the previous frame finish presenting before queueing more.
            if self.fbu.rects > 0 && self.display.pending() {
                self.flushing = true;
                self.display.flush();
                return Ok(false);
            }
        }

        while self.fbu.rects > 0 {
            let enc = match self.fbu.encoding {
                Some(enc) => enc,
                None => {
                    if self.sock.rq_wait("rect header", 12, 0)? {
                        return Ok(false);
                    }
                    let x = self.sock.shift16();
                    let y = self.sock.shift16();
                    let width = self.sock.shift16();
                    let height = self.sock.shift16();
                    let enc = self.sock.shift32() as i32;
                    self.fbu.rect = Rect::new(x, y, width, height);
                    self.fbu.encoding = Some(enc);
                    enc
                }
            };

            if !self.handle_rect(enc)? {
                return Ok(false);
            }

            self.fbu.rects -= 1;
            self.fbu.encoding = None;
        }

        self.display.flip();
        self.ard.last_fbu = Some(self.timer.now());
        self.ard.tickles = 0;

        if self.ard.enabled {
            self.ard_frame_complete()?;
        }
        Ok(true)
    }

    fn handle_rect(&mut self, enc: i32) -> Result<bool, RfbError> {
        let rect = self.fbu.rect;
        match enc {
            encoding::LAST_RECT => {
                // Decremented by the caller.
                self.fbu.rects = 1;
                Ok(true)
            }
            encoding::VMWARE_CURSOR => match decode_vmware_cursor(&rect, &mut self.sock)? {
                Some(cursor) => {
                    self.apply_cursor(cursor);
                    Ok(true)
                }
                None => Ok(false),
            },
            encoding::CURSOR => match decode_rich_cursor(&rect, &mut self.sock)? {
                Some(cursor) => {
                    self.apply_cursor(cursor);
                    Ok(true)
                }
                None => Ok(false),
            },
            encoding::QEMU_EXTENDED_KEY_EVENT => {
                self.ext.qemu_ext_key = true;
                Ok(true)
            }
            encoding::DESKTOP_NAME => self.handle_desktop_name(),
            encoding::DESKTOP_SIZE => {
                log::info!(
                    "DesktopSize: {}x{} -> {}x{}",
                    self.fb_width,
                    self.fb_height,
                    rect.width,
                    rect.height
                );
                self.resize_framebuffer(rect.width, rect.height);
                if self.ard.enabled {
                    let (w, h) = (self.fb_width, self.fb_height);
                    messages::fb_update_request(&mut self.sock, false, 0, 0, w, h);
                    messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, w, h);
                    self.sock.flush();
                }
                Ok(true)
            }
            encoding::EXTENDED_DESKTOP_SIZE => self.handle_extended_desktop_size(&rect),
            encoding::EXTENDED_MOUSE_BUTTONS => {
                self.ext.extended_pointer = true;
                Ok(true)
            }
            encoding::QEMU_LED_EVENT => {
                if self.sock.rq_wait("LED status", 1, 0)? {
                    return Ok(false);
                }
                let data = self.sock.shift8();
                self.ext.num_lock = Some(data & 2 != 0);
                self.ext.caps_lock = Some(data & 4 != 0);
                Ok(true)
            }
            encoding::ARD_CURSOR_POS..=encoding::ARD_DISPLAY_INFO2 if self.ard.enabled => self.handle_ard_rect(enc, &rect),
            _ => {
                let depth = self.fb_depth;
                let Some(decoder) = self.decoders.get_mut(enc) else {
                    return Err(RfbError::UnsupportedEncoding(enc));
                };
                decoder.decode_rect(&rect, &mut self.sock, self.display.as_mut(), depth)
            }
        }
    }

    pub(crate) fn apply_cursor(&mut self, cursor: Cursor) {
        self.display.set_cursor(&cursor);
        if self.ard.got_cursor == Some(false) {
            self.ard.got_cursor = Some(true);
        }
    }

    fn handle_desktop_name(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("DesktopName", 4, 0)? {
            return Ok(false);
        }
        let hdr = self.sock.peek_bytes(4);
        let len = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
        if self.sock.rq_wait("DesktopName", 4 + len, 0)? {
            return Ok(false);
        }
        self.sock.skip(4);
        let name = decode_name(self.sock.shift_bytes(len));
        self.set_desktop_name(name);
        Ok(true)
    }

    fn handle_extended_desktop_size(&mut self, rect: &Rect) -> Result<bool, RfbError> {
        if self.sock.rq_wait("ExtendedDesktopSize", 4, 0)? {
            return Ok(false);
        }
        let screens = self.sock.peek8() as usize;
        if self.sock.rq_wait("ExtendedDesktopSize", 4 + screens * 16, 0)? {
            return Ok(false);
        }

        let first_update = !self.ext.set_desktop_size;
        self.ext.set_desktop_size = true;

        self.sock.skip(4);
        for i in 0..screens {
            if i == 0 {
                self.resize.screen_id = self.sock.shift32();
                self.sock.skip(8);
                self.resize.screen_flags = self.sock.shift32();
            } else {
                self.sock.skip(16);
            }
        }

        // x carries the reason for the change, y the status when we asked.
        if rect.x == 1 {
            self.resize.pending = false;
        }
        if rect.x == 1 && rect.y != 0 {
            let msg = match rect.y {
                1 => "Resize is administratively prohibited",
                2 => "Out of resources",
                3 => "Invalid screen layout",
                _ => "Unknown reason",
            };
            log::warn!("Server did not accept the resize request: {msg}");
        } else {
            self.resize_framebuffer(rect.width, rect.height);
        }

        if first_update || (rect.x == 1 && rect.y == 0) {
            self.request_remote_resize();
        }
        Ok(true)
    }

    pub(crate) fn update_continuous_updates(&mut self) {
        if !self.ext.continuous_updates_enabled {
            return;
        }
        messages::enable_continuous_updates(&mut self.sock, true, 0, 0, self.fb_width, self.fb_height);
    }

    // ── Fence and XVP ────────────────────────────────────────────────────

    fn handle_server_fence(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("ServerFence header", 8, 1)? {
            return Ok(false);
        }
        self.sock.skip(3);
        let flags = self.sock.shift32();
        let len = self.sock.shift8() as usize;
        if self.sock.rq_wait("ServerFence payload", len, 9)? {
            return Ok(false);
        }

        let mut payload = self.sock.shift_vec(len);
        if payload.len() > MAX_FENCE_PAYLOAD {
            log::warn!("Bad payload length ({len}) in fence response");
            payload.truncate(MAX_FENCE_PAYLOAD);
        }
        self.ext.fence = true;

        if flags & FENCE_REQUEST == 0 {
            return Err(RfbError::protocol("Unexpected fence response"));
        }
        // Only the block flags are honoured; the request bit is cleared on the echo.
        let flags = flags & (FENCE_BLOCK_BEFORE | FENCE_BLOCK_AFTER);
        messages::client_fence(&mut self.sock, flags, &payload);
        Ok(true)
    }

    fn handle_xvp(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("XVP version and message", 3, 1)? {
            return Ok(false);
        }
        self.sock.skip(1);
        let version = self.sock.shift8();
        let msg = self.sock.shift8();
        match msg {
            0 => {
                log::error!("XVP operation failed");
                Ok(true)
            }
            1 => {
                self.ext.xvp_version = version;
                log::info!("XVP extensions enabled (version {version})");
                self.events.emit(RfbEvent::Capabilities { power: true });
                Ok(true)
            }
            other => Err(RfbError::protocol(format!("Illegal server XVP message (msg: {other})"))),
        }
    }
}
