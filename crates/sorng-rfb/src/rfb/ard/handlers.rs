//! ARD message and pseudo-encoding handlers, the post-ServerInit burst,
//! and the public ARD operations on [`RfbEngine`].

use flate2::Decompress;
use sorng_rfb_crypto::Aes128;

use super::cursor::{read_cursor_alpha, system_cursor_name, ActiveCursor, CursorAlpha, FIRST_CUSTOM_ID};
use super::display_info::{read_display_info, read_display_info2, DisplayInfo2};
use super::pasteboard::{build_pasteboard, normalize_text, parse_pasteboard};
use super::session_select::{read_session_info, read_session_result, session_command, SelectStatus, CONNECT_TO_CONSOLE};
use super::user_info::read_user_info;
use super::{curtain_payload, state_code, Frame, ENCRYPTION_ACKNOWLEDGE, ENCRYPTION_REQUEST, MAX_CLIPBOARD_SIZE};
use crate::rfb::collab::TimerId;
use crate::rfb::config::{
    ArdControlMode, QualityPreset, ARD_CLIPBOARD_REQUEST_THROTTLE, ARD_RETRY_DELAY, FREEZE_STALL_THRESHOLD,
    FREEZE_WATCHDOG_PERIOD,
};
use crate::rfb::constants::{encoding, ARD_VERSION_LINE};
use crate::rfb::decoders::inflate_stream;
use crate::rfb::engine::RfbEngine;
use crate::rfb::errors::RfbError;
use crate::rfb::messages;
use crate::rfb::types::{ArdDisplay, ConnectionState, Cursor, InitPhase, Rect, RfbEvent};

/// Bytes after the type byte of an inbound ClipboardSend.
const CLIPBOARD_SEND_HEADER: usize = 15;
/// Bytes after the type byte of a re-handshake request.
const REHANDSHAKE_BODY: usize = 11;
/// Key and IV, each AES-ECB encrypted, after a u32 command.
const SESSION_ENCRYPTION_BODY: usize = 36;

impl RfbEngine {
    // ── Session select ───────────────────────────────────────────────────

    pub(crate) fn handle_session_info(&mut self) -> Result<bool, RfbError> {
        let Some(info) = read_session_info(&mut self.sock)? else {
            return Ok(false);
        };
        log::info!(
            "ARD SessionInfo: version={} allowedCommands=0x{:x} user='{}'",
            info.version,
            info.allowed_commands,
            info.username
        );
        session_command(&mut self.sock, CONNECT_TO_CONSOLE, &info.username);
        self.phase = InitPhase::SessionSelectResult;
        Ok(true)
    }

    pub(crate) fn handle_session_result(&mut self) -> Result<bool, RfbError> {
        let Some(status) = read_session_result(&mut self.sock)? else {
            return Ok(false);
        };
        match status {
            SelectStatus::Pending => {
                log::info!("ARD Session Select: waiting for the console user");
                Ok(true)
            }
            SelectStatus::Granted => {
                log::info!("ARD Session Select granted");
                self.ard_init();
                self.update_state(ConnectionState::Connected);
                Ok(true)
            }
            SelectStatus::Denied(code) => Err(RfbError::auth(format!("Session Select failed: status={code}"))),
        }
    }

    // ── Post-ServerInit burst ────────────────────────────────────────────

    /// Everything a Screen Sharing viewer sends once ServerInit is in.
    pub(crate) fn ard_init(&mut self) {
        let (w, h) = (self.fb_width, self.fb_height);

        log::info!("ARD init [1/10]: ViewerInfo");
        messages::ard_viewer_info(&mut self.sock);

        let mode = if self.view_only {
            ArdControlMode::Observe
        } else {
            ArdControlMode::Control
        };
        log::info!("ARD init [2/10]: SetMode {mode:?}");
        self.ard.control_mode = mode;
        messages::ard_set_mode(&mut self.sock, mode.to_byte());

        log::info!(
            "ARD init [3/10]: SetDisplay combineAll={} display={}",
            self.ard.combine_all,
            self.ard.selected_display
        );
        messages::ard_set_display(&mut self.sock, self.ard.combine_all, self.ard.selected_display);

        log::info!("ARD init [4/10]: AutoPasteboard on");
        messages::ard_auto_pasteboard(&mut self.sock, 1);
        self.ard.clipboard_sync = true;

        log::info!("ARD init [5/10]: SetEncodings ({})", self.ard.quality_preset.as_str());
        self.send_encodings();

        log::info!("ARD init [6/10]: SetPixelFormat depth={}", self.fb_depth);
        messages::pixel_format(&mut self.sock, self.fb_depth, Some((16, 8, 0)));

        log::info!("ARD init [7/10]: SetEncodings again");
        self.send_encodings();

        if self.ard.dh_key.is_some() {
            log::info!("ARD init [8/10]: SetEncryption request");
            messages::ard_set_encryption(&mut self.sock, ENCRYPTION_REQUEST);
        } else {
            log::info!("ARD init [8/10]: SetEncryption skipped (no DH key)");
        }

        log::info!("ARD init [9/10]: FramebufferUpdateRequest {w}x{h}");
        messages::fb_update_request(&mut self.sock, false, 0, 0, w, h);

        log::info!("ARD init [10/10]: AutoFramebufferUpdate");
        messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, w, h);
        self.sock.flush();

        self.timer.arm(TimerId::ArdInitRetry, ARD_RETRY_DELAY);

        self.ard.active_cursor = ActiveCursor::System(0);
        self.display.set_system_cursor(system_cursor_name(0));
        self.ard.got_cursor = Some(false);
        self.ard.first_display_info = true;
        self.ard.phase3_pending = false;
    }

    pub(crate) fn ard_init_retry(&mut self) {
        if self.state != ConnectionState::Connected || !self.ard.enabled {
            return;
        }
        let (w, h) = (self.fb_width, self.fb_height);
        log::info!("ARD init [11/11]: delayed FramebufferUpdateRequest + AutoFramebufferUpdate");
        messages::fb_update_request(&mut self.sock, false, 0, 0, w, h);
        messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, w, h);
        self.sock.flush();
    }

    // ── Full updates ─────────────────────────────────────────────────────

    pub(crate) fn request_ard_full_update(&mut self) {
        let (w, h) = (self.fb_width, self.fb_height);
        self.request_ard_full_update_sized(w, h);
    }

    /// Non-incremental request plus AutoFBUpdate, repeated once shortly
    /// after in case the server dropped the first one.
    fn request_ard_full_update_sized(&mut self, w: u16, h: u16) {
        log::debug!("ARD: full update request {w}x{h}");
        messages::fb_update_request(&mut self.sock, false, 0, 0, w, h);
        messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, w, h);
        self.sock.flush();
        self.ard.full_update_retry = Some((w, h));
        self.timer.arm(TimerId::ArdFullUpdateRetry, ARD_RETRY_DELAY);
    }

    pub(crate) fn ard_full_update_retry(&mut self) {
        let Some((w, h)) = self.ard.full_update_retry.take() else {
            return;
        };
        if self.state != ConnectionState::Connected {
            return;
        }
        messages::fb_update_request(&mut self.sock, false, 0, 0, w, h);
        messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, w, h);
        self.sock.flush();
    }

    // ── Freeze watchdog ──────────────────────────────────────────────────

    pub(crate) fn arm_freeze_watchdog(&mut self) {
        self.ard.last_fbu = None;
        self.ard.tickles = 0;
        self.timer.arm(TimerId::FreezeWatchdog, FREEZE_WATCHDOG_PERIOD);
    }

    pub(crate) fn freeze_watchdog(&mut self) {
        if self.state != ConnectionState::Connected || !self.ard.enabled {
            return;
        }
        if let Some(last) = self.ard.last_fbu {
            let idle = self.timer.now().saturating_duration_since(last);
            if idle >= FREEZE_STALL_THRESHOLD {
                log::warn!(
                    "ARD: no FBU for {}s (Tickles since last FBU: {})",
                    idle.as_secs(),
                    self.ard.tickles
                );
            }
        }
        self.timer.arm(TimerId::FreezeWatchdog, FREEZE_WATCHDOG_PERIOD);
    }

    // ── Server messages ──────────────────────────────────────────────────

    /// StateChange (0x14): `[pad][u16 size][u16 flags][u16 code]...`
    pub(crate) fn handle_ard_state_change(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("ARD StateChange header", 3, 1)? {
            return Ok(false);
        }
        let hdr = self.sock.peek_bytes(3);
        let size = u16::from_be_bytes([hdr[1], hdr[2]]) as usize;
        if self.sock.rq_wait("ARD StateChange", 3 + size, 1)? {
            return Ok(false);
        }
        self.sock.skip(3);
        if size < 4 {
            self.sock.skip(size);
            return Ok(true);
        }
        let flags = self.sock.shift16();
        let code = self.sock.shift16();
        self.sock.skip(size - 4);
        log::debug!("ARD StateChange: code={code} flags=0x{flags:x}");

        match code {
            state_code::LOCAL_USER_CLOSED => {
                log::info!("ARD: remote user closed the session");
                self.clean = true;
                self.update_state(ConnectionState::Disconnecting);
                return Ok(false);
            }
            state_code::PASTEBOARD_CHANGED => {
                if !self.ard.clipboard_sync {
                    return Ok(true);
                }
                let now = self.timer.now();
                let throttled = self
                    .ard
                    .last_clipboard_request
                    .is_some_and(|last| now.saturating_duration_since(last) < ARD_CLIPBOARD_REQUEST_THROTTLE);
                if throttled {
                    log::debug!("ARD: pasteboard request throttled");
                } else {
                    self.ard.last_clipboard_request = Some(now);
                    messages::ard_clipboard_request(&mut self.sock, self.ard.clipboard_session_id);
                }
            }
            state_code::PASTEBOARD_DATA_NEEDED => {
                if self.ard.clipboard_sync {
                    if let Some(text) = self.ard.last_clipboard_sent.clone() {
                        self.send_ard_clipboard(&text);
                    }
                }
            }
            state_code::TICKLE => {
                self.ard.tickles += 1;
                let since = match self.ard.last_fbu {
                    Some(t) => format!("{}ms ago", self.timer.now().saturating_duration_since(t).as_millis()),
                    None => "never".into(),
                };
                log::debug!("ARD: Tickle #{} (last FBU {since})", self.ard.tickles);
                let (w, h) = (self.fb_width, self.fb_height);
                messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, w, h);
                self.sock.flush();
            }
            state_code::DISPLAY_SLEEP => log::info!("ARD: DisplaySleep"),
            state_code::DISPLAY_WAKE => log::info!("ARD: DisplayWake"),
            state_code::CURSOR_HIDDEN => self.display.set_cursor(&Cursor::hidden()),
            state_code::CURSOR_VISIBLE => self.reapply_cursor(),
            other => log::debug!("ARD StateChange: unhandled code {other}"),
        }
        Ok(true)
    }

    /// Inbound ClipboardSend (0x1f). Each message is its own zlib stream.
    pub(crate) fn handle_ard_clipboard_send(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("ARD ClipboardSend header", CLIPBOARD_SEND_HEADER, 1)? {
            return Ok(false);
        }
        let hdr = self.sock.peek_bytes(CLIPBOARD_SEND_HEADER);
        let compressed_len = u32::from_be_bytes([hdr[11], hdr[12], hdr[13], hdr[14]]) as usize;
        if self
            .sock
            .rq_wait("ARD ClipboardSend", CLIPBOARD_SEND_HEADER + compressed_len, 1)?
        {
            return Ok(false);
        }

        let format = self.sock.shift8();
        self.sock.skip(2);
        let session_id = self.sock.shift32();
        let uncompressed_len = self.sock.shift32();
        self.sock.skip(4);
        self.ard.clipboard_session_id = session_id;

        if uncompressed_len == 0 || compressed_len == 0 {
            self.sock.skip(compressed_len);
            return Ok(true);
        }
        if uncompressed_len > MAX_CLIPBOARD_SIZE {
            log::warn!("ARD ClipboardSend: {uncompressed_len} bytes exceeds the limit, dropped");
            self.sock.skip(compressed_len);
            return Ok(true);
        }

        let compressed = self.sock.shift_bytes(compressed_len);
        let mut z = Decompress::new(true);
        let limit = uncompressed_len as usize + 1;
        let raw = match inflate_stream(&mut z, compressed, uncompressed_len as usize, limit) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("ARD ClipboardSend: {e}");
                return Ok(true);
            }
        };
        let text = normalize_text(&parse_pasteboard(&raw));
        log::debug!(
            "ARD ClipboardSend: format={format} session={session_id} {} chars",
            text.chars().count()
        );

        if self.ard.last_clipboard_received.as_deref() == Some(text.as_str()) {
            return Ok(true);
        }
        self.ard.last_clipboard_received = Some(text.clone());

        let manual = std::mem::take(&mut self.ard.manual_clipboard_request);
        if !self.ard.clipboard_sync && !manual {
            return Ok(true);
        }
        self.write_clipboard(&text);
        Ok(true)
    }

    /// The server restarts the handshake from the security phase.
    pub(crate) fn handle_ard_rehandshake(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("ARD re-handshake", REHANDSHAKE_BODY, 1)? {
            return Ok(false);
        }
        self.sock.skip(REHANDSHAKE_BODY);
        log::info!("ARD: server requested re-handshake");

        self.sock.sq_push_bytes(ARD_VERSION_LINE);
        self.sock.flush();

        self.ard.reset_encryption();
        self.events.emit(RfbEvent::ArdDisplayList { displays: Vec::new() });

        self.timer.cancel(TimerId::ArdInitRetry);
        self.timer.cancel(TimerId::ArdFullUpdateRetry);
        self.timer.cancel(TimerId::FreezeWatchdog);
        self.state = ConnectionState::Connecting;
        self.phase = InitPhase::Security;
        self.authenticator = None;
        Ok(false)
    }

    // ── Pseudo-encodings ─────────────────────────────────────────────────

    pub(crate) fn handle_ard_rect(&mut self, enc: i32, rect: &Rect) -> Result<bool, RfbError> {
        match enc {
            encoding::ARD_CURSOR_POS => Ok(true),
            encoding::ARD_CURSOR_ALPHA => self.handle_cursor_alpha(rect),
            encoding::ARD_DISPLAY_INFO => {
                let Some(info) = read_display_info(&mut self.sock)? else {
                    return Ok(false);
                };
                self.set_ard_displays(info.displays);
                Ok(true)
            }
            encoding::ARD_DISPLAY_INFO2 => match read_display_info2(&mut self.sock)? {
                Frame::Incomplete => Ok(false),
                Frame::Ignored => Ok(true),
                Frame::Complete(info) => {
                    self.apply_display_info2(info);
                    Ok(true)
                }
            },
            encoding::ARD_USER_INFO => {
                let Some(info) = read_user_info(&mut self.sock)? else {
                    return Ok(false);
                };
                log::info!(
                    "ARD UserInfo: user='{}' avatar={} bytes",
                    info.username,
                    info.avatar.as_ref().map_or(0, Vec::len)
                );
                self.ard.username = info.username.clone();
                self.ard.avatar = info.avatar;
                self.events.emit(RfbEvent::ArdUserInfo {
                    username: info.username,
                    has_avatar: info.image_size > 0,
                });
                Ok(true)
            }
            encoding::ARD_SESSION_ENCRYPTION => self.handle_session_encryption(),
            other => Err(RfbError::UnsupportedEncoding(other)),
        }
    }

    fn handle_cursor_alpha(&mut self, rect: &Rect) -> Result<bool, RfbError> {
        let cursor = match read_cursor_alpha(rect, &mut self.sock)? {
            Frame::Incomplete => return Ok(false),
            Frame::Ignored => return Ok(true),
            Frame::Complete(c) => c,
        };
        self.ard.got_cursor = Some(true);
        match cursor {
            CursorAlpha::Select(id) if id < FIRST_CUSTOM_ID => {
                self.ard.active_cursor = ActiveCursor::System(id);
                self.display.set_system_cursor(system_cursor_name(id));
            }
            CursorAlpha::Select(id) => match self.ard.cursors.get(id) {
                Some(image) => {
                    self.ard.active_cursor = ActiveCursor::Custom(id);
                    self.display.set_cursor(image);
                }
                None => {
                    log::warn!("ArdCursorAlpha: unknown cursor id {id}, using default");
                    self.ard.active_cursor = ActiveCursor::System(0);
                    self.display.set_system_cursor(system_cursor_name(0));
                }
            },
            CursorAlpha::Image { id, cursor } => {
                self.display.set_cursor(&cursor);
                self.ard.cursors.insert(id, cursor);
                self.ard.active_cursor = ActiveCursor::Custom(id);
            }
        }
        Ok(true)
    }

    fn reapply_cursor(&mut self) {
        match self.ard.active_cursor {
            ActiveCursor::Custom(id) => match self.ard.cursors.get(id) {
                Some(image) => self.display.set_cursor(image),
                None => self.display.set_system_cursor(system_cursor_name(0)),
            },
            ActiveCursor::System(id) => self.display.set_system_cursor(system_cursor_name(id)),
        }
    }

    fn handle_session_encryption(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("ARD SessionEncryption", SESSION_ENCRYPTION_BODY, 0)? {
            return Ok(false);
        }
        let command = self.sock.shift32();
        if command != 1 {
            log::warn!("ARD SessionEncryption: unexpected command {command}");
        }
        let wrapped = self.sock.shift_bytes(32).to_vec();
        let dh_key = self
            .ard
            .dh_key
            .ok_or_else(|| RfbError::protocol("ARD SessionEncryption without a DH key"))?;
        let plain = Aes128::new(&dh_key).decrypt_ecb(&wrapped)?;
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&plain[..16]);
        iv.copy_from_slice(&plain[16..32]);
        self.ard.session_key = Some((key, iv));
        self.ard.pending_encryption = true;
        log::info!("ARD: session key received, switching on after this update");
        Ok(true)
    }

    fn set_ard_displays(&mut self, displays: Vec<ArdDisplay>) {
        self.ard.displays = displays.clone();
        self.events.emit(RfbEvent::ArdDisplayList { displays });
    }

    fn apply_display_info2(&mut self, info: DisplayInfo2) {
        let curtained = info.curtained();
        let console = info.console_active();
        let reason = info.console_reason();
        let (sw, sh) = (info.scaled_width, info.scaled_height);
        self.set_ard_displays(info.displays);

        if curtained != self.ard.curtain_active {
            self.ard.curtain_active = curtained;
            log::info!("ARD: curtain {}", if curtained { "engaged" } else { "released" });
            self.events.emit(RfbEvent::ArdCurtainChange { active: curtained });
        }
        if console != self.ard.console_active {
            self.ard.console_active = console;
            log::info!("ARD: console {reason}");
            self.events.emit(RfbEvent::ArdConsoleState { active: console });
        }

        let (prev_w, prev_h) = self.ard.last_scaled;
        let prev_count = self.ard.last_display_count;
        let count = self.ard.displays.len() as u16;
        self.ard.last_scaled = (sw, sh);
        self.ard.last_display_count = count;

        if sw > 0 && sh > 0 && (sw, sh) != (self.fb_width, self.fb_height) {
            log::info!("ARD: framebuffer {}x{} -> {sw}x{sh}", self.fb_width, self.fb_height);
            self.resize_framebuffer(sw, sh);
            self.display.fill_rect(0, 0, sw, sh, [0, 0, 0, 255]);
        }

        let connected = self.state == ConnectionState::Connected;
        let count_changed = connected && prev_count > 0 && count != prev_count;
        let dims_changed = connected && prev_w > 0 && (sw, sh) != (prev_w, prev_h);

        if count_changed && !dims_changed && !self.ard.first_display_info {
            log::info!("ARD: display count {prev_count} -> {count}");
            self.request_ard_full_update_sized(sw, sh);
        }

        if self.ard.first_display_info || dims_changed {
            self.ard.first_display_info = false;
            messages::ard_set_display(&mut self.sock, self.ard.combine_all, self.ard.selected_display);
            messages::pixel_format(&mut self.sock, self.fb_depth, None);
            self.sock.flush();
            if self.ard.combine_all {
                self.ard.phase3_pending = false;
                messages::ard_set_server_scaling(&mut self.sock, 1.0);
                self.request_ard_full_update();
            } else {
                self.ard.phase3_pending = true;
            }
        } else if self.ard.phase3_pending {
            self.ard.phase3_pending = false;
            messages::ard_set_server_scaling(&mut self.sock, 1.0);
            self.request_ard_full_update();
        } else if connected {
            messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, sw, sh);
            self.sock.flush();
        }
    }

    /// End-of-update hook: keep AutoFBUpdate alive and switch the stream
    /// to AES once a session key has arrived.
    pub(crate) fn ard_frame_complete(&mut self) -> Result<(), RfbError> {
        let (w, h) = (self.fb_width, self.fb_height);
        messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, w, h);
        self.sock.flush();

        if !self.ard.pending_encryption {
            return Ok(());
        }
        self.ard.pending_encryption = false;
        let Some((key, iv)) = self.ard.session_key else {
            return Ok(());
        };
        messages::ard_set_encryption(&mut self.sock, ENCRYPTION_ACKNOWLEDGE);
        self.sock.enable_encryption(&key, &iv);
        self.ard.encryption_enabled = true;
        log::info!("ARD: stream encryption enabled");
        self.sock.reprocess_remaining_as_encrypted()?;

        messages::fb_update_request(&mut self.sock, false, 0, 0, w, h);
        messages::ard_auto_fb_update(&mut self.sock, true, 0, 0, w, h);
        self.sock.flush();
        Ok(())
    }

    // ── Outbound pasteboard ──────────────────────────────────────────────

    pub(crate) fn send_ard_clipboard(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let pasteboard = build_pasteboard(text);
        let compressed = match messages::deflate(&pasteboard) {
            Ok(c) => c,
            Err(e) => {
                log::error!("ARD: failed to compress pasteboard: {e}");
                return;
            }
        };
        log::debug!(
            "ARD ClipboardSend: {} bytes ({} compressed) session={}",
            pasteboard.len(),
            compressed.len(),
            self.ard.clipboard_session_id
        );
        messages::ard_clipboard_send(
            &mut self.sock,
            self.ard.clipboard_session_id,
            pasteboard.len() as u32,
            &compressed,
        );
    }

    // ── Public operations ────────────────────────────────────────────────

    fn ard_connected(&self, op: &str) -> bool {
        let ok = self.state == ConnectionState::Connected && self.ard.enabled;
        if !ok {
            log::warn!("{op}: not connected to an ARD server");
        }
        ok
    }

    pub fn set_quality_preset(&mut self, preset: QualityPreset) {
        if self.ard.quality_preset == preset {
            return;
        }
        self.ard.quality_preset = preset;
        log::info!("ARD quality preset: {}", preset.as_str());
        if self.state == ConnectionState::Connected && self.ard.enabled {
            self.send_encodings();
            messages::ard_set_display(&mut self.sock, self.ard.combine_all, self.ard.selected_display);
            self.request_ard_full_update();
        }
    }

    /// Observe drives view-only; Control and Exclusive release it.
    pub fn set_ard_control_mode(&mut self, mode: ArdControlMode) {
        self.ard.control_mode = mode;
        self.view_only = mode == ArdControlMode::Observe;
        if self.state == ConnectionState::Connected && self.ard.enabled {
            messages::ard_set_mode(&mut self.sock, mode.to_byte());
            self.sock.flush();
        }
    }

    /// Curtain the remote screen. `None` uses the stored message.
    pub fn ard_curtain_lock(&mut self, message: Option<&str>) {
        if !self.ard_connected("ard_curtain_lock") {
            return;
        }
        if let Some(message) = message {
            self.ard.curtain_message = message.to_string();
        }
        let payload = curtain_payload(&self.ard.curtain_message);
        messages::ard_session_visibility(&mut self.sock, false, &payload);
        self.sock.flush();
        log::info!("ARD: curtain lock requested");
    }

    pub fn ard_curtain_unlock(&mut self) {
        if !self.ard_connected("ard_curtain_unlock") {
            return;
        }
        messages::ard_session_visibility(&mut self.sock, true, "");
        self.sock.flush();
        log::info!("ARD: curtain unlock requested");
    }

    pub fn set_ard_curtain_message(&mut self, message: &str) {
        self.ard.curtain_message = message.to_string();
    }

    /// Show every display stitched together, or just `display_id`.
    pub fn select_display(&mut self, combine_all: bool, display_id: u32) {
        if !self.ard_connected("select_display") {
            return;
        }
        self.ard.combine_all = combine_all;
        self.ard.selected_display = display_id;
        messages::ard_set_display(&mut self.sock, combine_all, display_id);
        if !combine_all {
            messages::ard_set_display(&mut self.sock, combine_all, display_id);
        }
        messages::pixel_format(&mut self.sock, self.fb_depth, None);
        messages::ard_set_server_scaling(&mut self.sock, 1.0);
        self.sock.flush();
    }

    pub fn enable_clipboard_sync(&mut self, enabled: bool) {
        if !self.ard_connected("enable_clipboard_sync") {
            return;
        }
        messages::ard_auto_pasteboard(&mut self.sock, u16::from(enabled));
        self.sock.flush();
        self.ard.clipboard_sync = enabled;
    }

    /// Pull the remote pasteboard once, even with sync off.
    pub fn request_remote_clipboard(&mut self) {
        if !self.ard_connected("request_remote_clipboard") {
            return;
        }
        self.ard.manual_clipboard_request = true;
        self.ard.last_clipboard_received = None;
        messages::ard_clipboard_request(&mut self.sock, self.ard.clipboard_session_id);
    }

    pub fn ard_curtain_active(&self) -> bool {
        self.ard.curtain_active
    }

    pub fn ard_console_active(&self) -> bool {
        self.ard.console_active
    }

    pub fn ard_username(&self) -> &str {
        &self.ard.username
    }

    pub fn ard_avatar(&self) -> Option<&[u8]> {
        self.ard.avatar.as_deref()
    }

    pub fn ard_displays(&self) -> &[ArdDisplay] {
        &self.ard.displays
    }

    pub fn ard_control_mode(&self) -> ArdControlMode {
        self.ard.control_mode
    }
}

#[cfg(test)]
mod tests {
    use super::super::display_info::test_data;
    use super::*;
    use crate::rfb::config::EngineConfig;
    use crate::rfb::engine::test_util::{server_init, Rig};
    use std::time::Duration;

    const DH_KEY: [u8; 16] = [0x42; 16];

    /// Handshake an ARD server with None security up to Connected.
    fn connect_ard(name: &[u8]) -> Rig {
        let mut rig = Rig::new(EngineConfig::default());
        rig.engine.connect();
        rig.feed(b"RFB 003.889\n");
        assert_eq!(rig.sent(), b"RFB 003.889\n");
        rig.feed(&[1, 1]);
        rig.feed(&[0, 0, 0, 0]);
        assert_eq!(rig.sent(), [1, 0xc1]);
        rig.feed(&server_init(800, 600, name));
        rig
    }

    fn connected() -> Rig {
        let mut rig = connect_ard(b"Studio Mac");
        assert_eq!(rig.engine.state(), ConnectionState::Connected);
        rig.sent();
        rig.events();
        rig.timer.expire(TimerId::ArdInitRetry);
        rig
    }

    fn fbu(rects: &[(Rect, i32, Vec<u8>)]) -> Vec<u8> {
        let mut b = vec![0, 0];
        b.extend((rects.len() as u16).to_be_bytes());
        for (r, enc, payload) in rects {
            for v in [r.x, r.y, r.width, r.height] {
                b.extend(v.to_be_bytes());
            }
            b.extend(enc.to_be_bytes());
            b.extend(payload);
        }
        b
    }

    fn state_change(code: u16) -> Vec<u8> {
        let mut b = vec![0x14, 0, 0, 4, 0, 0];
        b.extend(code.to_be_bytes());
        b
    }

    fn clipboard_send(session: u32, text: &str) -> Vec<u8> {
        let pb = build_pasteboard(text);
        let z = messages::deflate(&pb).unwrap();
        let mut b = vec![0x1f, 0, 0, 0];
        b.extend(session.to_be_bytes());
        b.extend((pb.len() as u32).to_be_bytes());
        b.extend((z.len() as u32).to_be_bytes());
        b.extend(z);
        b
    }

    #[test]
    fn init_burst() {
        let mut rig = connect_ard(b"Studio Mac");
        assert_eq!(rig.engine.state(), ConnectionState::Connected);
        let sent = rig.sent();
        assert_eq!(sent[0], 0x21);
        assert_eq!(&sent[66..70], &[0x0a, 0, 0, 1]);
        assert_eq!(&sent[70..78], &[0x0d, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&sent[78..86], &[0x15, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(sent[86], 2);

        let tail = &sent[sent.len() - 26..];
        assert_eq!(&tail[..10], &[3, 0, 0, 0, 0, 0, 0x03, 0x20, 0x02, 0x58]);
        assert_eq!(&tail[10..], &[9, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0x03, 0x20, 0x02, 0x58]);

        assert!(rig.timer.is_armed(TimerId::ArdInitRetry));
        assert!(rig.timer.is_armed(TimerId::FreezeWatchdog));
        assert_eq!(rig.display.system_cursor(), Some("default"));
        assert!(rig.events().contains(&RfbEvent::Connect));

        rig.engine.timer_fired(TimerId::ArdInitRetry);
        assert_eq!(rig.sent().len(), 26);
    }

    #[test]
    fn encryption_request_needs_dh_key() {
        let mut rig = Rig::new(EngineConfig::default());
        rig.engine.connect();
        rig.feed(b"RFB 003.889\n");
        rig.feed(&[1, 1]);
        rig.feed(&[0, 0, 0, 0]);
        rig.engine.ard.dh_key = Some(DH_KEY);
        rig.sent();
        rig.feed(&server_init(800, 600, b"Studio Mac"));
        let sent = rig.sent();
        let tail = &sent[sent.len() - 38..sent.len() - 26];
        assert_eq!(tail, &[0x12, 0, 0, 1, 0, 1, 0, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn session_select_flow() {
        let mut name = vec![0u8, 0, 0, 0, 0, 0x04, 0, 0, 0, 0x82];
        name.extend([0u8; 12]);
        name.extend(b"Mac");
        let mut rig = connect_ard(&name);
        assert_eq!(rig.engine.state(), ConnectionState::Connecting);
        assert_eq!(rig.engine.phase(), InitPhase::SessionSelectInfo);
        assert!(rig.events().contains(&RfbEvent::Capabilities { power: true }));
        assert_eq!(rig.engine.desktop_name(), "Mac");

        let mut info = vec![0, 14, 0, 1, 0, 0, 0, 3, 0, 0, 0, 0];
        info.extend(b"anna");
        rig.feed(&info);
        let cmd = rig.sent();
        assert_eq!(cmd.len(), 74);
        assert_eq!(&cmd[..4], &[0, 72, 0, 1]);
        assert_eq!(cmd[8], CONNECT_TO_CONSOLE);
        assert_eq!(&cmd[10..14], b"anna");
        assert_eq!(rig.engine.phase(), InitPhase::SessionSelectResult);

        rig.feed(&[0, 6, 0, 1, 0, 0, 0, 2]);
        assert_eq!(rig.engine.state(), ConnectionState::Connecting);

        rig.feed(&[0, 6, 0, 1, 0, 0, 0, 0]);
        assert_eq!(rig.engine.state(), ConnectionState::Connected);
        assert_eq!(rig.sent()[0], 0x21);
    }

    #[test]
    fn session_select_denied_fails() {
        let mut name = vec![0u8, 0, 0, 0, 0, 0x04, 0, 0, 0, 0x02];
        name.extend([0u8; 12]);
        name.extend(b"Mac");
        let mut rig = connect_ard(&name);
        rig.feed(&[0, 10, 0, 1, 0, 0, 0, 3, 0, 0, 0, 0]);
        rig.feed(&[0, 6, 0, 1, 0, 0, 0, 5]);
        assert_eq!(rig.engine.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn display_info2_reports_curtain_and_displays() {
        let mut rig = connected();
        let payload = test_data::payload((800, 600), 0x03, &[test_data::display2(7, 0, 0, 800, 600, 2.0, true)]);
        rig.feed(&fbu(&[(Rect::new(0, 0, 0, 0), encoding::ARD_DISPLAY_INFO2, payload)]));

        let events = rig.events();
        assert!(events.contains(&RfbEvent::ArdCurtainChange { active: true }));
        assert!(events.contains(&RfbEvent::ArdConsoleState { active: true }));
        assert!(events
            .iter()
            .any(|e| matches!(e, RfbEvent::ArdDisplayList { displays } if displays.len() == 1 && displays[0].id == 7)));
        assert!(rig.engine.ard_curtain_active());
        assert_eq!(rig.engine.ard_displays()[0].width, 800);
        assert!(!rig.engine.ard.first_display_info);
        assert!(rig.timer.is_armed(TimerId::ArdFullUpdateRetry));

        // Same flags again: no new curtain event.
        let payload = test_data::payload((800, 600), 0x03, &[test_data::display2(7, 0, 0, 800, 600, 2.0, true)]);
        rig.feed(&fbu(&[(Rect::new(0, 0, 0, 0), encoding::ARD_DISPLAY_INFO2, payload)]));
        assert!(!rig
            .events()
            .iter()
            .any(|e| matches!(e, RfbEvent::ArdCurtainChange { .. })));
    }

    #[test]
    fn display_info2_resizes_framebuffer() {
        let mut rig = connected();
        let payload = test_data::payload((1024, 768), 0, &[test_data::display2(1, 0, 0, 1024, 768, 1.0, true)]);
        rig.feed(&fbu(&[(Rect::new(0, 0, 0, 0), encoding::ARD_DISPLAY_INFO2, payload)]));
        assert_eq!(rig.engine.framebuffer_size(), (1024, 768));
        assert_eq!(rig.display.pixel(5, 5), Some([0, 0, 0, 255]));
    }

    #[test]
    fn full_update_retry_repeats_once() {
        let mut rig = connected();
        rig.engine.request_full_update();
        assert_eq!(rig.sent().len(), 26);
        assert!(rig.timer.expire(TimerId::ArdFullUpdateRetry));
        rig.engine.timer_fired(TimerId::ArdFullUpdateRetry);
        assert_eq!(rig.sent().len(), 26);
        rig.engine.timer_fired(TimerId::ArdFullUpdateRetry);
        assert!(rig.sent().is_empty());
    }

    #[test]
    fn session_encryption_switches_stream() {
        let mut rig = connected();
        rig.engine.ard.dh_key = Some(DH_KEY);
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let mut body = 1u32.to_be_bytes().to_vec();
        let mut wrapped = key.to_vec();
        wrapped.extend(iv);
        body.extend(Aes128::new(&DH_KEY).encrypt_ecb(&wrapped).unwrap());
        rig.feed(&fbu(&[(Rect::new(0, 0, 0, 0), encoding::ARD_SESSION_ENCRYPTION, body)]));

        assert!(rig.engine.is_encrypted());
        assert!(rig.engine.ard.encryption_enabled);
        assert!(!rig.engine.ard.encrypts_key_events());
        let sent = rig.sent();
        let ack = [0x12, 0, 0, 2, 0, 1, 0, 0];
        assert!(sent.windows(ack.len()).any(|w| w == ack));

        // A frame length that is not a block multiple is fatal.
        rig.feed(&[0, 5, 1, 2, 3, 4, 5]);
        assert_eq!(rig.engine.state(), ConnectionState::Disconnected);
        assert!(!rig.wire.is_open_now());
    }

    #[test]
    fn session_encryption_without_key_fails() {
        let mut rig = connected();
        let body = vec![0u8; 36];
        rig.feed(&fbu(&[(Rect::new(0, 0, 0, 0), encoding::ARD_SESSION_ENCRYPTION, body)]));
        assert_eq!(rig.engine.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn tickle_refreshes_auto_update() {
        let mut rig = connected();
        let msg = state_change(state_code::TICKLE);
        rig.feed(&msg[..3]);
        assert!(rig.sent().is_empty());
        rig.feed(&msg[3..]);
        let sent = rig.sent();
        assert_eq!(sent.len(), 16);
        assert_eq!(sent[0], 9);
        assert_eq!(rig.engine.ard.tickles, 1);
    }

    #[test]
    fn pasteboard_change_is_throttled() {
        let mut rig = connected();
        rig.feed(&state_change(state_code::PASTEBOARD_CHANGED));
        assert_eq!(rig.sent(), [0x0b, 0, 0, 0, 0, 0, 0, 0]);
        rig.feed(&state_change(state_code::PASTEBOARD_CHANGED));
        assert!(rig.sent().is_empty());
        rig.timer.advance(Duration::from_millis(600));
        rig.feed(&state_change(state_code::PASTEBOARD_CHANGED));
        assert_eq!(rig.sent().len(), 8);
    }

    #[test]
    fn cursor_hide_and_show() {
        let mut rig = connected();
        rig.feed(&state_change(state_code::CURSOR_HIDDEN));
        assert_eq!(rig.display.cursor(), Some(Cursor::hidden()));
        rig.feed(&state_change(state_code::CURSOR_VISIBLE));
        assert_eq!(rig.display.system_cursor(), Some("default"));
    }

    #[test]
    fn local_user_close_disconnects() {
        let mut rig = connected();
        rig.feed(&state_change(state_code::LOCAL_USER_CLOSED));
        assert_eq!(rig.engine.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn inbound_pasteboard() {
        let mut rig = connected();
        rig.feed(&clipboard_send(7, "hello\r\nworld"));
        assert_eq!(
            rig.events(),
            vec![RfbEvent::Clipboard {
                text: "hello\nworld".into()
            }]
        );
        assert_eq!(rig.engine.ard.clipboard_session_id, 7);

        rig.feed(&clipboard_send(7, "hello\r\nworld"));
        assert!(rig.events().is_empty());

        rig.engine.clipboard_paste_from("hi");
        let sent = rig.sent();
        assert_eq!(&sent[..8], &[0x1f, 0, 0, 0, 0, 0, 0, 7]);
        let size = u32::from_be_bytes([sent[8], sent[9], sent[10], sent[11]]) as usize;
        assert_eq!(size, build_pasteboard("hi").len());
    }

    #[test]
    fn pasteboard_ignored_with_sync_off_unless_requested() {
        let mut rig = connected();
        rig.engine.enable_clipboard_sync(false);
        assert_eq!(rig.sent(), [0x15, 0, 0, 0, 0, 0, 0, 0]);
        rig.feed(&clipboard_send(1, "one"));
        assert!(rig.events().is_empty());

        rig.engine.request_remote_clipboard();
        assert_eq!(rig.sent()[0], 0x0b);
        rig.feed(&clipboard_send(1, "two"));
        assert_eq!(rig.events(), vec![RfbEvent::Clipboard { text: "two".into() }]);
        rig.feed(&clipboard_send(1, "three"));
        assert!(rig.events().is_empty());
    }

    #[test]
    fn pasteboard_data_needed_resends_last() {
        let mut rig = connected();
        rig.engine.clipboard_paste_from("copy me");
        let first = rig.sent();
        rig.feed(&state_change(state_code::PASTEBOARD_DATA_NEEDED));
        assert_eq!(rig.sent(), first);
    }

    #[test]
    fn rehandshake_restarts_security() {
        let mut rig = connected();
        rig.engine.ard.dh_key = Some(DH_KEY);
        let mut msg = vec![0x52];
        msg.extend([0u8; 11]);
        rig.feed(&msg);
        assert_eq!(rig.sent(), ARD_VERSION_LINE);
        assert_eq!(rig.engine.state(), ConnectionState::Connecting);
        assert_eq!(rig.engine.phase(), InitPhase::Security);
        assert!(rig.engine.ard.dh_key.is_none());
        assert!(rig.events().contains(&RfbEvent::ArdDisplayList { displays: vec![] }));

        rig.feed(&[1, 1]);
        rig.feed(&[0, 0, 0, 0]);
        rig.feed(&server_init(800, 600, b"Studio Mac"));
        assert_eq!(rig.engine.state(), ConnectionState::Connected);
    }

    #[test]
    fn cursor_alpha_image_and_select() {
        let mut rig = connected();
        let data = messages::deflate(&[30, 20, 10, 0, 255]).unwrap();
        let mut payload = 1000u32.to_be_bytes().to_vec();
        payload.extend((data.len() as u32).to_be_bytes());
        payload.extend(data);
        rig.feed(&fbu(&[(Rect::new(0, 0, 1, 1), encoding::ARD_CURSOR_ALPHA, payload)]));

        let cursor = rig.display.cursor().unwrap();
        assert_eq!(cursor.rgba, vec![10, 20, 30, 255]);
        assert_eq!(rig.engine.ard.active_cursor, ActiveCursor::Custom(1000));
        assert_eq!(rig.engine.ard.got_cursor, Some(true));

        let mut select = 5u32.to_be_bytes().to_vec();
        select.extend(0u32.to_be_bytes());
        rig.feed(&fbu(&[(Rect::new(0, 0, 0, 0), encoding::ARD_CURSOR_ALPHA, select)]));
        assert_eq!(rig.display.system_cursor(), Some("pointer"));

        let mut unknown = 4242u32.to_be_bytes().to_vec();
        unknown.extend(0u32.to_be_bytes());
        rig.feed(&fbu(&[(Rect::new(0, 0, 0, 0), encoding::ARD_CURSOR_ALPHA, unknown)]));
        assert_eq!(rig.engine.ard.active_cursor, ActiveCursor::System(0));
    }

    #[test]
    fn user_info_event() {
        let mut rig = connected();
        let mut payload = 5u16.to_be_bytes().to_vec();
        payload.extend(b"alice");
        payload.extend(0u32.to_be_bytes());
        payload.extend(0u32.to_be_bytes());
        rig.feed(&fbu(&[(Rect::new(0, 0, 0, 0), encoding::ARD_USER_INFO, payload)]));
        assert!(rig.events().contains(&RfbEvent::ArdUserInfo {
            username: "alice".into(),
            has_avatar: false
        }));
        assert_eq!(rig.engine.ard_username(), "alice");
        assert!(rig.engine.ard_avatar().is_none());
    }

    #[test]
    fn control_mode_drives_view_only() {
        let mut rig = connected();
        rig.engine.set_ard_control_mode(ArdControlMode::Observe);
        assert!(rig.engine.view_only());
        assert_eq!(rig.sent(), [0x0a, 0, 0, 0]);
        rig.engine.set_ard_control_mode(ArdControlMode::Control);
        assert!(!rig.engine.view_only());
        assert_eq!(rig.engine.ard_control_mode(), ArdControlMode::Control);
    }

    #[test]
    fn curtain_lock_and_unlock() {
        let mut rig = connected();
        rig.engine.ard_curtain_lock(Some("Back soon"));
        let sent = rig.sent();
        assert_eq!(&sent[..4], &[0x0c, 0, 0, 0]);
        assert_eq!(&sent[6..], b"curtain\r\rBack soon");
        rig.engine.ard_curtain_unlock();
        assert_eq!(rig.sent(), [0x0c, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn select_single_display() {
        let mut rig = connected();
        rig.engine.select_display(false, 2);
        let sent = rig.sent();
        assert_eq!(&sent[..16], &[0x0d, 0, 0, 0, 0, 0, 0, 2, 0x0d, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(sent[16], 0);
        assert_eq!(&sent[36..38], &[0x08, 0]);
        assert_eq!(sent.len(), 46);
    }

    #[test]
    fn quality_preset_resends_encodings() {
        let mut rig = connected();
        rig.engine.set_quality_preset(QualityPreset::Thousands);
        assert!(rig.sent().is_empty());
        rig.engine.set_quality_preset(QualityPreset::Gray);
        let sent = rig.sent();
        assert_eq!(sent[0], 2);
        assert_eq!(&sent[4..8], &1001i32.to_be_bytes());
    }

    #[test]
    fn watchdog_rearms() {
        let mut rig = connected();
        assert!(rig.timer.expire(TimerId::FreezeWatchdog));
        rig.timer.advance(Duration::from_secs(6));
        rig.engine.timer_fired(TimerId::FreezeWatchdog);
        assert!(rig.timer.is_armed(TimerId::FreezeWatchdog));
    }
}
