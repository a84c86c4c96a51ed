//! Connection initialisation: ProtocolVersion through ServerInit.

use super::ard::{self, split_server_name};
use super::constants::{encoding, security, ARD_VERSION_LINE};
use super::engine::RfbEngine;
use super::errors::RfbError;
use super::messages;
use super::security::{authenticator_for, select_security_type, AuthContext, AuthStep};
use super::types::{ConnectionState, InitPhase, RfbEvent, RfbVersion};
use super::collab::TimerId;
use super::config::AUTH_TIMEOUT;

const REPEATER_ID_SIZE: usize = 250;
const AMT_KVM_NAME: &str = "Intel(r) AMT KVM";

/// Decode a server string as UTF-8, falling back to Latin-1.
pub(crate) fn decode_name(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}

impl RfbEngine {
    /// One handshake step. `Ok(false)` means more input (or caller
    /// action) is needed.
    pub(crate) fn init_msg(&mut self) -> Result<bool, RfbError> {
        match self.phase {
            InitPhase::ProtocolVersion => self.negotiate_protocol_version(),
            InitPhase::Security => self.negotiate_security(),
            InitPhase::Authentication => self.negotiate_authentication(),
            InitPhase::SecurityResult => {
                if !self.auth_timer_armed {
                    self.timer.arm(TimerId::AuthTimeout, AUTH_TIMEOUT);
                    self.auth_timer_armed = true;
                }
                self.handle_security_result()
            }
            InitPhase::SecurityReason => self.handle_security_reason(),
            InitPhase::ClientInit => {
                let flag = if self.ard.enabled {
                    // shared + ARD extension bits
                    0xc1
                } else {
                    u8::from(self.config.shared)
                };
                self.sock.sq_push8(flag);
                self.sock.flush();
                self.phase = InitPhase::ServerInit;
                Ok(true)
            }
            InitPhase::ServerInit => self.negotiate_server_init(),
            InitPhase::SessionSelectInfo => self.handle_session_info(),
            InitPhase::SessionSelectResult => self.handle_session_result(),
        }
    }

    // ── ProtocolVersion ──────────────────────────────────────────────────

    fn negotiate_protocol_version(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("version", 12, 0)? {
            return Ok(false);
        }
        let line = self.sock.shift_str(12);
        let sversion = line.get(4..11).unwrap_or_default().to_string();
        log::info!("Server ProtocolVersion: {sversion}");

        if sversion == "000.000" {
            let mut id = format!("ID:{}", self.config.repeater_id).into_bytes();
            if id.len() < REPEATER_ID_SIZE {
                id.resize(REPEATER_ID_SIZE, 0);
            }
            log::info!("UltraVNC repeater detected, sending ID");
            self.sock.sq_push_bytes(&id);
            self.sock.flush();
            return Ok(true);
        }

        let version = RfbVersion::from_server(&sversion)
            .ok_or_else(|| RfbError::protocol(format!("Invalid server version {sversion}")))?;
        self.version = version;
        if sversion == "003.889" {
            log::info!("Apple Remote Desktop server detected");
            self.ard.enabled = true;
        }

        let reply: &[u8; 12] = if self.ard.enabled {
            ARD_VERSION_LINE
        } else {
            version.client_line()
        };
        self.sock.sq_push_bytes(reply);
        self.sock.flush();
        log::debug!("Sent ProtocolVersion: {}", String::from_utf8_lossy(&reply[4..11]));

        self.phase = InitPhase::Security;
        Ok(true)
    }

    // ── Security ─────────────────────────────────────────────────────────

    fn negotiate_security(&mut self) -> Result<bool, RfbError> {
        if self.version >= RfbVersion::V3_7 {
            if self.sock.rq_wait("security type count", 1, 0)? {
                return Ok(false);
            }
            let count = self.sock.shift8() as usize;
            if self.sock.rq_wait("security type", count, 1)? {
                return Ok(false);
            }
            if count == 0 {
                self.phase = InitPhase::SecurityReason;
                self.security_context = "no security types";
                self.security_status = 1;
                return Ok(true);
            }

            let types = self.sock.shift_vec(count);
            log::debug!("Server security types: {types:?}");
            let scheme = select_security_type(&types).ok_or_else(|| {
                RfbError::UnsupportedSecurity(types.iter().map(|&t| u32::from(t)).collect())
            })?;
            self.auth_scheme = scheme;
            self.sock.sq_push8(scheme as u8);
            // The tunnel wants its type byte and first payload in one write.
            if scheme != security::RSA_TUNNEL {
                self.sock.flush();
            }
        } else {
            if self.sock.rq_wait("security scheme", 4, 0)? {
                return Ok(false);
            }
            let scheme = self.sock.shift32();
            if scheme == security::INVALID {
                self.phase = InitPhase::SecurityReason;
                self.security_context = "authentication scheme";
                self.security_status = 1;
                return Ok(true);
            }
            self.auth_scheme = scheme;
        }

        self.phase = InitPhase::Authentication;
        log::debug!("Authenticating using scheme: {}", self.auth_scheme);
        Ok(true)
    }

    fn negotiate_authentication(&mut self) -> Result<bool, RfbError> {
        let mut auth = match self.authenticator.take() {
            Some(auth) => auth,
            None => authenticator_for(self.auth_scheme).ok_or_else(|| {
                RfbError::auth(format!("Unsupported auth scheme (scheme: {})", self.auth_scheme))
            })?,
        };

        let step = {
            let mut ctx = AuthContext {
                sock: &mut self.sock,
                credentials: &self.credentials,
                events: &self.events,
                cache: self.cache.as_mut(),
                crypto: &self.crypto,
                task: &mut self.crypto_task,
                version: self.version,
                url: self.config.url.as_deref(),
                tight_vnc: &mut self.tight_vnc,
                ra2ne: self.ra2ne.as_deref_mut(),
            };
            auth.step(&mut ctx)?
        };

        match step {
            AuthStep::Pending => {
                self.authenticator = Some(auth);
                Ok(false)
            }
            AuthStep::SecurityResult => {
                self.phase = InitPhase::SecurityResult;
                Ok(true)
            }
            AuthStep::ClientInit => {
                self.phase = InitPhase::ClientInit;
                Ok(true)
            }
            AuthStep::Chain(next) => {
                log::debug!("Scheme {} continues with scheme {next}", auth.security_type());
                self.auth_scheme = next;
                Ok(true)
            }
        }
    }

    // ── SecurityResult ───────────────────────────────────────────────────

    fn handle_security_result(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("VNC auth response", 4, 0)? {
            return Ok(false);
        }
        self.timer.cancel(TimerId::AuthTimeout);
        self.auth_timer_armed = false;

        let status = self.sock.shift32();
        if status == 0 {
            log::debug!("Authentication OK");
            self.phase = InitPhase::ClientInit;
            return Ok(true);
        }
        if self.version >= RfbVersion::V3_8 {
            self.phase = InitPhase::SecurityReason;
            self.security_context = "security result";
            self.security_status = status;
            return Ok(true);
        }
        self.events.emit(RfbEvent::SecurityFailure { status, reason: None });
        Err(RfbError::auth("Security handshake failed"))
    }

    fn handle_security_reason(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("reason length", 4, 0)? {
            return Ok(false);
        }
        let len = self.sock.shift32() as usize;
        let mut reason = String::new();
        if len > 0 {
            if self.sock.rq_wait("reason", len, 4)? {
                return Ok(false);
            }
            reason = self.sock.shift_str(len);
        }

        let status = self.security_status;
        if reason.is_empty() {
            self.events.emit(RfbEvent::SecurityFailure { status, reason: None });
            return Err(RfbError::auth(format!(
                "Security negotiation failed on {}",
                self.security_context
            )));
        }
        self.events.emit(RfbEvent::SecurityFailure {
            status,
            reason: Some(reason.clone()),
        });
        Err(RfbError::auth(format!(
            "Security negotiation failed on {} (reason: {reason})",
            self.security_context
        )))
    }

    // ── ServerInit ───────────────────────────────────────────────────────

    fn negotiate_server_init(&mut self) -> Result<bool, RfbError> {
        if self.sock.rq_wait("server initialization", 24, 0)? {
            return Ok(false);
        }
        let width = self.sock.shift16();
        let height = self.sock.shift16();
        let bpp = self.sock.shift8();
        let depth = self.sock.shift8();
        let big_endian = self.sock.shift8();
        let true_color = self.sock.shift8();
        let red_max = self.sock.shift16();
        let green_max = self.sock.shift16();
        let blue_max = self.sock.shift16();
        let red_shift = self.sock.shift8();
        let green_shift = self.sock.shift8();
        let blue_shift = self.sock.shift8();
        self.sock.skip(3);

        let name_len = self.sock.shift32() as usize;
        if self.sock.rq_wait("server init name", name_len, 24)? {
            return Ok(false);
        }
        let raw_name = self.sock.shift_vec(name_len);

        if self.tight_vnc {
            if self.sock.rq_wait("TightVNC extended server init header", 8, 24 + name_len)? {
                return Ok(false);
            }
            let server_msgs = self.sock.shift16() as usize;
            let client_msgs = self.sock.shift16() as usize;
            let encodings = self.sock.shift16() as usize;
            self.sock.skip(2);
            let caps = (server_msgs + client_msgs + encodings) * 16;
            if self.sock.rq_wait("TightVNC extended server init header", caps, 32 + name_len)? {
                return Ok(false);
            }
            // Capability lists are not used.
            self.sock.skip(caps);
        }

        // Past every backtrack point from here on.
        let (flags, name) = if self.ard.enabled {
            split_server_name(&raw_name)
        } else {
            (None, raw_name.as_slice())
        };
        let name = decode_name(name);

        log::info!(
            "Screen: {width}x{height}, bpp: {bpp}, depth: {depth}, bigEndian: {big_endian}, \
             trueColor: {true_color}, redMax: {red_max}, greenMax: {green_max}, blueMax: {blue_max}, \
             redShift: {red_shift}, greenShift: {green_shift}, blueShift: {blue_shift}"
        );

        self.set_desktop_name(name);
        self.resize_framebuffer(width, height);

        self.fb_depth = 24;
        if self.fb_name == AMT_KVM_NAME {
            log::warn!("Intel AMT KVM only supports 8/16 bit depths. Using low color mode.");
            self.fb_depth = 8;
        }

        if self.ard.enabled {
            self.ard.server_flags = flags;
            if let Some(flags) = flags {
                self.events.emit(RfbEvent::Capabilities {
                    power: flags.power_management(),
                });
                if flags.session_select_needed() {
                    log::info!(
                        "ARD init: Session Select required (fb={}x{} name={})",
                        self.fb_width,
                        self.fb_height,
                        self.fb_name
                    );
                    self.phase = InitPhase::SessionSelectInfo;
                    return Ok(true);
                }
            }
            self.ard_init();
        } else {
            messages::pixel_format(&mut self.sock, self.fb_depth, None);
            self.send_encodings();
            messages::fb_update_request(&mut self.sock, false, 0, 0, self.fb_width, self.fb_height);
        }

        self.update_state(ConnectionState::Connected);
        Ok(true)
    }

    pub(crate) fn set_desktop_name(&mut self, name: String) {
        self.fb_name = name.clone();
        self.events.emit(RfbEvent::DesktopName { name });
    }

    pub(crate) fn resize_framebuffer(&mut self, width: u16, height: u16) {
        self.fb_width = width;
        self.fb_height = height;
        self.display.resize(width, height);
        self.update_continuous_updates();
    }

    // ── Encodings ────────────────────────────────────────────────────────

    pub(crate) fn send_encodings(&mut self) {
        let encs = if self.ard.enabled {
            ard::preset_encodings(self.ard.quality_preset)
        } else {
            self.standard_encodings()
        };
        messages::client_encodings(&mut self.sock, &encs);
    }

    /// In preference order. Pixel encodings are only offered when a
    /// decoder for them is registered.
    fn standard_encodings(&self) -> Vec<i32> {
        let full_depth = self.fb_depth == 24;
        let mut pixel = vec![encoding::COPY_RECT];
        if full_depth {
            pixel.extend([encoding::ZRLE, encoding::HEXTILE, encoding::RRE, encoding::ZLIB]);
        }
        pixel.push(encoding::RAW);

        let mut encs: Vec<i32> = pixel.into_iter().filter(|&e| self.decoders.contains(e)).collect();
        encs.push(encoding::QUALITY_LEVEL_0 + i32::from(self.quality_level));
        encs.push(encoding::COMPRESS_LEVEL_0 + i32::from(self.compression_level));
        encs.extend([
            encoding::DESKTOP_SIZE,
            encoding::LAST_RECT,
            encoding::QEMU_EXTENDED_KEY_EVENT,
            encoding::QEMU_LED_EVENT,
            encoding::EXTENDED_DESKTOP_SIZE,
            encoding::XVP,
            encoding::FENCE,
            encoding::CONTINUOUS_UPDATES,
            encoding::DESKTOP_NAME,
            encoding::EXTENDED_CLIPBOARD,
            encoding::EXTENDED_MOUSE_BUTTONS,
        ]);
        if full_depth {
            encs.push(encoding::VMWARE_CURSOR);
            encs.push(encoding::CURSOR);
        }
        encs
    }
}
