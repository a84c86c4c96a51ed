//! The connection state machine.
//!
//! [`RfbEngine`] owns the framed transport and every collaborator. Its
//! owner pushes bytes in with [`RfbEngine::receive`], reports transport
//! closure, display flushes and timer expiry, and drives any crypto task
//! the handshake parks. The engine never blocks and never returns protocol
//! errors to the caller: failures go through `fail`, which logs and starts
//! the disconnect sequence.
//!
//! The handshake lives in `handshake`, the steady-state loop in
//! `message_loop`, clipboard handling in `clipboard` and the ARD handlers
//! in `ard::handlers`; all of them are `impl RfbEngine` blocks over the
//! fields declared here.

use std::sync::Arc;
use std::time::Instant;

use super::ard::{self, ArdState};
use super::collab::{Clipboard, Display, EventSink, KeyValueCache, Timer, TimerId, Transport};
use super::config::{Credentials, EngineConfig, DISCONNECT_TIMEOUT, RESIZE_RATE_LIMIT};
use super::decoders::DecoderRegistry;
use super::errors::RfbError;
use super::framed::FramedTransport;
use super::messages;
use super::security::{Authenticator, CryptoOutcome, CryptoProvider, CryptoTask, Ra2neDelegate};
use super::types::{ConnectionState, InitPhase, Rect, RfbEvent, RfbVersion};

/// X11 keysyms used by the canned key sequences.
pub mod keysym {
    pub const CONTROL_L: u32 = 0xffe3;
    pub const ALT_L: u32 = 0xffe9;
    pub const DELETE: u32 = 0xffff;
}

/// XT scancodes matching [`keysym`].
mod scancode {
    pub const CONTROL_L: u32 = 0x1d;
    pub const ALT_L: u32 = 0x38;
    pub const DELETE: u32 = 0xe053;
}

/// XVP operation codes.
pub mod xvp_op {
    pub const SHUTDOWN: u8 = 2;
    pub const REBOOT: u8 = 3;
    pub const RESET: u8 = 4;
}

/// Everything the engine talks to.
pub struct EngineDeps {
    pub transport: Box<dyn Transport>,
    pub display: Box<dyn Display>,
    pub clipboard: Box<dyn Clipboard>,
    pub cache: Box<dyn KeyValueCache>,
    pub timer: Box<dyn Timer>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub events: EventSink,
    pub ra2ne: Option<Box<dyn Ra2neDelegate>>,
}

// ── Sub-state ────────────────────────────────────────────────────────────

/// The framebuffer update in flight.
#[derive(Debug, Default)]
pub(crate) struct FbuState {
    /// Rectangles still to come in the current update.
    pub rects: u16,
    pub rect: Rect,
    /// Encoding of the rectangle being decoded; `None` between rectangles.
    pub encoding: Option<i32>,
}

/// Standard extensions the server has confirmed.
#[derive(Debug, Default)]
pub(crate) struct Extensions {
    pub qemu_ext_key: bool,
    pub extended_pointer: bool,
    pub continuous_updates: bool,
    pub continuous_updates_enabled: bool,
    pub fence: bool,
    pub set_desktop_size: bool,
    pub xvp_version: u8,
    pub num_lock: Option<bool>,
    pub caps_lock: Option<bool>,
}

#[derive(Debug, Default)]
pub(crate) struct ResizeState {
    pub screen_id: u32,
    pub screen_flags: u32,
    /// A SetDesktopSize is awaiting the server's answer.
    pub pending: bool,
    pub last_request: Option<Instant>,
    pub client_size: Option<(u16, u16)>,
}

/// Extended clipboard capabilities announced by the server.
#[derive(Debug, Default)]
pub(crate) struct ClipboardCaps {
    pub enabled: bool,
    pub formats: u32,
    pub actions: u32,
}

// ── Engine ───────────────────────────────────────────────────────────────

pub struct RfbEngine {
    pub(crate) config: EngineConfig,
    pub(crate) credentials: Credentials,

    pub(crate) sock: FramedTransport,
    pub(crate) display: Box<dyn Display>,
    pub(crate) clipboard: Box<dyn Clipboard>,
    pub(crate) cache: Box<dyn KeyValueCache>,
    pub(crate) timer: Box<dyn Timer>,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) events: EventSink,
    pub(crate) ra2ne: Option<Box<dyn Ra2neDelegate>>,
    epoch: Instant,

    // Handshake
    pub(crate) state: ConnectionState,
    pub(crate) phase: InitPhase,
    pub(crate) version: RfbVersion,
    pub(crate) auth_scheme: u32,
    pub(crate) authenticator: Option<Box<dyn Authenticator>>,
    pub(crate) crypto_task: Option<CryptoTask>,
    pub(crate) tight_vnc: bool,
    /// What the pending SecurityReason explains.
    pub(crate) security_context: &'static str,
    pub(crate) security_status: u32,
    pub(crate) auth_timer_armed: bool,
    pub(crate) clean: bool,

    // Framebuffer
    pub(crate) fb_width: u16,
    pub(crate) fb_height: u16,
    pub(crate) fb_depth: u8,
    pub(crate) fb_name: String,
    pub(crate) decoders: DecoderRegistry,
    pub(crate) fbu: FbuState,
    pub(crate) flushing: bool,

    pub(crate) view_only: bool,
    pub(crate) quality_level: u8,
    pub(crate) compression_level: u8,
    pub(crate) ext: Extensions,
    pub(crate) resize: ResizeState,
    pub(crate) clipboard_caps: ClipboardCaps,
    /// Last text pushed by the local side, kept for `force_clipboard_paste`.
    pub(crate) clipboard_text: Option<String>,

    pub(crate) ard: ArdState,
}

impl std::fmt::Debug for RfbEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RfbEngine")
            .field("state", &self.state)
            .field("phase", &self.phase)
            .field("version", &self.version)
            .field("auth_scheme", &self.auth_scheme)
            .field("fb", &(self.fb_width, self.fb_height, self.fb_depth))
            .field("ard", &self.ard.enabled)
            .finish_non_exhaustive()
    }
}

impl RfbEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let EngineDeps {
            transport,
            display,
            clipboard,
            cache,
            timer,
            crypto,
            events,
            ra2ne,
        } = deps;
        let epoch = timer.now();
        Self {
            credentials: config.credentials.clone(),
            view_only: config.view_only,
            quality_level: config.quality_level.min(9),
            compression_level: config.compression_level.min(9),
            ard: ArdState::new(config.ard_quality_preset),
            config,
            sock: FramedTransport::new(transport),
            display,
            clipboard,
            cache,
            timer,
            crypto,
            events,
            ra2ne,
            epoch,
            state: ConnectionState::Unstarted,
            phase: InitPhase::ProtocolVersion,
            version: RfbVersion::V3_8,
            auth_scheme: 0,
            authenticator: None,
            crypto_task: None,
            tight_vnc: false,
            security_context: "unknown",
            security_status: 0,
            auth_timer_armed: false,
            clean: true,
            fb_width: 0,
            fb_height: 0,
            fb_depth: 24,
            fb_name: String::new(),
            decoders: DecoderRegistry::with_defaults(),
            fbu: FbuState::default(),
            flushing: false,
            ext: Extensions::default(),
            resize: ResizeState::default(),
            clipboard_caps: ClipboardCaps::default(),
            clipboard_text: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn phase(&self) -> InitPhase {
        self.phase
    }

    pub fn version(&self) -> RfbVersion {
        self.version
    }

    /// Negotiated security type, 0 before Security completes.
    pub fn auth_scheme(&self) -> u32 {
        self.auth_scheme
    }

    pub fn framebuffer_size(&self) -> (u16, u16) {
        (self.fb_width, self.fb_height)
    }

    pub fn desktop_name(&self) -> &str {
        &self.fb_name
    }

    pub fn is_ard(&self) -> bool {
        self.ard.enabled
    }

    pub fn is_encrypted(&self) -> bool {
        self.sock.is_encrypted()
    }

    pub fn view_only(&self) -> bool {
        self.view_only
    }

    pub fn set_view_only(&mut self, view_only: bool) {
        self.view_only = view_only;
    }

    /// Caps lock and num lock as last reported by the server.
    pub fn lock_state(&self) -> (Option<bool>, Option<bool>) {
        (self.ext.caps_lock, self.ext.num_lock)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn connect(&mut self) {
        self.update_state(ConnectionState::Connecting);
        if self.state == ConnectionState::Connecting {
            log::info!("Connecting, waiting for server version");
            self.phase = InitPhase::ProtocolVersion;
        }
    }

    pub fn disconnect(&mut self) {
        self.update_state(ConnectionState::Disconnecting);
        if let Some(delegate) = self.ra2ne.as_mut() {
            delegate.disconnect();
        }
    }

    /// Bytes read from the transport.
    pub fn receive(&mut self, data: &[u8]) {
        match self.sock.push_incoming(data) {
            Ok(true) => self.handle_message(),
            Ok(false) => {}
            Err(e) => self.abort(e),
        }
    }

    /// The transport went away, either on its own or after `close`.
    pub fn transport_closed(&mut self, code: u16, reason: &str) {
        let detail = match (code, reason) {
            (0, _) => String::new(),
            (c, "") => format!("(code: {c})"),
            (c, r) => format!("(code: {c}, reason: {r})"),
        };
        match self.state {
            ConnectionState::Connecting => {
                self.fail(RfbError::protocol(format!("Connection closed {detail}")));
            }
            ConnectionState::Connected => {
                self.update_state(ConnectionState::Disconnecting);
                self.update_state(ConnectionState::Disconnected);
            }
            ConnectionState::Disconnecting => self.update_state(ConnectionState::Disconnected),
            ConnectionState::Disconnected => {
                self.fail(RfbError::protocol(format!(
                    "Unexpected server disconnect when already disconnected {detail}"
                )));
            }
            ConnectionState::Unstarted => {
                self.fail(RfbError::protocol(format!(
                    "Unexpected server disconnect before connecting {detail}"
                )));
            }
        }
    }

    /// The display finished presenting; resume a deferred update.
    pub fn display_flushed(&mut self) {
        self.flushing = false;
        if self.sock.rq_len() > 0 {
            self.handle_message();
        }
    }

    pub fn timer_fired(&mut self, id: TimerId) {
        match id {
            TimerId::Disconnect => {
                if self.state == ConnectionState::Disconnecting {
                    log::error!("Disconnection timed out.");
                    self.update_state(ConnectionState::Disconnected);
                }
            }
            TimerId::AuthTimeout => {
                self.auth_timer_armed = false;
                if self.state == ConnectionState::Connecting {
                    self.fail(RfbError::Timeout(format!(
                        "Authentication timed out in {:?}",
                        self.phase
                    )));
                }
            }
            TimerId::ArdInitRetry => self.ard_init_retry(),
            TimerId::ArdFullUpdateRetry => self.ard_full_update_retry(),
            TimerId::FreezeWatchdog => self.freeze_watchdog(),
            TimerId::ResizeDebounce => self.request_remote_resize(),
        }
    }

    // ── Crypto hand-off ──────────────────────────────────────────────────

    /// Crypto work parked by the current authentication scheme. The owner
    /// runs it and passes the result to [`Self::crypto_complete`].
    pub fn take_crypto_task(&mut self) -> Option<CryptoTask> {
        self.crypto_task.take()
    }

    pub fn crypto_complete(&mut self, result: Result<CryptoOutcome, RfbError>) {
        if self.state != ConnectionState::Connecting {
            log::debug!("Dropping crypto result in state {}", self.state);
            return;
        }
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        if let Some(key) = outcome.dh_key() {
            self.ard.dh_key = Some(key);
        }
        let delivered = match self.authenticator.as_mut() {
            Some(auth) => auth.crypto_complete(outcome),
            None => Err(RfbError::Internal("crypto result without an active scheme".into())),
        };
        if let Err(e) = delivered {
            self.fail(e);
            return;
        }
        self.resume_handshake();
    }

    // ── Caller input during the handshake ────────────────────────────────

    pub fn send_credentials(&mut self, credentials: Credentials) {
        self.credentials.merge(credentials);
        self.resume_handshake();
    }

    /// The user accepted the identity shown in `ServerVerification`.
    pub fn approve_server(&mut self) {
        if let Some(delegate) = self.ra2ne.as_mut() {
            delegate.approve_server();
        }
        self.resume_handshake();
    }

    fn resume_handshake(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.handle_message_forced();
        }
    }

    // ── State transitions ────────────────────────────────────────────────

    pub(crate) fn update_state(&mut self, state: ConnectionState) {
        use ConnectionState::*;

        let old = self.state;
        if state == old {
            log::debug!("Already in state '{state}', ignoring");
            return;
        }
        if old == Disconnected {
            log::error!("Tried changing state of a disconnected RFB object");
            return;
        }
        let legal = match state {
            Connecting => old == Unstarted,
            Connected => old == Connecting,
            Disconnecting => matches!(old, Connecting | Connected),
            Disconnected => old == Disconnecting,
            Unstarted => false,
        };
        if !legal {
            log::error!("Bad transition to {state} state, current state is: {old}");
            return;
        }

        if old == Disconnecting {
            self.timer.cancel(TimerId::Disconnect);
        }
        self.state = state;
        log::debug!("New state '{state}', was '{old}'.");

        match state {
            Connected => {
                self.events.emit(RfbEvent::Connect);
                if self.ard.enabled {
                    self.arm_freeze_watchdog();
                }
            }
            Disconnecting => {
                self.cancel_protocol_timers();
                self.ard.reset_session();
                self.sock.close();
                self.timer.arm(TimerId::Disconnect, DISCONNECT_TIMEOUT);
            }
            Disconnected => {
                self.events.emit(RfbEvent::Disconnect { clean: self.clean });
            }
            _ => {}
        }
    }

    fn cancel_protocol_timers(&mut self) {
        for id in [
            TimerId::AuthTimeout,
            TimerId::ArdInitRetry,
            TimerId::ArdFullUpdateRetry,
            TimerId::FreezeWatchdog,
            TimerId::ResizeDebounce,
        ] {
            self.timer.cancel(id);
        }
        self.auth_timer_armed = false;
    }

    /// Log the failure with the current phase and start disconnecting.
    pub(crate) fn fail(&mut self, err: RfbError) {
        match self.state {
            ConnectionState::Connecting => {
                log::error!("Failed when connecting ({:?}): {err}", self.phase)
            }
            ConnectionState::Connected => log::error!("Failed when connected: {err}"),
            ConnectionState::Disconnecting => log::error!("Failed when disconnecting: {err}"),
            ConnectionState::Disconnected => {
                log::error!("RFB failure on a disconnected connection: {err}")
            }
            ConnectionState::Unstarted => log::error!("Failed before connecting: {err}"),
        }
        self.clean = false;
        self.update_state(ConnectionState::Disconnecting);
    }

    /// Route a step error. Integrity failures tear the connection down
    /// without the generic failure path.
    pub(crate) fn abort(&mut self, err: RfbError) {
        if let RfbError::Integrity(_) = err {
            log::error!("{err}");
            self.clean = false;
            self.sock.close();
            if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
                self.update_state(ConnectionState::Disconnecting);
            }
            self.update_state(ConnectionState::Disconnected);
            return;
        }
        self.fail(err);
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    pub(crate) fn handle_message(&mut self) {
        if self.sock.rq_len() == 0 {
            log::warn!("handle_message called on an empty receive queue");
            return;
        }
        self.handle_message_forced();
    }

    /// Like `handle_message`, but also runs with an empty queue so that a
    /// handshake step parked on caller input can continue.
    fn handle_message_forced(&mut self) {
        match self.state {
            ConnectionState::Disconnected => log::error!("Got data while disconnected"),
            ConnectionState::Connected => {
                loop {
                    if self.flushing {
                        break;
                    }
                    match self.normal_msg() {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            self.abort(e);
                            break;
                        }
                    }
                    if self.sock.rq_len() == 0 {
                        break;
                    }
                }
                // An in-band re-handshake drops back to Connecting.
                if self.state == ConnectionState::Connecting && self.sock.rq_len() > 0 {
                    self.handle_message();
                }
            }
            ConnectionState::Connecting => {
                while self.state == ConnectionState::Connecting {
                    match self.init_msg() {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            self.abort(e);
                            break;
                        }
                    }
                }
                if self.state == ConnectionState::Connected && self.sock.rq_len() > 0 {
                    self.handle_message();
                }
            }
            ConnectionState::Unstarted | ConnectionState::Disconnecting => {
                log::debug!("Ignoring data in state {}", self.state);
            }
        }
    }

    // ── Input ────────────────────────────────────────────────────────────

    fn can_send_input(&self) -> bool {
        self.state == ConnectionState::Connected && !self.view_only
    }

    /// Send a key. `scancode` is an XT scancode used when the server
    /// supports QEMU extended key events; `down = None` sends a press
    /// followed by a release.
    pub fn send_key(&mut self, keysym: u32, scancode: Option<u32>, down: Option<bool>) {
        if !self.can_send_input() {
            return;
        }
        let Some(down) = down else {
            self.send_key(keysym, scancode, Some(true));
            self.send_key(keysym, scancode, Some(false));
            return;
        };

        if self.ard.encrypts_key_events() {
            self.send_ard_encrypted_key(keysym, down);
            return;
        }

        if self.ext.qemu_ext_key {
            if let Some(code) = scancode {
                log::debug!("Sending key (down: {down}): keysym {keysym:#x}, scancode {code:#x}");
                messages::qemu_extended_key_event(&mut self.sock, keysym, down, code);
                return;
            }
        }
        if keysym == 0 {
            return;
        }
        log::debug!("Sending keysym (down: {down}): {keysym:#x}");
        messages::key_event(&mut self.sock, keysym, down);
    }

    fn send_ard_encrypted_key(&mut self, keysym: u32, down: bool) {
        let Some(key) = self.ard.dh_key else {
            return;
        };
        let elapsed = self.timer.now().saturating_duration_since(self.epoch);
        let timestamp = (elapsed.as_micros() & 0xffff_ffff) as u32;
        match ard::encrypt_key_event(&key, keysym, down, timestamp) {
            Ok(block) => messages::ard_encrypted_event(&mut self.sock, 0, &block),
            Err(e) => log::error!("ARD: failed to encrypt key event: {e}"),
        }
    }

    pub fn send_ctrl_alt_del(&mut self) {
        if !self.can_send_input() {
            return;
        }
        log::info!("Sending Ctrl-Alt-Del");
        let keys = [
            (keysym::CONTROL_L, scancode::CONTROL_L),
            (keysym::ALT_L, scancode::ALT_L),
            (keysym::DELETE, scancode::DELETE),
        ];
        for (sym, code) in keys {
            self.send_key(sym, Some(code), Some(true));
        }
        for (sym, code) in keys.into_iter().rev() {
            self.send_key(sym, Some(code), Some(false));
        }
    }

    /// Pointer position and button mask. Bits 7 and 8 need the
    /// ExtendedMouseButtons extension.
    pub fn send_pointer(&mut self, x: u16, y: u16, mask: u16) {
        if !self.can_send_input() {
            return;
        }
        if self.ext.extended_pointer && mask & 0x180 != 0 {
            if let Err(e) = messages::extended_pointer_event(&mut self.sock, x, y, mask) {
                log::error!("{e}");
            }
            return;
        }
        messages::pointer_event(&mut self.sock, x, y, mask);
    }

    // ── XVP ──────────────────────────────────────────────────────────────

    fn xvp_op(&mut self, ver: u8, op: u8) {
        if self.state != ConnectionState::Connected || self.ext.xvp_version < ver {
            return;
        }
        log::info!("Sending XVP operation {op} (version {ver})");
        messages::xvp_op(&mut self.sock, ver, op);
    }

    pub fn machine_shutdown(&mut self) {
        self.xvp_op(1, xvp_op::SHUTDOWN);
    }

    pub fn machine_reboot(&mut self) {
        self.xvp_op(1, xvp_op::REBOOT);
    }

    pub fn machine_reset(&mut self) {
        self.xvp_op(1, xvp_op::RESET);
    }

    // ── Updates and encodings ────────────────────────────────────────────

    /// Ask for the whole screen again.
    pub fn request_full_update(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if self.ard.enabled {
            self.request_ard_full_update();
        } else {
            messages::fb_update_request(&mut self.sock, false, 0, 0, self.fb_width, self.fb_height);
        }
    }

    pub fn set_quality_level(&mut self, level: u8) {
        if level > 9 {
            log::error!("qualityLevel must be an integer between 0 and 9");
            return;
        }
        if self.quality_level == level {
            return;
        }
        self.quality_level = level;
        if self.state == ConnectionState::Connected {
            self.send_encodings();
        }
    }

    pub fn set_compression_level(&mut self, level: u8) {
        if level > 9 {
            log::error!("compressionLevel must be an integer between 0 and 9");
            return;
        }
        if self.compression_level == level {
            return;
        }
        self.compression_level = level;
        if self.state == ConnectionState::Connected {
            self.send_encodings();
        }
    }

    // ── Remote resize ────────────────────────────────────────────────────

    pub fn set_resize_session(&mut self, enabled: bool) {
        self.config.resize_session = enabled;
        if enabled {
            self.request_remote_resize();
        }
    }

    /// Local viewport size; followed by the server when `resize_session`
    /// is on and the server supports SetDesktopSize.
    pub fn set_client_size(&mut self, width: u16, height: u16) {
        self.resize.client_size = Some((width, height));
        self.request_remote_resize();
    }

    pub(crate) fn request_remote_resize(&mut self) {
        if self.state != ConnectionState::Connected
            || !self.config.resize_session
            || self.view_only
            || !self.ext.set_desktop_size
            || self.resize.pending
        {
            return;
        }
        let Some((width, height)) = self.resize.client_size else {
            return;
        };
        if width == 0 || height == 0 || (width, height) == (self.fb_width, self.fb_height) {
            return;
        }
        let now = self.timer.now();
        if let Some(last) = self.resize.last_request {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < RESIZE_RATE_LIMIT {
                self.timer.arm(TimerId::ResizeDebounce, RESIZE_RATE_LIMIT - elapsed);
                return;
            }
        }
        self.resize.pending = true;
        self.resize.last_request = Some(now);
        messages::set_desktop_size(
            &mut self.sock,
            width,
            height,
            self.resize.screen_id,
            self.resize.screen_flags,
        );
        log::debug!("Requested new desktop size: {width}x{height}");
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::rfb::collab::MemoryCache;
    use crate::rfb::mock::{MockClipboard, MockDisplay, MockTimer, MockTransport};
    use crate::rfb::security::LocalCryptoProvider;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    /// An engine wired to mocks, plus handles to inspect them.
    pub struct Rig {
        pub engine: RfbEngine,
        pub wire: MockTransport,
        pub display: MockDisplay,
        pub clipboard: MockClipboard,
        pub timer: MockTimer,
        pub rx: UnboundedReceiver<RfbEvent>,
    }

    impl Rig {
        pub fn new(config: EngineConfig) -> Self {
            let wire = MockTransport::new();
            let display = MockDisplay::new(0, 0);
            let clipboard = MockClipboard::default();
            let timer = MockTimer::new();
            let (tx, rx) = unbounded_channel();
            let engine = RfbEngine::new(
                config,
                EngineDeps {
                    transport: Box::new(wire.clone()),
                    display: Box::new(display.clone()),
                    clipboard: Box::new(clipboard.clone()),
                    cache: Box::new(MemoryCache::new()),
                    timer: Box::new(timer.clone()),
                    crypto: Arc::new(LocalCryptoProvider),
                    events: EventSink::new(tx),
                    ra2ne: None,
                },
            );
            Self {
                engine,
                wire,
                display,
                clipboard,
                timer,
                rx,
            }
        }

        pub fn feed(&mut self, bytes: &[u8]) {
            self.engine.receive(bytes);
        }

        pub fn sent(&self) -> Vec<u8> {
            self.wire.take_sent()
        }

        pub fn events(&mut self) -> Vec<RfbEvent> {
            let mut out = Vec::new();
            while let Ok(ev) = self.rx.try_recv() {
                out.push(ev);
            }
            out
        }

        /// Run the parked crypto task and hand the result back.
        pub fn run_crypto(&mut self) {
            let task = self.engine.take_crypto_task().expect("no crypto task parked");
            let result = futures::executor::block_on(task);
            self.engine.crypto_complete(result);
        }

        /// Handshake a plain 3.8 server with None security up to Connected.
        pub fn connect_plain(&mut self, width: u16, height: u16) {
            self.engine.connect();
            self.feed(b"RFB 003.008\n");
            assert_eq!(self.sent(), b"RFB 003.008\n");
            self.feed(&[1, 1]);
            self.feed(&[0, 0, 0, 0]);
            self.feed(&server_init(width, height, b"test desktop"));
            assert_eq!(self.engine.state(), ConnectionState::Connected);
            self.sent();
            self.events();
        }
    }

    /// ServerInit for a 32 bpp true-colour screen.
    pub fn server_init(width: u16, height: u16, name: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend(width.to_be_bytes());
        b.extend(height.to_be_bytes());
        b.extend([32, 24, 0, 1, 0, 255, 0, 255, 0, 255, 16, 8, 0, 0, 0, 0]);
        b.extend((name.len() as u32).to_be_bytes());
        b.extend(name);
        b
    }
}
