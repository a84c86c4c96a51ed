//! Tokio session driver.
//!
//! Owns the TCP socket, the timers and the crypto hand-off for one
//! [`RfbEngine`], forwards [`SessionCommand`]s to it, and reconnects after
//! an unexpected loss when `auto_reconnect` is set.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::collab::{EventClipboard, EventSink, KeyValueCache, MemoryCache, Timer, TimerId, Transport};
use super::config::{
    ArdControlMode, Credentials, QualityPreset, SessionConfig, CONNECT_TIMEOUT, MAX_RECONNECT_ATTEMPTS,
    RECONNECT_DELAY,
};
use super::engine::{EngineDeps, RfbEngine};
use super::errors::RfbError;
use super::framebuffer::SharedFramebuffer;
use super::security::LocalCryptoProvider;
use super::types::{ConnectionState, RfbEvent};

/// Size of the command channel buffer.
const COMMAND_CHANNEL_SIZE: usize = 128;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on an idle wait when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Requests forwarded to the engine of a running session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Key {
        keysym: u32,
        scancode: Option<u32>,
        down: Option<bool>,
    },
    Pointer {
        x: u16,
        y: u16,
        mask: u16,
    },
    CtrlAltDel,
    ClipboardPaste(String),
    ForceClipboardPaste(String),
    RequestFullUpdate,
    SetClientSize {
        width: u16,
        height: u16,
    },
    SetViewOnly(bool),
    SetQualityLevel(u8),
    SetCompressionLevel(u8),
    Credentials(Credentials),
    ApproveServer,
    MachineShutdown,
    MachineReboot,
    MachineReset,
    SetQualityPreset(QualityPreset),
    SetControlMode(ArdControlMode),
    CurtainLock {
        message: Option<String>,
    },
    CurtainUnlock,
    SelectDisplay {
        combine_all: bool,
        display_id: u32,
    },
    EnableClipboardSync(bool),
    RequestRemoteClipboard,
    Disconnect,
}

/// Handle returned to the caller after launching a session.
pub struct SessionHandle {
    /// Unique session identifier.
    pub session_id: String,
    /// Send commands to the running session.
    pub command_tx: mpsc::Sender<SessionCommand>,
    /// Engine events, across reconnects.
    pub event_rx: mpsc::UnboundedReceiver<RfbEvent>,
    /// The remote desktop as last drawn.
    pub framebuffer: SharedFramebuffer,
    /// Tokio join handle for the session task.
    pub join_handle: tokio::task::JoinHandle<()>,
}

/// Launch a new session in a background task.
pub fn launch_session(config: SessionConfig) -> SessionHandle {
    let session_id = Uuid::new_v4().to_string();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();
    let framebuffer = SharedFramebuffer::default();

    let sid = session_id.clone();
    let fb = framebuffer.clone();
    let join_handle = tokio::spawn(async move {
        session_task(sid, config, cmd_rx, EventSink::new(evt_tx), fb).await;
    });

    SessionHandle {
        session_id,
        command_tx: cmd_tx,
        event_rx: evt_rx,
        framebuffer,
        join_handle,
    }
}

// ── Collaborators ────────────────────────────────────────────────────────

/// Engine-side writer: bytes are queued for the session loop to write.
struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

impl Transport for ChannelTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session loop gone"))
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Deadlines for the engine's one-shot timers, polled by the session loop.
#[derive(Debug, Clone, Default)]
struct SessionTimers(Arc<Mutex<HashMap<TimerId, Instant>>>);

impl SessionTimers {
    fn lock(&self) -> MutexGuard<'_, HashMap<TimerId, Instant>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock().values().min().copied()
    }

    fn take_expired(&self, now: Instant) -> Vec<TimerId> {
        let mut armed = self.lock();
        let due: Vec<TimerId> = armed.iter().filter(|(_, &at)| at <= now).map(|(&id, _)| id).collect();
        for id in &due {
            armed.remove(id);
        }
        due
    }
}

impl Timer for SessionTimers {
    fn arm(&mut self, id: TimerId, after: Duration) {
        let at = self.now() + after;
        self.lock().insert(id, at);
    }

    fn cancel(&mut self, id: TimerId) {
        self.lock().remove(&id);
    }

    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Key cache shared by every connection of one session, so a trusted
/// RSA-tunnel key survives reconnects.
#[derive(Debug, Clone, Default)]
struct SessionCache(Arc<Mutex<MemoryCache>>);

impl SessionCache {
    fn lock(&self) -> MutexGuard<'_, MemoryCache> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueCache for SessionCache {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key)
    }

    fn set(&mut self, key: &str, value: String) {
        self.lock().set(key, value);
    }

    fn remove(&mut self, key: &str) {
        self.lock().remove(key);
    }
}

// ── Session task ─────────────────────────────────────────────────────────

/// How one connection ended.
#[derive(Debug, Clone, Copy)]
struct SessionEnd {
    user_requested: bool,
    clean: bool,
    /// The peer closed the socket or it failed underneath us.
    lost: bool,
}

impl SessionEnd {
    fn should_reconnect(&self) -> bool {
        !self.user_requested && (self.lost || !self.clean)
    }
}

/// Runs connections until a clean end, a user disconnect, or the
/// reconnect budget is spent.
async fn session_task(
    session_id: String,
    config: SessionConfig,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    events: EventSink,
    framebuffer: SharedFramebuffer,
) {
    let cache = SessionCache::default();
    let mut attempt = 0u32;

    loop {
        log::info!("[RFB {session_id}] Connecting to {}", config.address());
        let retry = match run_session(&session_id, &config, &mut cmd_rx, &events, &framebuffer, &cache).await {
            Ok(end) => {
                log::info!(
                    "[RFB {session_id}] Session ended (clean: {}, lost: {}, requested: {})",
                    end.clean,
                    end.lost,
                    end.user_requested
                );
                if end.clean && !end.lost {
                    attempt = 0;
                }
                end.should_reconnect()
            }
            Err(e) => {
                log::error!("[RFB {session_id}] Session error: {e}");
                true
            }
        };

        if !retry || !config.auto_reconnect {
            break;
        }
        if attempt >= MAX_RECONNECT_ATTEMPTS {
            log::error!("[RFB {session_id}] Giving up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts");
            break;
        }
        attempt += 1;
        log::info!("[RFB {session_id}] Reconnecting ({attempt}/{MAX_RECONNECT_ATTEMPTS})");

        // A disconnect request during the back-off ends the session.
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            cmd = cmd_rx.recv() => {
                if matches!(cmd, None | Some(SessionCommand::Disconnect)) {
                    log::info!("[RFB {session_id}] Shutdown requested while reconnecting");
                    break;
                }
            }
        }
    }
}

/// One TCP connection driven through the engine until it is disconnected.
async fn run_session(
    session_id: &str,
    config: &SessionConfig,
    cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    events: &EventSink,
    framebuffer: &SharedFramebuffer,
    cache: &SessionCache,
) -> Result<SessionEnd, RfbError> {
    let addr = config.address();
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| RfbError::Timeout(format!("TCP connect to {addr} timed out")))??;
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("[RFB {session_id}] set_nodelay failed: {e}");
    }
    let (mut reader, mut writer) = stream.into_split();
    log::info!("[RFB {session_id}] TCP connected to {addr}");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));
    let timers = SessionTimers::default();

    let mut engine = RfbEngine::new(
        config.engine.clone(),
        EngineDeps {
            transport: Box::new(ChannelTransport {
                tx: out_tx,
                open: open.clone(),
            }),
            display: Box::new(framebuffer.clone()),
            clipboard: Box::new(EventClipboard),
            cache: Box::new(cache.clone()),
            timer: Box::new(timers.clone()),
            crypto: Arc::new(LocalCryptoProvider::new()),
            events: events.clone(),
            ra2ne: None,
        },
    );

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut reading = true;
    let mut end = SessionEnd {
        user_requested: false,
        clean: true,
        lost: false,
    };

    engine.connect();
    loop {
        while let Some(task) = engine.take_crypto_task() {
            let result = task.await;
            engine.crypto_complete(result);
        }

        while let Ok(data) = out_rx.try_recv() {
            if let Err(e) = write_out(&mut writer, &data).await {
                log::warn!("[RFB {session_id}] Write failed: {e}");
                open.store(false, Ordering::SeqCst);
                end.lost = true;
                engine.transport_closed(1006, &e.to_string());
                break;
            }
        }

        // The engine closed its side; finish the shutdown it started.
        if !open.load(Ordering::SeqCst) && engine.state() == ConnectionState::Disconnecting {
            if let Err(e) = writer.shutdown().await {
                log::debug!("[RFB {session_id}] Socket shutdown: {e}");
            }
            engine.transport_closed(0, "");
        }
        if engine.state() == ConnectionState::Disconnected {
            break;
        }

        let wake = timers
            .next_deadline()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_WAIT);

        tokio::select! {
            read = reader.read(&mut buf), if reading => match read {
                Ok(0) => {
                    log::info!("[RFB {session_id}] Server closed the connection");
                    reading = false;
                    end.lost = engine.state() != ConnectionState::Disconnecting;
                    open.store(false, Ordering::SeqCst);
                    engine.transport_closed(0, "");
                }
                Ok(n) => engine.receive(&buf[..n]),
                Err(e) => {
                    log::warn!("[RFB {session_id}] Read failed: {e}");
                    reading = false;
                    end.lost = true;
                    open.store(false, Ordering::SeqCst);
                    engine.transport_closed(1006, &e.to_string());
                }
            },
            cmd = cmd_rx.recv() => {
                let cmd = cmd.unwrap_or(SessionCommand::Disconnect);
                if matches!(cmd, SessionCommand::Disconnect) {
                    log::info!("[RFB {session_id}] Disconnect requested");
                    end.user_requested = true;
                }
                apply_command(&mut engine, cmd);
            }
            _ = tokio::time::sleep_until(wake) => {
                for id in timers.take_expired(timers.now()) {
                    log::debug!("[RFB {session_id}] Timer {id:?} fired");
                    engine.timer_fired(id);
                }
            }
        }
    }

    end.clean = engine.clean;
    Ok(end)
}

async fn write_out(writer: &mut OwnedWriteHalf, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

fn apply_command(engine: &mut RfbEngine, cmd: SessionCommand) {
    match cmd {
        SessionCommand::Key { keysym, scancode, down } => engine.send_key(keysym, scancode, down),
        SessionCommand::Pointer { x, y, mask } => engine.send_pointer(x, y, mask),
        SessionCommand::CtrlAltDel => engine.send_ctrl_alt_del(),
        SessionCommand::ClipboardPaste(text) => engine.clipboard_paste_from(&text),
        SessionCommand::ForceClipboardPaste(text) => engine.force_clipboard_paste(&text),
        SessionCommand::RequestFullUpdate => engine.request_full_update(),
        SessionCommand::SetClientSize { width, height } => engine.set_client_size(width, height),
        SessionCommand::SetViewOnly(view_only) => engine.set_view_only(view_only),
        SessionCommand::SetQualityLevel(level) => engine.set_quality_level(level),
        SessionCommand::SetCompressionLevel(level) => engine.set_compression_level(level),
        SessionCommand::Credentials(credentials) => engine.send_credentials(credentials),
        SessionCommand::ApproveServer => engine.approve_server(),
        SessionCommand::MachineShutdown => engine.machine_shutdown(),
        SessionCommand::MachineReboot => engine.machine_reboot(),
        SessionCommand::MachineReset => engine.machine_reset(),
        SessionCommand::SetQualityPreset(preset) => engine.set_quality_preset(preset),
        SessionCommand::SetControlMode(mode) => engine.set_ard_control_mode(mode),
        SessionCommand::CurtainLock { message } => engine.ard_curtain_lock(message.as_deref()),
        SessionCommand::CurtainUnlock => engine.ard_curtain_unlock(),
        SessionCommand::SelectDisplay { combine_all, display_id } => engine.select_display(combine_all, display_id),
        SessionCommand::EnableClipboardSync(enabled) => engine.enable_clipboard_sync(enabled),
        SessionCommand::RequestRemoteClipboard => engine.request_remote_clipboard(),
        SessionCommand::Disconnect => engine.disconnect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::collab::Display;
    use crate::rfb::engine::test_util::server_init;
    use tokio::net::TcpListener;

    async fn next_event(handle: &mut SessionHandle) -> RfbEvent {
        tokio::time::timeout(Duration::from_secs(5), handle.event_rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[test]
    fn reconnect_policy() {
        let end = |user_requested, clean, lost| SessionEnd {
            user_requested,
            clean,
            lost,
        };
        assert!(!end(true, false, true).should_reconnect());
        assert!(!end(false, true, false).should_reconnect());
        assert!(end(false, true, true).should_reconnect());
        assert!(end(false, false, false).should_reconnect());
    }

    #[test]
    fn timers_expire_in_deadline_order() {
        let mut t = SessionTimers::default();
        assert!(t.next_deadline().is_none());
        t.arm(TimerId::AuthTimeout, Duration::from_secs(10));
        t.arm(TimerId::ArdInitRetry, Duration::from_millis(50));
        let first = t.next_deadline().unwrap();
        assert_eq!(t.take_expired(first), vec![TimerId::ArdInitRetry]);
        t.cancel(TimerId::AuthTimeout);
        assert!(t.next_deadline().is_none());
    }

    #[test]
    fn closed_transport_rejects_writes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = ChannelTransport {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        };
        t.send(b"abc").unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"abc");
        t.close();
        assert!(!t.is_open());
        assert!(t.send(b"x").is_err());
    }

    #[test]
    fn cache_is_shared_between_clones() {
        let a = SessionCache::default();
        let mut b = a.clone();
        b.set("k", "v".into());
        assert_eq!(a.get("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn connects_and_disconnects_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"RFB 003.008\n").await.unwrap();
            let mut version = [0u8; 12];
            s.read_exact(&mut version).await.unwrap();
            assert_eq!(&version, b"RFB 003.008\n");
            s.write_all(&[1, 1]).await.unwrap();
            let mut one = [0u8; 1];
            s.read_exact(&mut one).await.unwrap();
            assert_eq!(one[0], 1);
            s.write_all(&[0, 0, 0, 0]).await.unwrap();
            s.read_exact(&mut one).await.unwrap();
            assert_eq!(one[0], 1, "shared ClientInit");
            s.write_all(&server_init(64, 48, b"runner")).await.unwrap();
            let mut rest = Vec::new();
            let _ = s.read_to_end(&mut rest).await;
            rest
        });

        let mut handle = launch_session(SessionConfig {
            host: "127.0.0.1".into(),
            port,
            auto_reconnect: false,
            ..SessionConfig::default()
        });
        loop {
            if next_event(&mut handle).await == RfbEvent::Connect {
                break;
            }
        }
        assert_eq!(handle.framebuffer.lock().width(), 64);

        handle.command_tx.send(SessionCommand::Disconnect).await.unwrap();
        loop {
            if let RfbEvent::Disconnect { clean } = next_event(&mut handle).await {
                assert!(clean);
                break;
            }
        }
        tokio::time::timeout(Duration::from_secs(5), handle.join_handle)
            .await
            .unwrap()
            .unwrap();

        // SetPixelFormat opens the post-init burst.
        let rest = server.await.unwrap();
        assert_eq!(rest[0], 0);
    }

    #[tokio::test]
    async fn refused_connection_ends_without_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handle = launch_session(SessionConfig {
            host: "127.0.0.1".into(),
            port,
            auto_reconnect: false,
            ..SessionConfig::default()
        });
        tokio::time::timeout(Duration::from_secs(5), handle.join_handle)
            .await
            .unwrap()
            .unwrap();
    }
}
