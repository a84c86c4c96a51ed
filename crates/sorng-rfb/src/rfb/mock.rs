//! Test doubles for every collaborator trait.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::collab::{Clipboard, Display, Timer, TimerId, Transport};
use super::framebuffer::SharedFramebuffer;
use super::types::Cursor;

// ── Transport ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<u8>>>,
    open: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(AtomicBool::new(true)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Drain everything written so far.
    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn is_open_now(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.sent.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// ── Display ──────────────────────────────────────────────────────────────

/// Framebuffer-backed display whose `pending` state the test controls.
#[derive(Debug, Clone)]
pub struct MockDisplay {
    pub fb: SharedFramebuffer,
    pending: Arc<AtomicBool>,
    flushes: Arc<AtomicUsize>,
}

impl MockDisplay {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            fb: SharedFramebuffer::new(width, height),
            pending: Arc::new(AtomicBool::new(false)),
            flushes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn pixel(&self, x: u16, y: u16) -> Option<[u8; 4]> {
        self.fb.lock().pixel(x, y)
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.fb.lock().cursor().cloned()
    }

    pub fn system_cursor(&self) -> Option<&'static str> {
        self.fb.lock().system_cursor()
    }
}

impl Display for MockDisplay {
    fn resize(&mut self, width: u16, height: u16) {
        self.fb.resize(width, height);
    }

    fn width(&self) -> u16 {
        self.fb.width()
    }

    fn height(&self) -> u16 {
        self.fb.height()
    }

    fn fill_rect(&mut self, x: u16, y: u16, w: u16, h: u16, color: [u8; 4]) {
        self.fb.fill_rect(x, y, w, h, color);
    }

    fn copy_image(&mut self, src_x: u16, src_y: u16, x: u16, y: u16, w: u16, h: u16) {
        self.fb.copy_image(src_x, src_y, x, y, w, h);
    }

    fn blit_image(&mut self, x: u16, y: u16, w: u16, h: u16, rgba: &[u8]) {
        self.fb.blit_image(x, y, w, h, rgba);
    }

    fn flip(&mut self) {
        self.fb.flip();
    }

    fn pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn flush(&mut self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn set_cursor(&mut self, cursor: &Cursor) {
        self.fb.set_cursor(cursor);
    }

    fn set_system_cursor(&mut self, name: &'static str) {
        self.fb.set_system_cursor(name);
    }
}

// ── Clipboard ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MockClipboard {
    pub written: Arc<Mutex<Vec<String>>>,
    pub accept: bool,
}

impl MockClipboard {
    pub fn accepting() -> Self {
        Self {
            written: Arc::default(),
            accept: true,
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

impl Clipboard for MockClipboard {
    fn write_text(&mut self, text: &str) -> bool {
        self.written.lock().unwrap().push(text.to_string());
        self.accept
    }
}

// ── Timer ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TimerState {
    armed: HashMap<TimerId, Duration>,
    now: Instant,
}

/// Records arm/cancel calls; the test fires timers by hand.
#[derive(Debug, Clone)]
pub struct MockTimer {
    state: Arc<Mutex<TimerState>>,
}

impl MockTimer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState {
                armed: HashMap::new(),
                now: Instant::now(),
            })),
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.state.lock().unwrap().armed.contains_key(&id)
    }

    pub fn delay(&self, id: TimerId) -> Option<Duration> {
        self.state.lock().unwrap().armed.get(&id).copied()
    }

    pub fn advance(&self, by: Duration) {
        let mut s = self.state.lock().unwrap();
        s.now += by;
    }

    /// Forget an arm as if it had expired. Returns whether it was armed.
    pub fn expire(&self, id: TimerId) -> bool {
        self.state.lock().unwrap().armed.remove(&id).is_some()
    }
}

impl Timer for MockTimer {
    fn arm(&mut self, id: TimerId, after: Duration) {
        self.state.lock().unwrap().armed.insert(id, after);
    }

    fn cancel(&mut self, id: TimerId) {
        self.state.lock().unwrap().armed.remove(&id);
    }

    fn now(&self) -> Instant {
        self.state.lock().unwrap().now
    }
}
