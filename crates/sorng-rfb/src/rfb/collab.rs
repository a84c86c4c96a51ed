//! External collaborators consumed by the engine.
//!
//! Everything platform-bound (the byte stream, the raster sink, the
//! system clipboard, persistent storage and timers) sits behind one of
//! these traits so the engine itself stays a pure state machine.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use super::types::{Cursor, RfbEvent};

// ── Events ───────────────────────────────────────────────────────────────

/// Outbound event channel. Events are dropped when no receiver is
/// attached or the receiver has gone away.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<RfbEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<RfbEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: RfbEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                log::debug!("Event receiver dropped");
            }
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────────

/// Opaque duplex byte stream. Incoming bytes are pushed into the engine
/// by its owner; the engine only writes.
pub trait Transport: Send {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

// ── Display ──────────────────────────────────────────────────────────────

/// Raster sink for decoded pixels. Colours are RGBA.
pub trait Display: Send {
    fn resize(&mut self, width: u16, height: u16);
    fn width(&self) -> u16;
    fn height(&self) -> u16;
    fn fill_rect(&mut self, x: u16, y: u16, w: u16, h: u16, color: [u8; 4]);
    fn copy_image(&mut self, src_x: u16, src_y: u16, x: u16, y: u16, w: u16, h: u16);
    /// `rgba` holds `w * h * 4` bytes, row-major.
    fn blit_image(&mut self, x: u16, y: u16, w: u16, h: u16, rgba: &[u8]);
    /// Present everything drawn since the previous flip.
    fn flip(&mut self);
    /// True while a previous frame is still being presented.
    fn pending(&self) -> bool;
    /// Ask the sink to finish presenting. Completion is reported back
    /// through `RfbEngine::display_flushed`.
    fn flush(&mut self);
    fn set_cursor(&mut self, cursor: &Cursor);
    /// Switch to a platform cursor by generic name (`default`, `text`,
    /// `pointer`, ...).
    fn set_system_cursor(&mut self, name: &'static str);
}

// ── Clipboard ────────────────────────────────────────────────────────────

pub trait Clipboard: Send {
    /// Returns false when the text was not taken; the engine then emits a
    /// `Clipboard` event instead.
    fn write_text(&mut self, text: &str) -> bool;
}

/// Clipboard that never handles anything, leaving delivery to events.
#[derive(Debug, Default)]
pub struct EventClipboard;

impl Clipboard for EventClipboard {
    fn write_text(&mut self, _text: &str) -> bool {
        false
    }
}

// ── Key/value persistence ────────────────────────────────────────────────

pub trait KeyValueCache: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String);
    fn remove(&mut self, key: &str);
}

/// In-process cache. Contents live as long as the value.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    entries: HashMap<String, String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

// ── Timers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    Disconnect,
    AuthTimeout,
    ArdInitRetry,
    ArdFullUpdateRetry,
    FreezeWatchdog,
    ResizeDebounce,
}

/// One-shot timers. Expiry is delivered through `RfbEngine::timer_fired`.
/// Arming an already armed id replaces it.
pub trait Timer: Send {
    fn arm(&mut self, id: TimerId, after: Duration);
    fn cancel(&mut self, id: TimerId);
    fn now(&self) -> Instant;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_cache_roundtrip() {
        let mut c = MemoryCache::new();
        assert!(c.is_empty());
        c.set("rsa_tunnel_key:wss://a", "{}".into());
        assert_eq!(c.get("rsa_tunnel_key:wss://a").as_deref(), Some("{}"));
        c.remove("rsa_tunnel_key:wss://a");
        assert!(c.get("rsa_tunnel_key:wss://a").is_none());
    }

    #[test]
    fn event_sink_delivers_and_tolerates_drop() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.emit(RfbEvent::Bell);
        assert_eq!(rx.try_recv().unwrap(), RfbEvent::Bell);
        drop(rx);
        sink.emit(RfbEvent::Connect);
        EventSink::detached().emit(RfbEvent::Connect);
    }

    #[test]
    fn event_clipboard_declines() {
        assert!(!EventClipboard.write_text("hello"));
    }
}
