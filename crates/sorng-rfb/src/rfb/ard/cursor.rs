//! ARD cursors: CursorAlpha (1104) images, the per-session image cache
//! and the numbered system cursors.

use std::collections::{HashMap, VecDeque};

use flate2::Decompress;

use super::Frame;
use crate::rfb::decoders::inflate_stream;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::{Cursor, Rect};

pub const CURSOR_CACHE_CAPACITY: usize = 100;
pub const MAX_CURSOR_SIZE: u16 = 256;
/// Ids below this select a built-in system cursor.
pub const FIRST_CUSTOM_ID: u32 = 1000;

/// CSS-style name for a server system cursor id.
pub fn system_cursor_name(id: u32) -> &'static str {
    match id {
        1 => "text",
        2 => "crosshair",
        3 => "grabbing",
        4 => "grab",
        5 => "pointer",
        6 => "w-resize",
        7 => "e-resize",
        8 => "ew-resize",
        _ => "default",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveCursor {
    System(u32),
    Custom(u32),
}

impl Default for ActiveCursor {
    fn default() -> Self {
        Self::System(0)
    }
}

/// Decoded images keyed by server id. The oldest insertion is evicted
/// once the cache is full.
#[derive(Debug, Default)]
pub struct CursorCache {
    images: HashMap<u32, Cursor>,
    order: VecDeque<u32>,
}

impl CursorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<&Cursor> {
        self.images.get(&id)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn insert(&mut self, id: u32, cursor: Cursor) {
        if self.images.insert(id, cursor).is_some() {
            return;
        }
        if self.images.len() > CURSOR_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.images.remove(&oldest);
            }
        }
        self.order.push_back(id);
    }

    pub fn clear(&mut self) {
        self.images.clear();
        self.order.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CursorAlpha {
    /// Zero-sized rectangle: switch to a known cursor.
    Select(u32),
    /// A new image for the cache.
    Image { id: u32, cursor: Cursor },
}

/// BGRX pixels followed by an 8-bit alpha plane, converted to RGBA.
pub fn bgrx_alpha_to_rgba(data: &[u8], pixels: usize) -> Result<Vec<u8>, RfbError> {
    if data.len() < pixels * 5 {
        return Err(RfbError::decoding(format!(
            "ARD cursor data too short ({} of {} bytes)",
            data.len(),
            pixels * 5
        )));
    }
    let (bgrx, alpha) = data.split_at(pixels * 4);
    let mut rgba = Vec::with_capacity(pixels * 4);
    for (px, &a) in bgrx.chunks_exact(4).zip(alpha) {
        rgba.extend_from_slice(&[px[2], px[1], px[0], a]);
    }
    Ok(rgba)
}

/// CursorAlpha payload: `[u32 id][u32 dataSize][zlib data]`. The
/// rectangle origin is the hotspot. Oversized images are skipped.
pub fn read_cursor_alpha(rect: &Rect, sock: &mut FramedTransport) -> Result<Frame<CursorAlpha>, RfbError> {
    if sock.rq_wait("ARD CursorAlpha header", 8, 0)? {
        return Ok(Frame::Incomplete);
    }
    let hdr = sock.peek_bytes(8);
    let id = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let data_size = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]) as usize;
    if sock.rq_wait("ARD CursorAlpha", 8 + data_size, 0)? {
        return Ok(Frame::Incomplete);
    }
    sock.skip(8);

    let (w, h) = (rect.width, rect.height);
    if w == 0 && h == 0 {
        sock.skip(data_size);
        return Ok(Frame::Complete(CursorAlpha::Select(id)));
    }
    if w > MAX_CURSOR_SIZE || h > MAX_CURSOR_SIZE {
        log::warn!("ArdCursorAlpha: cursor too large ({w}x{h}), skipping");
        sock.skip(data_size);
        return Ok(Frame::Ignored);
    }

    log::debug!(
        "ArdCursorAlpha: NewCursor id={id} {w}x{h} hotspot={},{} compressed={data_size} bytes",
        rect.x,
        rect.y
    );
    let pixels = rect.area();
    let mut z = Decompress::new(true);
    let data = inflate_stream(&mut z, sock.shift_bytes(data_size), pixels * 5, pixels * 5 + 1)?;
    let rgba = bgrx_alpha_to_rgba(&data, pixels)?;
    Ok(Frame::Complete(CursorAlpha::Image {
        id,
        cursor: Cursor {
            rgba,
            hot_x: rect.x,
            hot_y: rect.y,
            width: w,
            height: h,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::decoders::test_util::{compressor, sock, zlib_sync};

    fn payload(id: u32, data: &[u8]) -> Vec<u8> {
        let mut wire = id.to_be_bytes().to_vec();
        wire.extend((data.len() as u32).to_be_bytes());
        wire.extend(data);
        wire
    }

    #[test]
    fn system_names() {
        assert_eq!(system_cursor_name(0), "default");
        assert_eq!(system_cursor_name(5), "pointer");
        assert_eq!(system_cursor_name(8), "ew-resize");
        assert_eq!(system_cursor_name(42), "default");
    }

    #[test]
    fn single_pixel_cursor() {
        let mut s = sock();
        let z = zlib_sync(&mut compressor(), &[30, 20, 10, 0, 255]);
        s.push_incoming(&payload(1001, &z)).unwrap();
        let rect = Rect::new(0, 0, 1, 1);
        let Frame::Complete(CursorAlpha::Image { id, cursor }) = read_cursor_alpha(&rect, &mut s).unwrap() else {
            panic!("expected a cursor image");
        };
        assert_eq!(id, 1001);
        assert_eq!(cursor.rgba, vec![10, 20, 30, 255]);
        assert_eq!(s.rq_len(), 0);
    }

    #[test]
    fn zero_size_selects_and_skips_data() {
        let mut s = sock();
        s.push_incoming(&payload(5, &[1, 2, 3])).unwrap();
        assert_eq!(
            read_cursor_alpha(&Rect::new(3, 4, 0, 0), &mut s).unwrap(),
            Frame::Complete(CursorAlpha::Select(5))
        );
        assert_eq!(s.rq_len(), 0);
    }

    #[test]
    fn waits_for_compressed_data() {
        let mut s = sock();
        let wire = payload(1001, &[9; 10]);
        s.push_incoming(&wire[..12]).unwrap();
        assert_eq!(read_cursor_alpha(&Rect::new(0, 0, 300, 2), &mut s).unwrap(), Frame::Incomplete);
        assert_eq!(s.rq_len(), 12);
        s.push_incoming(&wire[12..]).unwrap();
        assert_eq!(read_cursor_alpha(&Rect::new(0, 0, 300, 2), &mut s).unwrap(), Frame::Ignored);
        assert_eq!(s.rq_len(), 0);
    }

    #[test]
    fn cache_evicts_oldest_first() {
        let mut cache = CursorCache::new();
        for id in 0..CURSOR_CACHE_CAPACITY as u32 {
            cache.insert(1000 + id, Cursor::hidden());
        }
        assert_eq!(cache.len(), CURSOR_CACHE_CAPACITY);
        cache.insert(1000, Cursor::default());
        assert_eq!(cache.len(), CURSOR_CACHE_CAPACITY);

        cache.insert(5000, Cursor::hidden());
        assert_eq!(cache.len(), CURSOR_CACHE_CAPACITY);
        assert!(cache.get(1000).is_none());
        assert!(cache.get(1001).is_some());
        assert!(cache.get(5000).is_some());
    }
}
