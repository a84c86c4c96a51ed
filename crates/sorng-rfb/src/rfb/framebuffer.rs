//! In-memory RGBA framebuffer implementing the `Display` sink.

use std::sync::{Arc, Mutex, MutexGuard};

use super::collab::Display;
use super::types::Cursor;

/// Plain RGBA surface. Drawing outside the surface is clipped.
#[derive(Debug, Clone, Default)]
pub struct Framebuffer {
    width: u16,
    height: u16,
    data: Vec<u8>,
    cursor: Option<Cursor>,
    system_cursor: Option<&'static str>,
    frames: u64,
}

impl Framebuffer {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
            cursor: None,
            system_cursor: None,
            frames: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u16, y: u16) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.offset(x, y);
        Some([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn system_cursor(&self) -> Option<&'static str> {
        self.system_cursor
    }

    /// Number of completed flips.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn offset(&self, x: u16, y: u16) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }

    /// Clip a rectangle to the surface, returning the visible extent.
    fn clip(&self, x: u16, y: u16, w: u16, h: u16) -> Option<(usize, usize)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let cw = (w as usize).min(self.width as usize - x as usize);
        let ch = (h as usize).min(self.height as usize - y as usize);
        if cw == 0 || ch == 0 {
            return None;
        }
        Some((cw, ch))
    }
}

impl Display for Framebuffer {
    fn resize(&mut self, width: u16, height: u16) {
        let mut data = vec![0u8; width as usize * height as usize * 4];
        let keep_w = width.min(self.width) as usize;
        let keep_h = height.min(self.height) as usize;
        for row in 0..keep_h {
            let src = row * self.width as usize * 4;
            let dst = row * width as usize * 4;
            data[dst..dst + keep_w * 4].copy_from_slice(&self.data[src..src + keep_w * 4]);
        }
        self.width = width;
        self.height = height;
        self.data = data;
    }

    fn width(&self) -> u16 {
        self.width
    }

    fn height(&self) -> u16 {
        self.height
    }

    fn fill_rect(&mut self, x: u16, y: u16, w: u16, h: u16, color: [u8; 4]) {
        let Some((cw, ch)) = self.clip(x, y, w, h) else {
            return;
        };
        for row in 0..ch {
            let start = self.offset(x, y + row as u16);
            for px in self.data[start..start + cw * 4].chunks_exact_mut(4) {
                px.copy_from_slice(&color);
            }
        }
    }

    fn copy_image(&mut self, src_x: u16, src_y: u16, x: u16, y: u16, w: u16, h: u16) {
        let Some((sw, sh)) = self.clip(src_x, src_y, w, h) else {
            return;
        };
        let Some((dw, dh)) = self.clip(x, y, w, h) else {
            return;
        };
        let (cw, ch) = (sw.min(dw), sh.min(dh));
        let mut tmp = Vec::with_capacity(cw * ch * 4);
        for row in 0..ch {
            let s = self.offset(src_x, src_y + row as u16);
            tmp.extend_from_slice(&self.data[s..s + cw * 4]);
        }
        for row in 0..ch {
            let d = self.offset(x, y + row as u16);
            self.data[d..d + cw * 4].copy_from_slice(&tmp[row * cw * 4..(row + 1) * cw * 4]);
        }
    }

    fn blit_image(&mut self, x: u16, y: u16, w: u16, h: u16, rgba: &[u8]) {
        let Some((cw, ch)) = self.clip(x, y, w, h) else {
            return;
        };
        let stride = w as usize * 4;
        for row in 0..ch {
            let s = row * stride;
            if s + cw * 4 > rgba.len() {
                break;
            }
            let d = self.offset(x, y + row as u16);
            self.data[d..d + cw * 4].copy_from_slice(&rgba[s..s + cw * 4]);
        }
    }

    fn flip(&mut self) {
        self.frames += 1;
    }

    fn pending(&self) -> bool {
        false
    }

    fn flush(&mut self) {}

    fn set_cursor(&mut self, cursor: &Cursor) {
        self.cursor = Some(cursor.clone());
        self.system_cursor = None;
    }

    fn set_system_cursor(&mut self, name: &'static str) {
        self.system_cursor = Some(name);
    }
}

// ── Shared handle ────────────────────────────────────────────────────────

/// Cloneable handle so the engine can draw while its owner reads pixels.
#[derive(Debug, Clone, Default)]
pub struct SharedFramebuffer(Arc<Mutex<Framebuffer>>);

impl SharedFramebuffer {
    pub fn new(width: u16, height: u16) -> Self {
        Self(Arc::new(Mutex::new(Framebuffer::new(width, height))))
    }

    pub fn lock(&self) -> MutexGuard<'_, Framebuffer> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Display for SharedFramebuffer {
    fn resize(&mut self, width: u16, height: u16) {
        self.lock().resize(width, height);
    }

    fn width(&self) -> u16 {
        self.lock().width()
    }

    fn height(&self) -> u16 {
        self.lock().height()
    }

    fn fill_rect(&mut self, x: u16, y: u16, w: u16, h: u16, color: [u8; 4]) {
        self.lock().fill_rect(x, y, w, h, color);
    }

    fn copy_image(&mut self, src_x: u16, src_y: u16, x: u16, y: u16, w: u16, h: u16) {
        self.lock().copy_image(src_x, src_y, x, y, w, h);
    }

    fn blit_image(&mut self, x: u16, y: u16, w: u16, h: u16, rgba: &[u8]) {
        self.lock().blit_image(x, y, w, h, rgba);
    }

    fn flip(&mut self) {
        self.lock().flip();
    }

    fn pending(&self) -> bool {
        self.lock().pending()
    }

    fn flush(&mut self) {
        self.lock().flush();
    }

    fn set_cursor(&mut self, cursor: &Cursor) {
        self.lock().set_cursor(cursor);
    }

    fn set_system_cursor(&mut self, name: &'static str) {
        self.lock().set_system_cursor(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_is_clipped() {
        let mut fb = Framebuffer::new(4, 4);
        fb.fill_rect(2, 2, 10, 10, [1, 2, 3, 255]);
        assert_eq!(fb.pixel(3, 3), Some([1, 2, 3, 255]));
        assert_eq!(fb.pixel(1, 1), Some([0, 0, 0, 0]));
    }

    #[test]
    fn copy_handles_overlap() {
        let mut fb = Framebuffer::new(4, 1);
        for x in 0..4 {
            fb.fill_rect(x, 0, 1, 1, [x as u8, 0, 0, 255]);
        }
        fb.copy_image(0, 0, 1, 0, 3, 1);
        let reds: Vec<u8> = (0..4).map(|x| fb.pixel(x, 0).unwrap()[0]).collect();
        assert_eq!(reds, vec![0, 0, 1, 2]);
    }

    #[test]
    fn blit_and_resize_keep_pixels() {
        let mut fb = Framebuffer::new(2, 2);
        fb.blit_image(0, 0, 2, 1, &[9, 9, 9, 255, 8, 8, 8, 255]);
        fb.resize(3, 3);
        assert_eq!(fb.pixel(1, 0), Some([8, 8, 8, 255]));
        assert_eq!(fb.pixel(2, 2), Some([0, 0, 0, 0]));
    }

    #[test]
    fn shared_handle_sees_writes() {
        let shared = SharedFramebuffer::new(2, 2);
        let mut writer = shared.clone();
        writer.fill_rect(0, 0, 1, 1, [5, 5, 5, 255]);
        assert_eq!(shared.lock().pixel(0, 0), Some([5, 5, 5, 255]));
    }
}
