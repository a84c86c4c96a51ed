use flate2::Decompress;

use super::{inflate_stream, Decoder};
use crate::rfb::collab::Display;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::Rect;

/// Zlib (6): raw pixels through one deflate stream that spans the whole
/// connection.
pub struct ZlibDecoder {
    zlib: Decompress,
    length: usize,
}

impl std::fmt::Debug for ZlibDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibDecoder").field("length", &self.length).finish()
    }
}

impl Default for ZlibDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibDecoder {
    pub fn new() -> Self {
        Self {
            zlib: Decompress::new(true),
            length: 0,
        }
    }
}

impl Decoder for ZlibDecoder {
    fn decode_rect(
        &mut self,
        rect: &Rect,
        sock: &mut FramedTransport,
        display: &mut dyn Display,
        _depth: u8,
    ) -> Result<bool, RfbError> {
        if rect.width == 0 || rect.height == 0 {
            return Ok(true);
        }
        if self.length == 0 {
            if sock.rq_wait("ZLIB", 4, 0)? {
                return Ok(false);
            }
            self.length = sock.shift32() as usize;
        }
        if sock.rq_wait("ZLIB", self.length, 0)? {
            return Ok(false);
        }

        let expected = rect.area() * 4;
        let input = sock.shift_vec(self.length);
        self.length = 0;
        let mut data = inflate_stream(&mut self.zlib, &input, expected, expected + 1)?;
        if data.len() < expected {
            return Err(RfbError::decoding(format!(
                "Zlib: inflated {} of {expected} bytes",
                data.len()
            )));
        }
        data.truncate(expected);
        for px in data.chunks_exact_mut(4) {
            px[3] = 255;
        }
        display.blit_image(rect.x, rect.y, rect.width, rect.height, &data);
        Ok(true)
    }
}
