use super::{opaque, Decoder};
use crate::rfb::collab::Display;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::Rect;

/// RRE (2): background fill plus solid sub-rectangles, resumable per
/// sub-rectangle.
#[derive(Debug, Default)]
pub struct RreDecoder {
    subrects: u32,
}

impl RreDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RreDecoder {
    fn decode_rect(
        &mut self,
        rect: &Rect,
        sock: &mut FramedTransport,
        display: &mut dyn Display,
        _depth: u8,
    ) -> Result<bool, RfbError> {
        if self.subrects == 0 {
            if sock.rq_wait("RRE", 4 + 4, 0)? {
                return Ok(false);
            }
            self.subrects = sock.shift32();
            let bg = opaque(sock.shift_bytes(4));
            display.fill_rect(rect.x, rect.y, rect.width, rect.height, bg);
        }

        while self.subrects > 0 {
            if sock.rq_wait("RRE", 4 + 8, 0)? {
                return Ok(false);
            }
            let color = opaque(sock.shift_bytes(4));
            let sx = sock.shift16();
            let sy = sock.shift16();
            let sw = sock.shift16();
            let sh = sock.shift16();
            display.fill_rect(rect.x.wrapping_add(sx), rect.y.wrapping_add(sy), sw, sh, color);
            self.subrects -= 1;
        }
        Ok(true)
    }
}
