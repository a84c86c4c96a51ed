use super::Decoder;
use crate::rfb::collab::Display;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::Rect;

/// CopyRect (1): copy an on-screen region.
#[derive(Debug, Default)]
pub struct CopyRectDecoder;

impl Decoder for CopyRectDecoder {
    fn decode_rect(
        &mut self,
        rect: &Rect,
        sock: &mut FramedTransport,
        display: &mut dyn Display,
        _depth: u8,
    ) -> Result<bool, RfbError> {
        if sock.rq_wait("COPYRECT", 4, 0)? {
            return Ok(false);
        }
        let src_x = sock.shift16();
        let src_y = sock.shift16();
        if rect.width == 0 || rect.height == 0 {
            return Ok(true);
        }
        display.copy_image(src_x, src_y, rect.x, rect.y, rect.width, rect.height);
        Ok(true)
    }
}
