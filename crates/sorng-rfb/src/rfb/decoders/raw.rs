use super::Decoder;
use crate::rfb::collab::Display;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::Rect;

/// Raw (0): uncompressed pixels, consumed one scanline at a time.
#[derive(Debug, Default)]
pub struct RawDecoder {
    lines: u16,
}

impl RawDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Expand 8-bit `bbgggrrr`-style 2-2-2 pixels (shifts 0/2/4) to RGBA.
fn expand_bgr222(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 4);
    for &p in data {
        out.push((p & 0x3) * 85);
        out.push(((p >> 2) & 0x3) * 85);
        out.push(((p >> 4) & 0x3) * 85);
        out.push(255);
    }
    out
}

impl Decoder for RawDecoder {
    fn decode_rect(
        &mut self,
        rect: &Rect,
        sock: &mut FramedTransport,
        display: &mut dyn Display,
        depth: u8,
    ) -> Result<bool, RfbError> {
        if rect.width == 0 || rect.height == 0 {
            return Ok(true);
        }
        if self.lines == 0 {
            self.lines = rect.height;
        }

        let pixel_size = if depth == 8 { 1 } else { 4 };
        let bytes_per_line = rect.width as usize * pixel_size;

        while self.lines > 0 {
            if sock.rq_wait("RAW", bytes_per_line, 0)? {
                return Ok(false);
            }
            let cur_y = rect.y + (rect.height - self.lines);
            let line = sock.shift_bytes(bytes_per_line);
            let rgba = if depth == 8 {
                expand_bgr222(line)
            } else {
                let mut v = line.to_vec();
                for px in v.chunks_exact_mut(4) {
                    px[3] = 255;
                }
                v
            };
            display.blit_image(rect.x, cur_y, rect.width, 1, &rgba);
            self.lines -= 1;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::decoders::test_util::*;

    #[test]
    fn decodes_rgbx_rows() {
        let bytes = [1, 2, 3, 0, 4, 5, 6, 0, 7, 8, 9, 0, 10, 11, 12, 0];
        let out = decode_chunks(&mut RawDecoder::new(), Rect::new(0, 0, 2, 2), 24, &[&bytes], (2, 2));
        assert_eq!(&out[..8], &[1, 2, 3, 255, 4, 5, 6, 255]);
        assert_eq!(&out[12..], &[10, 11, 12, 255]);
    }

    #[test]
    fn eight_bit_depth() {
        // r=3, g=0, b=1
        let out = decode_chunks(&mut RawDecoder::new(), Rect::new(0, 0, 1, 1), 8, &[&[0b01_00_11]], (1, 1));
        assert_eq!(out, vec![255, 0, 85, 255]);
    }

    #[test]
    fn split_reads_match_whole() {
        let bytes: Vec<u8> = (0..3 * 2 * 4).map(|i| i as u8).collect();
        assert_split_invariant(|| Box::new(RawDecoder::new()), Rect::new(1, 1, 3, 2), 24, &bytes, (5, 4));
    }

    #[test]
    fn empty_rect_completes() {
        let mut s = sock();
        let mut d = crate::rfb::mock::MockDisplay::new(1, 1);
        assert!(RawDecoder::new()
            .decode_rect(&Rect::new(0, 0, 0, 5), &mut s, &mut d, 24)
            .unwrap());
    }
}
