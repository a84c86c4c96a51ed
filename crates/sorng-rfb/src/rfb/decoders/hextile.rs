use super::{opaque, Decoder};
use crate::rfb::collab::Display;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::Rect;

const RAW: u8 = 0x01;
const BACKGROUND_SPECIFIED: u8 = 0x02;
const FOREGROUND_SPECIFIED: u8 = 0x04;
const ANY_SUBRECTS: u8 = 0x08;
const SUBRECTS_COLOURED: u8 = 0x10;

/// Hextile (5): 16×16 tiles, each fully buffered before it is drawn.
#[derive(Debug)]
pub struct HextileDecoder {
    tiles: u32,
    tiles_x: u32,
    total_tiles: u32,
    last_subencoding: u8,
    background: [u8; 4],
    foreground: [u8; 4],
    tile: Vec<u8>,
}

impl Default for HextileDecoder {
    fn default() -> Self {
        Self {
            tiles: 0,
            tiles_x: 0,
            total_tiles: 0,
            last_subencoding: 0,
            background: [0, 0, 0, 255],
            foreground: [0, 0, 0, 255],
            tile: Vec::with_capacity(16 * 16 * 4),
        }
    }
}

impl HextileDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill part of the buffered tile, clipped to `tw × th`.
    #[allow(clippy::too_many_arguments)]
    fn fill_tile_rect(&mut self, tw: usize, th: usize, sx: usize, sy: usize, sw: usize, sh: usize, color: [u8; 4]) {
        for y in sy..(sy + sh).min(th) {
            for x in sx..(sx + sw).min(tw) {
                let i = (y * tw + x) * 4;
                self.tile[i..i + 4].copy_from_slice(&color);
            }
        }
    }
}

impl Decoder for HextileDecoder {
    fn decode_rect(
        &mut self,
        rect: &Rect,
        sock: &mut FramedTransport,
        display: &mut dyn Display,
        _depth: u8,
    ) -> Result<bool, RfbError> {
        if self.tiles == 0 {
            self.tiles_x = (rect.width as u32).div_ceil(16);
            let tiles_y = (rect.height as u32).div_ceil(16);
            self.total_tiles = self.tiles_x * tiles_y;
            self.tiles = self.total_tiles;
        }

        while self.tiles > 0 {
            if sock.rq_wait("HEXTILE", 1, 0)? {
                return Ok(false);
            }
            let subencoding = sock.peek8();
            if subencoding > 30 {
                return Err(RfbError::decoding(format!(
                    "Illegal hextile subencoding (subencoding: {subencoding})"
                )));
            }

            let curr = self.total_tiles - self.tiles;
            let tx = rect.x as u32 + (curr % self.tiles_x) * 16;
            let ty = rect.y as u32 + (curr / self.tiles_x) * 16;
            let tw = 16.min(rect.x as u32 + rect.width as u32 - tx) as u16;
            let th = 16.min(rect.y as u32 + rect.height as u32 - ty) as u16;
            let (tx, ty) = (tx as u16, ty as u16);

            let mut bytes = 1usize;
            if subencoding & RAW != 0 {
                bytes += tw as usize * th as usize * 4;
            } else {
                if subencoding & BACKGROUND_SPECIFIED != 0 {
                    bytes += 4;
                }
                if subencoding & FOREGROUND_SPECIFIED != 0 {
                    bytes += 4;
                }
                if subencoding & ANY_SUBRECTS != 0 {
                    bytes += 1;
                    if sock.rq_wait("HEXTILE", bytes, 0)? {
                        return Ok(false);
                    }
                    let subrects = sock.peek_bytes(bytes)[bytes - 1] as usize;
                    bytes += if subencoding & SUBRECTS_COLOURED != 0 {
                        subrects * (4 + 2)
                    } else {
                        subrects * 2
                    };
                }
            }
            if sock.rq_wait("HEXTILE", bytes, 0)? {
                return Ok(false);
            }

            sock.shift8();
            if subencoding == 0 {
                if self.last_subencoding & RAW != 0 {
                    log::debug!("Ignoring blank after RAW");
                } else {
                    display.fill_rect(tx, ty, tw, th, self.background);
                }
            } else if subencoding & RAW != 0 {
                let mut data = sock.shift_vec(tw as usize * th as usize * 4);
                for px in data.chunks_exact_mut(4) {
                    px[3] = 255;
                }
                display.blit_image(tx, ty, tw, th, &data);
            } else {
                if subencoding & BACKGROUND_SPECIFIED != 0 {
                    self.background = opaque(sock.shift_bytes(4));
                }
                if subencoding & FOREGROUND_SPECIFIED != 0 {
                    self.foreground = opaque(sock.shift_bytes(4));
                }

                let (w, h) = (tw as usize, th as usize);
                self.tile.clear();
                for _ in 0..w * h {
                    self.tile.extend_from_slice(&self.background);
                }

                if subencoding & ANY_SUBRECTS != 0 {
                    let subrects = sock.shift8();
                    for _ in 0..subrects {
                        let color = if subencoding & SUBRECTS_COLOURED != 0 {
                            opaque(sock.shift_bytes(4))
                        } else {
                            self.foreground
                        };
                        let xy = sock.shift8();
                        let wh = sock.shift8();
                        let (sx, sy) = ((xy >> 4) as usize, (xy & 0x0f) as usize);
                        let (sw, sh) = ((wh >> 4) as usize + 1, (wh & 0x0f) as usize + 1);
                        self.fill_tile_rect(w, h, sx, sy, sw, sh, color);
                    }
                }
                display.blit_image(tx, ty, tw, th, &self.tile);
            }

            self.last_subencoding = subencoding;
            self.tiles -= 1;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::decoders::test_util::*;

    /// Two tiles across a 20×4 rect: a coloured-subrect tile then a raw one.
    fn sample() -> Vec<u8> {
        let mut b = vec![BACKGROUND_SPECIFIED | FOREGROUND_SPECIFIED | ANY_SUBRECTS | SUBRECTS_COLOURED];
        b.extend_from_slice(&[1, 1, 1, 0]); // bg
        b.extend_from_slice(&[2, 2, 2, 0]); // fg
        b.push(1);
        b.extend_from_slice(&[50, 60, 70, 0, 0x11, 0x00]); // (1,1) 1×1
        b.push(RAW);
        for i in 0..4 * 4 {
            b.extend_from_slice(&[i as u8, 0, 0, 0]);
        }
        b
    }

    #[test]
    fn tiles_decode() {
        let out = decode_chunks(&mut HextileDecoder::new(), Rect::new(0, 0, 20, 4), 24, &[&sample()], (20, 4));
        let px = |x: usize, y: usize| &out[(y * 20 + x) * 4..(y * 20 + x) * 4 + 4];
        assert_eq!(px(0, 0), &[1, 1, 1, 255]);
        assert_eq!(px(1, 1), &[50, 60, 70, 255]);
        assert_eq!(px(17, 0), &[1, 0, 0, 255]);
        assert_eq!(px(19, 3), &[15, 0, 0, 255]);
    }

    #[test]
    fn foreground_subrects_and_blank_tile() {
        let mut b = vec![FOREGROUND_SPECIFIED | ANY_SUBRECTS];
        b.extend_from_slice(&[9, 9, 9, 0]);
        b.push(1);
        b.extend_from_slice(&[0x00, 0x11]); // (0,0) 2×2
        let out = decode_chunks(&mut HextileDecoder::new(), Rect::new(0, 0, 3, 3), 24, &[&b], (3, 3));
        assert_eq!(&out[..4], &[9, 9, 9, 255]);
        assert_eq!(&out[4 * 4..4 * 4 + 4], &[9, 9, 9, 255]);
        assert_eq!(&out[8 * 4..8 * 4 + 4], &[0, 0, 0, 255]);
    }

    #[test]
    fn split_reads_match_whole() {
        assert_split_invariant(|| Box::new(HextileDecoder::new()), Rect::new(0, 0, 20, 4), 24, &sample(), (20, 4));
    }

    #[test]
    fn illegal_subencoding_fails() {
        let mut s = sock();
        let mut d = crate::rfb::mock::MockDisplay::new(16, 16);
        s.push_incoming(&[31]).unwrap();
        assert!(HextileDecoder::new()
            .decode_rect(&Rect::new(0, 0, 16, 16), &mut s, &mut d, 24)
            .is_err());
    }
}
