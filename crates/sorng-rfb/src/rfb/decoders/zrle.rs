use flate2::Decompress;

use super::{inflate_stream, Decoder};
use crate::rfb::collab::Display;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::Rect;

const TILE: u16 = 64;
/// Worst case for one rectangle: a raw 3-byte pixel plus one subencoding
/// byte per tile, with generous headroom for RLE runs.
const MAX_INFLATE: usize = 64 * 1024 * 1024;

/// ZRLE (16): 64×64 tiles of compressed pixels (CPIXEL = 3 bytes) from a
/// connection-wide zlib stream.
pub struct ZrleDecoder {
    zlib: Decompress,
}

impl std::fmt::Debug for ZrleDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ZrleDecoder")
    }
}

impl Default for ZrleDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZrleDecoder {
    pub fn new() -> Self {
        Self {
            zlib: Decompress::new(true),
        }
    }
}

/// Cursor over the inflated bytes of one rectangle.
struct Inflated {
    data: Vec<u8>,
    pos: usize,
}

impl Inflated {
    fn byte(&mut self) -> Result<u8, RfbError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| RfbError::decoding("ZRLE: inflated data ended early"))?;
        self.pos += 1;
        Ok(b)
    }

    fn pixels(&mut self, count: usize) -> Result<Vec<[u8; 4]>, RfbError> {
        let end = self.pos + count * 3;
        let raw = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| RfbError::decoding("ZRLE: inflated data ended early"))?;
        let px = raw.chunks_exact(3).map(|p| [p[0], p[1], p[2], 255]).collect();
        self.pos = end;
        Ok(px)
    }

    fn rle_length(&mut self) -> Result<usize, RfbError> {
        let mut length = 0usize;
        loop {
            let current = self.byte()?;
            length += current as usize;
            if current != 255 {
                return Ok(length + 1);
            }
        }
    }
}

fn bits_per_palette_index(palette_size: usize) -> usize {
    match palette_size {
        0..=2 => 1,
        3..=4 => 2,
        _ => 4,
    }
}

fn packed_palette_tile(src: &mut Inflated, palette_size: usize, tw: usize, th: usize) -> Result<Vec<u8>, RfbError> {
    let palette = src.pixels(palette_size)?;
    let bpp = bits_per_palette_index(palette_size);
    let mask = (1u8 << bpp) - 1;
    let mut out = Vec::with_capacity(tw * th * 4);
    for _ in 0..th {
        // Rows are padded to a byte boundary.
        let mut shift: i32 = -1;
        let mut encoded = 0u8;
        for _ in 0..tw {
            if shift < 0 {
                encoded = src.byte()?;
                shift = 8 - bpp as i32;
            }
            let index = ((encoded >> shift) & mask) as usize;
            let color = palette
                .get(index)
                .ok_or_else(|| RfbError::decoding(format!("Too big index in palette: {index}")))?;
            out.extend_from_slice(color);
            shift -= bpp as i32;
        }
    }
    Ok(out)
}

fn rle_tile(src: &mut Inflated, tile_size: usize) -> Result<Vec<u8>, RfbError> {
    let mut out = Vec::with_capacity(tile_size * 4);
    let mut i = 0;
    while i < tile_size {
        let px = src.pixels(1)?[0];
        let length = src.rle_length()?;
        if i + length > tile_size {
            return Err(RfbError::decoding(format!("Too big rle length: {length}")));
        }
        for _ in 0..length {
            out.extend_from_slice(&px);
        }
        i += length;
    }
    Ok(out)
}

fn rle_palette_tile(src: &mut Inflated, palette_size: usize, tile_size: usize) -> Result<Vec<u8>, RfbError> {
    let palette = src.pixels(palette_size)?;
    let mut out = Vec::with_capacity(tile_size * 4);
    let mut offset = 0;
    while offset < tile_size {
        let mut index = src.byte()? as usize;
        let mut length = 1;
        if index >= 128 {
            index -= 128;
            length = src.rle_length()?;
        }
        let color = palette
            .get(index)
            .ok_or_else(|| RfbError::decoding(format!("Too big index in palette: {index}")))?;
        if offset + length > tile_size {
            return Err(RfbError::decoding(format!(
                "Too big rle length in palette mode: {length}"
            )));
        }
        for _ in 0..length {
            out.extend_from_slice(color);
        }
        offset += length;
    }
    Ok(out)
}

impl Decoder for ZrleDecoder {
    fn decode_rect(
        &mut self,
        rect: &Rect,
        sock: &mut FramedTransport,
        display: &mut dyn Display,
        _depth: u8,
    ) -> Result<bool, RfbError> {
        if sock.rq_wait("ZRLE", 4, 0)? {
            return Ok(false);
        }
        let length = sock.shift32() as usize;
        if sock.rq_wait("ZRLE", length, 4)? {
            return Ok(false);
        }
        let input = sock.shift_vec(length);
        let data = inflate_stream(&mut self.zlib, &input, rect.area() * 3 + 64, MAX_INFLATE)?;
        let mut src = Inflated { data, pos: 0 };

        let (x_end, y_end) = (rect.x as u32 + rect.width as u32, rect.y as u32 + rect.height as u32);
        let mut ty = rect.y as u32;
        while ty < y_end {
            let th = (TILE as u32).min(y_end - ty) as u16;
            let mut tx = rect.x as u32;
            while tx < x_end {
                let tw = (TILE as u32).min(x_end - tx) as u16;
                let tile_size = tw as usize * th as usize;
                let (px, py) = (tx as u16, ty as u16);

                match src.byte()? {
                    0 => {
                        let pixels: Vec<u8> = src.pixels(tile_size)?.concat();
                        display.blit_image(px, py, tw, th, &pixels);
                    }
                    1 => {
                        let bg = src.pixels(1)?[0];
                        display.fill_rect(px, py, tw, th, bg);
                    }
                    sub @ 2..=16 => {
                        let pixels = packed_palette_tile(&mut src, sub as usize, tw as usize, th as usize)?;
                        display.blit_image(px, py, tw, th, &pixels);
                    }
                    128 => {
                        let pixels = rle_tile(&mut src, tile_size)?;
                        display.blit_image(px, py, tw, th, &pixels);
                    }
                    sub @ 130..=255 => {
                        let pixels = rle_palette_tile(&mut src, sub as usize - 128, tile_size)?;
                        display.blit_image(px, py, tw, th, &pixels);
                    }
                    sub => {
                        return Err(RfbError::decoding(format!("Unknown subencoding: {sub}")));
                    }
                }
                tx += TILE as u32;
            }
            ty += TILE as u32;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::decoders::test_util::*;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut c = compressor();
        let z = zlib_sync(&mut c, payload);
        let mut b = (z.len() as u32).to_be_bytes().to_vec();
        b.extend(z);
        b
    }

    fn px(out: &[u8], w: usize, x: usize, y: usize) -> [u8; 4] {
        let i = (y * w + x) * 4;
        [out[i], out[i + 1], out[i + 2], out[i + 3]]
    }

    #[test]
    fn solid_tile() {
        let out = decode_chunks(&mut ZrleDecoder::new(), Rect::new(0, 0, 2, 2), 24, &[&framed(&[1, 9, 8, 7])], (2, 2));
        assert_eq!(px(&out, 2, 1, 1), [9, 8, 7, 255]);
    }

    #[test]
    fn raw_tile() {
        let payload = [0, 1, 1, 1, 2, 2, 2];
        let out = decode_chunks(&mut ZrleDecoder::new(), Rect::new(0, 0, 2, 1), 24, &[&framed(&payload)], (2, 1));
        assert_eq!(out, vec![1, 1, 1, 255, 2, 2, 2, 255]);
    }

    #[test]
    fn packed_palette_rows_are_byte_aligned() {
        // 2-colour palette, 3×2 tile, one byte per row: 101, 010
        let payload = [2, 0, 0, 0, 255, 255, 255, 0b1010_0000, 0b0100_0000];
        let out = decode_chunks(&mut ZrleDecoder::new(), Rect::new(0, 0, 3, 2), 24, &[&framed(&payload)], (3, 2));
        assert_eq!(px(&out, 3, 0, 0), [255, 255, 255, 255]);
        assert_eq!(px(&out, 3, 1, 0), [0, 0, 0, 255]);
        assert_eq!(px(&out, 3, 1, 1), [255, 255, 255, 255]);
        assert_eq!(px(&out, 3, 2, 1), [0, 0, 0, 255]);
    }

    #[test]
    fn plain_rle_tile() {
        // 4 pixels: 3 × red, 1 × blue
        let payload = [128, 255, 0, 0, 2, 0, 0, 255, 0];
        let out = decode_chunks(&mut ZrleDecoder::new(), Rect::new(0, 0, 4, 1), 24, &[&framed(&payload)], (4, 1));
        assert_eq!(px(&out, 4, 2, 0), [255, 0, 0, 255]);
        assert_eq!(px(&out, 4, 3, 0), [0, 0, 255, 255]);
    }

    #[test]
    fn palette_rle_tile() {
        // palette [green, white], run of 3 green then a single white
        let payload = [130, 0, 255, 0, 255, 255, 255, 128, 2, 1];
        let out = decode_chunks(&mut ZrleDecoder::new(), Rect::new(0, 0, 4, 1), 24, &[&framed(&payload)], (4, 1));
        assert_eq!(px(&out, 4, 0, 0), [0, 255, 0, 255]);
        assert_eq!(px(&out, 4, 3, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn rle_overrun_fails() {
        let payload = [128, 1, 1, 1, 9];
        let mut s = sock();
        s.push_incoming(&framed(&payload)).unwrap();
        let mut d = crate::rfb::mock::MockDisplay::new(2, 1);
        assert!(ZrleDecoder::new().decode_rect(&Rect::new(0, 0, 2, 1), &mut s, &mut d, 24).is_err());
    }

    #[test]
    fn split_reads_match_whole() {
        let bytes = framed(&[0, 1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]);
        assert_split_invariant(|| Box::new(ZrleDecoder::new()), Rect::new(0, 0, 2, 2), 24, &bytes, (2, 2));
    }
}
