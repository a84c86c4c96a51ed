//! ARD fixed-ratio codecs (1000–1002).
//!
//! All three share one framing: a `u32` compressed length, then a chunk of
//! a deflate stream that lives for the whole connection. The inflated size
//! follows from the rectangle size and the codec's bit depth, so the chunk
//! is only decoded once it is fully buffered.

use flate2::Decompress;

use super::{inflate_stream, Decoder};
use crate::rfb::collab::Display;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArdCodec {
    /// 1 bit per pixel, MSB first, rows byte-aligned.
    Halftone,
    /// 4-bit grayscale, high nibble first, rows byte-aligned.
    Gray16,
    /// Big-endian RGB555.
    Thousands,
}

impl ArdCodec {
    fn name(self) -> &'static str {
        match self {
            Self::Halftone => "ArdHalftone",
            Self::Gray16 => "ArdGray16",
            Self::Thousands => "ArdThousands",
        }
    }

    /// Inflated byte count for a `w × h` rectangle.
    pub fn inflated_size(self, w: usize, h: usize) -> usize {
        match self {
            Self::Halftone => w.div_ceil(8) * h,
            Self::Gray16 => w.div_ceil(2) * h,
            Self::Thousands => w * h * 2,
        }
    }

    /// Expand inflated codec data to RGBA.
    pub fn to_rgba(self, data: &[u8], w: usize, h: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(w * h * 4);
        match self {
            Self::Halftone => {
                let stride = w.div_ceil(8);
                for row in data.chunks(stride).take(h) {
                    for col in 0..w {
                        let bit = (row[col >> 3] >> (7 - (col & 7))) & 1;
                        let v = if bit != 0 { 255 } else { 0 };
                        out.extend_from_slice(&[v, v, v, 255]);
                    }
                }
            }
            Self::Gray16 => {
                let stride = w.div_ceil(2);
                for row in data.chunks(stride).take(h) {
                    for col in 0..w {
                        let b = row[col >> 1];
                        let nibble = if col & 1 == 0 { b >> 4 } else { b & 0x0f };
                        let v = nibble * 17;
                        out.extend_from_slice(&[v, v, v, 255]);
                    }
                }
            }
            Self::Thousands => {
                let expand = |c: u16| ((c << 3) | (c >> 2)) as u8;
                for px in data.chunks_exact(2).take(w * h) {
                    let v = u16::from_be_bytes([px[0], px[1]]);
                    let r = (v >> 10) & 0x1f;
                    let g = (v >> 5) & 0x1f;
                    let b = v & 0x1f;
                    out.extend_from_slice(&[expand(r), expand(g), expand(b), 255]);
                }
            }
        }
        out
    }
}

pub struct ArdZlibDecoder {
    codec: ArdCodec,
    zlib: Decompress,
    length: Option<usize>,
}

impl std::fmt::Debug for ArdZlibDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArdZlibDecoder")
            .field("codec", &self.codec)
            .field("length", &self.length)
            .finish()
    }
}

impl ArdZlibDecoder {
    pub fn new(codec: ArdCodec) -> Self {
        Self {
            codec,
            zlib: Decompress::new(true),
            length: None,
        }
    }
}

impl Decoder for ArdZlibDecoder {
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
        let name = self.codec.name();
        let length = match self.length {
            Some(l) => l,
            None => {
                if sock.rq_wait(name, 4, 0)? {
                    return Ok(false);
                }
                let l = sock.shift32() as usize;
                self.length = Some(l);
                l
            }
        };
        if sock.rq_wait(name, length, 0)? {
            return Ok(false);
        }
        let input = sock.shift_vec(length);
        self.length = None;

        let (w, h) = (rect.width as usize, rect.height as usize);
        let expected = self.codec.inflated_size(w, h);
        let data = inflate_stream(&mut self.zlib, &input, expected, expected + 1)?;
        if data.len() < expected {
            return Err(RfbError::decoding(format!(
                "{name}: inflated {} of {expected} bytes",
                data.len()
            )));
        }
        let rgba = self.codec.to_rgba(&data[..expected], w, h);
        display.blit_image(rect.x, rect.y, rect.width, rect.height, &rgba);
        Ok(true)
    }
}
