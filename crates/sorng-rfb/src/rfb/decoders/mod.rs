//! Rectangle decoders.
//!
//! Each decoder consumes bytes from the receive queue and draws into the
//! display. `decode_rect` returns `Ok(false)` when more bytes are needed;
//! any partial progress lives in the decoder itself so the call can simply
//! be repeated. `Ok(true)` means the rectangle is complete and the decoder
//! is idle again.

mod ard;
mod copyrect;
mod hextile;
mod raw;
mod rre;
mod zlib;
mod zrle;

use std::collections::HashMap;

use flate2::{Decompress, FlushDecompress, Status};

use super::collab::Display;
use super::constants::encoding;
use super::errors::RfbError;
use super::framed::FramedTransport;
use super::types::Rect;

pub use ard::{ArdCodec, ArdZlibDecoder};
pub use copyrect::CopyRectDecoder;
pub use hextile::HextileDecoder;
pub use raw::RawDecoder;
pub use rre::RreDecoder;
pub use zlib::ZlibDecoder;
pub use zrle::ZrleDecoder;

pub trait Decoder: Send {
    fn decode_rect(
        &mut self,
        rect: &Rect,
        sock: &mut FramedTransport,
        display: &mut dyn Display,
        depth: u8,
    ) -> Result<bool, RfbError>;
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Encoding id → decoder instance.
pub struct DecoderRegistry {
    decoders: HashMap<i32, Box<dyn Decoder>>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.decoders.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("DecoderRegistry").field("encodings", &ids).finish()
    }
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Every decoder this crate ships.
    pub fn with_defaults() -> Self {
        let mut r = Self::empty();
        r.register(encoding::RAW, Box::new(RawDecoder::new()));
        r.register(encoding::COPY_RECT, Box::new(CopyRectDecoder));
        r.register(encoding::RRE, Box::new(RreDecoder::new()));
        r.register(encoding::HEXTILE, Box::new(HextileDecoder::new()));
        r.register(encoding::ZLIB, Box::new(ZlibDecoder::new()));
        r.register(encoding::ZRLE, Box::new(ZrleDecoder::new()));
        r.register(encoding::ARD_HALFTONE, Box::new(ArdZlibDecoder::new(ArdCodec::Halftone)));
        r.register(encoding::ARD_GRAY16, Box::new(ArdZlibDecoder::new(ArdCodec::Gray16)));
        r.register(encoding::ARD_THOUSANDS, Box::new(ArdZlibDecoder::new(ArdCodec::Thousands)));
        r
    }

    pub fn register(&mut self, enc: i32, decoder: Box<dyn Decoder>) {
        self.decoders.insert(enc, decoder);
    }

    pub fn contains(&self, enc: i32) -> bool {
        self.decoders.contains_key(&enc)
    }

    pub fn get_mut(&mut self, enc: i32) -> Option<&mut (dyn Decoder + 'static)> {
        self.decoders.get_mut(&enc).map(|d| d.as_mut())
    }

    /// Drop all decoder state, e.g. the zlib streams after a reconnect.
    pub fn reset(&mut self) {
        *self = Self::with_defaults();
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────

/// Feed `input` into a persistent inflate stream with a sync flush and
/// return everything it produces. Fails past `limit` output bytes.
pub(crate) fn inflate_stream(
    z: &mut Decompress,
    input: &[u8],
    size_hint: usize,
    limit: usize,
) -> Result<Vec<u8>, RfbError> {
    let mut out: Vec<u8> = Vec::with_capacity(size_hint.clamp(64, limit.max(64)));
    let start_in = z.total_in();
    loop {
        if out.len() == out.capacity() {
            if out.len() >= limit {
                return Err(RfbError::decoding(format!("inflated data exceeds {limit} bytes")));
            }
            let grow = out.capacity().max(4096).min(limit - out.len());
            out.reserve_exact(grow);
        }
        let consumed = (z.total_in() - start_in) as usize;
        let before = z.total_out();
        let status = z
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| RfbError::decoding(format!("inflate failed: {e}")))?;
        let consumed_now = (z.total_in() - start_in) as usize;
        let produced = z.total_out() - before;

        if status == Status::StreamEnd {
            break;
        }
        let room_left = out.len() < out.capacity();
        if consumed_now >= input.len() && room_left {
            break;
        }
        if produced == 0 && consumed_now == consumed && room_left {
            break;
        }
    }
    Ok(out)
}

/// RGBX from the wire to RGBA with an opaque alpha.
pub(crate) fn opaque(px: &[u8]) -> [u8; 4] {
    [px[0], px[1], px[2], 255]
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::rfb::mock::{MockDisplay, MockTransport};
    use flate2::{Compress, Compression, FlushCompress};

    pub fn sock() -> FramedTransport {
        FramedTransport::new(Box::new(MockTransport::new()))
    }

    /// Run a decoder over `bytes` delivered as the given chunks and return
    /// the final framebuffer contents.
    pub fn decode_chunks(
        decoder: &mut dyn Decoder,
        rect: Rect,
        depth: u8,
        chunks: &[&[u8]],
        fb: (u16, u16),
    ) -> Vec<u8> {
        let mut s = sock();
        let mut display = MockDisplay::new(fb.0, fb.1);
        let mut done = false;
        for chunk in chunks {
            s.push_incoming(chunk).unwrap();
            assert!(!done, "decoder finished before all chunks arrived");
            done = decoder.decode_rect(&rect, &mut s, &mut display, depth).unwrap();
        }
        assert!(done, "decoder did not finish");
        assert_eq!(s.rq_len(), 0, "decoder left bytes unread");
        let data = display.fb.lock().data().to_vec();
        data
    }

    /// Every two-way split of `bytes` decodes to the same pixels as the
    /// whole buffer.
    pub fn assert_split_invariant<F>(make: F, rect: Rect, depth: u8, bytes: &[u8], fb: (u16, u16))
    where
        F: Fn() -> Box<dyn Decoder>,
    {
        let whole = decode_chunks(make().as_mut(), rect, depth, &[bytes], fb);
        for k in 1..bytes.len() {
            let (a, b) = bytes.split_at(k);
            let split = decode_chunks(make().as_mut(), rect, depth, &[a, b], fb);
            assert_eq!(split, whole, "split at {k} differs");
        }
    }

    /// Compress with a sync flush, the way servers frame each rectangle.
    pub fn zlib_sync(c: &mut Compress, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 64);
        c.compress_vec(data, &mut out, FlushCompress::Sync).unwrap();
        while out.len() == out.capacity() {
            out.reserve(256);
            c.compress_vec(&[], &mut out, FlushCompress::Sync).unwrap();
        }
        out
    }

    pub fn compressor() -> Compress {
        Compress::new(Compression::default(), true)
    }
}
