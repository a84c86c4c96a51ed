//! Cursor pseudo-encodings: rich cursor (-239) and VMware cursor.
//!
//! Both read the whole payload in one go once it is buffered, so they
//! need no state between calls. `Ok(None)` means more bytes are needed.

use super::errors::RfbError;
use super::framed::FramedTransport;
use super::types::{Cursor, Rect};

const VMWARE_CLASSIC: u8 = 0;
const VMWARE_ALPHA: u8 = 1;

fn cursor_from(rect: &Rect, rgba: Vec<u8>) -> Cursor {
    Cursor {
        rgba,
        hot_x: rect.x,
        hot_y: rect.y,
        width: rect.width,
        height: rect.height,
    }
}

/// Rich cursor: BGRX pixels followed by a 1-bit row-padded mask.
pub fn decode_rich_cursor(rect: &Rect, sock: &mut FramedTransport) -> Result<Option<Cursor>, RfbError> {
    let w = rect.width as usize;
    let h = rect.height as usize;
    let pixels_len = w * h * 4;
    let stride = w.div_ceil(8);
    let mask_len = stride * h;

    if sock.rq_wait("cursor encoding", pixels_len + mask_len, 0)? {
        return Ok(None);
    }
    let pixels = sock.shift_vec(pixels_len);
    let mask = sock.shift_bytes(mask_len);

    let mut rgba = vec![0u8; pixels_len];
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) * 4;
            let bit = (mask[y * stride + x / 8] << (x % 8)) & 0x80;
            rgba[i] = pixels[i + 2];
            rgba[i + 1] = pixels[i + 1];
            rgba[i + 2] = pixels[i];
            rgba[i + 3] = if bit != 0 { 255 } else { 0 };
        }
    }
    Ok(Some(cursor_from(rect, rgba)))
}

/// VMware cursor: a type byte and a padding byte, then either AND/XOR
/// masks (classic) or premultiplied RGBA words (alpha).
pub fn decode_vmware_cursor(rect: &Rect, sock: &mut FramedTransport) -> Result<Option<Cursor>, RfbError> {
    if sock.rq_wait("VMware cursor encoding", 2, 0)? {
        return Ok(None);
    }
    let cursor_type = sock.shift8();
    sock.skip(1);

    let area = rect.area();
    let rgba = match cursor_type {
        VMWARE_CLASSIC => {
            if sock.rq_wait("VMware cursor classic encoding", area * 4 * 2, 2)? {
                return Ok(None);
            }
            let and_mask: Vec<u32> = (0..area).map(|_| sock.shift32()).collect();
            let xor_mask: Vec<u32> = (0..area).map(|_| sock.shift32()).collect();

            let mut rgba = Vec::with_capacity(area * 4);
            for (&and, &xor) in and_mask.iter().zip(&xor_mask) {
                if and == 0 {
                    rgba.extend_from_slice(&[(xor >> 8) as u8, (xor >> 16) as u8, (xor >> 24) as u8, 255]);
                } else if and & 0xffff_ff00 == 0xffff_ff00 && xor == 0 {
                    rgba.extend_from_slice(&[0, 0, 0, 0]);
                } else {
                    // Inverted and unknown pixels are drawn black.
                    rgba.extend_from_slice(&[0, 0, 0, 255]);
                }
            }
            rgba
        }
        VMWARE_ALPHA => {
            if sock.rq_wait("VMware cursor alpha encoding", area * 4, 2)? {
                return Ok(None);
            }
            let mut rgba = Vec::with_capacity(area * 4);
            for _ in 0..area {
                let px = sock.shift32();
                rgba.extend_from_slice(&[(px >> 24) as u8, (px >> 16) as u8, (px >> 8) as u8, px as u8]);
            }
            rgba
        }
        other => {
            return Err(RfbError::protocol(format!(
                "The given cursor type is not supported: {other} given."
            )));
        }
    };
    Ok(Some(cursor_from(rect, rgba)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::decoders::test_util::sock;

    #[test]
    fn rich_cursor_applies_mask() {
        let mut s = sock();
        let rect = Rect::new(1, 0, 2, 1);
        // BGRX pixels, then a mask with only the first bit set.
        s.push_incoming(&[30, 20, 10, 0, 3, 2, 1, 0, 0x80]).unwrap();
        let c = decode_rich_cursor(&rect, &mut s).unwrap().unwrap();
        assert_eq!(c.rgba, vec![10, 20, 30, 255, 1, 2, 3, 0]);
        assert_eq!((c.hot_x, c.hot_y), (1, 0));
        assert_eq!(s.rq_len(), 0);
    }

    #[test]
    fn rich_cursor_waits_for_mask() {
        let mut s = sock();
        let rect = Rect::new(0, 0, 9, 1);
        s.push_incoming(&[0u8; 36 + 1]).unwrap();
        assert!(decode_rich_cursor(&rect, &mut s).unwrap().is_none());
        s.push_incoming(&[0xff]).unwrap();
        assert!(decode_rich_cursor(&rect, &mut s).unwrap().is_some());
    }

    #[test]
    fn vmware_classic_masks() {
        let mut s = sock();
        let rect = Rect::new(0, 0, 3, 1);
        let mut wire = vec![VMWARE_CLASSIC, 0];
        for and in [0u32, 0xffff_ffff, 0xffff_ffff] {
            wire.extend(and.to_be_bytes());
        }
        for xor in [0x3020_1000u32, 0, 0x00ff_ff00] {
            wire.extend(xor.to_be_bytes());
        }
        s.push_incoming(&wire).unwrap();
        let c = decode_vmware_cursor(&rect, &mut s).unwrap().unwrap();
        assert_eq!(c.rgba, vec![0x10, 0x20, 0x30, 255, 0, 0, 0, 0, 0, 0, 0, 255]);
    }

    #[test]
    fn vmware_alpha_partial_then_complete() {
        let mut s = sock();
        let rect = Rect::new(0, 0, 1, 1);
        s.push_incoming(&[VMWARE_ALPHA, 0, 0x11, 0x22]).unwrap();
        assert!(decode_vmware_cursor(&rect, &mut s).unwrap().is_none());
        assert_eq!(s.rq_len(), 4);
        s.push_incoming(&[0x33, 0x80]).unwrap();
        let c = decode_vmware_cursor(&rect, &mut s).unwrap().unwrap();
        assert_eq!(c.rgba, vec![0x11, 0x22, 0x33, 0x80]);
    }

    #[test]
    fn vmware_unknown_type_is_an_error() {
        let mut s = sock();
        s.push_incoming(&[7, 0]).unwrap();
        assert!(decode_vmware_cursor(&Rect::new(0, 0, 1, 1), &mut s).is_err());
    }
}
