//! DisplayInfo (1101) and DisplayInfo2 (1105) rectangle payloads.

use super::Frame;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;
use crate::rfb::types::ArdDisplay;

const DISPLAY_INFO_ENTRY: usize = 28;
const DISPLAY_INFO2_HEADER: usize = 20;
const DISPLAY_INFO2_ENTRY: usize = 56;

const FLAG_CURTAIN: u32 = 0x03;
const FLAG_LOCKED: u32 = 0x08;
const FLAG_LOGIN_WINDOW: u32 = 0x10;

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayInfo {
    pub fb_width: u16,
    pub fb_height: u16,
    pub flags: u16,
    pub displays: Vec<ArdDisplay>,
}

/// Legacy display list: 8-byte header plus 28 bytes per display.
pub fn read_display_info(sock: &mut FramedTransport) -> Result<Option<DisplayInfo>, RfbError> {
    if sock.rq_wait("ARD DisplayInfo header", 8, 0)? {
        return Ok(None);
    }
    let hdr = sock.peek_bytes(8);
    let (fb_width, fb_height) = (be16(&hdr[0..2]), be16(&hdr[2..4]));
    let count = be16(&hdr[4..6]) as usize;
    let flags = be16(&hdr[6..8]);
    if sock.rq_wait("ARD DisplayInfo", 8 + count * DISPLAY_INFO_ENTRY, 0)? {
        return Ok(None);
    }
    sock.skip(8);

    let mut displays = Vec::with_capacity(count);
    for _ in 0..count {
        let id = sock.shift32();
        let w = sock.shift16();
        let h = sock.shift16();
        let _magic = sock.shift32();
        sock.skip(16);
        displays.push(ArdDisplay::simple(id, w as u32, h as u32));
    }
    log::debug!(
        "ARD DisplayInfo: fb={fb_width}x{fb_height} displays={count} flags=0x{flags:x}"
    );
    Ok(Some(DisplayInfo {
        fb_width,
        fb_height,
        flags,
        displays,
    }))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayInfo2 {
    pub version: u16,
    pub fb_width: u16,
    pub fb_height: u16,
    pub scaled_width: u16,
    pub scaled_height: u16,
    pub display_id: u32,
    pub flags: u32,
    /// Count announced by the server; may exceed `displays.len()`.
    pub count: u16,
    pub displays: Vec<ArdDisplay>,
}

impl DisplayInfo2 {
    pub fn curtained(&self) -> bool {
        self.flags & FLAG_CURTAIN == FLAG_CURTAIN
    }

    /// A user session is on screen (neither locked nor at the login window).
    pub fn console_active(&self) -> bool {
        self.flags & (FLAG_LOCKED | FLAG_LOGIN_WINDOW) == 0
    }

    pub fn console_reason(&self) -> &'static str {
        if self.flags & FLAG_LOGIN_WINDOW != 0 {
            "LOGIN WINDOW"
        } else if self.flags & FLAG_LOCKED != 0 {
            "LOCKED"
        } else {
            "ACTIVE"
        }
    }
}

fn read_display2(sock: &mut FramedTransport) -> ArdDisplay {
    let backing_scale = f64::from_bits(((sock.shift32() as u64) << 32) | sock.shift32() as u64);
    let display_scale = f64::from_bits(((sock.shift32() as u64) << 32) | sock.shift32() as u64);
    let id = sock.shift32();
    let mut edge = || sock.shift16() as i16 as i32;
    let (top, left, bottom, right) = (edge(), edge(), edge(), edge());
    let (b_top, b_left, b_bottom, b_right) = (edge(), edge(), edge(), edge());
    let flags = sock.shift32();
    sock.skip(16);
    ArdDisplay {
        id,
        width: (right - left).max(0) as u32,
        height: (bottom - top).max(0) as u32,
        backing_width: (b_right - b_left).max(0) as u32,
        backing_height: (b_bottom - b_top).max(0) as u32,
        backing_scale,
        display_scale,
        left,
        top,
        primary: flags & 1 != 0,
    }
}

/// Extended display list with geometry, scale factors and session flags.
/// A body shorter than the fixed header is skipped.
pub fn read_display_info2(sock: &mut FramedTransport) -> Result<Frame<DisplayInfo2>, RfbError> {
    if sock.rq_wait("ARD DisplayInfo2 size", 2, 0)? {
        return Ok(Frame::Incomplete);
    }
    let size = be16(sock.peek_bytes(2)) as usize;
    if sock.rq_wait("ARD DisplayInfo2", 2 + size, 0)? {
        return Ok(Frame::Incomplete);
    }
    sock.skip(2);

    if size < DISPLAY_INFO2_HEADER {
        log::warn!("ARD DisplayInfo2: body too short ({size} bytes)");
        sock.skip(size);
        return Ok(Frame::Ignored);
    }

    let version = sock.shift16();
    let fb_width = sock.shift16();
    let fb_height = sock.shift16();
    let scaled_width = sock.shift16();
    let scaled_height = sock.shift16();
    let display_id = sock.shift32();
    let flags = sock.shift32();
    let count = sock.shift16();

    let fit = (size - DISPLAY_INFO2_HEADER) / DISPLAY_INFO2_ENTRY;
    let n = (count as usize).min(fit);
    let displays: Vec<ArdDisplay> = (0..n).map(|_| read_display2(sock)).collect();
    sock.skip(size - DISPLAY_INFO2_HEADER - n * DISPLAY_INFO2_ENTRY);

    log::debug!(
        "ARD DisplayInfo2: v{version} fb={fb_width}x{fb_height} scaled={scaled_width}x{scaled_height} \
         display={display_id} flags=0x{flags:x} count={count}"
    );
    Ok(Frame::Complete(DisplayInfo2 {
        version,
        fb_width,
        fb_height,
        scaled_width,
        scaled_height,
        display_id,
        flags,
        count,
        displays,
    }))
}


#[cfg(test)]
mod tests {
    use super::test_data::*;
    use super::*;
    use crate::rfb::decoders::test_util::sock;

    #[test]
    fn legacy_display_list() {
        let mut s = sock();
        let mut wire = vec![0x05, 0x00, 0x03, 0x20, 0, 2, 0, 0];
        for (id, w, h) in [(1u32, 1280u16, 800u16), (2, 1920, 1080)] {
            wire.extend(id.to_be_bytes());
            wire.extend(w.to_be_bytes());
            wire.extend(h.to_be_bytes());
            wire.extend([0u8; 20]);
        }
        s.push_incoming(&wire[..40]).unwrap();
        assert!(read_display_info(&mut s).unwrap().is_none());
        assert_eq!(s.rq_len(), 40);
        s.push_incoming(&wire[40..]).unwrap();
        let info = read_display_info(&mut s).unwrap().unwrap();
        assert_eq!((info.fb_width, info.fb_height), (1280, 800));
        assert_eq!(info.displays[1], ArdDisplay::simple(2, 1920, 1080));
        assert_eq!(s.rq_len(), 0);
    }

    #[test]
    fn display_info2_geometry_and_flags() {
        let mut s = sock();
        let wire = payload(
            (3200, 1080),
            0x03,
            &[display2(7, 0, 0, 1280, 800, 2.0, true), display2(9, 1280, -100, 1920, 1080, 1.0, false)],
        );
        s.push_incoming(&wire).unwrap();
        let Frame::Complete(info) = read_display_info2(&mut s).unwrap() else {
            panic!("expected a display list");
        };
        assert!(info.curtained());
        assert!(info.console_active());
        assert_eq!(info.console_reason(), "ACTIVE");
        assert_eq!(info.displays.len(), 2);
        let d = &info.displays[0];
        assert_eq!((d.id, d.width, d.height), (7, 1280, 800));
        assert_eq!((d.backing_width, d.backing_height, d.backing_scale), (2560, 1600, 2.0));
        assert!(d.primary);
        let d = &info.displays[1];
        assert_eq!((d.left, d.top, d.width, d.height), (1280, -100, 1920, 1080));
        assert!(!d.primary);
        assert_eq!(s.rq_len(), 0);
    }

    #[test]
    fn display_info2_console_flags() {
        let mut s = sock();
        s.push_incoming(&payload((800, 600), 0x10, &[])).unwrap();
        let Frame::Complete(info) = read_display_info2(&mut s).unwrap() else {
            panic!("expected a display list");
        };
        assert!(!info.curtained());
        assert!(!info.console_active());
        assert_eq!(info.console_reason(), "LOGIN WINDOW");
    }

    #[test]
    fn display_info2_count_is_clamped_to_body() {
        let mut s = sock();
        let mut wire = payload((800, 600), 0, &[display2(1, 0, 0, 800, 600, 1.0, true)]);
        // Announce three displays while carrying one, plus trailing bytes.
        wire[20..22].copy_from_slice(&3u16.to_be_bytes());
        wire.extend([0xee; 5]);
        let size = (wire.len() - 2) as u16;
        wire[..2].copy_from_slice(&size.to_be_bytes());
        s.push_incoming(&wire).unwrap();
        let Frame::Complete(info) = read_display_info2(&mut s).unwrap() else {
            panic!("expected a display list");
        };
        assert_eq!(info.count, 3);
        assert_eq!(info.displays.len(), 1);
        assert_eq!(s.rq_len(), 0);
    }

    #[test]
    fn short_display_info2_is_skipped() {
        let mut s = sock();
        s.push_incoming(&[0, 4, 1, 2, 3, 4, 0xaa]).unwrap();
        assert_eq!(read_display_info2(&mut s).unwrap(), Frame::Ignored);
        assert_eq!(s.rq_len(), 1);
    }
}
