//! UserInfo (1102): console username and a zlib-compressed avatar.
//!
//! `[u16 nameLen][name][u32 imageSize][u32 imageEncoding][image]`

use flate2::Decompress;

use crate::rfb::decoders::inflate_stream;
use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;

/// Upper bound on a decompressed avatar.
pub const MAX_AVATAR_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// Empty while the login window is up.
    pub username: String,
    pub image_size: u32,
    pub image_encoding: u32,
    /// Inflated avatar bytes; `None` when absent or undecodable.
    pub avatar: Option<Vec<u8>>,
}

pub fn read_user_info(sock: &mut FramedTransport) -> Result<Option<UserInfo>, RfbError> {
    if sock.rq_wait("ArdUserInfo header", 10, 0)? {
        return Ok(None);
    }
    let peek = sock.peek_bytes(2);
    let name_len = u16::from_be_bytes([peek[0], peek[1]]) as usize;
    let header = 2 + name_len + 8;
    if sock.rq_wait("ArdUserInfo name+header", header, 0)? {
        return Ok(None);
    }
    let size = sock.peek_bytes(header);
    let image_size = u32::from_be_bytes([
        size[header - 8],
        size[header - 7],
        size[header - 6],
        size[header - 5],
    ]);
    if sock.rq_wait("ArdUserInfo avatar", header + image_size as usize, 0)? {
        return Ok(None);
    }

    sock.skip(2);
    let username = String::from_utf8_lossy(sock.shift_bytes(name_len)).into_owned();
    sock.skip(4);
    let image_encoding = sock.shift32();

    let avatar = if image_size > 0 {
        let compressed = sock.shift_bytes(image_size as usize);
        let mut z = Decompress::new(true);
        match inflate_stream(&mut z, compressed, compressed.len() * 4, MAX_AVATAR_SIZE) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("ARD UserInfo: avatar dropped: {e}");
                None
            }
        }
    } else {
        None
    };

    Ok(Some(UserInfo {
        username,
        image_size,
        image_encoding,
        avatar,
    }))
}
