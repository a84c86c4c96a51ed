//! ARD pasteboard blobs carried by ClipboardSend (0x1f).
//!
//! ```text
//! [u32 numTypes]
//!   per type: [u32 nameLen][name][u32 flags][u32 numProps]
//!             per prop: [u32 keyLen][key][u32 valLen][val]
//!             [u32 dataLen][data]
//! ```

use std::borrow::Cow;

const UTF8_TEXT: &str = "public.utf8-plain-text";
const MAC_TEXT: &str = "com.apple.traditional-mac-plain-text";

const MAX_TYPES: u32 = 20;
const MAX_NAME_LEN: usize = 256;
const MAX_PROPS: u32 = 20;
const MAX_VALUE_LEN: usize = 65536;

struct Reader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Result<u32, String> {
        let bytes = self
            .data
            .get(self.off..self.off + 4)
            .ok_or_else(|| format!("truncated at offset {}", self.off))?;
        self.off += 4;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn bytes(&mut self, len: usize, max: usize, what: &str) -> Result<&'a [u8], String> {
        if len > max || self.off + len > self.data.len() {
            return Err(format!("bad {what}={len}"));
        }
        let out = &self.data[self.off..self.off + len];
        self.off += len;
        Ok(out)
    }

    fn skip(&mut self, len: usize) {
        self.off += len;
    }
}

fn parse_types(data: &[u8]) -> Result<Vec<(Cow<'_, str>, &[u8])>, String> {
    let mut r = Reader { data, off: 0 };
    let num_types = r.u32()?;
    if num_types == 0 || num_types > MAX_TYPES {
        return Err(format!("unlikely numTypes: {num_types}"));
    }

    let mut types = Vec::with_capacity(num_types as usize);
    for _ in 0..num_types {
        let name_len = r.u32()? as usize;
        let name = String::from_utf8_lossy(r.bytes(name_len, MAX_NAME_LEN, "nameLen")?);
        r.skip(4);

        let num_props = r.u32()?;
        if num_props > MAX_PROPS {
            return Err(format!("bad numProps={num_props}"));
        }
        for _ in 0..num_props {
            let key_len = r.u32()? as usize;
            r.bytes(key_len, MAX_NAME_LEN, "keyLen")?;
            let val_len = r.u32()? as usize;
            r.bytes(val_len, MAX_VALUE_LEN, "valLen")?;
        }

        let data_len = r.u32()? as usize;
        let body = r.bytes(data_len, usize::MAX, "dataLen")?;
        types.push((name, body));
    }
    Ok(types)
}

/// Extract text from a decompressed pasteboard.
///
/// Input that does not look like a pasteboard is taken as plain UTF-8.
/// A malformed pasteboard falls back to its bytes with NULs removed.
pub fn parse_pasteboard(data: &[u8]) -> String {
    if data.len() < 8 || data[0] != 0 || data[1] != 0 {
        return String::from_utf8_lossy(data).into_owned();
    }

    match parse_types(data) {
        Ok(types) => {
            for wanted in [UTF8_TEXT, MAC_TEXT] {
                if let Some((_, body)) = types.iter().find(|(name, body)| name == wanted && !body.is_empty()) {
                    return String::from_utf8_lossy(body).into_owned();
                }
            }
            log::debug!("ARD Pasteboard: no text types in {} types", types.len());
            String::new()
        }
        Err(e) => {
            log::warn!("ARD Pasteboard parse failed: {e}");
            String::from_utf8_lossy(data).replace('\0', "")
        }
    }
}

/// Single-type pasteboard holding `text` as UTF-8.
pub fn build_pasteboard(text: &str) -> Vec<u8> {
    let name = UTF8_TEXT.as_bytes();
    let body = text.as_bytes();
    let mut pb = Vec::with_capacity(20 + name.len() + body.len());
    pb.extend_from_slice(&1u32.to_be_bytes());
    pb.extend_from_slice(&(name.len() as u32).to_be_bytes());
    pb.extend_from_slice(name);
    pb.extend_from_slice(&0u32.to_be_bytes());
    pb.extend_from_slice(&0u32.to_be_bytes());
    pb.extend_from_slice(&(body.len() as u32).to_be_bytes());
    pb.extend_from_slice(body);
    pb
}

/// Drop one trailing NUL and convert CRLF line endings.
pub fn normalize_text(text: &str) -> String {
    text.strip_suffix('\0').unwrap_or(text).replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pasteboard(types: &[(&str, &[(&str, &str)], &[u8])]) -> Vec<u8> {
        let mut pb = (types.len() as u32).to_be_bytes().to_vec();
        for (name, props, body) in types {
            pb.extend((name.len() as u32).to_be_bytes());
            pb.extend(name.as_bytes());
            pb.extend(0u32.to_be_bytes());
            pb.extend((props.len() as u32).to_be_bytes());
            for (k, v) in *props {
                pb.extend((k.len() as u32).to_be_bytes());
                pb.extend(k.as_bytes());
                pb.extend((v.len() as u32).to_be_bytes());
                pb.extend(v.as_bytes());
            }
            pb.extend((body.len() as u32).to_be_bytes());
            pb.extend(*body);
        }
        pb
    }

    #[test]
    fn build_then_parse_with_line_endings() {
        let pb = build_pasteboard("one\r\ntwo\0");
        assert_eq!(&pb[..4], &[0, 0, 0, 1]);
        assert_eq!(normalize_text(&parse_pasteboard(&pb)), "one\ntwo");
    }

    #[test]
    fn prefers_utf8_over_mac_text() {
        let pb = pasteboard(&[
            (MAC_TEXT, &[], b"legacy"),
            ("public.rtf", &[("k", "v")], b"{\\rtf}"),
            (UTF8_TEXT, &[], "h\u{e9}llo".as_bytes()),
        ]);
        assert_eq!(parse_pasteboard(&pb), "h\u{e9}llo");
    }

    #[test]
    fn falls_back_to_mac_text_and_skips_empty_utf8() {
        let pb = pasteboard(&[(UTF8_TEXT, &[], b""), (MAC_TEXT, &[], b"legacy")]);
        assert_eq!(parse_pasteboard(&pb), "legacy");
    }

    #[test]
    fn no_text_type_gives_empty_string() {
        let pb = pasteboard(&[("public.png", &[], b"\x89PNG")]);
        assert_eq!(parse_pasteboard(&pb), "");
    }

    #[test]
    fn raw_text_passes_through() {
        assert_eq!(parse_pasteboard(b"plain text"), "plain text");
        assert_eq!(parse_pasteboard(b"\0\0"), "\0\0");
    }

    #[test]
    fn malformed_pasteboard_strips_nuls() {
        let mut pb = pasteboard(&[(UTF8_TEXT, &[], b"abc")]);
        pb.truncate(pb.len() - 2);
        let text = parse_pasteboard(&pb);
        assert!(!text.contains('\0'));
        assert!(text.contains("public.utf8-plain-text"));

        let mut too_many = 21u32.to_be_bytes().to_vec();
        too_many.extend_from_slice(b"data");
        assert_eq!(parse_pasteboard(&too_many), "\u{15}data");
    }
}
