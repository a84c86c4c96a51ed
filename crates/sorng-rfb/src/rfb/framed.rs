//! Framed transport: receive queue with backtracking reads, batching send
//! queue, and the optional AES-CBC + SHA-1 frame layer used once an ARD
//! session switches to stream encryption.

use sorng_rfb_crypto::{sha1, Aes128};

use super::collab::Transport;
use super::errors::RfbError;

const RQ_INITIAL_SIZE: usize = 4 * 1024 * 1024;
/// Hard ceiling for receive-queue growth.
pub const RQ_MAX_SIZE: usize = 40 * 1024 * 1024;
const SQ_SIZE: usize = 10 * 1024;
const MAC_SIZE: usize = 20;
const BLOCK: usize = 16;
/// Smallest frame that holds the length word and the MAC.
const MIN_FRAME: usize = (2 + MAC_SIZE).div_ceil(BLOCK) * BLOCK;

/// Per-direction chaining state of an encrypted stream.
struct StreamCipher {
    aes: Aes128,
    send_iv: [u8; BLOCK],
    recv_iv: [u8; BLOCK],
    send_seq: u32,
    recv_seq: u32,
    recv_buf: Vec<u8>,
}

pub struct FramedTransport {
    transport: Box<dyn Transport>,
    rq: Vec<u8>,
    rq_i: usize,
    /// Logical receive-buffer size, drives compaction and growth.
    rq_size: usize,
    sq: Vec<u8>,
    cipher: Option<StreamCipher>,
}

impl std::fmt::Debug for FramedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("rq_unread", &self.rq_len())
            .field("sq_len", &self.sq.len())
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl FramedTransport {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            rq: Vec::new(),
            rq_i: 0,
            rq_size: RQ_INITIAL_SIZE,
            sq: Vec::with_capacity(SQ_SIZE),
            cipher: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn close(&mut self) {
        if self.transport.is_open() {
            log::info!("Closing transport");
            self.transport.close();
        }
    }

    // ── Incoming ─────────────────────────────────────────────────────────

    /// Append bytes received from the transport.
    ///
    /// Returns `Ok(true)` when new plaintext is available. An integrity
    /// failure of the encrypted layer closes the transport and returns
    /// `RfbError::Integrity`.
    pub fn push_incoming(&mut self, data: &[u8]) -> Result<bool, RfbError> {
        if self.cipher.is_some() {
            let before = self.rq_len();
            self.decrypt_append(data)?;
            return Ok(self.rq_len() > before);
        }
        self.append_plain(data)?;
        Ok(self.rq_len() > 0)
    }

    fn append_plain(&mut self, data: &[u8]) -> Result<(), RfbError> {
        if self.rq_i == self.rq.len() {
            self.rq.clear();
            self.rq_i = 0;
        }
        if data.len() > self.rq_size.saturating_sub(self.rq.len()) {
            self.expand_compact(data.len())?;
        }
        self.rq.extend_from_slice(data);
        Ok(())
    }

    /// Move unread bytes to the front, growing the logical buffer when it
    /// would be more than 1/8 full.
    fn expand_compact(&mut self, min_fit: usize) -> Result<(), RfbError> {
        let unread = self.rq_len();
        let required = (unread + min_fit) * 8;
        let resize = self.rq_size < required;
        if resize {
            self.rq_size = (self.rq_size * 2).max(required);
        }
        if self.rq_size > RQ_MAX_SIZE {
            self.rq_size = RQ_MAX_SIZE;
            if RQ_MAX_SIZE - unread < min_fit {
                return Err(RfbError::ResourceExhausted(format!(
                    "Receive queue buffer exceeded {RQ_MAX_SIZE} bytes, and the new message could not fit"
                )));
            }
        }
        self.rq.drain(..self.rq_i);
        self.rq_i = 0;
        if resize {
            self.rq.reserve(self.rq_size.saturating_sub(self.rq.len()).min(min_fit));
        }
        Ok(())
    }

    fn decrypt_append(&mut self, incoming: &[u8]) -> Result<(), RfbError> {
        let mut plain = Vec::new();
        let mut failure = None;
        if let Some(c) = self.cipher.as_mut() {
            c.recv_buf.extend_from_slice(incoming);
            while c.recv_buf.len() >= 2 {
                let ct_len = u16::from_be_bytes([c.recv_buf[0], c.recv_buf[1]]) as usize;
                if ct_len < MIN_FRAME || ct_len % BLOCK != 0 {
                    failure = Some(format!("invalid encrypted packet length {ct_len}"));
                    break;
                }
                if c.recv_buf.len() < 2 + ct_len {
                    break;
                }
                let ct: Vec<u8> = c.recv_buf.drain(..2 + ct_len).skip(2).collect();
                let clear = match c.aes.decrypt_cbc(&c.recv_iv, &ct) {
                    Ok(clear) => clear,
                    Err(e) => {
                        failure = Some(format!("encrypted packet decryption failed: {e}"));
                        break;
                    }
                };
                c.recv_iv.copy_from_slice(&ct[ct_len - BLOCK..]);

                let hash_offset = ct_len - MAC_SIZE;
                let payload_len = u16::from_be_bytes([clear[0], clear[1]]) as usize;
                if payload_len > hash_offset - 2 {
                    failure = Some(format!(
                        "encrypted packet payload length {payload_len} overlaps the MAC of a {ct_len} byte frame"
                    ));
                    break;
                }

                let expected = frame_mac(c.recv_seq, &clear[..hash_offset]);
                let diff = expected
                    .iter()
                    .zip(&clear[hash_offset..])
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b));
                if diff != 0 {
                    failure = Some(format!("SHA-1 mismatch on encrypted packet {}", c.recv_seq));
                    break;
                }

                c.recv_seq = c.recv_seq.wrapping_add(1);
                plain.extend_from_slice(&clear[2..2 + payload_len]);
            }
        }

        // Frames verified before a failure are still delivered.
        if !plain.is_empty() {
            self.append_plain(&plain)?;
        }
        if let Some(msg) = failure {
            log::error!("ARD: {msg}, disconnecting");
            self.close();
            return Err(RfbError::Integrity(msg));
        }
        Ok(())
    }

    // ── Receive queue ────────────────────────────────────────────────────

    /// Number of unread bytes.
    pub fn rq_len(&self) -> usize {
        self.rq.len() - self.rq_i
    }

    /// Returns `Ok(true)` when fewer than `num` bytes are unread. In that
    /// case the read cursor is first moved back by `goback` bytes so a
    /// partially consumed header can be re-read on the next call.
    pub fn rq_wait(&mut self, what: &str, num: usize, goback: usize) -> Result<bool, RfbError> {
        if self.rq_len() < num {
            if goback > 0 {
                if self.rq_i < goback {
                    return Err(RfbError::Internal(format!(
                        "rQwait cannot backup {goback} bytes ({what})"
                    )));
                }
                self.rq_i -= goback;
            }
            return Ok(true);
        }
        Ok(false)
    }

    pub fn peek8(&self) -> u8 {
        self.rq.get(self.rq_i).copied().unwrap_or(0)
    }

    pub fn peek_bytes(&self, len: usize) -> &[u8] {
        let end = (self.rq_i + len).min(self.rq.len());
        &self.rq[self.rq_i..end]
    }

    pub fn skip(&mut self, len: usize) {
        self.rq_i = (self.rq_i + len).min(self.rq.len());
    }

    fn shift_be(&mut self, len: usize) -> u32 {
        let mut res = 0u32;
        for _ in 0..len {
            res = (res << 8) | u32::from(self.peek8());
            self.skip(1);
        }
        res
    }

    pub fn shift8(&mut self) -> u8 {
        self.shift_be(1) as u8
    }

    pub fn shift16(&mut self) -> u16 {
        self.shift_be(2) as u16
    }

    pub fn shift32(&mut self) -> u32 {
        self.shift_be(4)
    }

    pub fn shift_bytes(&mut self, len: usize) -> &[u8] {
        let start = self.rq_i;
        self.skip(len);
        &self.rq[start..self.rq_i]
    }

    pub fn shift_vec(&mut self, len: usize) -> Vec<u8> {
        self.shift_bytes(len).to_vec()
    }

    /// Latin-1 string: every byte maps to the code point of the same value.
    pub fn shift_str(&mut self, len: usize) -> String {
        self.shift_bytes(len).iter().map(|&b| b as char).collect()
    }

    // ── Send queue ───────────────────────────────────────────────────────

    fn sq_ensure_space(&mut self, bytes: usize) {
        if SQ_SIZE - self.sq.len() < bytes {
            self.flush();
        }
    }

    pub fn sq_push8(&mut self, v: u8) {
        self.sq_ensure_space(1);
        self.sq.push(v);
    }

    pub fn sq_push16(&mut self, v: u16) {
        self.sq_ensure_space(2);
        self.sq.extend_from_slice(&v.to_be_bytes());
    }

    pub fn sq_push32(&mut self, v: u32) {
        self.sq_ensure_space(4);
        self.sq.extend_from_slice(&v.to_be_bytes());
    }

    pub fn sq_push_bytes(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            self.sq_ensure_space(1);
            let chunk = (SQ_SIZE - self.sq.len()).min(bytes.len());
            self.sq.extend_from_slice(&bytes[..chunk]);
            bytes = &bytes[chunk..];
        }
    }

    /// Latin-1 encode and push.
    pub fn sq_push_str(&mut self, s: &str) {
        let bytes: Vec<u8> = s.chars().map(|c| c as u32 as u8).collect();
        self.sq_push_bytes(&bytes);
    }

    pub fn sq_len(&self) -> usize {
        self.sq.len()
    }

    /// Send whatever is queued. A no-op while the transport is closed.
    /// A send failure closes the transport; its owner reports the close.
    pub fn flush(&mut self) {
        if self.sq.is_empty() || !self.transport.is_open() {
            return;
        }
        let data = std::mem::take(&mut self.sq);
        let packet = match self.cipher.as_mut() {
            Some(c) => match encrypt_frame(c, &data) {
                Ok(p) => p,
                Err(e) => {
                    log::error!("Encrypted flush failed: {e}");
                    self.sq = Vec::with_capacity(SQ_SIZE);
                    return;
                }
            },
            None => data,
        };
        if let Err(e) = self.transport.send(&packet) {
            log::error!("Transport send failed: {e}");
            self.transport.close();
        }
        self.sq = Vec::with_capacity(SQ_SIZE);
    }

    // ── Encryption ───────────────────────────────────────────────────────

    /// Switch both directions to encrypted framing. Both chaining IVs
    /// start at `iv` and both sequence counters at zero.
    pub fn enable_encryption(&mut self, key: &[u8; 16], iv: &[u8; 16]) {
        self.cipher = Some(StreamCipher {
            aes: Aes128::new(key),
            send_iv: *iv,
            recv_iv: *iv,
            send_seq: 0,
            recv_seq: 0,
            recv_buf: Vec::new(),
        });
    }

    /// Bytes buffered before encryption was switched on are ciphertext;
    /// take them out of the queue and run them through the decryptor.
    pub fn reprocess_remaining_as_encrypted(&mut self) -> Result<(), RfbError> {
        if self.cipher.is_none() {
            return Ok(());
        }
        let remaining = self.rq_len();
        if remaining == 0 {
            return Ok(());
        }
        log::info!("Reprocessing {remaining} remaining rQ bytes as encrypted data");
        let data = self.rq.split_off(self.rq_i);
        self.rq.clear();
        self.rq_i = 0;
        self.decrypt_append(&data)
    }
}

fn frame_mac(seq: u32, body: &[u8]) -> [u8; MAC_SIZE] {
    let mut input = Vec::with_capacity(4 + body.len());
    input.extend_from_slice(&seq.to_be_bytes());
    input.extend_from_slice(body);
    sha1(&input)
}

/// `[u16be total][AES-CBC(u16be len ‖ data ‖ zero pad ‖ sha1(seq ‖ ..))]`
fn encrypt_frame(c: &mut StreamCipher, data: &[u8]) -> Result<Vec<u8>, RfbError> {
    let len = data.len();
    let total = (2 + len + MAC_SIZE).div_ceil(BLOCK) * BLOCK;
    if total > u16::MAX as usize {
        return Err(RfbError::Internal(format!("encrypted frame of {total} bytes too large")));
    }
    let mut clear = vec![0u8; total];
    clear[..2].copy_from_slice(&(len as u16).to_be_bytes());
    clear[2..2 + len].copy_from_slice(data);
    let mac = frame_mac(c.send_seq, &clear[..total - MAC_SIZE]);
    clear[total - MAC_SIZE..].copy_from_slice(&mac);

    let ct = c.aes.encrypt_cbc(&c.send_iv, &clear)?;
    c.send_iv.copy_from_slice(&ct[ct.len() - BLOCK..]);
    c.send_seq = c.send_seq.wrapping_add(1);

    let mut packet = Vec::with_capacity(2 + total);
    packet.extend_from_slice(&(total as u16).to_be_bytes());
    packet.extend_from_slice(&ct);
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::mock::MockTransport;

    fn framed() -> (FramedTransport, MockTransport) {
        let mock = MockTransport::new();
        (FramedTransport::new(Box::new(mock.clone())), mock)
    }

    const KEY: [u8; 16] = *b"0123456789abcdef";
    const IV: [u8; 16] = *b"fedcba9876543210";

    /// Build frames the way the server does, from its own counters.
    fn server_frame(aes: &Aes128, iv: &mut [u8; 16], seq: &mut u32, data: &[u8]) -> Vec<u8> {
        let mut c = StreamCipher {
            aes: aes.clone(),
            send_iv: *iv,
            recv_iv: [0; 16],
            send_seq: *seq,
            recv_seq: 0,
            recv_buf: Vec::new(),
        };
        let out = encrypt_frame(&mut c, data).unwrap();
        *iv = c.send_iv;
        *seq = c.send_seq;
        out
    }

    #[test]
    fn rq_wait_rollback_restores_cursor() {
        let (mut t, _) = framed();
        t.push_incoming(&[1, 2, 3]).unwrap();
        assert_eq!(t.shift8(), 1);
        assert_eq!(t.rq_len(), 2);
        assert!(t.rq_wait("hdr", 4, 1).unwrap());
        assert_eq!(t.rq_len(), 3);
        assert_eq!(t.shift8(), 1);
        assert!(!t.rq_wait("hdr", 2, 1).unwrap());
        assert_eq!(t.rq_len(), 2);
    }

    #[test]
    fn rq_wait_cannot_backup_past_start() {
        let (mut t, _) = framed();
        t.push_incoming(&[9]).unwrap();
        assert!(t.rq_wait("x", 5, 1).is_err());
    }

    #[test]
    fn shifts_are_big_endian() {
        let (mut t, _) = framed();
        t.push_incoming(&[0x12, 0x34, 0xde, 0xad, 0xbe, 0xef, b'h', 0xe9]).unwrap();
        assert_eq!(t.shift16(), 0x1234);
        assert_eq!(t.shift32(), 0xdead_beef);
        assert_eq!(t.shift_str(2), "h\u{e9}");
        assert_eq!(t.rq_len(), 0);
    }

    #[test]
    fn shifting_past_end_clamps() {
        let (mut t, _) = framed();
        t.push_incoming(&[1]).unwrap();
        assert_eq!(t.shift32(), 0x0100_0000);
        assert_eq!(t.rq_len(), 0);
        assert!(t.shift_bytes(4).is_empty());
    }

    #[test]
    fn queue_resets_when_drained() {
        let (mut t, _) = framed();
        t.push_incoming(&[1, 2]).unwrap();
        t.skip(2);
        t.push_incoming(&[3]).unwrap();
        assert_eq!(t.rq.len(), 1);
        assert_eq!(t.shift8(), 3);
    }

    #[test]
    fn growth_past_ceiling_is_fatal() {
        let (mut t, _) = framed();
        let chunk = vec![0u8; 8 * 1024 * 1024];
        for _ in 0..5 {
            t.push_incoming(&chunk).unwrap();
        }
        assert_eq!(t.rq_len(), 40 * 1024 * 1024);
        match t.push_incoming(&[0]) {
            Err(RfbError::ResourceExhausted(_)) => {}
            other => panic!("expected resource exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn plain_flush_sends_queue() {
        let (mut t, mock) = framed();
        t.sq_push8(3);
        t.sq_push16(0x0102);
        t.sq_push32(7);
        t.flush();
        assert_eq!(mock.take_sent(), vec![3, 1, 2, 0, 0, 0, 7]);
        assert_eq!(t.sq_len(), 0);
    }

    #[test]
    fn send_queue_autoflushes_when_full() {
        let (mut t, mock) = framed();
        t.sq_push_bytes(&vec![0xaa; SQ_SIZE + 10]);
        assert_eq!(mock.take_sent().len(), SQ_SIZE);
        t.flush();
        assert_eq!(mock.take_sent().len(), 10);
    }

    #[test]
    fn flush_is_noop_when_closed() {
        let (mut t, mock) = framed();
        mock.set_open(false);
        t.sq_push8(1);
        t.flush();
        assert!(mock.take_sent().is_empty());
    }

    #[test]
    fn encrypted_flush_frame_layout() {
        let (mut t, mock) = framed();
        t.enable_encryption(&KEY, &IV);
        t.sq_push_bytes(&[1, 2, 3, 4, 5]);
        t.flush();
        let sent = mock.take_sent();
        // ceil16(2 + 5 + 20) = 32
        assert_eq!(&sent[..2], &[0, 32]);
        assert_eq!(sent.len(), 34);

        let aes = Aes128::new(&KEY);
        let clear = aes.decrypt_cbc(&IV, &sent[2..]).unwrap();
        assert_eq!(&clear[..7], &[0, 5, 1, 2, 3, 4, 5]);
        assert!(clear[7..12].iter().all(|&b| b == 0));
        assert_eq!(&clear[12..], &frame_mac(0, &clear[..12]));
    }

    #[test]
    fn encrypted_send_chains_iv_and_sequence() {
        let (mut t, mock) = framed();
        t.enable_encryption(&KEY, &IV);
        t.sq_push8(1);
        t.flush();
        let first = mock.take_sent();
        t.sq_push8(1);
        t.flush();
        let second = mock.take_sent();
        assert_ne!(first, second);

        let aes = Aes128::new(&KEY);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&first[first.len() - 16..]);
        let clear = aes.decrypt_cbc(&iv, &second[2..]).unwrap();
        let off = clear.len() - MAC_SIZE;
        assert_eq!(&clear[off..], &frame_mac(1, &clear[..off]));
    }

    #[test]
    fn encrypted_receive_roundtrip_across_chunks() {
        let (mut t, _) = framed();
        t.enable_encryption(&KEY, &IV);
        let aes = Aes128::new(&KEY);
        let (mut iv, mut seq) = (IV, 0u32);
        let mut wire = server_frame(&aes, &mut iv, &mut seq, b"hello");
        wire.extend(server_frame(&aes, &mut iv, &mut seq, b" world"));

        let (a, b) = wire.split_at(7);
        assert!(!t.push_incoming(a).unwrap());
        assert!(t.push_incoming(b).unwrap());
        assert_eq!(t.shift_str(11), "hello world");
    }

    #[test]
    fn unaligned_frame_length_closes_transport() {
        let (mut t, mock) = framed();
        t.enable_encryption(&KEY, &IV);
        let mut wire = vec![0, 17];
        wire.extend(vec![0u8; 17]);
        match t.push_incoming(&wire) {
            Err(RfbError::Integrity(_)) => {}
            other => panic!("expected integrity failure, got {other:?}"),
        }
        assert!(!mock.is_open_now());
        assert_eq!(t.rq_len(), 0);
    }

    #[test]
    fn zero_frame_length_closes_transport() {
        let (mut t, mock) = framed();
        t.enable_encryption(&KEY, &IV);
        assert!(t.push_incoming(&[0, 0]).is_err());
        assert!(!mock.is_open_now());
    }

    #[test]
    fn frame_too_short_for_mac_closes_transport() {
        let (mut t, mock) = framed();
        t.enable_encryption(&KEY, &IV);
        let aes = Aes128::new(&KEY);
        let mut clear = [0u8; 16];
        clear[..3].copy_from_slice(&[0, 1, 2]);
        let mut wire = vec![0, 16];
        wire.extend(aes.encrypt_cbc(&IV, &clear).unwrap());
        assert!(matches!(t.push_incoming(&wire), Err(RfbError::Integrity(_))));
        assert!(!mock.is_open_now());
        assert_eq!(t.rq_len(), 0);
    }

    #[test]
    fn payload_reaching_into_mac_is_rejected() {
        let (mut t, mock) = framed();
        t.enable_encryption(&KEY, &IV);
        let aes = Aes128::new(&KEY);
        // 32-byte frame: room for 10 payload bytes before the MAC.
        let mut clear = vec![0u8; 32];
        clear[..2].copy_from_slice(&11u16.to_be_bytes());
        let mac = frame_mac(0, &clear[..12]);
        clear[12..].copy_from_slice(&mac);
        let mut wire = vec![0, 32];
        wire.extend(aes.encrypt_cbc(&IV, &clear).unwrap());
        assert!(matches!(t.push_incoming(&wire), Err(RfbError::Integrity(_))));
        assert!(!mock.is_open_now());
    }

    #[test]
    fn tampered_mac_closes_transport() {
        let (mut t, mock) = framed();
        t.enable_encryption(&KEY, &IV);
        let aes = Aes128::new(&KEY);
        let (mut iv, mut seq) = (IV, 0u32);
        let mut wire = server_frame(&aes, &mut iv, &mut seq, b"data");
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(matches!(t.push_incoming(&wire), Err(RfbError::Integrity(_))));
        assert!(!mock.is_open_now());
    }

    #[test]
    fn wrong_sequence_number_is_rejected() {
        let (mut t, _) = framed();
        t.enable_encryption(&KEY, &IV);
        let aes = Aes128::new(&KEY);
        let (mut iv, mut seq) = (IV, 5u32);
        let wire = server_frame(&aes, &mut iv, &mut seq, b"data");
        assert!(t.push_incoming(&wire).is_err());
    }

    #[test]
    fn reprocess_buffered_bytes_as_ciphertext() {
        let (mut t, _) = framed();
        let aes = Aes128::new(&KEY);
        let (mut iv, mut seq) = (IV, 0u32);
        let frame = server_frame(&aes, &mut iv, &mut seq, &[0x02]);

        let mut wire = vec![0xff];
        wire.extend_from_slice(&frame);
        t.push_incoming(&wire).unwrap();
        assert_eq!(t.shift8(), 0xff);

        t.enable_encryption(&KEY, &IV);
        t.reprocess_remaining_as_encrypted().unwrap();
        assert_eq!(t.rq_len(), 1);
        assert_eq!(t.shift8(), 0x02);
    }
}
