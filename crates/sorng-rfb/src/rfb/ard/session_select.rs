//! ARD session selection, used when ServerInit flags say a console user
//! must be chosen before the session starts.
//!
//! Both server messages are `[u16 bodySize][body]`.

use crate::rfb::errors::RfbError;
use crate::rfb::framed::FramedTransport;

pub const CONNECT_TO_CONSOLE: u8 = 1;

const COMMAND_BODY_SIZE: u16 = 72;
const COMMAND_VERSION: u16 = 1;
const USERNAME_FIELD: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub version: u16,
    pub allowed_commands: u32,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectStatus {
    Granted,
    Pending,
    Denied(u32),
}

impl SelectStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 | 4 => Self::Granted,
            2 | 3 => Self::Pending,
            other => Self::Denied(other),
        }
    }
}

fn wait_body(sock: &mut FramedTransport, what: &str) -> Result<Option<usize>, RfbError> {
    if sock.rq_wait(what, 2, 0)? {
        return Ok(None);
    }
    let hdr = sock.peek_bytes(2);
    let body = u16::from_be_bytes([hdr[0], hdr[1]]) as usize;
    if sock.rq_wait(what, 2 + body, 0)? {
        return Ok(None);
    }
    sock.skip(2);
    Ok(Some(body))
}

pub fn read_session_info(sock: &mut FramedTransport) -> Result<Option<SessionInfo>, RfbError> {
    let Some(body) = wait_body(sock, "ARD SessionInfo")? else {
        return Ok(None);
    };
    if body < 10 {
        return Err(RfbError::protocol(format!("ARD SessionInfo too short ({body} bytes)")));
    }
    let version = sock.shift16();
    let allowed_commands = sock.shift32();
    sock.skip(4);
    let raw = sock.shift_bytes(body - 10);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let username = raw[..end].iter().map(|&b| b as char).collect();
    Ok(Some(SessionInfo {
        version,
        allowed_commands,
        username,
    }))
}

pub fn read_session_result(sock: &mut FramedTransport) -> Result<Option<SelectStatus>, RfbError> {
    let Some(body) = wait_body(sock, "ARD SessionResult")? else {
        return Ok(None);
    };
    if body < 6 {
        return Err(RfbError::protocol(format!("ARD SessionResult too short ({body} bytes)")));
    }
    let version = sock.shift16();
    let status = sock.shift32();
    sock.skip(body - 6);
    log::debug!("ARD SessionResult: version={version} status={status}");
    Ok(Some(SelectStatus::from_code(status)))
}

/// Queue and send a SessionCommand for `username`.
pub fn session_command(sock: &mut FramedTransport, command: u8, username: &str) {
    sock.sq_push16(COMMAND_BODY_SIZE);
    sock.sq_push16(COMMAND_VERSION);
    sock.sq_push32(0);
    sock.sq_push8(command);
    sock.sq_push8(0);
    let mut field = [0u8; USERNAME_FIELD];
    for (dst, ch) in field.iter_mut().zip(username.chars().take(USERNAME_FIELD - 1)) {
        *dst = u32::from(ch).min(0xff) as u8;
    }
    sock.sq_push_bytes(&field);
    sock.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::mock::MockTransport;

    fn framed() -> (FramedTransport, MockTransport) {
        let wire = MockTransport::new();
        (FramedTransport::new(Box::new(wire.clone())), wire)
    }

    #[test]
    fn session_info_username() {
        let (mut s, _) = framed();
        let mut body = vec![0, 1, 0, 0, 0, 3, 0, 0, 0, 0];
        body.extend(b"alice\0\0\0");
        let mut wire = (body.len() as u16).to_be_bytes().to_vec();
        wire.extend(&body);
        s.push_incoming(&wire[..6]).unwrap();
        assert!(read_session_info(&mut s).unwrap().is_none());
        s.push_incoming(&wire[6..]).unwrap();
        let info = read_session_info(&mut s).unwrap().unwrap();
        assert_eq!(info.username, "alice");
        assert_eq!(info.allowed_commands, 3);
        assert_eq!(s.rq_len(), 0);
    }

    #[test]
    fn session_result_codes() {
        assert_eq!(SelectStatus::from_code(0), SelectStatus::Granted);
        assert_eq!(SelectStatus::from_code(4), SelectStatus::Granted);
        assert_eq!(SelectStatus::from_code(3), SelectStatus::Pending);
        assert_eq!(SelectStatus::from_code(1), SelectStatus::Denied(1));

        let (mut s, _) = framed();
        s.push_incoming(&[0, 8, 0, 1, 0, 0, 0, 2, 9, 9]).unwrap();
        assert_eq!(read_session_result(&mut s).unwrap(), Some(SelectStatus::Pending));
        assert_eq!(s.rq_len(), 0);
    }

    #[test]
    fn command_layout() {
        let (mut s, wire) = framed();
        session_command(&mut s, CONNECT_TO_CONSOLE, "bob");
        let sent = wire.take_sent();
        assert_eq!(sent.len(), 74);
        assert_eq!(&sent[..10], &[0, 72, 0, 1, 0, 0, 0, 0, 1, 0]);
        assert_eq!(&sent[10..14], b"bob\0");
    }
}
