//! Error types for the RFB engine.

use std::fmt;

use sorng_rfb_crypto::CryptoError;

/// Top-level engine error.
///
/// Step functions return these; the engine turns every one of them into a
/// fail-and-disconnect except `Integrity`, which closes the transport
/// directly.
#[derive(Debug)]
pub enum RfbError {
    /// Transport-level I/O failure.
    Io(std::io::Error),
    /// RFB protocol violation (bad header, unexpected message, ...).
    Protocol(String),
    /// Authentication failure or server rejection.
    Auth(String),
    /// The server offered no security types we support.
    UnsupportedSecurity(Vec<u32>),
    /// Rectangle with an encoding that has no registered decoder.
    UnsupportedEncoding(i32),
    /// A decoder rejected rectangle data.
    Decoding(String),
    /// MAC mismatch or malformed encrypted frame.
    Integrity(String),
    /// Receive buffer or decompression ceiling exceeded.
    ResourceExhausted(String),
    /// Timeout expired.
    Timeout(String),
    /// Crypto primitive failure.
    Crypto(CryptoError),
    /// Generic internal error.
    Internal(String),
}

impl fmt::Display for RfbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(msg) => f.write_str(msg),
            Self::Auth(msg) => f.write_str(msg),
            Self::UnsupportedSecurity(types) => {
                let list: Vec<String> = types.iter().map(u32::to_string).collect();
                write!(f, "Unsupported security types (types: {})", list.join(", "))
            }
            Self::UnsupportedEncoding(enc) => {
                write!(f, "Unsupported encoding (encoding: {enc})")
            }
            Self::Decoding(msg) => write!(f, "Error decoding rect: {msg}"),
            Self::Integrity(msg) => write!(f, "Integrity failure: {msg}"),
            Self::ResourceExhausted(msg) => f.write_str(msg),
            Self::Timeout(msg) => f.write_str(msg),
            Self::Crypto(e) => write!(f, "Crypto error: {e}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for RfbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Crypto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RfbError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CryptoError> for RfbError {
    fn from(e: CryptoError) -> Self {
        Self::Crypto(e)
    }
}

impl From<RfbError> for String {
    fn from(e: RfbError) -> Self {
        e.to_string()
    }
}

impl RfbError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn decoding(msg: impl Into<String>) -> Self {
        Self::Decoding(msg.into())
    }
}
