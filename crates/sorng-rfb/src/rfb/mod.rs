//! RFB client engine – top-level module.
//!
//! [`engine::RfbEngine`] is a synchronous state machine fed with bytes by
//! its owner. It negotiates the handshake and security scheme, decodes
//! framebuffer updates into a [`collab::Display`], and speaks the Apple
//! Remote Desktop extension when the server announces 003.889.
//! [`session_runner`] drives one engine over TCP on tokio.

pub mod ard;
pub mod collab;
pub mod config;
pub mod constants;
pub mod cursor;
pub mod decoders;
pub mod engine;
pub mod errors;
pub mod framebuffer;
pub mod framed;
pub mod messages;
pub mod security;
pub mod session_runner;
pub mod types;

mod clipboard;
mod handshake;
mod message_loop;

#[cfg(test)]
pub(crate) mod mock;
