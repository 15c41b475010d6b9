//! The seam to the signing and encryption layer.
//!
//! Key derivation, signature computation and ciphers live outside the engine. The
//! engine decides, per message, whether it must be sent plain, signed or sealed, and
//! hands incoming messages to the provider before decoding them.

use smb_msg::{Dialect, ProtocolId};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealMode {
    Plain,
    Sign,
    Encrypt,
}

pub trait TransformProvider: Send + Sync {
    /// How messages of `session_id` are protected right now.
    fn mode(&self, session_id: u64) -> SealMode;

    /// Feeds a raw NEGOTIATE or SESSION_SETUP message into the preauth hash.
    fn preauth_update(&self, _message: &[u8]) {}

    /// Called once authentication yields a session key.
    fn session_established(
        &self,
        _session_id: u64,
        _session_key: &[u8],
        _dialect: Dialect,
    ) -> Result<()> {
        Ok(())
    }

    /// Called on logoff or when the session is torn down.
    fn session_closed(&self, _session_id: u64) {}

    /// Protects an outgoing message. Returns the bytes to put on the wire.
    fn seal(&self, session_id: u64, mode: SealMode, message: Vec<u8>) -> Result<Vec<u8>>;

    /// Verifies or decrypts an incoming message. Returns a plain message or chain.
    fn unseal(&self, message: Vec<u8>) -> Result<Vec<u8>>;

    /// Whether messages currently pass through a signature or cipher, which makes
    /// bulk transfers worth spreading over several tasks.
    fn is_active(&self, session_id: u64) -> bool {
        self.mode(session_id) != SealMode::Plain
    }
}

/// Sends everything plain and refuses encrypted input.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransform;

impl TransformProvider for NoTransform {
    fn mode(&self, _session_id: u64) -> SealMode {
        SealMode::Plain
    }

    fn seal(&self, _session_id: u64, mode: SealMode, message: Vec<u8>) -> Result<Vec<u8>> {
        if mode == SealMode::Encrypt {
            return Err(Error::Transform("no cipher is configured".into()));
        }
        Ok(message)
    }

    fn unseal(&self, message: Vec<u8>) -> Result<Vec<u8>> {
        match ProtocolId::of(&message)? {
            ProtocolId::Plain => Ok(message),
            ProtocolId::Transformed => Err(Error::Transform(
                "received an encrypted message without a cipher".into(),
            )),
            ProtocolId::Compressed => Err(Error::Transform(
                "received a compressed message, compression was never negotiated".into(),
            )),
        }
    }
}
