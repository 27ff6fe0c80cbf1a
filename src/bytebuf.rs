//! Growable byte buffer used by the line-oriented auth protocol, plus the
//! codec helpers shared by auth and the cookie keyring.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::{Error, Result};

/// A growable byte buffer with front-drain semantics.
///
/// The auth engine accumulates incoming socket bytes here and consumes them
/// one CRLF-terminated line at a time; outgoing command lines queue up in
/// another instance until the transport drains them.
#[derive(Debug, Default)]
pub(crate) struct ByteBuf(Vec<u8>);

impl ByteBuf {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    /// Remove and return the first `n` bytes.
    pub fn drain_front(&mut self, n: usize) -> Vec<u8> {
        self.0.drain(..n).collect()
    }

    /// Take the whole contents, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }

    /// Extract one complete `\r\n`-terminated line, without its terminator.
    ///
    /// Returns `Ok(None)` when no full line has arrived yet. A bare `\n`
    /// without the preceding `\r` is a protocol violation.
    pub fn take_crlf_line(&mut self) -> Result<Option<Vec<u8>>> {
        match self.0.iter().position(|b| *b == b'\n') {
            None => Ok(None),
            Some(0) => Err(Error::Handshake("invalid line ending in handshake".into())),
            Some(i) => {
                if self.0[i - 1] != b'\r' {
                    return Err(Error::Handshake("invalid line ending in handshake".into()));
                }
                let mut line = self.drain_front(i + 1);
                line.truncate(i - 1);
                Ok(Some(line))
            }
        }
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub(crate) fn hex_decode(s: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(s)?)
}

pub(crate) fn base64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub(crate) fn base64_decode(s: &str) -> Result<Vec<u8>> {
    Ok(BASE64.decode(s)?)
}

/// An owning byte container that zeroes its contents on drop.
///
/// Holds cookie secrets and the hash pre-images derived from them, so the
/// secret material does not linger in freed heap memory.
pub(crate) struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        for b in self.0.iter_mut() {
            // Volatile so the zeroing is not elided as a dead store.
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(..)")
    }
}
