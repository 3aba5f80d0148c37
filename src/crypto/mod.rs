//! Stream cipher seam
//!
//! The relay engine only sees `StreamCipher`: one fresh `StreamTransform`
//! per direction per session. `AesCrypto` is the OpenSSL-backed default.

mod aes;

pub use aes::{AesCrypto, CipherKind, IV_LEN};

use bytes::BytesMut;

use crate::common::Result;

/// Stateful transform over one direction of a byte stream
///
/// Implementations must be length-agnostic: feeding a stream in arbitrary
/// chunks yields the same output as feeding it at once.
pub trait StreamTransform: Send {
    /// Transform `input`, appending the result to `output`
    fn apply(&mut self, input: &[u8], output: &mut BytesMut) -> Result<()>;
}

/// Factory for per-session encrypt/decrypt transforms
pub trait StreamCipher: Send + Sync {
    /// Transform for client -> relay bytes
    fn encryptor(&self) -> Result<Box<dyn StreamTransform>>;

    /// Transform for relay -> client bytes
    fn decryptor(&self) -> Result<Box<dyn StreamTransform>>;
}
