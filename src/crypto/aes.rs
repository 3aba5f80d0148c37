//! AES-CTR stream cipher
//!
//! Every encrypted stream starts with a random IV in clear, followed by the
//! CTR keystream applied to the payload. The key is SHA-256 of the shared
//! password, truncated to the cipher's key length.

use bytes::BytesMut;
use log::trace;
use openssl::rand::rand_bytes;
use openssl::symm::{Cipher, Crypter, Mode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::{StreamCipher, StreamTransform};
use crate::common::{ProxyError, Result};

/// Length of the IV prefix on every encrypted stream
pub const IV_LEN: usize = 16;

/// Supported AES-CTR variants
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CipherKind {
    #[serde(rename = "aes-128-ctr")]
    Aes128Ctr,
    #[serde(rename = "aes-256-ctr")]
    Aes256Ctr,
}

impl CipherKind {
    fn openssl_cipher(&self) -> Cipher {
        match self {
            CipherKind::Aes128Ctr => Cipher::aes_128_ctr(),
            CipherKind::Aes256Ctr => Cipher::aes_256_ctr(),
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Ctr => 16,
            CipherKind::Aes256Ctr => 32,
        }
    }
}

impl Default for CipherKind {
    fn default() -> Self {
        CipherKind::Aes256Ctr
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherKind::Aes128Ctr => write!(f, "aes-128-ctr"),
            CipherKind::Aes256Ctr => write!(f, "aes-256-ctr"),
        }
    }
}

impl FromStr for CipherKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aes-128-ctr" => Ok(Self::Aes128Ctr),
            "aes-256-ctr" => Ok(Self::Aes256Ctr),
            _ => Err(ProxyError::Config(format!(
                "Invalid cipher: {}. Valid values are: aes-128-ctr, aes-256-ctr",
                s
            ))),
        }
    }
}

/// AES-CTR implementation of `StreamCipher`
#[derive(Clone)]
pub struct AesCrypto {
    kind: CipherKind,
    key: Vec<u8>,
}

impl AesCrypto {
    /// Derive the key from a shared password
    pub fn new(kind: CipherKind, password: &str) -> Self {
        let digest = Sha256::digest(password.as_bytes());
        Self {
            kind,
            key: digest[..kind.key_len()].to_vec(),
        }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    fn crypter(&self, mode: Mode, iv: &[u8]) -> Result<Crypter> {
        let crypter = Crypter::new(self.kind.openssl_cipher(), mode, &self.key, Some(iv))?;
        Ok(crypter)
    }
}

// Keys stay out of logs
impl fmt::Debug for AesCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesCrypto")
            .field("kind", &self.kind)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl StreamCipher for AesCrypto {
    fn encryptor(&self) -> Result<Box<dyn StreamTransform>> {
        let mut iv = [0u8; IV_LEN];
        rand_bytes(&mut iv)?;
        let crypter = self.crypter(Mode::Encrypt, &iv)?;
        Ok(Box::new(CtrEncryptor {
            crypter,
            pending_iv: Some(iv),
        }))
    }

    fn decryptor(&self) -> Result<Box<dyn StreamTransform>> {
        Ok(Box::new(CtrDecryptor {
            cipher: self.clone(),
            iv: Vec::with_capacity(IV_LEN),
            crypter: None,
        }))
    }
}

/// Run `input` through a CTR crypter, appending to `output`
fn update(crypter: &mut Crypter, input: &[u8], output: &mut BytesMut) -> Result<()> {
    if input.is_empty() {
        return Ok(());
    }
    let start = output.len();
    // OpenSSL wants room for one extra block even in CTR mode
    output.resize(start + input.len() + 16, 0);
    let written = crypter.update(input, &mut output[start..])?;
    output.truncate(start + written);
    Ok(())
}

struct CtrEncryptor {
    crypter: Crypter,
    pending_iv: Option<[u8; IV_LEN]>,
}

impl StreamTransform for CtrEncryptor {
    fn apply(&mut self, input: &[u8], output: &mut BytesMut) -> Result<()> {
        if let Some(iv) = self.pending_iv.take() {
            output.extend_from_slice(&iv);
        }
        update(&mut self.crypter, input, output)
    }
}

struct CtrDecryptor {
    cipher: AesCrypto,
    iv: Vec<u8>,
    crypter: Option<Crypter>,
}

impl StreamTransform for CtrDecryptor {
    fn apply(&mut self, mut input: &[u8], output: &mut BytesMut) -> Result<()> {
        if self.crypter.is_none() {
            let take = (IV_LEN - self.iv.len()).min(input.len());
            self.iv.extend_from_slice(&input[..take]);
            input = &input[take..];

            if self.iv.len() < IV_LEN {
                trace!("Waiting for IV: {}/{} bytes", self.iv.len(), IV_LEN);
                return Ok(());
            }
            self.crypter = Some(self.cipher.crypter(Mode::Decrypt, &self.iv)?);
        }

        match self.crypter.as_mut() {
            Some(crypter) => update(crypter, input, output),
            None => Ok(()),
        }
    }
}
