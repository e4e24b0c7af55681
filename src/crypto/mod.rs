//! Cipher capability applied to relay connections.
//!
//! A [`Cipher`] is a cheap-to-clone handle that upgrades a stream or packet
//! connection so that writes are encrypted and reads are decrypted
//! transparently. The flow pipelines never look inside.

use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};

use crate::error::{Error, Result};
use crate::net::{BoxedStream, PacketConn};

mod aead;
mod packet;
mod stream;

pub(crate) use self::aead::AeadState;
pub use self::packet::CryptoPacketConn;
pub use self::stream::CryptoStream;

/// Supported cipher methods.
///
/// `Plain` passes bytes through untouched and exists for interop tests and
/// deployments that obfuscate at another layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherKind {
    Plain,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Accepts both the upper-case spellings used by the mobile bindings and
    /// the usual dashed aliases.
    pub fn parse(name: &str) -> Result<CipherKind> {
        match name {
            "plain" | "none" | "dummy" => Ok(CipherKind::Plain),
            "AEAD_AES_128_GCM" | "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "AEAD_AES_256_GCM" | "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "AEAD_CHACHA20_POLY1305" | "chacha20-ietf-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            _ => Err(Error::Config(format!("unsupported cipher method {:?}", name))),
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Plain => 0,
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Salt length equals key length for every AEAD method.
    pub fn salt_len(self) -> usize {
        self.key_len()
    }

    pub fn tag_len(self) -> usize {
        match self {
            CipherKind::Plain => 0,
            _ => aead::TAG_LEN,
        }
    }
}

/// Encrypting wrapper factory for relay connections.
#[derive(Clone)]
pub struct Cipher {
    kind: CipherKind,
    key: Bytes,
}

impl Cipher {
    pub fn new(method: &str, password: &str) -> Result<Cipher> {
        let kind = CipherKind::parse(method)?;
        let key = derive_key(password, kind.key_len());
        Ok(Cipher { kind, key: key.into() })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    /// Upgrades a stream connection. Plain is a no-op.
    pub fn wrap_stream(&self, conn: BoxedStream) -> BoxedStream {
        match self.kind {
            CipherKind::Plain => conn,
            _ => Box::new(CryptoStream::new(conn, self.clone())),
        }
    }

    /// Upgrades a packet connection. Plain is a no-op.
    pub fn wrap_packet(&self, pc: Arc<dyn PacketConn>) -> Arc<dyn PacketConn> {
        match self.kind {
            CipherKind::Plain => pc,
            _ => Arc::new(CryptoPacketConn::new(pc, self.clone())),
        }
    }
}

/// OpenSSL's EVP_BytesToKey with MD5, the historical Shadowsocks password
/// schedule.
pub(crate) fn derive_key(password: &str, len: usize) -> Vec<u8> {
    let mut key: Vec<u8> = Vec::with_capacity(len + 16);
    let mut last: Option<Vec<u8>> = None;
    while key.len() < len {
        let mut hash = Md5::new();
        if let Some(prev) = &last {
            hash.update(prev);
        }
        hash.update(password.as_bytes());
        let digest = hash.finalize();
        key.extend_from_slice(&digest);
        last = Some(digest.to_vec());
    }
    key.truncate(len);
    key
}
