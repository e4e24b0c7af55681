//! AEAD seal/open state shared by the stream and packet wrappers.

use std::io;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM, CHACHA20_POLY1305};
use ring::hkdf::{self, KeyType, HKDF_SHA1_FOR_LEGACY_USE_ONLY};

use super::CipherKind;

pub(crate) const TAG_LEN: usize = 16;
pub(crate) const NONCE_LEN: usize = 12;

/// HKDF info string fixed by the Shadowsocks AEAD construction.
const SUBKEY_INFO: &[u8] = b"ss-subkey";

struct SubkeyLen(usize);

impl KeyType for SubkeyLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn crypto_err(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// One direction of an AEAD session: a subkey derived from `(master, salt)`
/// and an incrementing little-endian nonce.
pub(crate) struct AeadState {
    key: LessSafeKey,
    nonce: [u8; NONCE_LEN],
}

impl AeadState {
    pub(crate) fn new(kind: CipherKind, master: &[u8], salt: &[u8]) -> io::Result<AeadState> {
        let algorithm = match kind {
            CipherKind::Aes128Gcm => &AES_128_GCM,
            CipherKind::Aes256Gcm => &AES_256_GCM,
            CipherKind::ChaCha20Poly1305 => &CHACHA20_POLY1305,
            CipherKind::Plain => return Err(crypto_err("plain cipher has no aead state")),
        };

        let mut subkey = vec![0u8; kind.key_len()];
        hkdf::Salt::new(HKDF_SHA1_FOR_LEGACY_USE_ONLY, salt)
            .extract(master)
            .expand(&[SUBKEY_INFO], SubkeyLen(subkey.len()))
            .and_then(|okm| okm.fill(&mut subkey))
            .map_err(|_| crypto_err("subkey derivation failed"))?;

        let key = UnboundKey::new(algorithm, &subkey).map_err(|_| crypto_err("bad subkey length"))?;
        Ok(AeadState {
            key: LessSafeKey::new(key),
            nonce: [0u8; NONCE_LEN],
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let nonce = Nonce::assume_unique_for_key(self.nonce);
        for byte in self.nonce.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
        nonce
    }

    /// Encrypts `plaintext` and appends `ciphertext ‖ tag` to `out`.
    pub(crate) fn seal(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let nonce = self.next_nonce();
        let mut buf = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .map_err(|_| crypto_err("aead seal failed"))?;
        out.extend_from_slice(&buf);
        Ok(())
    }

    /// Decrypts `ciphertext ‖ tag` in place, returning the plaintext length.
    pub(crate) fn open(&mut self, in_out: &mut [u8]) -> io::Result<usize> {
        let nonce = self.next_nonce();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), in_out)
            .map_err(|_| crypto_err("aead open failed"))?;
        Ok(plaintext.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;

    #[test]
    fn seal_open_round_trip() {
        let kind = CipherKind::ChaCha20Poly1305;
        let master = derive_key("pw", kind.key_len());
        let salt = vec![7u8; kind.salt_len()];

        let mut sealer = AeadState::new(kind, &master, &salt).unwrap();
        let mut opener = AeadState::new(kind, &master, &salt).unwrap();

        // Nonces advance in lock step, so chunks must decrypt in order.
        for msg in [&b"hello"[..], &b"world"[..], &[0u8; 1000][..]] {
            let mut wire = Vec::new();
            sealer.seal(msg, &mut wire).unwrap();
            assert_eq!(wire.len(), msg.len() + TAG_LEN);
            let n = opener.open(&mut wire).unwrap();
            assert_eq!(&wire[..n], msg);
        }
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let kind = CipherKind::Aes256Gcm;
        let master = derive_key("pw", kind.key_len());
        let salt = vec![1u8; kind.salt_len()];

        let mut sealer = AeadState::new(kind, &master, &salt).unwrap();
        let mut opener = AeadState::new(kind, &master, &salt).unwrap();

        let mut wire = Vec::new();
        sealer.seal(b"payload", &mut wire).unwrap();
        wire[0] ^= 0x80;
        assert!(opener.open(&mut wire).is_err());
    }

    #[test]
    fn different_salts_give_different_streams() {
        let kind = CipherKind::Aes128Gcm;
        let master = derive_key("pw", kind.key_len());

        let mut a = AeadState::new(kind, &master, &vec![0u8; kind.salt_len()]).unwrap();
        let mut b = AeadState::new(kind, &master, &vec![1u8; kind.salt_len()]).unwrap();

        let mut wa = Vec::new();
        let mut wb = Vec::new();
        a.seal(b"same bytes", &mut wa).unwrap();
        b.seal(b"same bytes", &mut wb).unwrap();
        assert_ne!(wa, wb);
    }
}
