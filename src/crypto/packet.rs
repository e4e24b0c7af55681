//! Per-datagram AEAD wrapper for packet connections.
//!
//! Each datagram is `salt ‖ seal(payload)` with a fresh salt and an all-zero
//! starting nonce, so datagrams stand alone and tolerate loss/reorder.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;

use super::{AeadState, Cipher};
use crate::net::{PacketConn, RelayAddr};

pub struct CryptoPacketConn {
    inner: Arc<dyn PacketConn>,
    cipher: Cipher,
}

impl CryptoPacketConn {
    pub fn new(inner: Arc<dyn PacketConn>, cipher: Cipher) -> CryptoPacketConn {
        CryptoPacketConn { inner, cipher }
    }

    fn overhead(&self) -> usize {
        self.cipher.kind().salt_len() + self.cipher.kind().tag_len()
    }
}

#[async_trait]
impl PacketConn for CryptoPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, RelayAddr)> {
        let kind = self.cipher.kind();
        let mut wire = vec![0u8; buf.len() + self.overhead()];
        let (n, addr) = self.inner.recv_from(&mut wire).await?;
        if n < self.overhead() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram shorter than cipher overhead",
            ));
        }

        let (salt, sealed) = wire[..n].split_at_mut(kind.salt_len());
        let mut opener = AeadState::new(kind, self.cipher.key(), salt)?;
        let len = opener.open(sealed)?;
        buf[..len].copy_from_slice(&sealed[..len]);
        Ok((len, addr))
    }

    async fn send_to(&self, buf: &[u8], addr: &RelayAddr) -> io::Result<usize> {
        let kind = self.cipher.kind();
        let mut wire = Vec::with_capacity(buf.len() + self.overhead());

        let mut salt = vec![0u8; kind.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        wire.extend_from_slice(&salt);

        let mut sealer = AeadState::new(kind, self.cipher.key(), &salt)?;
        sealer.seal(buf, &mut wire)?;

        self.inner.send_to(&wire, addr).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// In-memory loopback: everything sent comes back on recv.
    #[derive(Default)]
    struct LoopbackPc {
        queue: Mutex<VecDeque<(Vec<u8>, RelayAddr)>>,
        notify: Notify,
    }

    #[async_trait]
    impl PacketConn for LoopbackPc {
        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, RelayAddr)> {
            loop {
                if let Some((data, addr)) = self.queue.lock().unwrap().pop_front() {
                    buf[..data.len()].copy_from_slice(&data);
                    return Ok((data.len(), addr));
                }
                self.notify.notified().await;
            }
        }

        async fn send_to(&self, buf: &[u8], addr: &RelayAddr) -> io::Result<usize> {
            self.queue.lock().unwrap().push_back((buf.to_vec(), addr.clone()));
            self.notify.notify_one();
            Ok(buf.len())
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        async fn close(&self) {}
    }

    fn peer() -> RelayAddr {
        RelayAddr::Socket("127.0.0.1:8488".parse().unwrap())
    }

    #[tokio::test]
    async fn datagram_round_trip() {
        let cipher = Cipher::new("AEAD_AES_256_GCM", "pw").unwrap();
        let pc = CryptoPacketConn::new(Arc::new(LoopbackPc::default()), cipher);

        pc.send_to(b"dns query", &peer()).await.unwrap();
        let mut buf = [0u8; 1500];
        let (n, addr) = pc.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"dns query");
        assert_eq!(addr.to_string(), "127.0.0.1:8488");
    }

    #[tokio::test]
    async fn corrupted_datagram_is_rejected() {
        let cipher = Cipher::new("AEAD_AES_256_GCM", "pw").unwrap();
        let inner = Arc::new(LoopbackPc::default());
        let pc = CryptoPacketConn::new(inner.clone(), cipher);

        pc.send_to(b"payload", &peer()).await.unwrap();
        {
            let mut queue = inner.queue.lock().unwrap();
            let (data, _) = queue.front_mut().unwrap();
            let last = data.len() - 1;
            data[last] ^= 0xFF;
        }
        let mut buf = [0u8; 1500];
        assert!(pc.recv_from(&mut buf).await.is_err());
    }
}
