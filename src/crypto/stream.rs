//! AEAD-framed stream adapter.
//!
//! Wire layout per direction: `salt ‖ (seal(len_be16) ‖ seal(chunk))*` with
//! an incrementing little-endian nonce and chunks capped at 0x3FFF bytes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::aead::{AeadState, TAG_LEN};
use super::Cipher;

const MAX_CHUNK: usize = 0x3FFF;

/// Stop encrypting ahead of the transport once this much ciphertext is
/// buffered.
const OUT_HIGH_WATER: usize = 64 * 1024;

enum ReadState {
    Salt,
    Len,
    Data(usize),
}

pub struct CryptoStream<S> {
    inner: S,
    cipher: Cipher,

    enc: Option<AeadState>,
    out_buf: Vec<u8>,
    out_pos: usize,

    dec: Option<AeadState>,
    in_buf: BytesMut,
    plain: BytesMut,
    read_state: ReadState,
    read_eof: bool,
}

impl<S> CryptoStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S, cipher: Cipher) -> CryptoStream<S> {
        CryptoStream {
            inner,
            cipher,
            enc: None,
            out_buf: Vec::new(),
            out_pos: 0,
            dec: None,
            in_buf: BytesMut::new(),
            plain: BytesMut::new(),
            read_state: ReadState::Salt,
            read_eof: false,
        }
    }

    /// Writes buffered ciphertext to the transport until empty.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out_buf.len() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.out_buf[self.out_pos..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport closed while flushing ciphertext",
                    )))
                }
                Poll::Ready(Ok(n)) => n,
            };
            self.out_pos += n;
        }
        self.out_buf.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Advances the decryption state machine as far as the buffered
    /// ciphertext allows. Returns whether any step was taken.
    fn process_in_buf(&mut self) -> io::Result<bool> {
        let kind = self.cipher.kind();
        let mut progressed = false;
        loop {
            match self.read_state {
                ReadState::Salt => {
                    if self.in_buf.len() < kind.salt_len() {
                        break;
                    }
                    let salt = self.in_buf.split_to(kind.salt_len());
                    self.dec = Some(AeadState::new(kind, self.cipher.key(), &salt)?);
                    self.read_state = ReadState::Len;
                    progressed = true;
                }
                ReadState::Len => {
                    if self.in_buf.len() < 2 + TAG_LEN {
                        break;
                    }
                    let mut sealed = self.in_buf.split_to(2 + TAG_LEN);
                    let dec = self.dec.as_mut().expect("length frame before salt");
                    dec.open(&mut sealed)?;
                    let len = u16::from_be_bytes([sealed[0], sealed[1]]) as usize & MAX_CHUNK;
                    self.read_state = ReadState::Data(len);
                    progressed = true;
                }
                ReadState::Data(len) => {
                    if self.in_buf.len() < len + TAG_LEN {
                        break;
                    }
                    let mut sealed = self.in_buf.split_to(len + TAG_LEN);
                    let dec = self.dec.as_mut().expect("data frame before salt");
                    let n = dec.open(&mut sealed)?;
                    self.plain.extend_from_slice(&sealed[..n]);
                    self.read_state = ReadState::Len;
                    progressed = true;
                    if !self.plain.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(progressed)
    }
}

impl<S> AsyncRead for CryptoStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        loop {
            if !me.plain.is_empty() {
                let n = me.plain.len().min(out.remaining());
                out.put_slice(&me.plain[..n]);
                me.plain.advance(n);
                return Poll::Ready(Ok(()));
            }

            if me.process_in_buf()? {
                continue;
            }

            if me.read_eof {
                let at_boundary =
                    me.in_buf.is_empty() && matches!(me.read_state, ReadState::Salt | ReadState::Len);
                return if at_boundary {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "cipher stream truncated mid-frame",
                    )))
                };
            }

            let mut chunk = [0u8; 8 * 1024];
            let mut rb = ReadBuf::new(&mut chunk);
            match Pin::new(&mut me.inner).poll_read(cx, &mut rb) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    let filled = rb.filled();
                    if filled.is_empty() {
                        me.read_eof = true;
                    } else {
                        me.in_buf.extend_from_slice(filled);
                    }
                }
            }
        }
    }
}

impl<S> AsyncWrite for CryptoStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;

        if me.out_buf.len() - me.out_pos >= OUT_HIGH_WATER {
            match me.poll_drain(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if me.enc.is_none() {
            let kind = me.cipher.kind();
            let mut salt = vec![0u8; kind.salt_len()];
            rand::thread_rng().fill_bytes(&mut salt);
            me.enc = Some(AeadState::new(kind, me.cipher.key(), &salt)?);
            me.out_buf.extend_from_slice(&salt);
        }

        let enc = me.enc.as_mut().expect("encryptor initialised above");
        for chunk in buf.chunks(MAX_CHUNK) {
            enc.seal(&(chunk.len() as u16).to_be_bytes(), &mut me.out_buf)?;
            enc.seal(chunk, &mut me.out_buf)?;
        }

        // Opportunistic flush; leftover ciphertext stays buffered.
        if let Poll::Ready(Err(e)) = me.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        match me.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        match me.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut me.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn cipher() -> Cipher {
        Cipher::new("AEAD_CHACHA20_POLY1305", "test-password").unwrap()
    }

    #[tokio::test]
    async fn round_trips_small_writes() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = CryptoStream::new(a, cipher());
        let mut rx = CryptoStream::new(b, cipher());

        let writer = tokio::spawn(async move {
            tx.write_all(b"hello ").await.unwrap();
            tx.write_all(b"world").await.unwrap();
            tx.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        rx.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello world");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn round_trips_multi_chunk_payload() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let mut tx = CryptoStream::new(a, cipher());
        let mut rx = CryptoStream::new(b, cipher());

        // Longer than one 0x3FFF chunk, so the framing has to split it.
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            tx.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        rx.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn both_directions_are_independent() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = CryptoStream::new(a, cipher());
        let mut right = CryptoStream::new(b, cipher());

        left.write_all(b"ping").await.unwrap();
        left.flush().await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await.unwrap();
        right.flush().await.unwrap();
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn wrong_password_fails() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = CryptoStream::new(a, cipher());
        let mut rx = CryptoStream::new(b, Cipher::new("AEAD_CHACHA20_POLY1305", "other").unwrap());

        tx.write_all(b"secret").await.unwrap();
        tx.shutdown().await.unwrap();

        let mut got = Vec::new();
        assert!(rx.read_to_end(&mut got).await.is_err());
    }
}
