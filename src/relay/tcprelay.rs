//! One accepted SOCKS5 TCP flow: handshake, upstream dial, relay.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use super::local::Shared;
use super::{relay, socks5};
use crate::error::Error;

/// Accepted SOCKS connection annotated with an eviction timestamp.
///
/// `last_seen` is stamped when an I/O operation *errors*, so a connection
/// that has recently failed reads as fresh to the eviction scan while a
/// quietly healthy one ages out first.
pub(crate) struct TrackedStream {
    inner: TcpStream,
    last_seen: Arc<Mutex<Instant>>,
}

impl TrackedStream {
    pub(crate) fn new(inner: TcpStream, last_seen: Arc<Mutex<Instant>>) -> TrackedStream {
        TrackedStream { inner, last_seen }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Err(_)) = &res {
            self.touch();
        }
        res
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = &res {
            self.touch();
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub(crate) async fn handle_conn(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    last_seen: Arc<Mutex<Instant>>,
) {
    // UDP ASSOCIATE replies advertise the bound UDP endpoint; fall back to
    // the TCP side when no UDP listener is running.
    let bnd = shared.udp_addr.lock().unwrap().unwrap_or_else(|| {
        stream
            .local_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("wildcard address"))
    });
    let mut lc = TrackedStream::new(stream, last_seen);

    let target = match socks5::handshake(&mut lc, shared.udp_enabled, bnd).await {
        Ok(target) => target,
        Err(Error::UdpAssociate) => {
            // Keep the TCP side open so the association stays alive in the
            // client's view; the UDP listener does the actual work.
            park(&mut lc).await;
            log::debug!("udp associate from {} ended", peer);
            return;
        }
        Err(Error::Handshake(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            log::debug!("client {} closed during handshake", peer);
            return;
        }
        Err(e) => {
            log::error!("failed to get target address from {}: {}", peer, e);
            return;
        }
    };

    // The dialer lease spans exactly one dial, so a concurrent reset waits
    // at most that long.
    let (rc, server_host) = {
        let dialer = shared.dialer.read().await;
        match dialer.connect().await {
            Ok(rc) => (rc, dialer.server_host()),
            Err(e) => {
                log::error!("connect to {} failed: {}", dialer.server_host(), e);
                return;
            }
        }
    };

    let cipher = shared.cipher.read().await.clone();
    let mut rc = cipher.wrap_stream(rc);

    let header_written = async {
        rc.write_all(&target.to_bytes()).await?;
        rc.flush().await
    };
    if let Err(e) = header_written.await {
        log::error!("{}", Error::TargetWrite(e));
        return;
    }

    log::debug!("proxy {} <-> {} <-> {}", peer, server_host, target);
    let (_received, _sent, err) = relay(rc, lc).await;
    if let Some(e) = err {
        // Read timeouts are how idle flows end; stay quiet about them.
        if !matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
            log::error!("{} for {}", Error::Relay(e), target);
        }
    }
}

/// Blocks on the parked TCP connection until the client drops it. Timeouts
/// mean the client is idle, not gone.
async fn park(lc: &mut TrackedStream) {
    let mut buf = [0u8; 64];
    loop {
        match lc.read(&mut buf).await {
            Ok(0) => return,
            Ok(_) => continue,
            Err(ref e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                continue
            }
            Err(_) => return,
        }
    }
}
