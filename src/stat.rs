//! Transfer accounting: monotonic totals plus 1 s / 10 s bandwidth windows.
//!
//! All figures are in bits. Counters are updated from the I/O paths through
//! the [`MeteredStream`] / [`MeteredPacketConn`] wrappers the dialers install
//! around the raw transport connections.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::{PacketConn, RelayAddr};

/// One rolling bandwidth sample.
#[derive(Clone, Copy, Debug)]
pub struct Sample {
    /// Receive bandwidth in bits per second.
    pub rx: u64,
    /// Transmit bandwidth in bits per second.
    pub tx: u64,
    /// When the sample was taken.
    pub at: SystemTime,
}

impl Default for Sample {
    fn default() -> Sample {
        Sample {
            rx: 0,
            tx: 0,
            at: SystemTime::UNIX_EPOCH,
        }
    }
}

#[derive(Default)]
struct Window {
    prev_rx: u64,
    prev_tx: u64,
    sample: Sample,
}

struct StatInner {
    rx: AtomicU64,
    tx: AtomicU64,
    in1: Mutex<Window>,
    in10: Mutex<Window>,
    stopped: AtomicBool,
}

/// Cloneable transfer meter. Must be created inside a tokio runtime; the
/// samplers run as background tasks until [`Stat::reset`].
#[derive(Clone)]
pub struct Stat {
    inner: Arc<StatInner>,
}

impl Stat {
    pub fn new() -> Stat {
        let stat = Stat {
            inner: Arc::new(StatInner {
                rx: AtomicU64::new(0),
                tx: AtomicU64::new(0),
                in1: Mutex::new(Window::default()),
                in10: Mutex::new(Window::default()),
                stopped: AtomicBool::new(false),
            }),
        };
        stat.spawn_sampler(Duration::from_secs(1), 1, false);
        stat.spawn_sampler(Duration::from_secs(10), 10, true);
        stat
    }

    fn spawn_sampler(&self, period: Duration, divisor: u64, long: bool) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // the immediate first tick
            loop {
                tick.tick().await;
                if inner.stopped.load(Ordering::Relaxed) {
                    break;
                }
                let rx = inner.rx.load(Ordering::Relaxed);
                let tx = inner.tx.load(Ordering::Relaxed);
                let window = if long { &inner.in10 } else { &inner.in1 };
                let mut w = window.lock().unwrap();
                w.sample = Sample {
                    rx: rx.saturating_sub(w.prev_rx) / divisor,
                    tx: tx.saturating_sub(w.prev_tx) / divisor,
                    at: SystemTime::now(),
                };
                w.prev_rx = rx;
                w.prev_tx = tx;
            }
        });
    }

    pub fn add_rx(&self, bits: u64) {
        self.inner.rx.fetch_add(bits, Ordering::Relaxed);
    }

    pub fn add_tx(&self, bits: u64) {
        self.inner.tx.fetch_add(bits, Ordering::Relaxed);
    }

    /// Total received bits.
    pub fn rx(&self) -> u64 {
        self.inner.rx.load(Ordering::Relaxed)
    }

    /// Total transmitted bits.
    pub fn tx(&self) -> u64 {
        self.inner.tx.load(Ordering::Relaxed)
    }

    pub fn bandwidth1(&self) -> Sample {
        self.inner.in1.lock().unwrap().sample
    }

    pub fn bandwidth10(&self) -> Sample {
        self.inner.in10.lock().unwrap().sample
    }

    /// Zeroes totals and samples and stops the samplers.
    pub fn reset(&self) {
        self.inner.rx.store(0, Ordering::Relaxed);
        self.inner.tx.store(0, Ordering::Relaxed);
        *self.inner.in1.lock().unwrap() = Window::default();
        *self.inner.in10.lock().unwrap() = Window::default();
        self.inner.stopped.store(true, Ordering::Relaxed);
    }
}

/// Stream wrapper counting ciphertext bytes as bits.
pub struct MeteredStream<S> {
    inner: S,
    stat: Stat,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, stat: Stat) -> MeteredStream<S> {
        MeteredStream { inner, stat }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            self.stat.add_rx(n as u64 * 8);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            self.stat.add_tx(n as u64 * 8);
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

/// Packet-connection wrapper counting datagram bytes as bits.
pub struct MeteredPacketConn {
    inner: Arc<dyn PacketConn>,
    stat: Stat,
}

impl MeteredPacketConn {
    pub fn new(inner: Arc<dyn PacketConn>, stat: Stat) -> MeteredPacketConn {
        MeteredPacketConn { inner, stat }
    }
}

#[async_trait]
impl PacketConn for MeteredPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, RelayAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        self.stat.add_rx(n as u64 * 8);
        Ok((n, addr))
    }

    async fn send_to(&self, buf: &[u8], addr: &RelayAddr) -> io::Result<usize> {
        let n = self.inner.send_to(buf, addr).await?;
        self.stat.add_tx(n as u64 * 8);
        Ok(n)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
