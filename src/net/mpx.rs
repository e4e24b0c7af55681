//! Pool of persistent relay streams carrying multiplexed virtual flows.
//!
//! Frame layout: `[stream id: u32 BE][flag: u8][payload len: u16 BE]` followed
//! by the payload. The client opens streams with SYN, carries bytes in DATA
//! frames and half-closes with FIN. New virtual streams are assigned
//! round-robin across the live underlying sessions; dead sessions are redialed
//! lazily, so a pool that failed its first connect can heal later.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use super::{BoxedStream, Dialer};
use crate::error::{Error, Result};

pub const DEFAULT_POOL_SIZE: usize = 4;

const FLAG_DATA: u8 = 0x00;
const FLAG_SYN: u8 = 0x01;
const FLAG_FIN: u8 = 0x02;

const FRAME_HEADER_LEN: usize = 7;
const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frames queued towards one session's writer task.
const SESSION_QUEUE: usize = 64;
/// Inbound payloads buffered per virtual stream.
const STREAM_QUEUE: usize = 32;

#[derive(Debug)]
struct Frame {
    id: u32,
    flag: u8,
    payload: Bytes,
}

fn encode_header(frame: &Frame) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&frame.id.to_be_bytes());
    header[4] = frame.flag;
    header[5..7].copy_from_slice(&(frame.payload.len() as u16).to_be_bytes());
    header
}

pub struct MpxPool {
    dialer: Arc<dyn Dialer>,
    size: usize,
    sessions: tokio::sync::Mutex<Vec<Arc<MpxSession>>>,
    next_session: AtomicUsize,
    next_stream_id: AtomicU32,
}

impl MpxPool {
    pub fn new(dialer: Arc<dyn Dialer>, size: usize) -> MpxPool {
        MpxPool {
            dialer,
            size: size.max(1),
            sessions: tokio::sync::Mutex::new(Vec::new()),
            next_session: AtomicUsize::new(0),
            next_stream_id: AtomicU32::new(1),
        }
    }

    /// Dials the underlying sessions. When none comes up the error is
    /// surfaced, but the pool stays usable: later connects redial.
    pub async fn start(&self) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let mut first_err: Option<Error> = None;
        for _ in 0..self.size {
            match self.dial_session().await {
                Ok(session) => sessions.push(session),
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        if sessions.is_empty() {
            return Err(match first_err {
                Some(Error::Dial { server, source }) => Error::MpxFirstConnect { server, source },
                Some(other) => other,
                None => unreachable!("pool size is at least one"),
            });
        }
        Ok(())
    }

    async fn dial_session(&self) -> Result<Arc<MpxSession>> {
        let conn = self.dialer.connect().await?;
        Ok(MpxSession::start(conn))
    }

    async fn open_virtual(&self) -> Result<BoxedStream> {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|s| s.is_alive());
        if sessions.len() < self.size {
            match self.dial_session().await {
                Ok(session) => sessions.push(session),
                Err(e) if sessions.is_empty() => return Err(e),
                Err(e) => log::debug!("mpx redial failed: {}", e),
            }
        }
        let idx = self.next_session.fetch_add(1, Ordering::Relaxed) % sessions.len();
        let session = sessions[idx].clone();
        drop(sessions);

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        session.open_stream(id).await.map_err(|e| Error::Dial {
            server: self.dialer.server_host(),
            source: e,
        })
    }
}

#[async_trait]
impl Dialer for MpxPool {
    async fn connect(&self) -> Result<BoxedStream> {
        self.open_virtual().await
    }

    fn server_host(&self) -> String {
        self.dialer.server_host()
    }
}

struct MpxSession {
    out_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    alive: AtomicBool,
}

impl MpxSession {
    fn start(conn: BoxedStream) -> Arc<MpxSession> {
        let (mut reader, mut writer) = tokio::io::split(conn);
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(SESSION_QUEUE);
        let session = Arc::new(MpxSession {
            out_tx,
            streams: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        });

        let writer_session = session.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let header = encode_header(&frame);
                if writer.write_all(&header).await.is_err()
                    || writer.write_all(&frame.payload).await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
            writer_session.mark_dead();
        });

        let reader_session = session.clone();
        tokio::spawn(async move {
            let mut header = [0u8; FRAME_HEADER_LEN];
            loop {
                if reader.read_exact(&mut header).await.is_err() {
                    break;
                }
                let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
                let flag = header[4];
                let len = u16::from_be_bytes([header[5], header[6]]) as usize;
                let mut payload = vec![0u8; len];
                if reader.read_exact(&mut payload).await.is_err() {
                    break;
                }
                match flag {
                    FLAG_DATA => {
                        let tx = reader_session.streams.lock().unwrap().get(&id).cloned();
                        match tx {
                            Some(tx) => {
                                if tx.send(payload.into()).await.is_err() {
                                    reader_session.streams.lock().unwrap().remove(&id);
                                }
                            }
                            None => log::debug!("mpx frame for unknown stream {}", id),
                        }
                    }
                    FLAG_FIN => {
                        reader_session.streams.lock().unwrap().remove(&id);
                    }
                    _ => log::debug!("mpx frame with unexpected flag {}", flag),
                }
            }
            reader_session.mark_dead();
        });

        session
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Relaxed);
        // Dropping the senders delivers EOF to every virtual stream.
        self.streams.lock().unwrap().clear();
    }

    async fn open_stream(self: Arc<Self>, id: u32) -> io::Result<BoxedStream> {
        if !self.is_alive() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mpx session closed"));
        }
        let (in_tx, in_rx) = mpsc::channel(STREAM_QUEUE);
        self.streams.lock().unwrap().insert(id, in_tx);
        self.out_tx
            .send(Frame {
                id,
                flag: FLAG_SYN,
                payload: Bytes::new(),
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mpx session closed"))?;
        Ok(Box::new(MpxStream {
            id,
            inbound: in_rx,
            pending: Bytes::new(),
            outbound: PollSender::new(self.out_tx.clone()),
            session: Arc::downgrade(&self),
            fin_sent: false,
        }))
    }
}

/// One virtual flow over a pooled session.
struct MpxStream {
    id: u32,
    inbound: mpsc::Receiver<Bytes>,
    pending: Bytes,
    outbound: PollSender<Frame>,
    session: Weak<MpxSession>,
    fin_sent: bool,
}

impl AsyncRead for MpxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match self.inbound.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(data)) => self.pending = data,
            }
        }
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MpxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let chunk = &buf[..buf.len().min(MAX_FRAME_PAYLOAD)];
        match self.outbound.poll_reserve(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(_)) => return Poll::Ready(Err(broken_session())),
            Poll::Ready(Ok(())) => {}
        }
        let frame = Frame {
            id: self.id,
            flag: FLAG_DATA,
            payload: Bytes::copy_from_slice(chunk),
        };
        if self.outbound.send_item(frame).is_err() {
            return Poll::Ready(Err(broken_session()));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session writer task.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.fin_sent {
            match self.outbound.poll_reserve(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(_)) => return Poll::Ready(Err(broken_session())),
                Poll::Ready(Ok(())) => {}
            }
            let id = self.id;
            if self
                .outbound
                .send_item(Frame {
                    id,
                    flag: FLAG_FIN,
                    payload: Bytes::new(),
                })
                .is_err()
            {
                return Poll::Ready(Err(broken_session()));
            }
            self.fin_sent = true;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MpxStream {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.streams.lock().unwrap().remove(&self.id);
            if !self.fin_sent {
                let _ = session.out_tx.try_send(Frame {
                    id: self.id,
                    flag: FLAG_FIN,
                    payload: Bytes::new(),
                });
            }
        }
    }
}

fn broken_session() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mpx session closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp::TcpDialer;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    #[test]
    fn header_round_trip() {
        let frame = Frame {
            id: 0x01020304,
            flag: FLAG_DATA,
            payload: Bytes::from_static(b"abc"),
        };
        let header = encode_header(&frame);
        assert_eq!(u32::from_be_bytes([header[0], header[1], header[2], header[3]]), frame.id);
        assert_eq!(header[4], FLAG_DATA);
        assert_eq!(u16::from_be_bytes([header[5], header[6]]), 3);
    }

    /// Scripted peer: accepts pooled connections, echoes DATA frames back on
    /// the same stream id.
    async fn spawn_mux_echo() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conns = Arc::new(AtomicUsize::new(0));
        let counter = conns.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut header = [0u8; FRAME_HEADER_LEN];
                    loop {
                        if stream.read_exact(&mut header).await.is_err() {
                            break;
                        }
                        let len = u16::from_be_bytes([header[5], header[6]]) as usize;
                        let mut payload = vec![0u8; len];
                        if stream.read_exact(&mut payload).await.is_err() {
                            break;
                        }
                        if header[4] == FLAG_DATA {
                            if stream.write_all(&header).await.is_err()
                                || stream.write_all(&payload).await.is_err()
                            {
                                break;
                            }
                        }
                    }
                });
            }
        });
        (addr, conns)
    }

    #[tokio::test]
    async fn virtual_streams_round_trip() {
        let (addr, conns) = spawn_mux_echo().await;
        let pool = MpxPool::new(Arc::new(TcpDialer::new(addr.to_string())), 2);
        pool.start().await.unwrap();

        let mut a = pool.connect().await.unwrap();
        let mut b = pool.connect().await.unwrap();

        a.write_all(b"stream a").await.unwrap();
        b.write_all(b"stream b").await.unwrap();

        let mut buf = [0u8; 8];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"stream a");
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"stream b");

        // Two pooled sessions were dialed; no per-flow connections.
        assert_eq!(conns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_connect_failure_keeps_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = MpxPool::new(Arc::new(TcpDialer::new(addr.to_string())), 2);
        assert!(matches!(
            pool.start().await,
            Err(Error::MpxFirstConnect { .. })
        ));

        // The pool is still there; connect attempts redial and fail with a
        // plain dial error while the relay stays down.
        assert!(matches!(pool.connect().await, Err(Error::Dial { .. })));
    }
}
