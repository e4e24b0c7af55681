//! Datagram surface fabricated over WebSocket sessions.
//!
//! One WebSocket per peer, keyed by the peer's address string. Outbound,
//! every `send_to` becomes one binary frame; a missing session is dialed on
//! the spot when the peer is a WebSocket URL. Inbound, every binary frame
//! becomes one datagram on a bounded queue drained by `recv_from`. Text
//! frames are dropped.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{PacketConn, RelayAddr};
use crate::stat::Stat;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Inbound datagrams queued between the session readers and `recv_from`.
const INBOUND_QUEUE: usize = 64;

struct Inner {
    username: String,
    handshake_timeout: Duration,
    stat: Option<Stat>,
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<WsSink>>>>,
    inbound_tx: mpsc::Sender<(RelayAddr, Vec<u8>)>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<(RelayAddr, Vec<u8>)>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

pub struct WsPacketConn {
    inner: Arc<Inner>,
}

impl WsPacketConn {
    pub fn new(username: String, handshake_timeout: Duration, stat: Option<Stat>) -> WsPacketConn {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        WsPacketConn {
            inner: Arc::new(Inner {
                username,
                handshake_timeout,
                stat,
                sessions: Mutex::new(HashMap::new()),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    async fn open_session(&self, url: &Url) -> io::Result<Arc<tokio::sync::Mutex<WsSink>>> {
        let inner = &self.inner;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(to_io_error)?;
        request.headers_mut().insert(
            "Shadowsocks-Username",
            HeaderValue::from_str(&inner.username)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad username"))?,
        );
        request
            .headers_mut()
            .insert("Shadowsocks-Type", HeaderValue::from_static("packet"));

        let (ws, _response) = timeout(inner.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "websocket handshake timed out"))?
            .map_err(to_io_error)?;
        let (sink, source) = ws.split();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));

        let key = url.to_string();
        {
            let mut sessions = inner.sessions.lock().unwrap();
            if let Some(existing) = sessions.get(&key) {
                // Lost a dial race; keep the session already registered.
                return Ok(existing.clone());
            }
            sessions.insert(key.clone(), sink.clone());
        }

        spawn_session_reader(inner.clone(), key, RelayAddr::Ws(url.clone()), source);
        Ok(sink)
    }
}

fn spawn_session_reader(inner: Arc<Inner>, key: String, peer: RelayAddr, mut source: WsSource) {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                msg = source.next() => msg,
            };
            match message {
                None | Some(Err(_)) => break,
                Some(Ok(Message::Binary(data))) => {
                    let delivered = tokio::select! {
                        _ = inner.cancel.cancelled() => false,
                        res = inner.inbound_tx.send((peer.clone(), data)) => res.is_ok(),
                    };
                    if !delivered {
                        break;
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    log::debug!("dropping websocket text frame from {}", peer);
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {} // ping/pong handled by the protocol layer
            }
        }
        inner.sessions.lock().unwrap().remove(&key);
    });
}

fn to_io_error(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    match e {
        tokio_tungstenite::tungstenite::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

#[async_trait]
impl PacketConn for WsPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, RelayAddr)> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(closed_error());
        }
        let mut rx = self.inner.inbound_rx.lock().await;
        let packet = tokio::select! {
            _ = self.inner.cancel.cancelled() => None,
            packet = rx.recv() => packet,
        };
        match packet {
            None => Err(closed_error()),
            Some((addr, data)) => {
                if buf.len() < data.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "receive buffer too short for websocket datagram",
                    ));
                }
                buf[..data.len()].copy_from_slice(&data);
                if let Some(stat) = &self.inner.stat {
                    stat.add_rx(data.len() as u64 * 8);
                }
                Ok((data.len(), addr))
            }
        }
    }

    async fn send_to(&self, buf: &[u8], addr: &RelayAddr) -> io::Result<usize> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(closed_error());
        }

        let key = addr.to_string();
        let existing = self.inner.sessions.lock().unwrap().get(&key).cloned();
        let sink = match existing {
            Some(sink) => sink,
            None => match addr {
                RelayAddr::Ws(url) if !self.inner.username.is_empty() => {
                    self.open_session(url).await?
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        "no websocket session for peer",
                    ))
                }
            },
        };

        sink.lock()
            .await
            .send(Message::binary(buf.to_vec()))
            .await
            .map_err(to_io_error)?;
        if let Some(stat) = &self.inner.stat {
            stat.add_tx(buf.len() as u64 * 8);
        }
        Ok(buf.len())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.inner.cancel.cancel();
        let sinks: Vec<_> = self.inner.sessions.lock().unwrap().drain().collect();
        for (_, sink) in sinks {
            let _ = sink.lock().await.close().await;
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "websocket packet conn closed")
}
