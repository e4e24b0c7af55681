//! WebSocket stream dialer.
//!
//! The relay only uses the WebSocket handshake as a door: after the 101
//! response both ends speak the Shadowsocks stream directly on the TCP
//! connection, without frame wrapping. The upgrade request is therefore
//! written by hand and the raw socket is handed to the caller.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use url::Url;

use super::ws_packet::WsPacketConn;
use super::{BoxedStream, Dialer, PacketConn, PacketDialer};
use crate::config::DEFAULT_WS_TIMEOUT;
use crate::error::{Error, Result};
use crate::stat::{MeteredStream, Stat};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

pub struct WsDialer {
    server_addr: String,
    path: String,
    username: String,
    handshake_timeout: Duration,
    stat: Option<Stat>,
}

impl WsDialer {
    pub fn new(
        server_addr: impl Into<String>,
        path: impl Into<String>,
        username: impl Into<String>,
    ) -> WsDialer {
        WsDialer {
            server_addr: server_addr.into(),
            path: path.into(),
            username: username.into(),
            handshake_timeout: DEFAULT_WS_TIMEOUT,
            stat: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> WsDialer {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_stat(mut self, stat: Stat) -> WsDialer {
        self.stat = Some(stat);
        self
    }

    /// `ws://` URL datagram sessions are dialed against.
    pub fn packet_url(&self) -> Url {
        let path = normalize_path(&self.path);
        let raw = format!("ws://{}{}", self.server_addr, path);
        Url::parse(&raw).expect("relay address forms a valid url")
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{}", path)
    }
}

/// Performs the client half of the upgrade and verifies the 101 response.
async fn upgrade(
    stream: &mut TcpStream,
    host: &str,
    path: &str,
    username: &str,
    session_type: &str,
) -> io::Result<()> {
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Shadowsocks-Username: {username}\r\n\
         Shadowsocks-Type: {session_type}\r\n\r\n",
        key = generate_key(),
    );
    stream.write_all(request.as_bytes()).await?;

    // Read exactly up to the blank line; whatever follows belongs to the
    // tunnelled stream.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized upgrade response",
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during websocket upgrade",
            ));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status = head.lines().next().unwrap_or_default();
    if !(status.starts_with("HTTP/1.1 101") || status.starts_with("HTTP/1.0 101")) {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("websocket upgrade rejected: {}", status),
        ));
    }
    Ok(())
}

#[async_trait]
impl Dialer for WsDialer {
    async fn connect(&self) -> Result<BoxedStream> {
        let path = normalize_path(&self.path);
        let dial = async {
            let mut stream = TcpStream::connect(&self.server_addr).await?;
            upgrade(&mut stream, &self.server_addr, &path, &self.username, "connection").await?;
            io::Result::Ok(stream)
        };

        let stream = timeout(self.handshake_timeout, dial)
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "websocket handshake timed out")
            })
            .and_then(|r| r)
            .map_err(|e| Error::Dial {
                server: self.server_addr.clone(),
                source: e,
            })?;

        Ok(match &self.stat {
            Some(stat) => Box::new(MeteredStream::new(stream, stat.clone())),
            None => Box::new(stream),
        })
    }

    fn server_host(&self) -> String {
        self.server_addr.clone()
    }
}

#[async_trait]
impl PacketDialer for WsDialer {
    async fn dial_packet(&self, _local: Option<SocketAddr>) -> Result<Arc<dyn PacketConn>> {
        Ok(Arc::new(WsPacketConn::new(
            self.username.clone(),
            self.handshake_timeout,
            self.stat.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    /// Minimal upgrade endpoint: checks the headers, answers 101, then
    /// echoes raw bytes.
    async fn spawn_upgrade_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        if stream.read(&mut byte).await.unwrap_or(0) == 0 {
                            return;
                        }
                        head.push(byte[0]);
                    }
                    let head = String::from_utf8(head).unwrap();
                    assert!(head.starts_with("GET /tunnel HTTP/1.1\r\n"));
                    assert!(head.contains("Upgrade: websocket\r\n"));
                    assert!(head.contains("Shadowsocks-Username: alice\r\n"));
                    assert!(head.contains("Shadowsocks-Type: connection\r\n"));

                    stream
                        .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
                        .await
                        .unwrap();

                    let mut buf = [0u8; 64];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn upgrades_and_exposes_raw_stream() {
        let addr = spawn_upgrade_echo().await;
        let dialer = WsDialer::new(addr.to_string(), "tunnel", "alice");
        let mut conn = dialer.connect().await.unwrap();

        conn.write_all(b"raw bytes").await.unwrap();
        let mut buf = [0u8; 9];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw bytes");
    }

    #[tokio::test]
    async fn handshake_timeout_fires() {
        // Accepts connections but never answers the upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let dialer =
            WsDialer::new(addr.to_string(), "/t", "u").with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = match dialer.connect().await {
            Ok(_) => panic!("expected connect() to fail"),
            Err(e) => e,
        };
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.is_timeout());
        assert!(matches!(err, Error::Dial { .. }));
    }

    #[tokio::test]
    async fn non_101_response_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let dialer = WsDialer::new(addr.to_string(), "/t", "u");
        assert!(matches!(dialer.connect().await, Err(Error::Dial { .. })));
    }

    #[test]
    fn packet_url_normalizes_path() {
        let dialer = WsDialer::new("relay:8488", "tunnel", "u");
        assert_eq!(dialer.packet_url().as_str(), "ws://relay:8488/tunnel");
    }
}
