//! Transport abstraction towards the relay server.
//!
//! A [`Dialer`] produces stream connections, a [`PacketDialer`] produces
//! packet connections. Concrete variants: direct TCP/UDP, WebSocket stream,
//! WebSocket packet, a multiplexed stream pool, and (behind the `quic`
//! feature) QUIC.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use crate::error::Result;

pub mod mpx;
pub mod tcp;
pub mod udp;
pub mod websocket;
pub mod ws_packet;

#[cfg(feature = "quic")]
pub mod quic;

/// Duplex byte stream to the relay.
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> StreamConn for T {}

pub type BoxedStream = Box<dyn StreamConn>;

/// Peer address of a packet connection. Direct transports talk to socket
/// addresses; the WebSocket packet transport addresses peers by URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayAddr {
    Socket(SocketAddr),
    Ws(Url),
}

impl fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayAddr::Socket(addr) => addr.fmt(f),
            RelayAddr::Ws(url) => url.fmt(f),
        }
    }
}

/// Produces a new stream connection to the relay on demand.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream>;

    /// Relay endpoint, for logging.
    fn server_host(&self) -> String;
}

/// Produces a new packet connection, optionally bound to a local address.
#[async_trait]
pub trait PacketDialer: Send + Sync {
    async fn dial_packet(&self, local: Option<SocketAddr>) -> Result<Arc<dyn PacketConn>>;
}

/// Datagram surface with explicit peer addresses.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, RelayAddr)>;

    async fn send_to(&self, buf: &[u8], addr: &RelayAddr) -> io::Result<usize>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Idempotent; any blocked `recv_from`/`send_to` unblocks with an error.
    async fn close(&self);
}
