//! Direct UDP packet dialer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{PacketConn, PacketDialer, RelayAddr};
use crate::error::{Error, Result};
use crate::stat::{MeteredPacketConn, Stat};

/// Plain UDP socket exposed through the packet-connection trait.
pub struct UdpPacketConn {
    socket: UdpSocket,
}

impl UdpPacketConn {
    pub fn new(socket: UdpSocket) -> UdpPacketConn {
        UdpPacketConn { socket }
    }
}

#[async_trait]
impl PacketConn for UdpPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, RelayAddr)> {
        let (n, addr) = self.socket.recv_from(buf).await?;
        Ok((n, RelayAddr::Socket(addr)))
    }

    async fn send_to(&self, buf: &[u8], addr: &RelayAddr) -> io::Result<usize> {
        match addr {
            RelayAddr::Socket(sa) => self.socket.send_to(buf, sa).await,
            RelayAddr::Ws(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "udp socket cannot reach a websocket peer",
            )),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct UdpDialer {
    stat: Option<Stat>,
}

impl UdpDialer {
    pub fn new() -> UdpDialer {
        UdpDialer { stat: None }
    }

    pub fn with_stat(mut self, stat: Stat) -> UdpDialer {
        self.stat = Some(stat);
        self
    }
}

#[async_trait]
impl PacketDialer for UdpDialer {
    async fn dial_packet(&self, local: Option<SocketAddr>) -> Result<Arc<dyn PacketConn>> {
        let bind = local.unwrap_or_else(|| "0.0.0.0:0".parse().expect("wildcard address"));
        let socket = UdpSocket::bind(bind).await.map_err(|e| Error::Dial {
            server: bind.to_string(),
            source: e,
        })?;
        let pc: Arc<dyn PacketConn> = Arc::new(UdpPacketConn::new(socket));
        Ok(match &self.stat {
            Some(stat) => Arc::new(MeteredPacketConn::new(pc, stat.clone())),
            None => pc,
        })
    }
}
