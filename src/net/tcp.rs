//! Direct TCP dialer.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use super::{BoxedStream, Dialer};
use crate::error::{Error, Result};
use crate::stat::{MeteredStream, Stat};

pub struct TcpDialer {
    server_addr: String,
    /// Bind outgoing connections to this local address when set.
    local_addr: Option<SocketAddr>,
    stat: Option<Stat>,
}

impl TcpDialer {
    pub fn new(server_addr: impl Into<String>) -> TcpDialer {
        TcpDialer {
            server_addr: server_addr.into(),
            local_addr: None,
            stat: None,
        }
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> TcpDialer {
        self.local_addr = Some(addr);
        self
    }

    pub fn with_stat(mut self, stat: Stat) -> TcpDialer {
        self.stat = Some(stat);
        self
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        match self.local_addr {
            None => TcpStream::connect(&self.server_addr).await,
            Some(local) => {
                let remote = lookup_host(&self.server_addr)
                    .await?
                    .find(|addr| addr.is_ipv4() == local.is_ipv4())
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "no matching server address")
                    })?;
                let socket = if local.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(local)?;
                socket.connect(remote).await
            }
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn connect(&self) -> Result<BoxedStream> {
        let stream = self.dial().await.map_err(|e| Error::Dial {
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
