//! Error types shared by every layer of the client.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("socks5 handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// Not a failure. The SOCKS5 client asked for UDP ASSOCIATE, so the TCP
    /// connection is parked until the client disconnects while datagrams are
    /// serviced by the UDP listener.
    #[error("udp associate requested")]
    UdpAssociate,

    #[error("failed to reach {server}: {source}")]
    Dial {
        server: String,
        #[source]
        source: io::Error,
    },

    /// The mpx pool could not bring up any underlying stream at start.
    /// The pool is kept around; later connects may still heal it.
    #[error("mpx first connect to {server} failed: {source}")]
    MpxFirstConnect {
        server: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to send target address: {0}")]
    TargetWrite(#[source] io::Error),

    #[error("relay i/o error: {0}")]
    Relay(#[source] io::Error),

    #[error("packet dropped: {0}")]
    PacketDropped(&'static str),

    #[error("proxy is closed")]
    Closed,
}

impl Error {
    /// I/O timeouts on established flows are how idle peers look, not
    /// failures; callers suppress them instead of logging.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Handshake(e) | Error::Dial { source: e, .. } | Error::Relay(e) => {
                matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }
}
