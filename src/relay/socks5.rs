//! SOCKS5 negotiation (RFC 1928) and the wire address format.
//!
//! The address parsed from a request doubles as the target header sent to
//! the relay: `[type][addr][port]` with type 0x01 (IPv4), 0x03
//! (length-prefixed domain) or 0x04 (IPv6).

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

pub const VERSION: u8 = 0x05;

pub mod consts {
    pub const AUTH_METHOD_NONE: u8 = 0x00;
    pub const AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

    pub const CMD_CONNECT: u8 = 0x01;
    pub const CMD_BIND: u8 = 0x02;
    pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    pub const REPLY_SUCCEEDED: u8 = 0x00;
    pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Longest serialized address: type + length byte + 255-byte domain + port.
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

/// Target address in the shared SOCKS5 / Shadowsocks wire format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub async fn read_from<R>(r: &mut R) -> io::Result<Address>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = r.read_u8().await?;
        match atyp {
            consts::ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Ok(Address::Socket(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            consts::ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Ok(Address::Socket(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            consts::ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let port = r.read_u16().await?;
                let name = String::from_utf8(name).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "domain name is not utf-8")
                })?;
                Ok(Address::Domain(name, port))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported address type {:#04x}", atyp),
            )),
        }
    }

    pub fn write_to_buf(&self, buf: &mut Vec<u8>) {
        match self {
            Address::Socket(SocketAddr::V4(v4)) => {
                buf.push(consts::ATYP_IPV4);
                buf.extend_from_slice(&v4.ip().octets());
                buf.extend_from_slice(&v4.port().to_be_bytes());
            }
            Address::Socket(SocketAddr::V6(v6)) => {
                buf.push(consts::ATYP_IPV6);
                buf.extend_from_slice(&v6.ip().octets());
                buf.extend_from_slice(&v6.port().to_be_bytes());
            }
            Address::Domain(name, port) => {
                debug_assert!(name.len() <= 255);
                buf.push(consts::ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        buf
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(name, _) => 1 + 1 + name.len() + 2,
        }
    }

    /// Parses the address prefix of a datagram. Returns the address and the
    /// number of bytes it occupies, or `None` when the buffer is malformed.
    pub fn split_from(buf: &[u8]) -> Option<(Address, usize)> {
        let atyp = *buf.first()?;
        match atyp {
            consts::ATYP_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return None;
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Some((Address::Socket(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            consts::ATYP_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return None;
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Some((
                    Address::Socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            consts::ATYP_DOMAIN => {
                let len = *buf.get(1)? as usize;
                if buf.len() < 2 + len + 2 {
                    return None;
                }
                let name = String::from_utf8(buf[2..2 + len].to_vec()).ok()?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Some((Address::Domain(name, port), 2 + len + 2))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => addr.fmt(f),
            Address::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

async fn write_reply<S>(stream: &mut S, reply: u8, bnd: &Address) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(3 + bnd.serialized_len());
    buf.extend_from_slice(&[VERSION, reply, 0x00]);
    bnd.write_to_buf(&mut buf);
    stream.write_all(&buf).await
}

/// Runs the server side of the SOCKS5 negotiation on a freshly accepted
/// connection.
///
/// Returns the CONNECT target, or [`Error::UdpAssociate`] after replying
/// with `bnd` (the local UDP endpoint) when the client asked for a UDP
/// association and `udp_enabled` is set.
pub async fn handshake<S>(
    stream: &mut S,
    udp_enabled: bool,
    bnd: SocketAddr,
) -> Result<Address, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let inner = async {
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await?;
        if greeting[0] != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected socks version {:#04x}", greeting[0]),
            ));
        }
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await?;
        if !methods.contains(&consts::AUTH_METHOD_NONE) {
            stream
                .write_all(&[VERSION, consts::AUTH_METHOD_NOT_ACCEPTABLE])
                .await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "client requires authentication",
            ));
        }
        stream
            .write_all(&[VERSION, consts::AUTH_METHOD_NONE])
            .await?;

        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected socks version {:#04x}", head[0]),
            ));
        }
        Ok(head[1])
    };

    let cmd = inner.await.map_err(Error::Handshake)?;
    let wildcard = Address::Socket("0.0.0.0:0".parse().expect("wildcard address"));

    match cmd {
        consts::CMD_CONNECT => {
            let target = Address::read_from(stream).await.map_err(Error::Handshake)?;
            write_reply(stream, consts::REPLY_SUCCEEDED, &wildcard)
                .await
                .map_err(Error::Handshake)?;
            Ok(target)
        }
        consts::CMD_UDP_ASSOCIATE if udp_enabled => {
            // The requested address is advisory; datagrams are matched by
            // source endpoint.
            let _ = Address::read_from(stream).await.map_err(Error::Handshake)?;
            write_reply(stream, consts::REPLY_SUCCEEDED, &Address::Socket(bnd))
                .await
                .map_err(Error::Handshake)?;
            Err(Error::UdpAssociate)
        }
        other => {
            let _ = Address::read_from(stream).await;
            let _ = write_reply(stream, consts::REPLY_COMMAND_NOT_SUPPORTED, &wildcard).await;
            Err(Error::Handshake(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported command {:#04x}", other),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn address_round_trips() {
        for addr in [
            Address::Socket("1.2.3.4:80".parse().unwrap()),
            Address::Socket("[2001:db8::1]:443".parse().unwrap()),
            Address::Domain("example.com".to_owned(), 8080),
        ] {
            let bytes = addr.to_bytes();
            assert_eq!(bytes.len(), addr.serialized_len());

            let mut cursor = io::Cursor::new(bytes.clone());
            let parsed = Address::read_from(&mut cursor).await.unwrap();
            assert_eq!(parsed, addr);

            let (split, consumed) = Address::split_from(&bytes).unwrap();
            assert_eq!(split, addr);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn split_rejects_truncated_buffers() {
        let addr = Address::Domain("example.com".to_owned(), 53);
        let bytes = addr.to_bytes();
        assert!(Address::split_from(&bytes[..bytes.len() - 1]).is_none());
        assert!(Address::split_from(&[0x7F, 0x00]).is_none());
        assert!(Address::split_from(&[]).is_none());
    }

    #[tokio::test]
    async fn connect_handshake() {
        let (mut client, mut server) = duplex(1024);
        let bnd = "127.0.0.1:1080".parse().unwrap();
        let task = tokio::spawn(async move { handshake(&mut server, true, bnd).await });

        client.write_all(&[VERSION, 1, consts::AUTH_METHOD_NONE]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, consts::AUTH_METHOD_NONE]);

        let mut request = vec![VERSION, consts::CMD_CONNECT, 0x00];
        request.extend_from_slice(&Address::Domain("example.com".into(), 80).to_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..4], [VERSION, consts::REPLY_SUCCEEDED, 0x00, consts::ATYP_IPV4]);

        let target = task.await.unwrap().unwrap();
        assert_eq!(target, Address::Domain("example.com".into(), 80));
    }

    #[tokio::test]
    async fn udp_associate_returns_sentinel_with_bound_addr() {
        let (mut client, mut server) = duplex(1024);
        let bnd: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let task = tokio::spawn(async move { handshake(&mut server, true, bnd).await });

        client.write_all(&[VERSION, 1, consts::AUTH_METHOD_NONE]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        let mut request = vec![VERSION, consts::CMD_UDP_ASSOCIATE, 0x00];
        request.extend_from_slice(&Address::Socket("0.0.0.0:0".parse().unwrap()).to_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], consts::REPLY_SUCCEEDED);
        assert_eq!(reply[3], consts::ATYP_IPV4);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 1080);

        assert!(matches!(task.await.unwrap(), Err(Error::UdpAssociate)));
    }

    #[tokio::test]
    async fn udp_associate_refused_when_disabled() {
        let (mut client, mut server) = duplex(1024);
        let bnd = "127.0.0.1:1080".parse().unwrap();
        let task = tokio::spawn(async move { handshake(&mut server, false, bnd).await });

        client.write_all(&[VERSION, 1, consts::AUTH_METHOD_NONE]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        let mut request = vec![VERSION, consts::CMD_UDP_ASSOCIATE, 0x00];
        request.extend_from_slice(&Address::Socket("0.0.0.0:0".parse().unwrap()).to_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], consts::REPLY_COMMAND_NOT_SUPPORTED);
        assert!(matches!(task.await.unwrap(), Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn no_acceptable_method_is_refused() {
        let (mut client, mut server) = duplex(1024);
        let bnd = "127.0.0.1:1080".parse().unwrap();
        let task = tokio::spawn(async move { handshake(&mut server, true, bnd).await });

        // Only username/password offered.
        client.write_all(&[VERSION, 1, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, consts::AUTH_METHOD_NOT_ACCEPTABLE]);
        assert!(matches!(task.await.unwrap(), Err(Error::Handshake(_))));
    }
}
