//! SOCKS5 UDP pipeline: per-client NAT towards the relay.
//!
//! Every distinct client endpoint gets its own upstream packet connection.
//! A reply copier drains the upstream side under a per-read idle deadline
//! and rewrites headers according to the entry's role; when it exits the
//! entry is removed and the upstream connection closed.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru_time_cache::LruCache;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::local::Shared;
use super::socks5::Address;
use super::UDP_BUF_SIZE;
use crate::error::Error;
use crate::net::{PacketConn, RelayAddr};

/// Header rewrite applied on the return leg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatRole {
    /// Replies go to a SOCKS5 program: prepend `[RSV, RSV, FRAG=0]`.
    SocksClient,
    /// Replies go to a plain client of a tunnelled flow: strip the
    /// target-address header.
    RelayClient,
    /// Replies go back through a server-side table: prepend the packet
    /// source in wire format.
    RemoteServer,
}

struct NatEntry {
    id: u64,
    pc: Arc<dyn PacketConn>,
}

/// Client endpoint → upstream packet connection, with idle expiry.
pub(crate) struct NatMap {
    entries: Mutex<LruCache<String, NatEntry>>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl NatMap {
    pub(crate) fn new(timeout: Duration) -> Arc<NatMap> {
        Arc::new(NatMap {
            // The copiers remove entries at `timeout`; the cache's own expiry
            // is a backstop for entries whose copier got lost.
            entries: Mutex::new(LruCache::with_expiry_duration(timeout.saturating_mul(3))),
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<dyn PacketConn>> {
        self.entries.lock().unwrap().get(key).map(|e| e.pc.clone())
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().get(key).is_some()
    }

    fn remove_if(&self, key: &str, id: u64) {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).map(|e| e.id) == Some(id) {
            entries.remove(key);
        }
    }

    /// Registers `src` for `peer` and spawns its reply copier.
    pub(crate) fn add(
        nat: &Arc<NatMap>,
        peer: SocketAddr,
        dst: Arc<UdpSocket>,
        src: Arc<dyn PacketConn>,
        role: NatRole,
        cancel: CancellationToken,
    ) {
        let id = nat.next_id.fetch_add(1, Ordering::Relaxed);
        let key = peer.to_string();
        nat.entries
            .lock()
            .unwrap()
            .insert(key.clone(), NatEntry { id, pc: src.clone() });

        let nat = nat.clone();
        let timeout = nat.timeout;
        tokio::spawn(async move {
            if let Err(e) = timed_copy(dst, peer, src.clone(), timeout, role, cancel).await {
                if e.kind() == io::ErrorKind::TimedOut {
                    log::debug!("udp nat entry for {} idled out", peer);
                } else {
                    log::debug!("udp nat entry for {} closed: {}", peer, e);
                }
            }
            nat.remove_if(&key, id);
            src.close().await;
        });
    }
}

/// Copies upstream datagrams back to `target`, refreshing the idle deadline
/// before every read.
async fn timed_copy(
    dst: Arc<UdpSocket>,
    target: SocketAddr,
    src: Arc<dyn PacketConn>,
    idle: Duration,
    role: NatRole,
    cancel: CancellationToken,
) -> io::Result<()> {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let (n, from) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            res = tokio::time::timeout(idle, src.recv_from(&mut buf)) => match res {
                Err(_elapsed) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "udp read deadline"))
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(v)) => v,
            },
        };

        match role {
            NatRole::SocksClient => {
                let mut out = Vec::with_capacity(3 + n);
                out.extend_from_slice(&[0, 0, 0]);
                out.extend_from_slice(&buf[..n]);
                dst.send_to(&out, target).await?;
            }
            NatRole::RelayClient => match Address::split_from(&buf[..n]) {
                Some((_, header_len)) => {
                    dst.send_to(&buf[header_len..n], target).await?;
                }
                None => {
                    log::debug!("dropping reply without target header for {}", target);
                }
            },
            NatRole::RemoteServer => {
                let RelayAddr::Socket(src_addr) = from else {
                    log::debug!("dropping reply from non-socket peer for {}", target);
                    continue;
                };
                let mut out = Address::Socket(src_addr).to_bytes();
                out.extend_from_slice(&buf[..n]);
                dst.send_to(&out, target).await?;
            }
        }
    }
}

/// Demultiplexes the local SOCKS5 UDP socket by client endpoint and forwards
/// payloads to the relay.
pub(crate) async fn run_udp(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    server: RelayAddr,
    nat: Arc<NatMap>,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let (n, peer) = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                log::debug!("exit udp");
                break;
            }
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    if shared.cancel.is_cancelled() {
                        break;
                    }
                    log::error!("udp local read error: {}", e);
                    continue;
                }
            },
        };

        // 3-byte SOCKS5 datagram header: RSV RSV FRAG. Fragments are
        // unsupported; such packets never create NAT state.
        if n < 3 || buf[2] != 0 {
            log::debug!(
                "{} from {}",
                Error::PacketDropped("fragmented or truncated datagram"),
                peer
            );
            continue;
        }

        let key = peer.to_string();
        let pc = match nat.get(&key) {
            Some(pc) => pc,
            None => {
                let dialed = {
                    let pc_dialer = shared.pc_dialer.read().await;
                    let Some(dialer) = pc_dialer.as_ref() else {
                        log::debug!("no packet dialer; dropping datagram from {}", peer);
                        continue;
                    };
                    dialer.dial_packet(None).await
                };
                let raw = match dialed {
                    Ok(raw) => raw,
                    Err(e) => {
                        log::error!("udp upstream dial error: {}", e);
                        continue;
                    }
                };
                let pc = shared.cipher.read().await.clone().wrap_packet(raw);
                if let Some((target, _)) = Address::split_from(&buf[3..n]) {
                    log::debug!("udp socks tunnel {} <-> {} <-> {}", peer, server, target);
                }
                NatMap::add(
                    &nat,
                    peer,
                    socket.clone(),
                    pc.clone(),
                    NatRole::SocksClient,
                    shared.cancel.child_token(),
                );
                pc
            }
        };

        if let Err(e) = pc.send_to(&buf[3..n], &server).await {
            log::error!("udp local write error: {}", e);
            continue;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::udp::UdpPacketConn;
    use tokio::time::sleep;

    async fn bound(addr: &str) -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind(addr).await.unwrap())
    }

    #[tokio::test]
    async fn socks_client_role_prepends_header() {
        let local = bound("127.0.0.1:0").await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let relay_side = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let nat = NatMap::new(Duration::from_secs(2));
        NatMap::add(
            &nat,
            client.local_addr().unwrap(),
            local.clone(),
            Arc::new(UdpPacketConn::new(upstream)),
            NatRole::SocksClient,
            CancellationToken::new(),
        );

        relay_side.send_to(b"reply", upstream_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x00\x00\x00reply");
        assert_eq!(from, local.local_addr().unwrap());
    }

    #[tokio::test]
    async fn relay_client_role_strips_address() {
        let local = bound("127.0.0.1:0").await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let relay_side = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let nat = NatMap::new(Duration::from_secs(2));
        NatMap::add(
            &nat,
            client.local_addr().unwrap(),
            local.clone(),
            Arc::new(UdpPacketConn::new(upstream)),
            NatRole::RelayClient,
            CancellationToken::new(),
        );

        let mut datagram = Address::Socket("8.8.8.8:53".parse().unwrap()).to_bytes();
        datagram.extend_from_slice(b"answer");
        relay_side.send_to(&datagram, upstream_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"answer");
    }

    #[tokio::test]
    async fn idle_entry_is_evicted() {
        let local = bound("127.0.0.1:0").await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let nat = NatMap::new(Duration::from_millis(200));
        let key = client.local_addr().unwrap().to_string();
        NatMap::add(
            &nat,
            client.local_addr().unwrap(),
            local,
            Arc::new(UdpPacketConn::new(upstream)),
            NatRole::SocksClient,
            CancellationToken::new(),
        );

        assert!(nat.contains(&key));
        sleep(Duration::from_millis(100)).await;
        assert!(nat.contains(&key));
        sleep(Duration::from_millis(300)).await;
        assert!(!nat.contains(&key));
    }
}
