//! The proxy instance: a SOCKS5 listener pair plus lifecycle control.
//!
//! Owns the TCP and UDP listeners, caps concurrent pipelines with a fixed
//! worker pool, evicts the least-recently-seen conversation under pressure,
//! supports hot transport swaps and token-driven shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use super::{tcprelay, udprelay};
use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::net::{Dialer, PacketDialer, RelayAddr};
use crate::stat::Stat;

/// Idle lifetime of a UDP NAT entry unless configured otherwise.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// State shared between the listeners, the worker pool and the pipelines.
pub(crate) struct Shared {
    pub(crate) cipher: RwLock<Cipher>,
    pub(crate) dialer: RwLock<Arc<dyn Dialer>>,
    pub(crate) pc_dialer: RwLock<Option<Arc<dyn PacketDialer>>>,
    pub(crate) conns: Mutex<HashMap<String, ConnRecord>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) max_conns: usize,
    pub(crate) udp_timeout: Duration,
    pub(crate) udp_enabled: bool,
    /// Bound UDP endpoint, advertised in UDP ASSOCIATE replies.
    pub(crate) udp_addr: Mutex<Option<SocketAddr>>,
    next_conn_id: AtomicU64,
}

/// Live-connection bookkeeping for the eviction scan.
pub(crate) struct ConnRecord {
    id: u64,
    token: CancellationToken,
    last_seen: Arc<Mutex<Instant>>,
}

struct Job {
    stream: TcpStream,
    peer: SocketAddr,
    key: String,
    id: u64,
    token: CancellationToken,
    last_seen: Arc<Mutex<Instant>>,
}

/// Local SOCKS5 proxy tunnelling to one relay server.
pub struct Client {
    shared: Arc<Shared>,
    stat: Option<Stat>,
    tcp_addr: Mutex<Option<SocketAddr>>,
    udp_addr: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

impl Client {
    pub fn new(
        cipher: Cipher,
        dialer: Arc<dyn Dialer>,
        pc_dialer: Option<Arc<dyn PacketDialer>>,
    ) -> Client {
        let udp_enabled = pc_dialer.is_some();
        Client {
            shared: Arc::new(Shared {
                cipher: RwLock::new(cipher),
                dialer: RwLock::new(dialer),
                pc_dialer: RwLock::new(pc_dialer),
                conns: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                max_conns: 0,
                udp_timeout: DEFAULT_UDP_TIMEOUT,
                udp_enabled,
                udp_addr: Mutex::new(None),
                next_conn_id: AtomicU64::new(1),
            }),
            stat: None,
            tcp_addr: Mutex::new(None),
            udp_addr: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Caps concurrently running pipelines; 0 means unbounded.
    pub fn with_max_conns(mut self, max_conns: usize) -> Client {
        let shared = Arc::get_mut(&mut self.shared).expect("configure before start");
        shared.max_conns = max_conns;
        self
    }

    pub fn with_udp_timeout(mut self, timeout: Duration) -> Client {
        let shared = Arc::get_mut(&mut self.shared).expect("configure before start");
        shared.udp_timeout = timeout;
        self
    }

    pub fn with_stat(mut self, stat: Stat) -> Client {
        self.stat = Some(stat);
        self
    }

    pub fn stat(&self) -> Option<&Stat> {
        self.stat.as_ref()
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.lock().unwrap()
    }

    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.lock().unwrap()
    }

    /// Binds the SOCKS5 TCP listener and starts accepting.
    pub async fn start_tcp(&self, addr: &str) -> Result<SocketAddr> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        let listener = TcpListener::bind(addr).await.map_err(|e| Error::Listen {
            addr: addr.to_owned(),
            source: e,
        })?;
        let local = listener.local_addr().map_err(|e| Error::Listen {
            addr: addr.to_owned(),
            source: e,
        })?;
        log::info!(
            "socks proxy {} <-> {}",
            local,
            self.shared.dialer.read().await.server_host()
        );
        *self.tcp_addr.lock().unwrap() = Some(local);
        tokio::spawn(accept_loop(self.shared.clone(), listener));
        Ok(local)
    }

    /// Binds the SOCKS5 UDP socket and starts the NAT pipeline. `server` is
    /// the relay endpoint every outbound payload is sent to.
    pub async fn start_udp(&self, addr: &str, server: RelayAddr) -> Result<SocketAddr> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        if !self.shared.udp_enabled {
            return Err(Error::Config("no packet dialer configured".to_owned()));
        }
        let socket = UdpSocket::bind(addr).await.map_err(|e| Error::Listen {
            addr: addr.to_owned(),
            source: e,
        })?;
        let local = socket.local_addr().map_err(|e| Error::Listen {
            addr: addr.to_owned(),
            source: e,
        })?;
        *self.udp_addr.lock().unwrap() = Some(local);
        *self.shared.udp_addr.lock().unwrap() = Some(local);

        let nat = udprelay::NatMap::new(self.shared.udp_timeout);
        tokio::spawn(udprelay::run_udp(
            self.shared.clone(),
            Arc::new(socket),
            server,
            nat,
        ));
        Ok(local)
    }

    /// Swaps the transport endpoints without touching the listeners.
    /// In-flight sessions keep the dialer they already leased; only new
    /// dials see the replacement.
    pub async fn reset(
        &self,
        dialer: Arc<dyn Dialer>,
        pc_dialer: Option<Arc<dyn PacketDialer>>,
        cipher: Option<Cipher>,
    ) {
        *self.shared.dialer.write().await = dialer;
        *self.shared.pc_dialer.write().await = pc_dialer;
        if let Some(cipher) = cipher {
            *self.shared.cipher.write().await = cipher;
        }
    }

    /// Stops accepting and releases the listeners. Established relays run
    /// until their streams close on their own.
    pub fn stop(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        log::info!("stopping socks proxy");
        self.shared.cancel.cancel();
    }

    /// Number of tracked live connections.
    pub fn live_conns(&self) -> usize {
        self.shared.conns.lock().unwrap().len()
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    // With a connection cap the pipelines run on a fixed set of workers fed
    // through a rendezvous channel; otherwise each flow gets its own task.
    let job_tx = if shared.max_conns > 0 {
        let (tx, rx) = mpsc::channel::<Job>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..shared.max_conns {
            tokio::spawn(worker(shared.clone(), rx.clone()));
        }
        Some(tx)
    } else {
        None
    };

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    if shared.cancel.is_cancelled() {
                        break;
                    }
                    log::error!("failed to accept: {}", e);
                    continue;
                }
            },
        };

        let key = peer.to_string();
        let id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let last_seen = Arc::new(Mutex::new(Instant::now()));

        if shared.max_conns > 0 {
            // Free a slot before queueing: kill the conversation with the
            // oldest timestamp.
            let victim = {
                let conns = shared.conns.lock().unwrap();
                if conns.len() >= shared.max_conns {
                    conns
                        .iter()
                        .min_by_key(|(_, record)| *record.last_seen.lock().unwrap())
                        .map(|(key, record)| (key.clone(), record.token.clone()))
                } else {
                    None
                }
            };
            if let Some((victim_key, victim_token)) = victim {
                log::debug!("evicting connection {}", victim_key);
                victim_token.cancel();
            }
        }

        shared.conns.lock().unwrap().insert(
            key.clone(),
            ConnRecord {
                id,
                token: token.clone(),
                last_seen: last_seen.clone(),
            },
        );

        let job = Job {
            stream,
            peer,
            key,
            id,
            token,
            last_seen,
        };
        match &job_tx {
            Some(tx) => {
                if tx.send(job).await.is_err() {
                    break;
                }
            }
            None => {
                tokio::spawn(serve_conn(shared.clone(), job));
            }
        }
    }
    // Dropping the sender drains the workers once queued jobs finish.
}

async fn worker(shared: Arc<Shared>, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = { rx.lock().await.recv().await };
        match job {
            Some(job) => serve_conn(shared.clone(), job).await,
            None => break,
        }
    }
}

async fn serve_conn(shared: Arc<Shared>, job: Job) {
    let Job {
        stream,
        peer,
        key,
        id,
        token,
        last_seen,
    } = job;

    tokio::select! {
        biased;
        _ = token.cancelled() => {
            log::debug!("connection {} force-closed by eviction", peer);
        }
        _ = tcprelay::handle_conn(&shared, stream, peer, last_seen) => {}
    }

    let mut conns = shared.conns.lock().unwrap();
    if conns.get(&key).map(|record| record.id) == Some(id) {
        conns.remove(&key);
    }
}
