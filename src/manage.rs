//! Process-level entry points: construct, register and stop proxies.
//!
//! The tag registry is the only process-wide state; everything else lives in
//! the [`Client`] instances.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::config::{Config, PROTO_TCP_UDP, PROTO_WEBSOCKET};
use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::net::mpx::{MpxPool, DEFAULT_POOL_SIZE};
use crate::net::tcp::TcpDialer;
use crate::net::udp::UdpDialer;
use crate::net::websocket::WsDialer;
use crate::net::RelayAddr;
use crate::relay::local::Client;
use crate::stat::Stat;

lazy_static! {
    static ref CLIENTS: Mutex<HashMap<i32, Arc<Client>>> = Mutex::new(HashMap::new());
    static ref LOCAL_IP: Mutex<Option<IpAddr>> = Mutex::new(None);
}

/// Pins the local address outgoing relay connections bind to.
pub fn set_local_ip(ip: &str) -> Result<()> {
    let parsed: IpAddr = ip
        .parse()
        .map_err(|_| Error::Config(format!("invalid local ip {:?}", ip)))?;
    *LOCAL_IP.lock().unwrap() = Some(parsed);
    Ok(())
}

/// Parses a JSON configuration and runs the proxy it describes, replacing
/// any proxy already registered under the same tag.
pub async fn start(json: &str) -> Result<()> {
    let cfg = Config::from_json(json)?;
    cfg.validate()?;
    start_with_config(&cfg).await
}

pub async fn start_with_config(cfg: &Config) -> Result<()> {
    let cipher = Cipher::new(&cfg.method, &cfg.password)?;
    let stat = Stat::new();
    let server_addr = cfg.server_addr();
    let local_addr = cfg.local_addr();

    let client = match cfg.proto {
        PROTO_TCP_UDP => {
            let mut dialer = TcpDialer::new(server_addr.clone()).with_stat(stat.clone());
            if let Some(ip) = *LOCAL_IP.lock().unwrap() {
                dialer = dialer.with_local_addr(SocketAddr::new(ip, 0));
            }
            let pc_dialer = UdpDialer::new().with_stat(stat.clone());
            let client = Client::new(cipher, Arc::new(dialer), Some(Arc::new(pc_dialer)))
                .with_max_conns(cfg.max_conn_count)
                .with_stat(stat);

            log::info!("start shadowsocks on tcp, server: {}", server_addr);
            client.start_tcp(&local_addr).await?;

            let server = tokio::net::lookup_host(&server_addr)
                .await
                .map_err(|e| Error::Dial {
                    server: server_addr.clone(),
                    source: e,
                })?
                .next()
                .ok_or_else(|| Error::Config(format!("{} did not resolve", server_addr)))?;
            log::info!("start shadowsocks on udp, server: {}", server_addr);
            client.start_udp(&local_addr, RelayAddr::Socket(server)).await?;
            client
        }
        PROTO_WEBSOCKET => {
            let ws = WsDialer::new(server_addr.clone(), cfg.url.clone(), cfg.username.clone())
                .with_timeout(cfg.ws_handshake_timeout())
                .with_stat(stat.clone());

            if cfg.mpx {
                let pool = Arc::new(MpxPool::new(Arc::new(ws), DEFAULT_POOL_SIZE));
                let client = Client::new(cipher, pool.clone(), None)
                    .with_max_conns(cfg.max_conn_count)
                    .with_stat(stat);
                log::info!("start shadowsocks on websocket mpx, server: {}", server_addr);
                client.start_tcp(&local_addr).await?;
                // A dead relay at startup is not fatal: the listener is up
                // and the pool redials as flows arrive.
                if let Err(e) = pool.start().await {
                    log::warn!("{}", e);
                }
                client
            } else {
                let client = Client::new(cipher, Arc::new(ws), None)
                    .with_max_conns(cfg.max_conn_count)
                    .with_stat(stat);
                log::info!("start shadowsocks on websocket, server: {}", server_addr);
                client.start_tcp(&local_addr).await?;
                client
            }
        }
        other => return Err(Error::Config(format!("unknown proto {}", other))),
    };

    let replaced = CLIENTS.lock().unwrap().insert(cfg.tag, Arc::new(client));
    if let Some(old) = replaced {
        log::info!("replacing proxy registered under tag {}", cfg.tag);
        if let Some(stat) = old.stat() {
            stat.reset();
        }
        old.stop();
    }
    Ok(())
}

/// Tears down the proxy registered under `tag`.
pub fn stop(tag: i32) -> Result<()> {
    match CLIENTS.lock().unwrap().remove(&tag) {
        Some(client) => {
            if let Some(stat) = client.stat() {
                stat.reset();
            }
            client.stop();
            Ok(())
        }
        None => Err(Error::Closed),
    }
}

/// Transfer meter of the proxy registered under `tag`.
pub fn stat(tag: i32) -> Option<Stat> {
    CLIENTS.lock().unwrap().get(&tag).and_then(|c| c.stat().cloned())
}

/// Raw TCP + UDP transport towards `server:port`.
pub async fn start_tcp_udp(
    server: &str,
    port: u16,
    method: &str,
    password: &str,
    local_port: u16,
    verbose: bool,
) -> Result<()> {
    start_with_config(&Config {
        server: server.to_owned(),
        port,
        method: method.to_owned(),
        password: password.to_owned(),
        local_host: "127.0.0.1".to_owned(),
        local_port,
        verbose,
        ..Config::default()
    })
    .await
}

/// WebSocket transport towards `ws://server:port{url}`.
#[allow(clippy::too_many_arguments)]
pub async fn start_websocket(
    server: &str,
    url: &str,
    username: &str,
    port: u16,
    method: &str,
    password: &str,
    local_port: u16,
    verbose: bool,
) -> Result<()> {
    start_with_config(&Config {
        proto: PROTO_WEBSOCKET,
        server: server.to_owned(),
        url: url.to_owned(),
        username: username.to_owned(),
        port,
        method: method.to_owned(),
        password: password.to_owned(),
        local_host: "127.0.0.1".to_owned(),
        local_port,
        verbose,
        ..Config::default()
    })
    .await
}

/// WebSocket transport with the multiplexed stream pool.
#[allow(clippy::too_many_arguments)]
pub async fn start_websocket_mpx(
    server: &str,
    url: &str,
    username: &str,
    port: u16,
    method: &str,
    password: &str,
    local_port: u16,
    verbose: bool,
) -> Result<()> {
    start_with_config(&Config {
        proto: PROTO_WEBSOCKET,
        mpx: true,
        server: server.to_owned(),
        url: url.to_owned(),
        username: username.to_owned(),
        port,
        method: method.to_owned(),
        password: password.to_owned(),
        local_host: "127.0.0.1".to_owned(),
        local_port,
        verbose,
        ..Config::default()
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_rejects_invalid_json() {
        assert!(matches!(start("{not json").await, Err(Error::Config(_))));
        assert!(matches!(start(r#"{"server": ""}"#).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn stop_of_unknown_tag_fails() {
        assert!(matches!(stop(-9999), Err(Error::Closed)));
    }

    #[test]
    fn local_ip_must_parse() {
        assert!(set_local_ip("not-an-ip").is_err());
        assert!(set_local_ip("127.0.0.1").is_ok());
        *LOCAL_IP.lock().unwrap() = None;
    }
}
