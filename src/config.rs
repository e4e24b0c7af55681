//! JSON configuration accepted by the `manage` entry points.

use std::time::Duration;

use serde::Deserialize;

use crate::crypto::CipherKind;
use crate::error::{Error, Result};

/// Default WebSocket handshake timeout when `wSTimeout` is absent or zero.
pub const DEFAULT_WS_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport selector: raw TCP + UDP towards the relay, or WebSocket.
pub const PROTO_TCP_UDP: u8 = 0;
pub const PROTO_WEBSOCKET: u8 = 1;

/// One proxy instance, as described by the embedding application.
///
/// Field names match the JSON contract of the original mobile bindings, so
/// existing configuration blobs keep working unchanged.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proto: u8,
    pub server: String,
    /// WebSocket path on the relay (`proto = 1` only).
    pub url: String,
    /// Account name sent as `Shadowsocks-Username` (`proto = 1` only).
    pub username: String,
    pub port: u16,
    pub method: String,
    pub password: String,
    pub verbose: bool,
    #[serde(rename = "maxConnCount")]
    pub max_conn_count: usize,
    /// Handle under which the running proxy is registered for `stop`.
    pub tag: i32,
    #[serde(rename = "localHost")]
    pub local_host: String,
    #[serde(rename = "localPort")]
    pub local_port: u16,
    /// Multiplex many flows over a pool of persistent WebSocket streams.
    pub mpx: bool,
    /// WebSocket handshake timeout in milliseconds; 0 means the default.
    #[serde(rename = "wSTimeout")]
    pub ws_timeout: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            proto: PROTO_TCP_UDP,
            server: String::new(),
            url: String::new(),
            username: String::new(),
            port: 0,
            method: String::new(),
            password: String::new(),
            verbose: false,
            max_conn_count: 0,
            tag: 0,
            local_host: "0.0.0.0".to_owned(),
            local_port: 0,
            mpx: false,
            ws_timeout: 0,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.proto > PROTO_WEBSOCKET {
            return Err(Error::Config(format!("unknown proto {}", self.proto)));
        }
        if self.server.is_empty() {
            return Err(Error::Config("server must not be empty".to_owned()));
        }
        if self.port == 0 {
            return Err(Error::Config("server port must be in 1..65535".to_owned()));
        }
        if self.password.is_empty() {
            return Err(Error::Config("password must not be empty".to_owned()));
        }
        if self.local_port == 0 {
            return Err(Error::Config("local port must be in 1..65535".to_owned()));
        }
        CipherKind::parse(&self.method)?;
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn ws_handshake_timeout(&self) -> Duration {
        if self.ws_timeout == 0 {
            DEFAULT_WS_TIMEOUT
        } else {
            Duration::from_millis(self.ws_timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_json() {
        let cfg = Config::from_json(
            r#"{
                "proto": 1,
                "server": "relay.example.net",
                "url": "/tunnel",
                "username": "alice",
                "port": 8488,
                "method": "AEAD_CHACHA20_POLY1305",
                "password": "pw",
                "verbose": true,
                "maxConnCount": 8,
                "tag": 3,
                "localHost": "127.0.0.1",
                "localPort": 1080,
                "mpx": true,
                "wSTimeout": 500
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.proto, PROTO_WEBSOCKET);
        assert_eq!(cfg.server_addr(), "relay.example.net:8488");
        assert_eq!(cfg.local_addr(), "127.0.0.1:1080");
        assert_eq!(cfg.max_conn_count, 8);
        assert_eq!(cfg.tag, 3);
        assert!(cfg.mpx);
        assert_eq!(cfg.ws_handshake_timeout(), Duration::from_millis(500));
        cfg.validate().unwrap();
    }

    #[test]
    fn defaults_are_filled_in() {
        let cfg = Config::from_json(r#"{"server": "s", "port": 1, "method": "plain", "password": "x", "localPort": 1080}"#).unwrap();
        assert_eq!(cfg.proto, PROTO_TCP_UDP);
        assert_eq!(cfg.local_host, "0.0.0.0");
        assert_eq!(cfg.ws_handshake_timeout(), DEFAULT_WS_TIMEOUT);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_bad_fields() {
        let base = r#"{"server": "s", "port": 8488, "method": "plain", "password": "x", "localPort": 1080}"#;
        assert!(Config::from_json(base).unwrap().validate().is_ok());

        let mut cfg = Config::from_json(base).unwrap();
        cfg.server.clear();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = Config::from_json(base).unwrap();
        cfg.port = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = Config::from_json(base).unwrap();
        cfg.password.clear();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = Config::from_json(base).unwrap();
        cfg.method = "rot13".to_owned();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
