//! Local-side Shadowsocks client.
//!
//! Accepts SOCKS5 traffic (TCP CONNECT and UDP ASSOCIATE) on a loopback
//! listener and tunnels each flow to a relay server in the Shadowsocks wire
//! format, over raw TCP/UDP, a WebSocket upgrade, a multiplexed stream pool
//! or (with the `quic` feature) QUIC.
//!
//! ```no_run
//! use ssclient::manage;
//!
//! #[tokio::main]
//! async fn main() -> ssclient::Result<()> {
//!     manage::start(
//!         r#"{
//!             "proto": 0,
//!             "server": "relay.example.net",
//!             "port": 8488,
//!             "method": "AEAD_CHACHA20_POLY1305",
//!             "password": "your-password",
//!             "localHost": "127.0.0.1",
//!             "localPort": 1080,
//!             "tag": 0
//!         }"#,
//!     )
//!     .await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     manage::stop(0)
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod manage;
pub mod net;
pub mod relay;
pub mod stat;

pub use config::Config;
pub use crypto::{Cipher, CipherKind};
pub use error::{Error, Result};
pub use relay::local::Client;
pub use stat::Stat;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
